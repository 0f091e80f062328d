use crate::common::fatal;
use crate::graphics::backend::{RawBuffer, RawImage};

bitflags::bitflags! {
    /// The closed set of pipeline stages passes declare their resource
    /// accesses at.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct PipelineStage: u32 {
        const BEGIN_OF_PIPE = 1 << 0;
        const VERTEX_INPUT = 1 << 1;
        const VERTEX = 1 << 2;
        const FRAGMENT = 1 << 3;
        const COMPUTE = 1 << 4;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 5;
        const TRANSFER = 1 << 6;
        const HOST = 1 << 7;
        const END_OF_PIPE = 1 << 8;

        const ALL_SHADERS = Self::VERTEX.bits() | Self::FRAGMENT.bits() | Self::COMPUTE.bits();
        const ALL_COMMANDS = Self::BEGIN_OF_PIPE.bits()
            | Self::VERTEX_INPUT.bits()
            | Self::VERTEX.bits()
            | Self::FRAGMENT.bits()
            | Self::COMPUTE.bits()
            | Self::COLOR_ATTACHMENT_OUTPUT.bits()
            | Self::TRANSFER.bits()
            | Self::HOST.bits()
            | Self::END_OF_PIPE.bits();
    }
}

pub fn is_shader_stage(stage: PipelineStage) -> bool {
    stage.intersects(PipelineStage::ALL_SHADERS)
}

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct AccessFlags: u32 {
        const SHADER_READ = 1 << 0;
        const SHADER_WRITE = 1 << 1;
        const COLOR_ATTACHMENT_READ = 1 << 2;
        const COLOR_ATTACHMENT_WRITE = 1 << 3;
        const TRANSFER_READ = 1 << 4;
        const TRANSFER_WRITE = 1 << 5;
        const HOST_READ = 1 << 6;
        const HOST_WRITE = 1 << 7;
        const MEMORY_READ = 1 << 8;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachment,
    DepthAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    Present,
}

/// What a pass last did to a resource.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResourceOp {
    Undefined,
    Read,
    Write,
}

/// Source access mask for the op a previous pass performed.
pub fn src_access_flags(op: ResourceOp, stage: PipelineStage) -> AccessFlags {
    match op {
        ResourceOp::Undefined => AccessFlags::empty(),
        ResourceOp::Write => {
            if stage.contains(PipelineStage::COLOR_ATTACHMENT_OUTPUT) {
                AccessFlags::COLOR_ATTACHMENT_WRITE
            } else if is_shader_stage(stage) {
                AccessFlags::SHADER_WRITE
            } else if stage.contains(PipelineStage::TRANSFER) {
                AccessFlags::TRANSFER_WRITE
            } else if stage.contains(PipelineStage::HOST) {
                AccessFlags::HOST_WRITE
            } else {
                fatal("Unsupported pipeline stage for a write access.");
            }
        }
        ResourceOp::Read => {
            if is_shader_stage(stage) {
                AccessFlags::SHADER_READ
            } else if stage.contains(PipelineStage::TRANSFER) {
                AccessFlags::TRANSFER_READ
            } else if stage.contains(PipelineStage::HOST) {
                AccessFlags::HOST_READ
            } else {
                fatal("Unsupported pipeline stage for a read access.");
            }
        }
    }
}

/// Destination access mask for the op the next pass performs.
pub fn dst_access_flags(op: ResourceOp, stage: PipelineStage) -> AccessFlags {
    match op {
        ResourceOp::Undefined => AccessFlags::empty(),
        ResourceOp::Read => {
            if is_shader_stage(stage) {
                AccessFlags::SHADER_READ
            } else if stage.contains(PipelineStage::TRANSFER) {
                AccessFlags::TRANSFER_READ
            } else if stage.contains(PipelineStage::HOST) {
                AccessFlags::HOST_READ
            } else {
                fatal("Unsupported pipeline stage for a read access.");
            }
        }
        ResourceOp::Write => {
            if stage.contains(PipelineStage::COLOR_ATTACHMENT_OUTPUT) {
                AccessFlags::COLOR_ATTACHMENT_READ | AccessFlags::COLOR_ATTACHMENT_WRITE
            } else if is_shader_stage(stage) {
                AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE
            } else if stage.contains(PipelineStage::TRANSFER) {
                AccessFlags::TRANSFER_WRITE
            } else if stage.contains(PipelineStage::HOST) {
                AccessFlags::HOST_WRITE
            } else {
                fatal("Unsupported pipeline stage for a write access.");
            }
        }
    }
}

/// Layout an image usage implies. Depth formats swap the attachment layout.
pub fn image_layout_for(op: ResourceOp, stage: PipelineStage, is_depth: bool) -> ImageLayout {
    match op {
        ResourceOp::Undefined => ImageLayout::Undefined,
        ResourceOp::Write => {
            if stage.contains(PipelineStage::COLOR_ATTACHMENT_OUTPUT) {
                if is_depth {
                    ImageLayout::DepthAttachment
                } else {
                    ImageLayout::ColorAttachment
                }
            } else if stage.contains(PipelineStage::TRANSFER) {
                ImageLayout::TransferDst
            } else {
                ImageLayout::General
            }
        }
        ResourceOp::Read => {
            if stage.contains(PipelineStage::TRANSFER) {
                ImageLayout::TransferSrc
            } else {
                ImageLayout::ShaderReadOnly
            }
        }
    }
}

/// One synthesized pipeline barrier, ready to hand to a recorder.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct BarrierDesc {
    pub image: Option<RawImage>,
    pub buffer: Option<RawBuffer>,
    pub src_stage: PipelineStage,
    pub dst_stage: PipelineStage,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub old_layout: Option<ImageLayout>,
    pub new_layout: Option<ImageLayout>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_tables() {
        assert_eq!(
            src_access_flags(ResourceOp::Write, PipelineStage::COLOR_ATTACHMENT_OUTPUT),
            AccessFlags::COLOR_ATTACHMENT_WRITE
        );
        assert_eq!(
            src_access_flags(ResourceOp::Write, PipelineStage::COMPUTE),
            AccessFlags::SHADER_WRITE
        );
        assert_eq!(
            src_access_flags(ResourceOp::Read, PipelineStage::TRANSFER),
            AccessFlags::TRANSFER_READ
        );
        assert_eq!(
            dst_access_flags(ResourceOp::Read, PipelineStage::FRAGMENT),
            AccessFlags::SHADER_READ
        );
        assert_eq!(
            dst_access_flags(ResourceOp::Write, PipelineStage::COLOR_ATTACHMENT_OUTPUT),
            AccessFlags::COLOR_ATTACHMENT_READ | AccessFlags::COLOR_ATTACHMENT_WRITE
        );
        assert_eq!(
            dst_access_flags(ResourceOp::Write, PipelineStage::COMPUTE),
            AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE
        );
    }

    #[test]
    fn shader_stage_composites() {
        assert!(is_shader_stage(PipelineStage::FRAGMENT));
        assert!(is_shader_stage(PipelineStage::ALL_SHADERS));
        assert!(!is_shader_stage(PipelineStage::TRANSFER));
    }
}
