use nalgebra::Vector2;
use thiserror::Error;

use crate::graphics::barrier::BarrierDesc;

macro_rules! raw_handle {
    ($name:ident) => {
        /// Opaque device handle. The null value is reserved.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn null() -> Self {
                Self(u64::MAX)
            }

            pub fn is_null(&self) -> bool {
                *self == Self::null()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

raw_handle!(RawImage);
raw_handle!(RawImageView);
raw_handle!(RawBuffer);
raw_handle!(RawFramebuffer);
raw_handle!(RawPipeline);
raw_handle!(RawDescriptorSetLayout);
raw_handle!(RawDescriptorPool);
raw_handle!(RawSemaphore);
raw_handle!(RawFence);
raw_handle!(RawCmdBuffer);

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device allocation failed")]
    OutOfMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("swapchain out of date")]
    SwapchainOutOfDate,
    #[error("device initialization failed: {0}")]
    InitFailed(String),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ImageFormat {
    Rgba8Unorm,
    Rgba8Srgb,
    Rgba16Float,
    Depth32Float,
}

impl ImageFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, ImageFormat::Depth32Float)
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct ImageUsage: u32 {
        const COLOR_ATTACHMENT = 1 << 0;
        const DEPTH_ATTACHMENT = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct BufferUsage: u32 {
        const UNIFORM = 1 << 0;
        const STORAGE = 1 << 1;
        const VERTEX = 1 << 2;
        const INDEX = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ImageDesc {
    pub size: Vector2<u32>,
    pub format: ImageFormat,
    pub usage: ImageUsage,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub fn default_for(format: ImageFormat) -> Self {
        if format.is_depth() {
            ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            }
        } else {
            ClearValue::Color([0.0; 4])
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoadOp {
    Clear,
    Load,
}

/// Device features toggled from the environment (and `--no-debug`).
#[derive(Clone, Copy, Debug)]
pub struct DeviceConfig {
    pub validation: bool,
    pub ray_tracing: bool,
    pub diagnostics: bool,
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => value != "0",
        Err(_) => default,
    }
}

impl DeviceConfig {
    pub fn from_env() -> Self {
        Self {
            validation: env_flag("YAVE_VALIDATION", cfg!(debug_assertions)),
            ray_tracing: env_flag("YAVE_RT", false),
            diagnostics: env_flag("YAVE_DIAG", false),
        }
    }
}

/// The device surface the runtime core consumes. The Vulkan implementation
/// lives outside this crate; the in-tree implementation is the headless
/// device used by tests and `--headless` runs.
///
/// Fences are created in the signalled state and reset right before a
/// submission stamps them.
pub trait DeviceBackend: Send + Sync {
    fn config(&self) -> DeviceConfig;

    fn create_image(&self, desc: &ImageDesc) -> Result<RawImage, DeviceError>;
    fn create_image_view(&self, image: RawImage) -> Result<RawImageView, DeviceError>;
    fn create_buffer(&self, desc: &BufferDesc) -> Result<RawBuffer, DeviceError>;
    fn create_framebuffer(
        &self,
        attachments: &[RawImageView],
        size: Vector2<u32>,
    ) -> Result<RawFramebuffer, DeviceError>;
    fn create_descriptor_set_layout(
        &self,
        binding_count: u32,
    ) -> Result<RawDescriptorSetLayout, DeviceError>;
    fn create_descriptor_pool(&self, capacity: u32) -> Result<RawDescriptorPool, DeviceError>;
    fn create_semaphore(&self) -> RawSemaphore;
    fn create_fence(&self) -> RawFence;
    fn create_cmd_buffer(&self) -> RawCmdBuffer;

    fn reset_cmd_buffer(&self, cmd: RawCmdBuffer);
    /// Non-blocking.
    fn fence_signalled(&self, fence: RawFence) -> bool;
    fn reset_fence(&self, fence: RawFence);
    fn submit(&self, cmd: RawCmdBuffer, fence: RawFence);
    /// Blocks until the fence signals.
    fn wait_fence(&self, fence: RawFence);
    fn wait_idle(&self);

    fn destroy_image(&self, handle: RawImage);
    fn destroy_image_view(&self, handle: RawImageView);
    fn destroy_buffer(&self, handle: RawBuffer);
    fn destroy_framebuffer(&self, handle: RawFramebuffer);
    fn destroy_pipeline(&self, handle: RawPipeline);
    fn destroy_descriptor_set_layout(&self, handle: RawDescriptorSetLayout);
    fn destroy_descriptor_pool(&self, handle: RawDescriptorPool);
    fn destroy_semaphore(&self, handle: RawSemaphore);
    fn destroy_fence(&self, handle: RawFence);
    fn free_cmd_buffer(&self, handle: RawCmdBuffer);
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct RenderAttachment {
    pub view: RawImageView,
    pub load_op: LoadOp,
    pub clear: ClearValue,
}

/// The recorder interface the frame graph emits into. One implementation
/// wraps a live command buffer; the headless one captures the stream.
pub trait CmdRecorder {
    fn pipeline_barrier(&mut self, barrier: &BarrierDesc);
    fn begin_render_pass(&mut self, framebuffer: RawFramebuffer, attachments: &[RenderAttachment]);
    fn end_render_pass(&mut self);
    fn dispatch(&mut self, groups: [u32; 3]);
    fn draw(&mut self, vertex_count: u32, instance_count: u32);
    fn copy_buffer(&mut self, src: RawBuffer, dst: RawBuffer, size: u64);
    fn copy_image(&mut self, src: RawImage, dst: RawImage);
    fn copy_image_to_buffer(&mut self, src: RawImage, dst: RawBuffer);
}
