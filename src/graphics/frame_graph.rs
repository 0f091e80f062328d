use std::collections::HashSet;

use nalgebra::Vector2;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::common::fatal;
use crate::graphics::backend::{
    BufferDesc, ClearValue, CmdRecorder, DeviceBackend, DeviceError, ImageDesc, LoadOp,
    RawBuffer, RawFramebuffer, RawImage, RawImageView, RenderAttachment,
};
use crate::graphics::barrier::{
    dst_access_flags, image_layout_for, src_access_flags, BarrierDesc, ImageLayout, PipelineStage,
    ResourceOp,
};
use crate::graphics::lifetime::{DeferredDestroy, LifetimeManager};

/// Virtual resource markers.
pub struct Image;
pub struct Buffer;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PassKind {
    Compute,
    Graphics,
    Transfer,
    External,
}

#[derive(Error, Debug)]
pub enum FrameGraphError {
    #[error("resource \"{resource}\" is read but never written")]
    UninitializedRead { resource: String },
    #[error("frame graph contains a cycle")]
    CyclicGraph,
    #[error("resource \"{resource}\" is not of the expected kind")]
    TypeMismatch { resource: String },
    #[error("attachments of pass \"{pass}\" do not share a common size")]
    AttachmentSizeMismatch { pass: String },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Versioned virtual handle. `id` is the allocation identity; the version
/// is bumped by every write-producing pass. Handles are plain values and
/// only valid for the graph that created them, for one frame.
pub struct FrameGraphResource<T> {
    id: u32,
    version: u32,
    last_pass: u32,
    last_op: ResourceOp,
    last_op_stage: PipelineStage,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Copy for FrameGraphResource<T> {}

impl<T> Clone for FrameGraphResource<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> FrameGraphResource<T> {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Index of the pass that last declared a use of this handle.
    pub fn last_pass(&self) -> u32 {
        self.last_pass
    }

    pub fn last_op(&self) -> ResourceOp {
        self.last_op
    }

    pub fn last_op_stage(&self) -> PipelineStage {
        self.last_op_stage
    }
}

enum ResourceKind {
    Image(ImageDesc),
    Buffer(BufferDesc),
}

struct ResourceDecl {
    name: String,
    kind: ResourceKind,
}

#[derive(Clone, Copy, Debug)]
struct ResourceUse {
    id: u32,
    op: ResourceOp,
    stage: PipelineStage,
}

#[derive(Clone, Copy, Debug)]
struct AttachmentDecl {
    id: u32,
    load_op: LoadOp,
    clear: Option<ClearValue>,
}

type RecordFn = Box<dyn FnOnce(&mut dyn CmdRecorder, &FrameGraphResources)>;

struct PassData {
    name: String,
    kind: PassKind,
    uses: Vec<ResourceUse>,
    color_attachments: Vec<AttachmentDecl>,
    depth_attachment: Option<AttachmentDecl>,
    record: Option<RecordFn>,
}

/// Per-frame DAG of passes over virtual resources. Built through
/// `add_pass`, compiled once, recorded once, then released.
pub struct FrameGraph {
    passes: Vec<PassData>,
    resources: Vec<ResourceDecl>,
}

impl FrameGraph {
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            resources: Vec::new(),
        }
    }

    /// Declares a pass. `setup` declares resource accesses through the
    /// builder and returns the record function invoked at recording time.
    pub fn add_pass<Setup, Record>(&mut self, name: &str, kind: PassKind, setup: Setup)
    where
        Setup: FnOnce(&mut FrameGraphPassBuilder<'_>) -> Record,
        Record: FnOnce(&mut dyn CmdRecorder, &FrameGraphResources) + 'static,
    {
        let index = self.passes.len() as u32;
        self.passes.push(PassData {
            name: name.to_string(),
            kind,
            uses: Vec::new(),
            color_attachments: Vec::new(),
            depth_attachment: None,
            record: None,
        });
        let mut builder = FrameGraphPassBuilder { graph: self, index };
        let record = setup(&mut builder);
        self.passes[index as usize].record = Some(Box::new(record));
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    fn image_desc(&self, id: u32) -> Option<&ImageDesc> {
        match &self.resources.get(id as usize)?.kind {
            ResourceKind::Image(desc) => Some(desc),
            ResourceKind::Buffer(_) => None,
        }
    }

    /// Dependency inference over the declared uses, per resource id.
    /// Readers depend on the producing writer; writers depend on the
    /// previous writer and on readers of the previous version. Reads that
    /// precede any declared write bind to the final writer, so declaration
    /// order does not have to follow execution order.
    fn dependency_edges(&self) -> Result<HashSet<(u32, u32)>, FrameGraphError> {
        let mut edges = HashSet::new();

        for id in 0..self.resources.len() as u32 {
            let mut last_writer: Option<u32> = None;
            let mut readers_since_write: Vec<u32> = Vec::new();
            let mut early_readers: Vec<u32> = Vec::new();

            for (pass_index, pass) in self.passes.iter().enumerate() {
                let pass_index = pass_index as u32;
                for access in pass.uses.iter().filter(|u| u.id == id) {
                    match access.op {
                        ResourceOp::Read => match last_writer {
                            Some(writer) => {
                                if writer != pass_index {
                                    edges.insert((writer, pass_index));
                                }
                                readers_since_write.push(pass_index);
                            }
                            None => early_readers.push(pass_index),
                        },
                        ResourceOp::Write => {
                            if let Some(writer) = last_writer {
                                if writer != pass_index {
                                    edges.insert((writer, pass_index));
                                }
                            }
                            for reader in readers_since_write.drain(..) {
                                if reader != pass_index {
                                    edges.insert((reader, pass_index));
                                }
                            }
                            last_writer = Some(pass_index);
                        }
                        ResourceOp::Undefined => {}
                    }
                }
            }

            match last_writer {
                Some(writer) => {
                    for reader in early_readers {
                        if reader != writer {
                            edges.insert((writer, reader));
                        }
                    }
                }
                None => {
                    if !early_readers.is_empty() {
                        return Err(FrameGraphError::UninitializedRead {
                            resource: self.resources[id as usize].name.clone(),
                        });
                    }
                }
            }
        }

        Ok(edges)
    }

    /// Kahn's algorithm over the dependency DAG; ties broken by pass
    /// registration order.
    fn linearize(&self, edges: &HashSet<(u32, u32)>) -> Result<Vec<u32>, FrameGraphError> {
        let mut graph = DiGraph::<u32, ()>::new();
        let nodes = (0..self.passes.len() as u32)
            .map(|i| graph.add_node(i))
            .collect::<Vec<NodeIndex>>();
        for (from, to) in edges {
            graph.add_edge(nodes[*from as usize], nodes[*to as usize], ());
        }

        let mut indegree = vec![0usize; self.passes.len()];
        for (_, to) in edges {
            indegree[*to as usize] += 1;
        }

        let mut ready = std::collections::BinaryHeap::new();
        for (pass, degree) in indegree.iter().enumerate() {
            if *degree == 0 {
                ready.push(std::cmp::Reverse(pass as u32));
            }
        }

        let mut order = Vec::with_capacity(self.passes.len());
        while let Some(std::cmp::Reverse(pass)) = ready.pop() {
            order.push(pass);
            for neighbor in graph.neighbors(nodes[pass as usize]) {
                let target = graph[neighbor];
                indegree[target as usize] -= 1;
                if indegree[target as usize] == 0 {
                    ready.push(std::cmp::Reverse(target));
                }
            }
        }

        if order.len() != self.passes.len() {
            return Err(FrameGraphError::CyclicGraph);
        }
        Ok(order)
    }

    /// Runs the deferred constructors, infers dependencies, linearizes and
    /// synthesizes barriers. Consumes the graph; failures abort the frame.
    pub fn compile(
        mut self,
        device: &dyn DeviceBackend,
    ) -> Result<CompiledFrameGraph, FrameGraphError> {
        let edges = self.dependency_edges()?;
        let schedule = self.linearize(&edges)?;

        // Instantiation.
        let mut entries = Vec::with_capacity(self.resources.len());
        for decl in &self.resources {
            let entry = match &decl.kind {
                ResourceKind::Image(desc) => {
                    let image = device.create_image(desc)?;
                    let view = device.create_image_view(image)?;
                    ConcreteResource::Image {
                        image,
                        view,
                        desc: desc.clone(),
                    }
                }
                ResourceKind::Buffer(desc) => ConcreteResource::Buffer {
                    buffer: device.create_buffer(desc)?,
                    desc: desc.clone(),
                },
            };
            entries.push(entry);
        }

        // Framebuffers for graphics passes; all attachments must agree on
        // their size.
        let mut framebuffers: Vec<Option<RawFramebuffer>> = Vec::new();
        let mut attachments: Vec<Vec<RenderAttachment>> = Vec::new();
        for pass in &self.passes {
            let declared = pass
                .color_attachments
                .iter()
                .chain(pass.depth_attachment.iter())
                .copied()
                .collect::<Vec<_>>();
            if declared.is_empty() {
                framebuffers.push(None);
                attachments.push(Vec::new());
                continue;
            }

            let mut size: Option<Vector2<u32>> = None;
            let mut views = Vec::new();
            let mut resolved = Vec::new();
            for attachment in &declared {
                let Some(desc) = self.image_desc(attachment.id) else {
                    return Err(FrameGraphError::TypeMismatch {
                        resource: self.resources[attachment.id as usize].name.clone(),
                    });
                };
                match size {
                    None => size = Some(desc.size),
                    Some(expected) if expected != desc.size => {
                        return Err(FrameGraphError::AttachmentSizeMismatch {
                            pass: pass.name.clone(),
                        });
                    }
                    Some(_) => {}
                }
                let ConcreteResource::Image { view, .. } = &entries[attachment.id as usize]
                else {
                    unreachable!("Attachment declarations are image-typed.");
                };
                views.push(*view);
                resolved.push(RenderAttachment {
                    view: *view,
                    load_op: attachment.load_op,
                    clear: attachment
                        .clear
                        .unwrap_or_else(|| ClearValue::default_for(desc.format)),
                });
            }
            let size = size.expect("Checked non-empty.");
            framebuffers.push(Some(device.create_framebuffer(&views, size)?));
            attachments.push(resolved);
        }

        // Barrier synthesis along the linear order.
        let mut states: Vec<Option<(u32, ResourceOp, PipelineStage, ImageLayout)>> =
            vec![None; self.resources.len()];
        let mut barriers: Vec<Vec<BarrierDesc>> = Vec::with_capacity(schedule.len());
        for pass_index in &schedule {
            let pass = &self.passes[*pass_index as usize];
            let mut pass_barriers = Vec::new();
            for access in &pass.uses {
                let is_depth = self
                    .image_desc(access.id)
                    .map(|d| d.format.is_depth())
                    .unwrap_or(false);
                let is_image = matches!(entries[access.id as usize], ConcreteResource::Image { .. });
                let new_layout = if is_image {
                    image_layout_for(access.op, access.stage, is_depth)
                } else {
                    ImageLayout::Undefined
                };

                if let Some((last_pass, last_op, last_stage, last_layout)) =
                    states[access.id as usize]
                {
                    let hazard = last_op == ResourceOp::Write
                        || access.op == ResourceOp::Write
                        || (is_image && last_layout != new_layout);
                    if hazard && last_pass != *pass_index {
                        pass_barriers.push(BarrierDesc {
                            image: match &entries[access.id as usize] {
                                ConcreteResource::Image { image, .. } => Some(*image),
                                ConcreteResource::Buffer { .. } => None,
                            },
                            buffer: match &entries[access.id as usize] {
                                ConcreteResource::Buffer { buffer, .. } => Some(*buffer),
                                ConcreteResource::Image { .. } => None,
                            },
                            src_stage: last_stage,
                            dst_stage: access.stage,
                            src_access: src_access_flags(last_op, last_stage),
                            dst_access: dst_access_flags(access.op, access.stage),
                            old_layout: is_image.then_some(last_layout),
                            new_layout: is_image.then_some(new_layout),
                        });
                    }
                }
                states[access.id as usize] = Some((*pass_index, access.op, access.stage, new_layout));
            }
            barriers.push(pass_barriers);
        }

        let passes = std::mem::take(&mut self.passes);
        Ok(CompiledFrameGraph {
            passes,
            schedule,
            barriers,
            resources: FrameGraphResources {
                names: self.resources.iter().map(|r| r.name.clone()).collect(),
                entries,
                framebuffers: framebuffers.iter().flatten().copied().collect(),
            },
            pass_framebuffers: framebuffers,
            pass_attachments: attachments,
        })
    }
}

impl Default for FrameGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder handed to a pass's setup function.
pub struct FrameGraphPassBuilder<'g> {
    graph: &'g mut FrameGraph,
    index: u32,
}

impl<'g> FrameGraphPassBuilder<'g> {
    fn declare<T>(&mut self, name: &str, kind: ResourceKind) -> FrameGraphResource<T> {
        let id = self.graph.resources.len() as u32;
        self.graph.resources.push(ResourceDecl {
            name: name.to_string(),
            kind,
        });
        FrameGraphResource {
            id,
            version: 0,
            last_pass: self.index,
            last_op: ResourceOp::Undefined,
            last_op_stage: PipelineStage::BEGIN_OF_PIPE,
            _marker: std::marker::PhantomData,
        }
    }

    /// Reserves a virtual image; the backing object is created at compile
    /// time.
    pub fn create_image(&mut self, name: &str, desc: ImageDesc) -> FrameGraphResource<Image> {
        self.declare(name, ResourceKind::Image(desc))
    }

    pub fn create_buffer(&mut self, name: &str, desc: BufferDesc) -> FrameGraphResource<Buffer> {
        self.declare(name, ResourceKind::Buffer(desc))
    }

    fn push_use<T>(
        &mut self,
        res: &mut FrameGraphResource<T>,
        op: ResourceOp,
        stage: PipelineStage,
    ) {
        if res.id as usize >= self.graph.resources.len() {
            fatal("Frame graph handle does not belong to this graph.");
        }
        if op == ResourceOp::Write {
            res.version += 1;
        }
        res.last_pass = self.index;
        res.last_op = op;
        res.last_op_stage = stage;
        self.graph.passes[self.index as usize].uses.push(ResourceUse {
            id: res.id,
            op,
            stage,
        });
    }

    /// Marks the pass as a reader of the resource at the given stage.
    pub fn read<T>(&mut self, res: &mut FrameGraphResource<T>, stage: PipelineStage) {
        self.push_use(res, ResourceOp::Read, stage);
    }

    /// Marks the pass as a writer; bumps the resource version.
    pub fn write<T>(&mut self, res: &mut FrameGraphResource<T>, stage: PipelineStage) {
        self.push_use(res, ResourceOp::Write, stage);
    }

    /// Declares a color attachment written at `ColorAttachmentOutput`.
    pub fn render_to(&mut self, res: &mut FrameGraphResource<Image>, load_op: LoadOp) {
        self.render_to_with_clear(res, load_op, None);
    }

    pub fn render_to_with_clear(
        &mut self,
        res: &mut FrameGraphResource<Image>,
        load_op: LoadOp,
        clear: Option<ClearValue>,
    ) {
        self.push_use(res, ResourceOp::Write, PipelineStage::COLOR_ATTACHMENT_OUTPUT);
        self.graph.passes[self.index as usize]
            .color_attachments
            .push(AttachmentDecl {
                id: res.id,
                load_op,
                clear,
            });
    }

    /// Declares the depth attachment. At most one per pass.
    pub fn set_depth(&mut self, res: &mut FrameGraphResource<Image>, load_op: LoadOp) {
        self.push_use(res, ResourceOp::Write, PipelineStage::COLOR_ATTACHMENT_OUTPUT);
        let pass = &mut self.graph.passes[self.index as usize];
        if pass.depth_attachment.is_some() {
            fatal("Pass already has a depth attachment.");
        }
        pass.depth_attachment = Some(AttachmentDecl {
            id: res.id,
            load_op,
            clear: None,
        });
    }
}

enum ConcreteResource {
    Image {
        image: RawImage,
        view: RawImageView,
        desc: ImageDesc,
    },
    Buffer {
        buffer: RawBuffer,
        desc: BufferDesc,
    },
}

/// The instantiated backing objects, indexed by handle id. Valid from
/// compile until `release`.
pub struct FrameGraphResources {
    names: Vec<String>,
    entries: Vec<ConcreteResource>,
    framebuffers: Vec<RawFramebuffer>,
}

impl FrameGraphResources {
    pub fn image(&self, res: &FrameGraphResource<Image>) -> RawImage {
        match self.entries.get(res.id as usize) {
            Some(ConcreteResource::Image { image, .. }) => *image,
            _ => fatal!("Resource \"{}\" is not an image", self.name(res.id)),
        }
    }

    pub fn image_view(&self, res: &FrameGraphResource<Image>) -> RawImageView {
        match self.entries.get(res.id as usize) {
            Some(ConcreteResource::Image { view, .. }) => *view,
            _ => fatal!("Resource \"{}\" is not an image", self.name(res.id)),
        }
    }

    pub fn image_desc(&self, res: &FrameGraphResource<Image>) -> &ImageDesc {
        match self.entries.get(res.id as usize) {
            Some(ConcreteResource::Image { desc, .. }) => desc,
            _ => fatal!("Resource \"{}\" is not an image", self.name(res.id)),
        }
    }

    pub fn buffer(&self, res: &FrameGraphResource<Buffer>) -> RawBuffer {
        match self.entries.get(res.id as usize) {
            Some(ConcreteResource::Buffer { buffer, .. }) => *buffer,
            _ => fatal!("Resource \"{}\" is not a buffer", self.name(res.id)),
        }
    }

    pub fn buffer_desc(&self, res: &FrameGraphResource<Buffer>) -> &BufferDesc {
        match self.entries.get(res.id as usize) {
            Some(ConcreteResource::Buffer { desc, .. }) => desc,
            _ => fatal!("Resource \"{}\" is not a buffer", self.name(res.id)),
        }
    }

    fn name(&self, id: u32) -> &str {
        self.names
            .get(id as usize)
            .map(|n| n.as_str())
            .unwrap_or("<unknown>")
    }

    /// Hands every transient object to the lifetime manager. Frame graph
    /// resources must not outlive compile + record + submit.
    pub fn release(self, lifetime: &LifetimeManager) {
        for framebuffer in self.framebuffers {
            lifetime.destroy_later(DeferredDestroy::Framebuffer(framebuffer));
        }
        for entry in self.entries {
            match entry {
                ConcreteResource::Image { image, view, .. } => {
                    lifetime.destroy_later(DeferredDestroy::ImageView(view));
                    lifetime.destroy_later(DeferredDestroy::Image(image));
                }
                ConcreteResource::Buffer { buffer, .. } => {
                    lifetime.destroy_later(DeferredDestroy::Buffer(buffer));
                }
            }
        }
    }
}

/// A compiled frame: linear pass order plus the barrier batch in front of
/// each pass. Inspectable before recording.
pub struct CompiledFrameGraph {
    passes: Vec<PassData>,
    schedule: Vec<u32>,
    barriers: Vec<Vec<BarrierDesc>>,
    resources: FrameGraphResources,
    pass_framebuffers: Vec<Option<RawFramebuffer>>,
    pass_attachments: Vec<Vec<RenderAttachment>>,
}

impl CompiledFrameGraph {
    /// Scheduled pass indices, in execution order.
    pub fn schedule(&self) -> &[u32] {
        &self.schedule
    }

    pub fn pass_name(&self, pass_index: u32) -> &str {
        &self.passes[pass_index as usize].name
    }

    /// Barriers emitted immediately before the pass at `position` in the
    /// schedule.
    pub fn barriers_before(&self, position: usize) -> &[BarrierDesc] {
        &self.barriers[position]
    }

    pub fn resources(&self) -> &FrameGraphResources {
        &self.resources
    }

    /// Emits barriers and invokes every record function in scheduled
    /// order. Returns the resources for release after submission.
    pub fn record(mut self, recorder: &mut dyn CmdRecorder) -> FrameGraphResources {
        for (position, pass_index) in self.schedule.iter().enumerate() {
            for barrier in &self.barriers[position] {
                recorder.pipeline_barrier(barrier);
            }

            let pass = &mut self.passes[*pass_index as usize];
            let framebuffer = self.pass_framebuffers[*pass_index as usize];
            if let Some(framebuffer) = framebuffer {
                recorder
                    .begin_render_pass(framebuffer, &self.pass_attachments[*pass_index as usize]);
            }
            if let Some(record) = pass.record.take() {
                record(recorder, &self.resources);
            }
            if framebuffer.is_some() {
                recorder.end_render_pass();
            }
        }
        self.resources
    }
}
