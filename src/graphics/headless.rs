use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::Vector2;
use parking_lot::Mutex;

use crate::common::fatal;
use crate::graphics::backend::{
    BufferDesc, CmdRecorder, DeviceBackend, DeviceConfig, DeviceError, ImageDesc, RawBuffer,
    RawCmdBuffer, RawDescriptorPool, RawDescriptorSetLayout, RawFence, RawFramebuffer, RawImage,
    RawImageView, RawPipeline, RawSemaphore, RenderAttachment,
};
use crate::graphics::barrier::BarrierDesc;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FenceState {
    Signalled,
    Unsignalled,
    Pending,
}

#[derive(Default)]
struct HeadlessState {
    alive: HashMap<u64, &'static str>,
    fences: HashMap<u64, FenceState>,
    /// Submissions in order; completion signals their fences FIFO.
    pending: VecDeque<u64>,
}

/// Software stand-in for the device: allocates handle ids, tracks liveness
/// (catching double destroys and leaks) and models fences whose completion
/// the caller drives explicitly. Backs `--headless` runs and tests.
pub struct HeadlessDevice {
    config: DeviceConfig,
    next_id: AtomicU64,
    state: Mutex<HeadlessState>,
}

impl HeadlessDevice {
    pub fn new(config: DeviceConfig) -> Result<Self, DeviceError> {
        if config.validation {
            log::debug!("Headless device created with validation enabled.");
        }
        if config.ray_tracing {
            log::warn!("Headless device ignores the ray tracing feature request.");
        }
        Ok(Self {
            config,
            next_id: AtomicU64::new(1),
            state: Mutex::new(HeadlessState::default()),
        })
    }

    fn alloc(&self, kind: &'static str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().alive.insert(id, kind);
        id
    }

    fn release(&self, id: u64, kind: &'static str) {
        let mut state = self.state.lock();
        match state.alive.remove(&id) {
            None => fatal!("Double destroy of {}({})", kind, id),
            Some(stored) if stored != kind => {
                fatal!("Handle {} destroyed as {} but created as {}", id, kind, stored)
            }
            Some(_) => {}
        }
    }

    /// Completes the oldest outstanding submission, signalling its fence.
    pub fn complete_one(&self) -> bool {
        let mut state = self.state.lock();
        let Some(fence) = state.pending.pop_front() else {
            return false;
        };
        state.fences.insert(fence, FenceState::Signalled);
        true
    }

    /// Completes every outstanding submission, in order.
    pub fn complete_all(&self) {
        while self.complete_one() {}
    }

    /// Count of live handles of every kind, for leak assertions.
    pub fn live_handles(&self) -> usize {
        self.state.lock().alive.len()
    }

    pub fn live_handles_of(&self, kind: &'static str) -> usize {
        self.state
            .lock()
            .alive
            .values()
            .filter(|k| **k == kind)
            .count()
    }
}

impl DeviceBackend for HeadlessDevice {
    fn config(&self) -> DeviceConfig {
        self.config
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<RawImage, DeviceError> {
        if desc.size.x == 0 || desc.size.y == 0 {
            return Err(DeviceError::OutOfMemory);
        }
        Ok(RawImage(self.alloc("image")))
    }

    fn create_image_view(&self, image: RawImage) -> Result<RawImageView, DeviceError> {
        debug_assert!(self.state.lock().alive.contains_key(&image.0));
        Ok(RawImageView(self.alloc("image_view")))
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<RawBuffer, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::OutOfMemory);
        }
        Ok(RawBuffer(self.alloc("buffer")))
    }

    fn create_framebuffer(
        &self,
        attachments: &[RawImageView],
        size: Vector2<u32>,
    ) -> Result<RawFramebuffer, DeviceError> {
        debug_assert!(!attachments.is_empty());
        debug_assert!(size.x > 0 && size.y > 0);
        Ok(RawFramebuffer(self.alloc("framebuffer")))
    }

    fn create_descriptor_set_layout(
        &self,
        _binding_count: u32,
    ) -> Result<RawDescriptorSetLayout, DeviceError> {
        Ok(RawDescriptorSetLayout(self.alloc("descriptor_set_layout")))
    }

    fn create_descriptor_pool(&self, _capacity: u32) -> Result<RawDescriptorPool, DeviceError> {
        Ok(RawDescriptorPool(self.alloc("descriptor_pool")))
    }

    fn create_semaphore(&self) -> RawSemaphore {
        RawSemaphore(self.alloc("semaphore"))
    }

    fn create_fence(&self) -> RawFence {
        let id = self.alloc("fence");
        self.state.lock().fences.insert(id, FenceState::Signalled);
        RawFence(id)
    }

    fn create_cmd_buffer(&self) -> RawCmdBuffer {
        RawCmdBuffer(self.alloc("cmd_buffer"))
    }

    fn reset_cmd_buffer(&self, cmd: RawCmdBuffer) {
        debug_assert!(self.state.lock().alive.contains_key(&cmd.0));
    }

    fn fence_signalled(&self, fence: RawFence) -> bool {
        match self.state.lock().fences.get(&fence.0) {
            Some(state) => *state == FenceState::Signalled,
            None => fatal!("Unknown fence {}", fence),
        }
    }

    fn reset_fence(&self, fence: RawFence) {
        let mut state = self.state.lock();
        match state.fences.get(&fence.0) {
            Some(FenceState::Pending) => fatal("Reset a fence with a pending submission."),
            Some(_) => {
                state.fences.insert(fence.0, FenceState::Unsignalled);
            }
            None => fatal!("Unknown fence {}", fence),
        }
    }

    fn submit(&self, cmd: RawCmdBuffer, fence: RawFence) {
        let mut state = self.state.lock();
        debug_assert!(state.alive.contains_key(&cmd.0));
        match state.fences.get(&fence.0) {
            Some(FenceState::Unsignalled) => {}
            Some(_) => fatal("Submission fence must be reset first."),
            None => fatal!("Unknown fence {}", fence),
        }
        state.fences.insert(fence.0, FenceState::Pending);
        state.pending.push_back(fence.0);
    }

    fn wait_fence(&self, fence: RawFence) {
        loop {
            {
                let state = self.state.lock();
                match state.fences.get(&fence.0) {
                    Some(FenceState::Signalled) => return,
                    Some(FenceState::Pending) => {}
                    Some(FenceState::Unsignalled) => {
                        // Nothing will ever signal it.
                        fatal!("Waited on fence {} with no submission", fence);
                    }
                    None => fatal!("Unknown fence {}", fence),
                }
            }
            // Completion is in submission order, so drain until it flips.
            if !self.complete_one() {
                fatal!("Fence {} is pending but no submission is outstanding", fence);
            }
        }
    }

    fn wait_idle(&self) {
        self.complete_all();
    }

    fn destroy_image(&self, handle: RawImage) {
        self.release(handle.0, "image");
    }

    fn destroy_image_view(&self, handle: RawImageView) {
        self.release(handle.0, "image_view");
    }

    fn destroy_buffer(&self, handle: RawBuffer) {
        self.release(handle.0, "buffer");
    }

    fn destroy_framebuffer(&self, handle: RawFramebuffer) {
        self.release(handle.0, "framebuffer");
    }

    fn destroy_pipeline(&self, handle: RawPipeline) {
        self.release(handle.0, "pipeline");
    }

    fn destroy_descriptor_set_layout(&self, handle: RawDescriptorSetLayout) {
        self.release(handle.0, "descriptor_set_layout");
    }

    fn destroy_descriptor_pool(&self, handle: RawDescriptorPool) {
        self.release(handle.0, "descriptor_pool");
    }

    fn destroy_semaphore(&self, handle: RawSemaphore) {
        self.release(handle.0, "semaphore");
    }

    fn destroy_fence(&self, handle: RawFence) {
        self.state.lock().fences.remove(&handle.0);
        self.release(handle.0, "fence");
    }

    fn free_cmd_buffer(&self, handle: RawCmdBuffer) {
        self.release(handle.0, "cmd_buffer");
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum RecordedCommand {
    Barrier(BarrierDesc),
    BeginRenderPass {
        framebuffer: RawFramebuffer,
        attachments: Vec<RenderAttachment>,
    },
    EndRenderPass,
    Dispatch([u32; 3]),
    Draw {
        vertices: u32,
        instances: u32,
    },
    CopyBuffer {
        src: RawBuffer,
        dst: RawBuffer,
        size: u64,
    },
    CopyImage {
        src: RawImage,
        dst: RawImage,
    },
    CopyImageToBuffer {
        src: RawImage,
        dst: RawBuffer,
    },
}

/// Captures the recorded stream so tests can assert on pass and barrier
/// ordering.
#[derive(Default)]
pub struct HeadlessRecorder {
    pub commands: Vec<RecordedCommand>,
}

impl HeadlessRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn barriers(&self) -> impl Iterator<Item = &BarrierDesc> {
        self.commands.iter().filter_map(|c| match c {
            RecordedCommand::Barrier(b) => Some(b),
            _ => None,
        })
    }
}

impl CmdRecorder for HeadlessRecorder {
    fn pipeline_barrier(&mut self, barrier: &BarrierDesc) {
        self.commands.push(RecordedCommand::Barrier(*barrier));
    }

    fn begin_render_pass(&mut self, framebuffer: RawFramebuffer, attachments: &[RenderAttachment]) {
        self.commands.push(RecordedCommand::BeginRenderPass {
            framebuffer,
            attachments: attachments.to_vec(),
        });
    }

    fn end_render_pass(&mut self) {
        self.commands.push(RecordedCommand::EndRenderPass);
    }

    fn dispatch(&mut self, groups: [u32; 3]) {
        self.commands.push(RecordedCommand::Dispatch(groups));
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.commands.push(RecordedCommand::Draw {
            vertices: vertex_count,
            instances: instance_count,
        });
    }

    fn copy_buffer(&mut self, src: RawBuffer, dst: RawBuffer, size: u64) {
        self.commands.push(RecordedCommand::CopyBuffer { src, dst, size });
    }

    fn copy_image(&mut self, src: RawImage, dst: RawImage) {
        self.commands.push(RecordedCommand::CopyImage { src, dst });
    }

    fn copy_image_to_buffer(&mut self, src: RawImage, dst: RawBuffer) {
        self.commands
            .push(RecordedCommand::CopyImageToBuffer { src, dst });
    }
}
