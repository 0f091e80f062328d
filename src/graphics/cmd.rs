use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::graphics::backend::{DeviceBackend, RawCmdBuffer, RawFence};
use crate::graphics::lifetime::{LifetimeManager, ResourceFence};

/// One reusable command buffer: the device handle, its completion fence,
/// the resource fence of its last submission and the fences of submissions
/// it depends on.
pub struct CmdBufferData {
    raw: RawCmdBuffer,
    fence: RawFence,
    resource_fence: ResourceFence,
    dependency_fences: Vec<RawFence>,
}

struct PoolShared {
    device: Arc<dyn DeviceBackend>,
    free: Mutex<Vec<CmdBufferData>>,
    /// Every fence this pool ever created, for the blocking join on drop.
    fences: Mutex<Vec<RawFence>>,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        // All wrappers are gone by now (they keep the Arc alive), so every
        // buffer is parked in the free list. A fence that never signals
        // leaves this wait stuck, which is the documented fatal case.
        for fence in self.fences.get_mut().iter() {
            self.device.wait_fence(*fence);
        }
        for data in self.free.get_mut().drain(..) {
            for dependency in &data.dependency_fences {
                self.device.wait_fence(*dependency);
            }
            self.device.free_cmd_buffer(data.raw);
            self.device.destroy_fence(data.fence);
        }
    }
}

/// Thread-owned command-buffer pool. Allocation recycles the first parked
/// buffer whose fence has signalled, without ever blocking on the GPU;
/// releases (wrapper drops) may come from any thread.
pub struct CmdBufferPool {
    shared: Arc<PoolShared>,
    thread: ThreadId,
}

impl CmdBufferPool {
    pub fn new(device: Arc<dyn DeviceBackend>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                device,
                free: Mutex::new(Vec::new()),
                fences: Mutex::new(Vec::new()),
            }),
            thread: std::thread::current().id(),
        }
    }

    pub fn allocate(&self) -> CmdBuffer {
        assert_eq!(
            std::thread::current().id(),
            self.thread,
            "Command buffers are allocated from the pool's owning thread only."
        );

        let recycled = {
            let mut free = self.shared.free.lock();
            free.iter()
                .position(|data| self.shared.device.fence_signalled(data.fence))
                .map(|at| free.swap_remove(at))
        };

        if let Some(mut data) = recycled {
            self.shared.device.reset_cmd_buffer(data.raw);
            data.dependency_fences.clear();
            data.resource_fence = ResourceFence(0);
            return CmdBuffer {
                data: Some(data),
                pool: self.shared.clone(),
            };
        }

        let raw = self.shared.device.create_cmd_buffer();
        let fence = self.shared.device.create_fence();
        self.shared.fences.lock().push(fence);
        CmdBuffer {
            data: Some(CmdBufferData {
                raw,
                fence,
                resource_fence: ResourceFence(0),
                dependency_fences: Vec::new(),
            }),
            pool: self.shared.clone(),
        }
    }

    pub fn parked_buffers(&self) -> usize {
        self.shared.free.lock().len()
    }
}

/// RAII wrapper around a pooled command buffer; dropping it returns the
/// buffer to its pool, in flight or not.
pub struct CmdBuffer {
    data: Option<CmdBufferData>,
    pool: Arc<PoolShared>,
}

impl CmdBuffer {
    pub fn raw(&self) -> RawCmdBuffer {
        self.data.as_ref().expect("Buffer was released.").raw
    }

    pub fn fence(&self) -> RawFence {
        self.data.as_ref().expect("Buffer was released.").fence
    }

    /// The resource fence stamped at submission; zero before that.
    pub fn resource_fence(&self) -> ResourceFence {
        self.data
            .as_ref()
            .expect("Buffer was released.")
            .resource_fence
    }

    pub fn wait_for(&mut self, fence: RawFence) {
        self.data
            .as_mut()
            .expect("Buffer was released.")
            .dependency_fences
            .push(fence);
    }

    fn data_mut(&mut self) -> &mut CmdBufferData {
        self.data.as_mut().expect("Buffer was released.")
    }
}

impl Drop for CmdBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.free.lock().push(data);
        }
    }
}

/// Submission entry point: stamps the buffer with the next resource fence,
/// resets its device fence and hands it to the device. In-queue submission
/// order defines GPU execution order.
pub struct CmdQueue {
    device: Arc<dyn DeviceBackend>,
    lifetime: Arc<LifetimeManager>,
}

impl CmdQueue {
    pub fn new(device: Arc<dyn DeviceBackend>, lifetime: Arc<LifetimeManager>) -> Self {
        Self { device, lifetime }
    }

    pub fn submit(&self, cmd: &mut CmdBuffer) -> ResourceFence {
        let data = cmd.data_mut();
        self.device.reset_fence(data.fence);
        let resource_fence = self.lifetime.stamp_submission(data.fence);
        data.resource_fence = resource_fence;
        self.device.submit(data.raw, data.fence);
        resource_fence
    }
}
