use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::consts::gfx::COLLECT_INTERVAL_MS;
use crate::graphics::backend::{
    DeviceBackend, RawBuffer, RawDescriptorPool, RawDescriptorSetLayout, RawFence, RawFramebuffer,
    RawImage, RawImageView, RawPipeline, RawSemaphore,
};

/// Monotone counter stamped on every command-buffer submission. A value of
/// F means "the GPU has acknowledged all work up to and including F" once
/// `last_signalled` reaches it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ResourceFence(pub u64);

/// A GPU handle waiting for its keep-until fence.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeferredDestroy {
    Image(RawImage),
    ImageView(RawImageView),
    Buffer(RawBuffer),
    Framebuffer(RawFramebuffer),
    Pipeline(RawPipeline),
    DescriptorSetLayout(RawDescriptorSetLayout),
    DescriptorPool(RawDescriptorPool),
    Semaphore(RawSemaphore),
    Fence(RawFence),
}

struct LifetimeShared {
    device: Arc<dyn DeviceBackend>,
    /// The fence the next submission will be stamped with.
    next_fence: AtomicU64,
    /// Largest fence whose command buffer reported completion.
    last_signalled: AtomicU64,
    /// FIFO of handles keyed by their keep-until fence.
    queue: Mutex<VecDeque<(u64, DeferredDestroy)>>,
    /// Submitted command buffers in submission order.
    in_flight: Mutex<VecDeque<(u64, RawFence)>>,
    shut_down: AtomicBool,
    wake_lock: Mutex<bool>,
    wake: Condvar,
}

impl LifetimeShared {
    fn destroy_now(&self, resource: DeferredDestroy) {
        match resource {
            DeferredDestroy::Image(h) => self.device.destroy_image(h),
            DeferredDestroy::ImageView(h) => self.device.destroy_image_view(h),
            DeferredDestroy::Buffer(h) => self.device.destroy_buffer(h),
            DeferredDestroy::Framebuffer(h) => self.device.destroy_framebuffer(h),
            DeferredDestroy::Pipeline(h) => self.device.destroy_pipeline(h),
            DeferredDestroy::DescriptorSetLayout(h) => {
                self.device.destroy_descriptor_set_layout(h)
            }
            DeferredDestroy::DescriptorPool(h) => self.device.destroy_descriptor_pool(h),
            DeferredDestroy::Semaphore(h) => self.device.destroy_semaphore(h),
            DeferredDestroy::Fence(h) => self.device.destroy_fence(h),
        }
    }

    /// Advances `last_signalled` by polling device fences in submission
    /// order. Never blocks.
    fn poll_fences(&self) {
        let mut in_flight = self.in_flight.lock();
        while let Some((resource_fence, fence)) = in_flight.front().copied() {
            if !self.device.fence_signalled(fence) {
                break;
            }
            self.last_signalled.fetch_max(resource_fence, Ordering::AcqRel);
            in_flight.pop_front();
        }
    }

    /// Destroys every queued handle whose fence has been acknowledged.
    fn collect_ready(&self) {
        let last = self.last_signalled.load(Ordering::Acquire);
        loop {
            let ready = {
                let mut queue = self.queue.lock();
                match queue.front() {
                    Some((fence, _)) if *fence <= last => queue.pop_front(),
                    _ => None,
                }
            };
            let Some((_, resource)) = ready else {
                break;
            };
            self.destroy_now(resource);
        }
    }
}

/// Keeps GPU resources alive until the GPU is provably done with them.
/// `destroy_later` is safe from any thread and never blocks on the device;
/// a dedicated collector thread frees what the fences allow.
pub struct LifetimeManager {
    shared: Arc<LifetimeShared>,
    collector: Option<std::thread::JoinHandle<()>>,
}

impl LifetimeManager {
    pub fn new(device: Arc<dyn DeviceBackend>) -> Self {
        let shared = Arc::new(LifetimeShared {
            device,
            next_fence: AtomicU64::new(1),
            last_signalled: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(VecDeque::new()),
            shut_down: AtomicBool::new(false),
            wake_lock: Mutex::new(false),
            wake: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let collector = std::thread::Builder::new()
            .name("yave-collector".to_string())
            .spawn(move || {
                loop {
                    {
                        let mut nudged = thread_shared.wake_lock.lock();
                        if !*nudged {
                            thread_shared
                                .wake
                                .wait_for(&mut nudged, Duration::from_millis(COLLECT_INTERVAL_MS));
                        }
                        *nudged = false;
                    }
                    if thread_shared.shut_down.load(Ordering::Acquire) {
                        break;
                    }
                    thread_shared.poll_fences();
                    thread_shared.collect_ready();
                }
            })
            .expect("Failed to spawn the lifetime collector thread.");

        Self {
            shared,
            collector: Some(collector),
        }
    }

    pub fn device(&self) -> &Arc<dyn DeviceBackend> {
        &self.shared.device
    }

    /// The fence the next submission will carry; resources destroyed now
    /// are kept until a buffer with this fence completes.
    pub fn current_fence(&self) -> ResourceFence {
        ResourceFence(self.shared.next_fence.load(Ordering::Acquire))
    }

    pub fn last_signalled(&self) -> ResourceFence {
        ResourceFence(self.shared.last_signalled.load(Ordering::Acquire))
    }

    /// Stamps a submission with the next resource fence and tracks its
    /// device fence for completion polling.
    pub(crate) fn stamp_submission(&self, device_fence: RawFence) -> ResourceFence {
        let fence = self.shared.next_fence.fetch_add(1, Ordering::AcqRel);
        self.shared.in_flight.lock().push_back((fence, device_fence));
        ResourceFence(fence)
    }

    /// Enqueues a handle for destruction once the GPU has passed the
    /// current resource fence. After shutdown the handle is destroyed
    /// inline, best effort.
    pub fn destroy_later(&self, resource: DeferredDestroy) {
        if self.shared.shut_down.load(Ordering::Acquire) {
            debug_assert!(false, "destroy_later after shutdown");
            self.shared.destroy_now(resource);
            return;
        }
        let fence = self.shared.next_fence.load(Ordering::Acquire);
        self.shared.queue.lock().push_back((fence, resource));
        self.nudge();
    }

    /// One synchronous collection pass.
    pub fn collect(&self) {
        self.shared.poll_fences();
        self.shared.collect_ready();
    }

    /// Blocks until the device is idle, then acknowledges every stamped
    /// fence. A following `collect` (done here) frees all pending handles.
    pub fn wait_all_queues(&self) {
        self.shared.device.wait_idle();
        self.shared.poll_fences();
        self.shared
            .last_signalled
            .fetch_max(self.shared.next_fence.load(Ordering::Acquire), Ordering::AcqRel);
        self.shared.in_flight.lock().clear();
        self.shared.collect_ready();
    }

    pub fn pending_destructions(&self) -> usize {
        self.shared.queue.lock().len()
    }

    fn nudge(&self) {
        let mut nudged = self.shared.wake_lock.lock();
        *nudged = true;
        self.shared.wake.notify_one();
    }

    /// Stops the collector and drains every queue after a full device wait.
    pub fn shutdown(&mut self) {
        if let Some(collector) = self.collector.take() {
            self.shared.shut_down.store(true, Ordering::Release);
            self.nudge();
            let _ = collector.join();
            self.wait_all_queues();
        }
    }
}

impl Drop for LifetimeManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
