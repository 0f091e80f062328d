use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::fatal;
use crate::common::freelist::{FreeList, FreeListHandle};
use crate::graphics::backend::{
    DeviceBackend, DeviceError, RawDescriptorPool, RawDescriptorSetLayout, RawImageView,
};
use crate::graphics::lifetime::{DeferredDestroy, LifetimeManager};

/// Bindless image table. Append-only during a frame; index allocation is a
/// short critical section. The table is declared `UPDATE_AFTER_BIND |
/// PARTIALLY_BOUND` on real devices, which is what makes writing slots
/// while bound legal; removal goes through the lifetime manager.
pub struct DescriptorArray {
    lifetime: Arc<LifetimeManager>,
    layout: RawDescriptorSetLayout,
    pool: RawDescriptorPool,
    slots: Mutex<FreeList<RawImageView>>,
    capacity: u32,
}

impl DescriptorArray {
    pub fn new(
        device: &Arc<dyn DeviceBackend>,
        lifetime: Arc<LifetimeManager>,
        capacity: u32,
    ) -> Result<Self, DeviceError> {
        let layout = device.create_descriptor_set_layout(capacity)?;
        let pool = device.create_descriptor_pool(capacity)?;
        Ok(Self {
            lifetime,
            layout,
            pool,
            slots: Mutex::new(FreeList::new()),
            capacity,
        })
    }

    /// Allocates a slot for the view and returns its bindless index.
    pub fn add(&self, view: RawImageView) -> u32 {
        let mut slots = self.slots.lock();
        if slots.len() as u32 >= self.capacity {
            fatal("Bindless descriptor array is full.");
        }
        slots.push(view).index() as u32
    }

    /// Frees the slot; the underlying view is destroyed once the GPU can no
    /// longer reference it.
    pub fn remove(&self, index: u32) {
        let view = self
            .slots
            .lock()
            .remove(FreeListHandle::new(index as usize));
        self.lifetime.destroy_later(DeferredDestroy::ImageView(view));
    }

    pub fn get(&self, index: u32) -> Option<RawImageView> {
        self.slots
            .lock()
            .get(FreeListHandle::new(index as usize))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Drop for DescriptorArray {
    fn drop(&mut self) {
        self.lifetime
            .destroy_later(DeferredDestroy::DescriptorPool(self.pool));
        self.lifetime
            .destroy_later(DeferredDestroy::DescriptorSetLayout(self.layout));
    }
}
