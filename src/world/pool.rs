use crate::common::fatal;
use crate::world::component::{component_type, Component, ComponentType};
use crate::world::page::{slot_count, PagePtr, PageVtable};
use crate::world::refs::ComponentRef;

/// Owns every component of one type: a set of page allocations plus the
/// free list of empty slots. The pool address is baked into page headers,
/// so a pool must not move once it has pages; the world keeps its owning
/// container boxed for exactly that reason.
pub struct ComponentPool<T: Component> {
    ty: ComponentType,
    container: *mut (),
    vtable: Option<&'static PageVtable>,
    pages: Vec<PagePtr<T>>,
    free: Vec<ComponentRef<T>>,
}

unsafe impl<T: Component> Send for ComponentPool<T> {}
unsafe impl<T: Component> Sync for ComponentPool<T> {}

impl<T: Component> ComponentPool<T> {
    pub fn new() -> Self {
        Self {
            ty: component_type::<T>(),
            container: std::ptr::null_mut(),
            vtable: None,
            pages: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn ty(&self) -> ComponentType {
        self.ty
    }

    /// Called once by the owning container after it has been boxed, so page
    /// headers get a stable back-reference.
    pub(crate) fn register_container(&mut self, container: *mut (), vtable: &'static PageVtable) {
        debug_assert!(self.pages.is_empty());
        self.container = container;
        self.vtable = vtable.into();
    }

    pub fn add(&mut self, value: T) -> ComponentRef<T> {
        let r = self.create_ref();
        // Safety: create_ref only hands out empty slots.
        unsafe { (*r.storage()).init(r.generation(), value) };
        r
    }

    pub fn remove(&mut self, r: ComponentRef<T>) {
        if r.is_null() {
            return;
        }
        debug_assert!(self.owns(r), "Component ref removed through a foreign pool.");

        // Safety: the slot lives in one of our pages.
        unsafe {
            if (*r.storage()).is_empty() || r.is_stale() {
                return;
            }
            (*r.storage()).destroy();
        }
        self.free.push(r);
    }

    pub fn get(&self, r: ComponentRef<T>) -> Option<&T> {
        // Safety: the returned borrow is tied to the pool borrow.
        unsafe { r.resolve() }
    }

    pub fn get_mut(&mut self, r: ComponentRef<T>) -> Option<&mut T> {
        // Safety: exclusive through `&mut self`.
        unsafe { r.resolve_mut() }
    }

    /// Interior-mutable variant used by write guards.
    ///
    /// Safety: the caller must hold the container's write borrow.
    pub(crate) unsafe fn get_mut_unchecked(&self, r: ComponentRef<T>) -> Option<&mut T> {
        r.resolve_mut()
    }

    pub fn owns(&self, r: ComponentRef<T>) -> bool {
        let ptr = r.storage() as *const u8;
        self.pages.iter().any(|page| page.contains(ptr))
    }

    fn create_ref(&mut self) -> ComponentRef<T> {
        if self.free.is_empty() {
            self.create_page();
        }
        let r = self.free.pop().expect("Fresh page produced no free slots.");
        r.with_generation(r.next_generation())
    }

    fn create_page(&mut self) {
        let Some(vtable) = self.vtable else {
            fatal("Component pool used before its container was registered.");
        };
        let page = PagePtr::alloc(self.ty, self.container, vtable);
        for i in 0..slot_count::<T>() {
            let slot = page.slot(i);
            let generation = unsafe { slot.as_ref() }.generation();
            self.free.push(ComponentRef::new(slot.as_ptr(), generation));
        }
        self.pages.push(page);
    }
}

impl<T: Component> Drop for ComponentPool<T> {
    fn drop(&mut self) {
        let Some(vtable) = self.vtable else {
            return;
        };
        for page in &self.pages {
            for i in 0..slot_count::<T>() {
                // Safety: pool teardown, nothing can observe the slots.
                // Empty slots are skipped by the erased drop.
                unsafe { (vtable.drop_slot)(page.slot(i).as_ptr() as *mut u8) };
            }
        }
    }
}
