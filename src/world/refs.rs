use crate::world::component::{Component, ComponentStorage, ComponentType, GENERATION_MASK};
use crate::world::page;

/// Generation-checked handle to a component slot. Copyable and cheap to
/// store; a ref whose slot has been reused since it was issued reads as
/// `None` on resolution instead of dangling.
pub struct ComponentRef<T> {
    ptr: *mut ComponentStorage<T>,
    generation: u32,
}

impl<T> Copy for ComponentRef<T> {}

impl<T> Clone for ComponentRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for ComponentRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.generation == other.generation
    }
}

impl<T> Eq for ComponentRef<T> {}

impl<T> std::fmt::Debug for ComponentRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRef")
            .field("ptr", &self.ptr)
            .field("generation", &self.generation)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

// Refs point into pages owned by the pools of the world they came from.
// Access always goes through a world borrow, which keeps the pages alive.
unsafe impl<T: Send> Send for ComponentRef<T> {}
unsafe impl<T: Sync> Sync for ComponentRef<T> {}

impl<T: Component> ComponentRef<T> {
    pub fn null() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            generation: 0,
        }
    }

    pub(crate) fn new(ptr: *mut ComponentStorage<T>, generation: u32) -> Self {
        Self { ptr, generation }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn storage(&self) -> *mut ComponentStorage<T> {
        self.ptr
    }

    /// The generation the slot will carry next time it is handed out.
    pub(crate) fn next_generation(&self) -> u32 {
        let next = (self.generation + 1) & GENERATION_MASK;
        if next == 0 {
            1
        } else {
            next
        }
    }

    pub(crate) fn with_generation(&self, generation: u32) -> Self {
        Self {
            ptr: self.ptr,
            generation,
        }
    }

    /// Safety: the owning pool must be alive.
    pub unsafe fn is_stale(&self) -> bool {
        debug_assert!(!self.is_null());
        (*self.ptr).generation() != self.generation
    }

    /// Safety: the owning pool must be alive for `'a`, and no `&mut T` to the
    /// same slot may exist for `'a`.
    pub(crate) unsafe fn resolve<'a>(&self) -> Option<&'a T> {
        if self.is_null() || self.is_stale() {
            return None;
        }
        Some((*self.ptr).value())
    }

    /// Safety: the owning pool must be alive for `'a`, and this must be the
    /// only live reference to the slot for `'a`. Sets the mutated flag.
    pub(crate) unsafe fn resolve_mut<'a>(&self) -> Option<&'a mut T> {
        if self.is_null() || self.is_stale() {
            return None;
        }
        Some((*self.ptr).value_mut())
    }
}

/// Type-erased component ref. The component type is not stored; it is
/// recovered from the page header by masking the slot pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UntypedComponentRef {
    ptr: *mut u8,
    generation: u32,
}

unsafe impl Send for UntypedComponentRef {}
unsafe impl Sync for UntypedComponentRef {}

impl UntypedComponentRef {
    pub fn null() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            generation: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Safety: the owning pool must be alive.
    pub unsafe fn ty(&self) -> ComponentType {
        debug_assert!(!self.is_null());
        (*page::header_from_ptr(self.ptr)).ty
    }

    /// Safety: the owning pool must be alive.
    pub unsafe fn is<T: Component>(&self) -> bool {
        !self.is_null() && self.ty() == crate::world::component::component_type::<T>()
    }

    /// Safety: the owning pool must be alive.
    pub unsafe fn to_typed<T: Component>(&self) -> Option<ComponentRef<T>> {
        if !self.is::<T>() {
            return None;
        }
        Some(self.to_typed_unchecked())
    }

    /// Safety: the owning pool must be alive and the erased type must be `T`.
    pub unsafe fn to_typed_unchecked<T: Component>(&self) -> ComponentRef<T> {
        debug_assert!(self.is::<T>());
        ComponentRef::new(self.ptr as *mut ComponentStorage<T>, self.generation)
    }

    /// Removes the referenced component through its owning container, found
    /// via the page header back-reference.
    ///
    /// Safety: the owning pool must be alive and registered (pages are only
    /// ever created by a registered container).
    pub(crate) unsafe fn remove_through_container(self) {
        if self.is_null() {
            return;
        }
        let header = page::header_from_ptr(self.ptr);
        ((*header).vtable.remove)((*header).container, self);
    }
}

impl<T: Component> From<ComponentRef<T>> for UntypedComponentRef {
    fn from(r: ComponentRef<T>) -> Self {
        Self {
            ptr: r.ptr as *mut u8,
            generation: r.generation,
        }
    }
}
