use std::any::TypeId;
use std::collections::HashMap;
use std::mem::MaybeUninit;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Marker for anything that can live in a component pool. Components cross
/// thread boundaries during parallel stages, so `Send + Sync` is required.
pub trait Component: Send + Sync + 'static {}
impl<T: Send + Sync + 'static> Component for T {}

pub type ComponentTypeIndex = u32;

/// Process-wide token for a component type. The index is assigned the first
/// time a type is seen and never changes afterwards; equality and ordering
/// only look at the index.
#[derive(Clone, Copy, Debug)]
pub struct ComponentType {
    index: ComponentTypeIndex,
    name: &'static str,
}

impl ComponentType {
    pub fn index(&self) -> ComponentTypeIndex {
        self.index
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ComponentType {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for ComponentType {}

impl PartialOrd for ComponentType {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComponentType {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl std::hash::Hash for ComponentType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

static TYPE_REGISTRY: Lazy<RwLock<HashMap<TypeId, ComponentType>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

pub fn component_type<T: Component>() -> ComponentType {
    let type_id = TypeId::of::<T>();
    if let Some(ty) = TYPE_REGISTRY.read().get(&type_id) {
        return *ty;
    }

    let mut registry = TYPE_REGISTRY.write();
    if let Some(ty) = registry.get(&type_id) {
        return *ty;
    }
    let ty = ComponentType {
        index: registry.len() as ComponentTypeIndex,
        name: short_type_name::<T>(),
    };
    registry.insert(type_id, ty);
    ty
}

pub const GENERATION_MASK: u32 = 0x7fff_ffff;
const MUTATED_BIT: u32 = 0x8000_0000;

/// Slot metadata word: generation in the low 31 bits (0 means the slot is
/// empty), mutated flag in the top bit.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Metadata(u32);

impl Metadata {
    pub fn empty() -> Self {
        Metadata(0)
    }

    pub fn generation(&self) -> u32 {
        self.0 & GENERATION_MASK
    }

    pub fn is_empty(&self) -> bool {
        self.generation() == 0
    }

    pub fn set_generation(&mut self, generation: u32) {
        debug_assert!(self.is_empty());
        debug_assert!(generation != 0 && generation <= GENERATION_MASK);
        self.0 = generation;
    }

    pub fn mutate(&mut self) {
        debug_assert!(!self.is_empty());
        self.0 |= MUTATED_BIT;
    }

    pub fn is_mutated(&self) -> bool {
        (self.0 & MUTATED_BIT) != 0
    }

    pub fn clear_mutated(&mut self) {
        self.0 &= !MUTATED_BIT;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// One component slot inside a page: raw storage plus the metadata word.
/// Non-empty iff the generation is non-zero.
#[repr(C)]
pub struct ComponentStorage<T> {
    storage: MaybeUninit<T>,
    metadata: Metadata,
}

impl<T> ComponentStorage<T> {
    pub fn metadata(&self) -> Metadata {
        self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn generation(&self) -> u32 {
        self.metadata.generation()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Safety: the slot must be empty.
    pub unsafe fn init(&mut self, generation: u32, value: T) {
        debug_assert!(self.is_empty());
        self.storage.write(value);
        self.metadata.set_generation(generation);
    }

    /// Safety: the slot must not be empty.
    pub unsafe fn destroy(&mut self) {
        debug_assert!(!self.is_empty());
        self.metadata.clear();
        self.storage.assume_init_drop();

        #[cfg(debug_assertions)]
        {
            let bytes = self.storage.as_mut_ptr() as *mut u8;
            std::ptr::write_bytes(bytes, 0xfe, std::mem::size_of::<T>());
        }
    }

    /// Safety: the slot must not be empty.
    pub unsafe fn value(&self) -> &T {
        debug_assert!(!self.is_empty());
        self.storage.assume_init_ref()
    }

    /// Safety: the slot must not be empty. Sets the mutated flag.
    pub unsafe fn value_mut(&mut self) -> &mut T {
        debug_assert!(!self.is_empty());
        self.metadata.mutate();
        self.storage.assume_init_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_indices_are_stable() {
        struct A;
        struct B;

        let a0 = component_type::<A>();
        let b0 = component_type::<B>();
        let a1 = component_type::<A>();

        assert_eq!(a0, a1);
        assert_ne!(a0, b0);
        assert_eq!(a0.name(), "A");
    }

    #[test]
    fn metadata_packing() {
        let mut meta = Metadata::empty();
        assert!(meta.is_empty());

        meta.set_generation(7);
        assert_eq!(meta.generation(), 7);
        assert!(!meta.is_mutated());

        meta.mutate();
        assert!(meta.is_mutated());
        assert_eq!(meta.generation(), 7);

        meta.clear_mutated();
        assert!(!meta.is_mutated());

        meta.clear();
        assert!(meta.is_empty());
    }
}
