use std::cell::UnsafeCell;

use downcast::{downcast_sync, AnySync};

use crate::world::borrow::AtomicBorrow;
use crate::world::component::{Component, ComponentStorage, ComponentType};
use crate::world::entity::EntityId;
use crate::world::page::PageVtable;
use crate::world::pool::ComponentPool;
use crate::world::refs::{ComponentRef, UntypedComponentRef};

/// Type-erased view of a component container, for the handful of operations
/// the world needs without knowing the component type.
pub trait ContainerAny: AnySync {
    fn ty(&self) -> ComponentType;
    fn len(&self) -> usize;
    /// Entities owning a component of this type, ascending by index.
    fn owner_ids(&self) -> Vec<EntityId>;
    /// Entities whose component was mutably accessed since the last commit.
    fn mutated_ids(&self) -> Vec<EntityId>;
    fn clear_mutated(&mut self);
    fn remove_untyped(&mut self, id: EntityId, r: UntypedComponentRef);
    fn structural_version(&self) -> u64;
    /// Stores the boxed self pointer into future page headers. Must be
    /// called once, after the container lands at its final address.
    fn register_backref(&mut self);
}
downcast_sync!(dyn ContainerAny);

/// All components of one type: the paged pool plus the owner list that maps
/// slots back to entities.
pub struct ComponentContainer<T: Component> {
    pool: ComponentPool<T>,
    owners: Vec<(EntityId, ComponentRef<T>)>,
    version: u64,
}

unsafe fn remove_erased<T: Component>(container: *mut (), r: UntypedComponentRef) {
    let container = &mut *(container as *mut ComponentContainer<T>);
    container.remove_by_ref(r.to_typed_unchecked::<T>());
}

unsafe fn drop_slot_erased<T: Component>(slot: *mut u8) {
    let storage = &mut *(slot as *mut ComponentStorage<T>);
    if !storage.is_empty() {
        storage.destroy();
    }
}

fn vtable_of<T: Component>() -> &'static PageVtable {
    struct VtableOf<T>(std::marker::PhantomData<T>);
    impl<T: Component> VtableOf<T> {
        const VTABLE: PageVtable = PageVtable {
            remove: remove_erased::<T>,
            drop_slot: drop_slot_erased::<T>,
        };
    }
    &VtableOf::<T>::VTABLE
}

impl<T: Component> ComponentContainer<T> {
    pub fn new() -> Self {
        Self {
            pool: ComponentPool::new(),
            owners: Vec::new(),
            version: 0,
        }
    }

    pub fn add(&mut self, id: EntityId, value: T) -> ComponentRef<T> {
        let r = self.pool.add(value);
        // Fresh components count as mutated until the next commit so change
        // detection picks them up.
        unsafe { (*r.storage()).metadata_mut().mutate() };
        let at = self
            .owners
            .binary_search_by_key(&id.index(), |(owner, _)| owner.index())
            .unwrap_or_else(|at| at);
        self.owners.insert(at, (id, r));
        self.version += 1;
        r
    }

    pub fn remove_for_entity(&mut self, id: EntityId) {
        if let Some(at) = self.owners.iter().position(|(owner, _)| *owner == id) {
            let (_, r) = self.owners.remove(at);
            self.pool.remove(r);
            self.version += 1;
        }
    }

    pub fn remove_by_ref(&mut self, r: ComponentRef<T>) {
        if let Some(at) = self.owners.iter().position(|(_, held)| *held == r) {
            self.owners.remove(at);
            self.version += 1;
        }
        self.pool.remove(r);
    }

    pub fn get(&self, r: ComponentRef<T>) -> Option<&T> {
        self.pool.get(r)
    }

    pub fn get_mut(&mut self, r: ComponentRef<T>) -> Option<&mut T> {
        self.pool.get_mut(r)
    }

    /// Safety: the caller must hold this container's write borrow.
    pub(crate) unsafe fn get_mut_unchecked(&self, r: ComponentRef<T>) -> Option<&mut T> {
        self.pool.get_mut_unchecked(r)
    }

    pub fn ref_for(&self, id: EntityId) -> Option<ComponentRef<T>> {
        self.owners
            .iter()
            .find(|(owner, _)| *owner == id)
            .map(|(_, r)| *r)
    }

    pub fn owners(&self) -> &[(EntityId, ComponentRef<T>)] {
        &self.owners
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.owners
            .iter()
            .filter_map(|(id, r)| self.pool.get(*r).map(|value| (*id, value)))
    }
}

impl<T: Component> ContainerAny for ComponentContainer<T> {
    fn ty(&self) -> ComponentType {
        self.pool.ty()
    }

    fn len(&self) -> usize {
        self.owners.len()
    }

    fn owner_ids(&self) -> Vec<EntityId> {
        self.owners.iter().map(|(id, _)| *id).collect()
    }

    fn mutated_ids(&self) -> Vec<EntityId> {
        self.owners
            .iter()
            .filter(|(_, r)| unsafe { !r.is_null() && (*r.storage()).metadata().is_mutated() })
            .map(|(id, _)| *id)
            .collect()
    }

    fn clear_mutated(&mut self) {
        for (_, r) in &self.owners {
            // Safety: exclusive through `&mut self`.
            unsafe { (*r.storage()).metadata_mut().clear_mutated() };
        }
    }

    fn remove_untyped(&mut self, id: EntityId, r: UntypedComponentRef) {
        debug_assert_eq!(self.ref_for(id).map(UntypedComponentRef::from), Some(r));
        self.remove_for_entity(id);
    }

    fn structural_version(&self) -> u64 {
        self.version
    }

    fn register_backref(&mut self) {
        let container = self as *mut Self as *mut ();
        self.pool.register_container(container, vtable_of::<T>());
    }
}

/// A boxed container plus its borrow word. The `UnsafeCell` is what lets
/// parallel systems acquire write guards through a shared world borrow; the
/// borrow word makes that sound at runtime.
pub(crate) struct ContainerSlot {
    pub borrow: AtomicBorrow,
    cell: UnsafeCell<Box<dyn ContainerAny>>,
}

unsafe impl Send for ContainerSlot {}
unsafe impl Sync for ContainerSlot {}

impl ContainerSlot {
    pub fn new(mut container: Box<dyn ContainerAny>) -> Self {
        container.register_backref();
        Self {
            borrow: AtomicBorrow::new(),
            cell: UnsafeCell::new(container),
        }
    }

    pub fn get(&self) -> &dyn ContainerAny {
        // Safety: shared view; mutation goes through get_mut or a held
        // write borrow.
        unsafe { (*self.cell.get()).as_ref() }
    }

    pub fn get_mut(&mut self) -> &mut dyn ContainerAny {
        self.cell.get_mut().as_mut()
    }

    /// Safety: the caller must hold this slot's write borrow.
    pub unsafe fn get_mut_unchecked(&self) -> &mut dyn ContainerAny {
        (*self.cell.get()).as_mut()
    }
}
