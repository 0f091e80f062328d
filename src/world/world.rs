use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::common::fatal;
use crate::world::borrow::AtomicBorrow;
use crate::world::component::{component_type, Component, ComponentType, ComponentTypeIndex};
use crate::world::components::register_builtin_components;
use crate::world::container::{ComponentContainer, ContainerAny, ContainerSlot};
use crate::world::entity::{Entity, EntityContainer, EntityId};
use crate::world::group::{Group, GroupKey};
use crate::world::query::{Query, QueryBorrow};
use crate::world::refs::ComponentRef;
use crate::world::schedule::{run_parallel_stage, System, SystemStage};
use crate::world::tag::TagSet;

#[derive(Default)]
struct DeferredChanges {
    removed_entities: Vec<EntityId>,
    removed_components: Vec<(EntityId, ComponentTypeIndex)>,
}

/// The game world: entity identities, one component container per type,
/// tag sets, cached groups, registered systems and the deferred-change log
/// drained at the end of every tick.
pub struct World {
    entities: EntityContainer,
    containers: HashMap<ComponentTypeIndex, ContainerSlot>,
    tags: BTreeMap<String, TagSet>,
    groups: HashMap<GroupKey, Group>,
    systems: Vec<Box<dyn System>>,
    deferred: Mutex<DeferredChanges>,
    recently_added: Vec<EntityId>,
}

impl World {
    pub fn new() -> Self {
        register_builtin_components();
        Self {
            entities: EntityContainer::new(),
            containers: HashMap::new(),
            tags: BTreeMap::new(),
            groups: HashMap::new(),
            systems: Vec::new(),
            deferred: Mutex::new(DeferredChanges::default()),
            recently_added: Vec::new(),
        }
    }

    // --- entities ---

    pub fn create_entity(&mut self) -> EntityId {
        let id = self.entities.create();
        self.recently_added.push(id);
        id
    }

    /// Recreates an entity under a known id (undo, scene loading).
    pub fn create_entity_with_id(&mut self, id: EntityId) {
        self.entities.create_with_id(id);
        self.recently_added.push(id);
    }

    /// Enqueued onto the deferred log; the entity disappears at the next
    /// commit point (end of tick, or an explicit `commit`). Keeping the
    /// entity observable until then is what lets change tracking box its
    /// components for undo.
    pub fn remove_entity(&self, id: EntityId) {
        debug_assert!(self.exists(id), "Removed a dead entity.");
        self.deferred.lock().removed_entities.push(id);
    }

    pub fn exists(&self, id: EntityId) -> bool {
        self.entities.exists(id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn set_parent(&mut self, id: EntityId, parent: EntityId) {
        if parent.is_valid() && !self.exists(parent) {
            fatal("Parented an entity to a dead entity.");
        }
        let Some(entity) = self.entities.get_mut(id) else {
            fatal("Parented a dead entity.");
        };
        entity.set_parent(parent);
    }

    pub fn parent(&self, id: EntityId) -> EntityId {
        self.entities
            .get(id)
            .map(|e| e.parent())
            .unwrap_or(EntityId::null())
    }

    fn remove_entity_now(&mut self, id: EntityId) {
        for tags in self.tags.values_mut() {
            tags.remove(id);
        }
        let entity = self.entities.remove(id);
        // Bottom-up so teardown order is the reverse of registration order.
        for component in entity.components().iter().rev() {
            // Safety: the ref was issued by one of this world's containers,
            // all of which are alive and registered.
            unsafe { component.reference.remove_through_container() };
        }
    }

    // --- components ---

    pub fn add_component<T: Component>(&mut self, id: EntityId, value: T) -> ComponentRef<T> {
        if !self.exists(id) {
            fatal("Added a component to a dead entity.");
        }
        let ty = component_type::<T>();

        if let Some(existing) = self.entities.get(id).and_then(|e| e.get(ty.index())) {
            #[cfg(debug_assertions)]
            fatal("Duplicate component added to entity.");
            #[cfg(not(debug_assertions))]
            {
                log::error!("Duplicate {} on entity {}, insertion rejected.", ty.name(), id);
                // Safety: the registered ref is of type T.
                return unsafe { existing.to_typed_unchecked::<T>() };
            }
        }

        let r = self.container_mut::<T>().add(id, value);
        let registered = self
            .entities
            .get_mut(id)
            .expect("Entity vanished during component insertion.")
            .register_component(ty.index(), r.into());
        debug_assert!(registered);
        r
    }

    /// Always lands on the deferred log; takes effect at the next commit.
    /// No-op if the entity does not carry the component.
    pub fn remove_component<T: Component>(&self, id: EntityId) {
        self.deferred
            .lock()
            .removed_components
            .push((id, component_type::<T>().index()));
    }

    fn remove_component_now(&mut self, id: EntityId, type_index: ComponentTypeIndex) {
        let Some(entity) = self.entities.get_mut(id) else {
            return;
        };
        let Some(reference) = entity.unregister_component(type_index) else {
            return;
        };
        if let Some(slot) = self.containers.get_mut(&type_index) {
            slot.get_mut().remove_untyped(id, reference);
        }
    }

    pub fn get<T: Component>(&self, r: ComponentRef<T>) -> Option<&T> {
        // Safety: pages live as long as the world; shared borrow.
        unsafe { r.resolve() }
    }

    /// Mutable access through a ref. Sets the slot's mutated flag so change
    /// detection picks the component up.
    pub fn get_mut<T: Component>(&mut self, r: ComponentRef<T>) -> Option<&mut T> {
        // Safety: exclusive through `&mut self`.
        unsafe { r.resolve_mut() }
    }

    pub fn get_by_entity<T: Component>(&self, id: EntityId) -> Option<&T> {
        let r = self.entities.get(id)?.get(component_type::<T>().index())?;
        // Safety: the registered ref is of type T; shared borrow.
        unsafe { r.to_typed_unchecked::<T>().resolve() }
    }

    pub fn get_mut_by_entity<T: Component>(&mut self, id: EntityId) -> Option<&mut T> {
        let r = self.entities.get(id)?.get(component_type::<T>().index())?;
        // Safety: exclusive through `&mut self`.
        unsafe { r.to_typed_unchecked::<T>().resolve_mut() }
    }

    pub fn component_ref<T: Component>(&self, id: EntityId) -> Option<ComponentRef<T>> {
        let r = self.entities.get(id)?.get(component_type::<T>().index())?;
        // Safety: the registered ref is of type T.
        Some(unsafe { r.to_typed_unchecked::<T>() })
    }

    pub fn has_component<T: Component>(&self, id: EntityId) -> bool {
        self.has_component_index(id, component_type::<T>().index())
    }

    pub fn has_component_index(&self, id: EntityId, type_index: ComponentTypeIndex) -> bool {
        self.entities
            .get(id)
            .map(|e| e.has(type_index))
            .unwrap_or(false)
    }

    fn container_mut<T: Component>(&mut self) -> &mut ComponentContainer<T> {
        let index = component_type::<T>().index();
        let slot = self
            .containers
            .entry(index)
            .or_insert_with(|| ContainerSlot::new(Box::new(ComponentContainer::<T>::new())));
        slot.get_mut()
            .downcast_mut::<ComponentContainer<T>>()
            .expect("Container type does not match its type index.")
    }

    pub(crate) fn container_slot(&self, index: ComponentTypeIndex) -> Option<&ContainerSlot> {
        self.containers.get(&index)
    }

    // --- queries and guards ---

    pub fn query<Q: Query>(&self) -> QueryBorrow<'_, Q> {
        QueryBorrow::new(self)
    }

    /// Shared container view for systems in parallel stages. Fatal if the
    /// container is write-borrowed, which means a bad access declaration.
    pub fn read<T: Component>(&self) -> Option<ComponentReadGuard<'_, T>> {
        let slot = self.container_slot(component_type::<T>().index())?;
        slot.borrow.acquire_read();
        let container = slot
            .get()
            .downcast_ref::<ComponentContainer<T>>()
            .expect("Container type does not match its type index.");
        Some(ComponentReadGuard {
            container,
            borrow: &slot.borrow,
        })
    }

    /// Exclusive container view for systems in parallel stages.
    pub fn write<T: Component>(&self) -> Option<ComponentWriteGuard<'_, T>> {
        let slot = self.container_slot(component_type::<T>().index())?;
        slot.borrow.acquire_write();
        // Safety: the write borrow was just acquired.
        let container = unsafe { slot.get_mut_unchecked() }
            .downcast_mut::<ComponentContainer<T>>()
            .expect("Container type does not match its type index.");
        Some(ComponentWriteGuard {
            container,
            borrow: &slot.borrow,
        })
    }

    // --- tags ---

    pub fn add_tag(&mut self, id: EntityId, tag: &str) {
        debug_assert!(self.exists(id), "Tagged a dead entity.");
        self.tags.entry(tag.to_string()).or_insert_with(TagSet::new).add(id);
    }

    pub fn remove_tag(&mut self, id: EntityId, tag: &str) {
        if let Some(tags) = self.tags.get_mut(tag) {
            tags.remove(id);
        }
    }

    pub fn has_tag(&self, id: EntityId, tag: &str) -> bool {
        self.tags.get(tag).map(|t| t.contains(id)).unwrap_or(false)
    }

    pub fn tag_entities(&self, tag: &str) -> Vec<EntityId> {
        self.tags
            .get(tag)
            .map(|t| t.iter().collect())
            .unwrap_or_default()
    }

    pub fn tags(&self) -> &BTreeMap<String, TagSet> {
        &self.tags
    }

    // --- groups ---

    /// Cached view of the entities carrying all `types` and all `tags`.
    /// Rebuilt lazily after structural changes to any involved container,
    /// tag set, or the entity index.
    pub fn group(&mut self, types: &[ComponentType], tags: &[&str]) -> &[EntityId] {
        let key = GroupKey::new(
            types.iter().map(|t| t.index()).collect(),
            tags.iter().map(|t| t.to_string()).collect(),
        );

        let container_versions = key
            .types
            .iter()
            .map(|i| {
                self.containers
                    .get(i)
                    .map(|s| s.get().structural_version())
                    .unwrap_or(0)
            })
            .collect::<Vec<_>>();
        let tag_versions = key
            .tags
            .iter()
            .map(|t| self.tags.get(t).map(|s| s.version()).unwrap_or(0))
            .collect::<Vec<_>>();
        let entity_version = self.entities.version();

        let stale = match self.groups.get(&key) {
            None => true,
            Some(group) => group.is_stale(&container_versions, &tag_versions, entity_version),
        };
        if stale {
            let ids = self.collect_group_ids(&key);
            self.groups.insert(
                key.clone(),
                Group {
                    ids,
                    container_versions,
                    tag_versions,
                    entity_version,
                },
            );
        }
        self.groups
            .get(&key)
            .map(|g| g.ids())
            .unwrap_or(&[])
    }

    fn collect_group_ids(&self, key: &GroupKey) -> Vec<EntityId> {
        if key.types.iter().any(|i| !self.containers.contains_key(i)) {
            return Vec::new();
        }

        let mut candidates: Vec<EntityId> = if let Some(smallest) = key
            .types
            .iter()
            .filter_map(|i| self.containers.get(i))
            .min_by_key(|slot| slot.get().len())
        {
            smallest.get().owner_ids()
        } else {
            self.entities.iter().map(|e| e.id()).collect()
        };

        candidates.retain(|id| {
            let Some(entity) = self.entities.get(*id) else {
                return false;
            };
            key.types.iter().all(|i| entity.has(*i))
                && key.tags.iter().all(|t| self.has_tag(*id, t))
        });
        candidates.sort();
        candidates
    }

    // --- systems ---

    pub fn register_system(&mut self, system: Box<dyn System>) {
        log::debug!("Registered system {}.", system.name());
        self.systems.push(system);
    }

    pub fn system_mut<S: System>(&mut self) -> Option<&mut S> {
        self.systems
            .iter_mut()
            .find_map(|s| s.downcast_mut::<S>().ok())
    }

    /// One full tick: `Tick`, `Update`, `TickSequential`, `PostUpdate`,
    /// then deferred changes are committed.
    pub fn tick(&mut self) {
        let mut systems = std::mem::take(&mut self.systems);

        run_parallel_stage(&mut systems, self, SystemStage::Tick);
        run_parallel_stage(&mut systems, self, SystemStage::Update);
        for system in systems.iter_mut() {
            system.tick_sequential(self);
        }
        run_parallel_stage(&mut systems, self, SystemStage::PostUpdate);

        self.systems = systems;
        self.commit();
    }

    // --- change tracking / deferred ---

    /// Applies the deferred log (component removals first, then entity
    /// removals) and resets per-tick change tracking.
    pub fn commit(&mut self) {
        let deferred = std::mem::take(&mut *self.deferred.lock());
        for (id, type_index) in deferred.removed_components {
            self.remove_component_now(id, type_index);
        }
        for id in deferred.removed_entities {
            if self.entities.exists(id) {
                self.remove_entity_now(id);
            }
        }
        for slot in self.containers.values_mut() {
            slot.get_mut().clear_mutated();
        }
        self.recently_added.clear();
    }

    pub fn component_types(&self) -> Vec<ComponentType> {
        let mut types = self
            .containers
            .values()
            .map(|slot| slot.get().ty())
            .collect::<Vec<_>>();
        types.sort();
        types
    }

    pub fn container_len(&self, type_index: ComponentTypeIndex) -> usize {
        self.containers
            .get(&type_index)
            .map(|s| s.get().len())
            .unwrap_or(0)
    }

    pub fn container_owner_ids(&self, type_index: ComponentTypeIndex) -> Vec<EntityId> {
        self.containers
            .get(&type_index)
            .map(|s| s.get().owner_ids())
            .unwrap_or_default()
    }

    /// Entities whose component of the given type was mutably accessed
    /// since the last commit.
    pub fn mutated_ids(&self, type_index: ComponentTypeIndex) -> Vec<EntityId> {
        self.containers
            .get(&type_index)
            .map(|s| s.get().mutated_ids())
            .unwrap_or_default()
    }

    pub fn pending_entity_deletions(&self) -> Vec<EntityId> {
        self.deferred.lock().removed_entities.clone()
    }

    pub fn pending_component_deletions(&self, type_index: ComponentTypeIndex) -> Vec<EntityId> {
        self.deferred
            .lock()
            .removed_components
            .iter()
            .filter(|(_, ty)| *ty == type_index)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn recently_added(&self) -> Vec<EntityId> {
        self.recently_added.clone()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared view of one container, released on drop.
pub struct ComponentReadGuard<'w, T: Component> {
    container: &'w ComponentContainer<T>,
    borrow: &'w AtomicBorrow,
}

impl<'w, T: Component> std::ops::Deref for ComponentReadGuard<'w, T> {
    type Target = ComponentContainer<T>;

    fn deref(&self) -> &Self::Target {
        self.container
    }
}

impl<T: Component> Drop for ComponentReadGuard<'_, T> {
    fn drop(&mut self) {
        self.borrow.release_read();
    }
}

/// Exclusive view of one container, released on drop. Mutation goes through
/// `component_mut`, which also sets the mutated flag on the slot.
pub struct ComponentWriteGuard<'w, T: Component> {
    container: &'w mut ComponentContainer<T>,
    borrow: &'w AtomicBorrow,
}

impl<'w, T: Component> ComponentWriteGuard<'w, T> {
    pub fn component_mut(&mut self, r: ComponentRef<T>) -> Option<&mut T> {
        self.container.get_mut(r)
    }

    pub fn component(&self, r: ComponentRef<T>) -> Option<&T> {
        self.container.get(r)
    }

    pub fn owners(&self) -> &[(EntityId, ComponentRef<T>)] {
        self.container.owners()
    }
}

impl<T: Component> Drop for ComponentWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.borrow.release_write();
    }
}
