use crate::common::bitset::Bitset;
use crate::common::fatal;
use crate::world::component::ComponentTypeIndex;
use crate::world::refs::UntypedComponentRef;

/// Generational entity identity. Only generation >= 1 is valid; the default
/// id is null. Stable across free-list reuse of the underlying index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct EntityId {
    index: u32,
    generation: u32,
}

impl EntityId {
    pub const fn null() -> Self {
        Self {
            index: 0,
            generation: 0,
        }
    }

    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_valid(&self) -> bool {
        self.generation != 0
    }

    pub fn as_u64(&self) -> u64 {
        ((self.index as u64) << 32) | self.generation as u64
    }

    pub fn from_u64(bits: u64) -> Self {
        Self {
            index: (bits >> 32) as u32,
            generation: bits as u32,
        }
    }
}

impl PartialOrd for EntityId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_u64().cmp(&other.as_u64())
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.index, self.generation)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EntityComponent {
    pub type_index: ComponentTypeIndex,
    pub reference: UntypedComponentRef,
}

/// An entity: its id, an optional parent, and the sorted list of attached
/// components. At most one component per type.
pub struct Entity {
    id: EntityId,
    parent: EntityId,
    components: Vec<EntityComponent>,
    mask: Bitset,
}

impl Entity {
    fn empty() -> Self {
        Self {
            id: EntityId::null(),
            parent: EntityId::null(),
            components: Vec::new(),
            mask: Bitset::new(),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn parent(&self) -> EntityId {
        self.parent
    }

    pub fn set_parent(&mut self, parent: EntityId) {
        self.parent = parent;
    }

    pub fn components(&self) -> &[EntityComponent] {
        &self.components
    }

    pub fn mask(&self) -> &Bitset {
        &self.mask
    }

    pub fn has(&self, type_index: ComponentTypeIndex) -> bool {
        self.mask.get_bit(type_index as usize)
    }

    pub fn get(&self, type_index: ComponentTypeIndex) -> Option<UntypedComponentRef> {
        self.find(type_index)
            .ok()
            .map(|i| self.components[i].reference)
    }

    fn find(&self, type_index: ComponentTypeIndex) -> Result<usize, usize> {
        self.components
            .binary_search_by_key(&type_index, |c| c.type_index)
    }

    /// Returns false if a component of that type is already registered.
    pub(crate) fn register_component(
        &mut self,
        type_index: ComponentTypeIndex,
        reference: UntypedComponentRef,
    ) -> bool {
        match self.find(type_index) {
            Ok(_) => false,
            Err(at) => {
                self.components.insert(
                    at,
                    EntityComponent {
                        type_index,
                        reference,
                    },
                );
                self.mask.set_bit(type_index as usize, true);
                true
            }
        }
    }

    /// Erases the list entry for the matching component type only.
    pub(crate) fn unregister_component(
        &mut self,
        type_index: ComponentTypeIndex,
    ) -> Option<UntypedComponentRef> {
        let at = self.find(type_index).ok()?;
        self.mask.set_bit(type_index as usize, false);
        Some(self.components.remove(at).reference)
    }
}

/// Dense entity storage indexed by `EntityId::index`, with a free list of
/// reclaimable indices. A slot's stored id carries the current generation;
/// an id is alive iff it matches its slot.
pub struct EntityContainer {
    entities: Vec<Entity>,
    free: Vec<EntityId>,
    version: u64,
}

impl EntityContainer {
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            free: Vec::new(),
            version: 0,
        }
    }

    pub fn create(&mut self) -> EntityId {
        let id = self.create_id();
        let slot = &mut self.entities[id.index as usize];
        debug_assert!(!slot.id.is_valid());
        slot.id = id;
        self.version += 1;
        id
    }

    /// Recreates an entity under a known id. Used by undo and scene loading.
    pub fn create_with_id(&mut self, id: EntityId) {
        if !id.is_valid() {
            fatal("Cannot create an entity from the null id.");
        }
        let index = id.index as usize;
        while self.entities.len() <= index {
            self.free
                .push(EntityId::new(self.entities.len() as u32, 0));
            self.entities.push(Entity::empty());
        }
        if self.entities[index].id.is_valid() {
            if self.entities[index].id == id {
                return;
            }
            fatal("Entity index is already occupied by a different generation.");
        }
        if let Some(at) = self.free.iter().position(|f| f.index == id.index) {
            self.free.swap_remove(at);
        }
        self.entities[index].id = id;
        self.version += 1;
    }

    /// Clears the slot, preserves its generation in the free list, and
    /// returns the removed entity so the caller can tear down components.
    pub fn remove(&mut self, id: EntityId) -> Entity {
        debug_assert!(self.exists(id));
        let slot = &mut self.entities[id.index as usize];
        let entity = std::mem::replace(slot, Entity::empty());
        self.free.push(id);
        self.version += 1;
        entity
    }

    pub fn exists(&self, id: EntityId) -> bool {
        id.is_valid()
            && (id.index as usize) < self.entities.len()
            && self.entities[id.index as usize].id == id
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.exists(id).then(|| &self.entities[id.index as usize])
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.exists(id)
            .then(|| &mut self.entities[id.index as usize])
    }

    pub fn len(&self) -> usize {
        self.entities.len() - self.free.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(|e| e.id.is_valid())
    }

    /// Bumped on every create/remove; groups use it to detect staleness.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn create_id(&mut self) -> EntityId {
        let mut id = if let Some(id) = self.free.pop() {
            id
        } else {
            if self.entities.len() > u32::MAX as usize {
                fatal("Entity index space exhausted.");
            }
            let id = EntityId::new(self.entities.len() as u32, 0);
            self.entities.push(Entity::empty());
            id
        };
        id.generation = id.generation.wrapping_add(1);
        if id.generation == 0 {
            id.generation = 1;
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_destroy_create_reuses_index_with_new_generation() {
        let mut entities = EntityContainer::new();
        let e1 = entities.create();
        entities.remove(e1);
        let e2 = entities.create();

        assert_eq!(e1.index(), e2.index());
        assert_eq!(e1.generation() + 1, e2.generation());
        assert_ne!(e1, e2);
        assert!(!entities.exists(e1));
        assert!(entities.exists(e2));
    }

    #[test]
    fn new_entities_have_no_components() {
        let mut entities = EntityContainer::new();
        let id = entities.create();
        assert!(entities.exists(id));
        assert!(entities.get(id).unwrap().components().is_empty());
    }

    #[test]
    fn create_with_id_restores_identity() {
        let mut entities = EntityContainer::new();
        let a = entities.create();
        let b = entities.create();
        entities.remove(a);

        entities.create_with_id(a);
        assert!(entities.exists(a));
        assert!(entities.exists(b));

        // A later plain create must not collide with the restored index.
        let c = entities.create();
        assert_ne!(c.index(), a.index());
    }

    #[test]
    fn ids_never_repeat() {
        let mut entities = EntityContainer::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = entities.create();
            assert!(seen.insert(id));
            entities.remove(id);
        }
    }
}
