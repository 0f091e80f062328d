use crate::world::component::ComponentTypeIndex;
use crate::world::entity::EntityId;

/// Cache key: required component types plus required tags, both sorted.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub types: Vec<ComponentTypeIndex>,
    pub tags: Vec<String>,
}

impl GroupKey {
    pub fn new(mut types: Vec<ComponentTypeIndex>, mut tags: Vec<String>) -> Self {
        types.sort_unstable();
        types.dedup();
        tags.sort();
        tags.dedup();
        Self { types, tags }
    }
}

/// A cached view of the entities that carry all of a set of component types
/// and tags. Rebuilt lazily when any of the underlying containers or tag
/// sets has structurally changed since the cache was taken.
pub struct Group {
    pub(crate) ids: Vec<EntityId>,
    pub(crate) container_versions: Vec<u64>,
    pub(crate) tag_versions: Vec<u64>,
    pub(crate) entity_version: u64,
}

impl Group {
    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    pub(crate) fn is_stale(
        &self,
        container_versions: &[u64],
        tag_versions: &[u64],
        entity_version: u64,
    ) -> bool {
        self.entity_version != entity_version
            || self.container_versions != container_versions
            || self.tag_versions != tag_versions
    }
}
