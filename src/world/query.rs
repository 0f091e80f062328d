use yave_macros::generate_tuples;

use crate::common::bitset::Bitset;
use crate::world::borrow::ReadBorrowGuard;
use crate::world::component::{component_type, Component, ComponentType};
use crate::world::entity::{Entity, EntityId};
use crate::world::World;

/// One element of a query tuple. Queries yield shared references; mutation
/// goes through `World::get_mut` or a write guard.
pub trait QueryItem {
    type Item<'w>;

    fn component_type() -> ComponentType;

    /// Safety: the entity's refs must point into pools that outlive `'w`.
    unsafe fn fetch<'w>(entity: &Entity) -> Option<Self::Item<'w>>;
}

impl<'q, T: Component> QueryItem for &'q T {
    type Item<'w> = &'w T;

    fn component_type() -> ComponentType {
        component_type::<T>()
    }

    unsafe fn fetch<'w>(entity: &Entity) -> Option<&'w T> {
        let r = entity.get(Self::component_type().index())?;
        r.to_typed_unchecked::<T>().resolve()
    }
}

pub trait Query {
    type Item<'w>;

    fn component_types() -> Vec<ComponentType>;

    /// Safety: see `QueryItem::fetch`.
    unsafe fn fetch<'w>(entity: &Entity) -> Option<Self::Item<'w>>;
}

impl<T: QueryItem> Query for T {
    type Item<'w> = T::Item<'w>;

    fn component_types() -> Vec<ComponentType> {
        vec![T::component_type()]
    }

    unsafe fn fetch<'w>(entity: &Entity) -> Option<Self::Item<'w>> {
        T::fetch(entity)
    }
}

macro_rules! impl_query {
    ($($param:ident),+) => {
        impl<$($param: QueryItem),+> Query for ($($param,)+) {
            type Item<'w> = ($($param::Item<'w>,)+);

            fn component_types() -> Vec<ComponentType> {
                vec![$($param::component_type()),+]
            }

            unsafe fn fetch<'w>(entity: &Entity) -> Option<Self::Item<'w>> {
                Some(($($param::fetch(entity)?,)+))
            }
        }
    }
}

generate_tuples!(impl_query, 2, 8);

/// Query builder: component tuple plus optional tag filters. Enumeration
/// starts from the smallest container among the requested types and tests
/// the rest through the per-entity component bitmask.
pub struct QueryBorrow<'w, Q: Query> {
    world: &'w World,
    with_tags: Vec<String>,
    without_tags: Vec<String>,
    _marker: std::marker::PhantomData<Q>,
}

impl<'w, Q: Query> QueryBorrow<'w, Q> {
    pub(crate) fn new(world: &'w World) -> Self {
        Self {
            world,
            with_tags: Vec::new(),
            without_tags: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.with_tags.push(tag.into());
        self
    }

    pub fn without_tag(mut self, tag: impl Into<String>) -> Self {
        self.without_tags.push(tag.into());
        self
    }

    pub fn iter(self) -> QueryIter<'w, Q> {
        let types = Q::component_types();

        let mut mask = Bitset::new();
        for ty in &types {
            mask.set_bit(ty.index() as usize, true);
        }

        // Candidates come from the smallest container; missing containers
        // mean the query can't match anything.
        let mut candidates = Vec::new();
        let mut borrows = Vec::new();
        let mut smallest: Option<Vec<EntityId>> = None;
        let mut have_all = true;
        for ty in &types {
            let Some(slot) = self.world.container_slot(ty.index()) else {
                have_all = false;
                break;
            };
            borrows.push(ReadBorrowGuard::acquire(&slot.borrow));
            let owners = slot.get().owner_ids();
            if smallest.as_ref().map_or(true, |s| owners.len() < s.len()) {
                smallest = Some(owners);
            }
        }
        if have_all {
            candidates = smallest.unwrap_or_default();
        } else {
            borrows.clear();
        }

        QueryIter {
            world: self.world,
            candidates,
            at: 0,
            mask,
            with_tags: self.with_tags,
            without_tags: self.without_tags,
            _borrows: borrows,
            _marker: std::marker::PhantomData,
        }
    }
}

pub struct QueryIter<'w, Q: Query> {
    world: &'w World,
    candidates: Vec<EntityId>,
    at: usize,
    mask: Bitset,
    with_tags: Vec<String>,
    without_tags: Vec<String>,
    _borrows: Vec<ReadBorrowGuard<'w>>,
    _marker: std::marker::PhantomData<Q>,
}

impl<'w, Q: Query> Iterator for QueryIter<'w, Q> {
    type Item = (EntityId, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        while self.at < self.candidates.len() {
            let id = self.candidates[self.at];
            self.at += 1;

            let Some(entity) = self.world.entity(id) else {
                continue;
            };
            if !entity.mask().contains_all(&self.mask) {
                continue;
            }
            if !self.with_tags.iter().all(|t| self.world.has_tag(id, t)) {
                continue;
            }
            if self.without_tags.iter().any(|t| self.world.has_tag(id, t)) {
                continue;
            }

            // Safety: the fetched borrows are tied to the world borrow 'w,
            // and read borrows on every queried container are held.
            if let Some(item) = unsafe { Q::fetch(entity) } {
                return Some((id, item));
            }
        }
        None
    }
}
