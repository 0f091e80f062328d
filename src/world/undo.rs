use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::assets::scene;
use crate::common::fatal;
use crate::consts::world::UNDO_MERGE_SECONDS;
use crate::world::component::ComponentTypeIndex;
use crate::world::entity::EntityId;
use crate::world::reflect::{traits_for, ComponentBox, Property};
use crate::world::schedule::System;
use crate::world::World;

pub type ComponentKey = (EntityId, ComponentTypeIndex);
type PropertyList = SmallVec<[Property; 8]>;

/// One atomic edit: entity/component structure deltas plus before/after
/// property snapshots for mutated components.
pub struct UndoState {
    redo_properties: Vec<(ComponentKey, PropertyList)>,
    undo_properties: Vec<(ComponentKey, PropertyList)>,
    removed_components: Vec<(EntityId, ComponentBox)>,
    added_components: Vec<(EntityId, ComponentBox)>,
    removed_entities: Vec<EntityId>,
    added_entities: Vec<EntityId>,
    created: Instant,
}

impl UndoState {
    fn new() -> Self {
        Self {
            redo_properties: Vec::new(),
            undo_properties: Vec::new(),
            removed_components: Vec::new(),
            added_components: Vec::new(),
            removed_entities: Vec::new(),
            added_entities: Vec::new(),
            created: Instant::now(),
        }
    }

    fn has_entity_changes(&self) -> bool {
        !self.added_components.is_empty()
            || !self.removed_components.is_empty()
            || !self.added_entities.is_empty()
            || !self.removed_entities.is_empty()
    }

    fn apply_properties(
        world: &mut World,
        properties: &[(ComponentKey, PropertyList)],
    ) {
        for ((id, type_index), props) in properties {
            let Some(traits) = traits_for(*type_index) else {
                log::error!("No component traits registered for type index {}.", type_index);
                continue;
            };
            (traits.apply)(world, *id, props);
        }
    }

    fn undo(&self, world: &mut World) {
        Self::apply_properties(world, &self.undo_properties);

        for id in &self.removed_entities {
            world.create_entity_with_id(*id);
        }
        for id in &self.added_entities {
            if world.exists(*id) {
                world.remove_entity(*id);
            }
        }
        for (id, boxed) in &self.removed_components {
            if let Some(traits) = traits_for(boxed.ty().index()) {
                (traits.add_or_replace)(world, *id, boxed);
            }
        }
        for (id, boxed) in &self.added_components {
            if let Some(traits) = traits_for(boxed.ty().index()) {
                (traits.remove)(world, *id);
            }
        }
    }

    fn redo(&self, world: &mut World) {
        Self::apply_properties(world, &self.redo_properties);

        for id in &self.removed_entities {
            if world.exists(*id) {
                world.remove_entity(*id);
            }
        }
        for id in &self.added_entities {
            world.create_entity_with_id(*id);
        }
        for (id, boxed) in &self.removed_components {
            if let Some(traits) = traits_for(boxed.ty().index()) {
                (traits.remove)(world, *id);
            }
        }
        for (id, boxed) in &self.added_components {
            if let Some(traits) = traits_for(boxed.ty().index()) {
                (traits.add_or_replace)(world, *id, boxed);
            }
        }
    }
}

/// Runs in `TickSequential`. Diffs the world's per-tick change tracking
/// against a serialized snapshot to produce undo states; undo/redo replay
/// states against both the live world and the snapshot so the two stay in
/// sync.
pub struct UndoRedoSystem {
    states: Vec<UndoState>,
    top: usize,
    snapshot: Option<Box<World>>,
    do_undo: bool,
    do_redo: bool,
}

impl UndoRedoSystem {
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            top: 0,
            snapshot: None,
            do_undo: false,
            do_redo: false,
        }
    }

    pub fn undo(&mut self) {
        self.do_undo = true;
    }

    pub fn redo(&mut self) {
        self.do_redo = true;
    }

    pub fn stack_top(&self) -> usize {
        self.top
    }

    pub fn stack_depth(&self) -> usize {
        self.states.len()
    }

    pub fn reset(&mut self, world: &World) {
        self.states.clear();
        self.top = 0;
        self.do_undo = false;
        self.do_redo = false;
        self.take_snapshot(world);
    }

    fn take_snapshot(&mut self, world: &World) {
        let bytes = scene::save_to_vec(world)
            .unwrap_or_else(|e| fatal!("Unable to serialize the world: {}", e));
        let snapshot = scene::load_from_vec(&bytes)
            .unwrap_or_else(|e| fatal!("Unable to rebuild the world snapshot: {}", e));
        self.snapshot = Some(Box::new(snapshot));
    }

    fn collect_state(&self, world: &World) -> UndoState {
        let snapshot = self.snapshot.as_deref().expect("Snapshot must exist.");
        let mut state = UndoState::new();

        for id in world.pending_entity_deletions() {
            state.removed_entities.push(id);
            // Box every component so the entity comes back whole on undo.
            if let Some(entity) = world.entity(id) {
                for component in entity.components() {
                    if let Some(traits) = traits_for(component.type_index) {
                        if let Some(boxed) = (traits.box_component)(world, id) {
                            state.removed_components.push((id, boxed));
                        }
                    }
                }
            }
        }

        for id in world.recently_added() {
            state.added_entities.push(id);
        }

        for ty in world.component_types() {
            let Some(traits) = traits_for(ty.index()) else {
                continue;
            };
            if !traits.inspectable {
                continue;
            }

            for id in world.mutated_ids(ty.index()) {
                if state.removed_entities.contains(&id) {
                    continue;
                }
                if snapshot.exists(id) && snapshot.has_component_index(id, ty.index()) {
                    let mut props = PropertyList::new();
                    (traits.inspect)(world, id, &mut |name, value| {
                        props.push(Property { name, value });
                    });
                    state.redo_properties.push(((id, ty.index()), props));
                } else if let Some(boxed) = (traits.box_component)(world, id) {
                    state.added_components.push((id, boxed));
                }
            }

            for id in world.pending_component_deletions(ty.index()) {
                if state.removed_entities.contains(&id) {
                    continue;
                }
                if let Some(boxed) = (traits.box_component)(world, id) {
                    state.removed_components.push((id, boxed));
                }
            }
        }

        state
    }

    fn push_state(&mut self, mut state: UndoState) {
        let snapshot = self.snapshot.as_mut().expect("Snapshot must exist.");

        // Pull the before-values out of the snapshot.
        debug_assert!(state.undo_properties.is_empty());
        for (key, _) in &state.redo_properties {
            let mut props = PropertyList::new();
            if let Some(traits) = traits_for(key.1) {
                (traits.inspect)(snapshot, key.0, &mut |name, value| {
                    props.push(Property { name, value });
                });
            }
            state.undo_properties.push((*key, props));
        }

        // Drop property pairs whose before/after compare equal, and entries
        // that end up empty.
        debug_assert_eq!(state.redo_properties.len(), state.undo_properties.len());
        let mut k = 0;
        while k < state.redo_properties.len() {
            debug_assert_eq!(state.redo_properties[k].0, state.undo_properties[k].0);
            let redo_props = &mut state.redo_properties[k].1;
            let undo_props = &mut state.undo_properties[k].1;

            let mut i = 0;
            while i < redo_props.len() && i < undo_props.len() {
                debug_assert_eq!(redo_props[i].name, undo_props[i].name);
                if redo_props[i].value == undo_props[i].value {
                    redo_props.remove(i);
                    undo_props.remove(i);
                } else {
                    i += 1;
                }
            }

            if redo_props.is_empty() && undo_props.is_empty() {
                state.redo_properties.remove(k);
                state.undo_properties.remove(k);
            } else {
                k += 1;
            }
        }

        let has_entity_changes = state.has_entity_changes();
        if !has_entity_changes && state.redo_properties.is_empty() {
            return;
        }

        // Move the snapshot forward to the new state.
        state.redo(snapshot);
        snapshot.commit();

        if self.states.len() != self.top {
            self.states.truncate(self.top);
        } else if !has_entity_changes && !self.states.is_empty() {
            let last = self.states.last_mut().expect("Checked non-empty.");
            let same_shape = last.created.elapsed()
                < Duration::from_secs_f32(UNDO_MERGE_SECONDS)
                && last.redo_properties.len() == state.redo_properties.len()
                && last
                    .redo_properties
                    .iter()
                    .zip(&state.redo_properties)
                    .all(|((last_key, last_props), (key, props))| {
                        last_key == key
                            && last_props.len() == props.len()
                            && last_props
                                .iter()
                                .zip(props.iter())
                                .all(|(a, b)| a.name == b.name)
                    });
            if same_shape {
                // Coalesce typing edits: keep the original before-values,
                // overwrite the after-values.
                last.redo_properties = state.redo_properties;
                last.created = Instant::now();
                return;
            }
        }

        self.states.push(state);
        self.top += 1;
    }
}

impl System for UndoRedoSystem {
    fn name(&self) -> &'static str {
        "UndoRedoSystem"
    }

    fn tick_sequential(&mut self, world: &mut World) {
        if self.snapshot.is_none() {
            self.take_snapshot(world);
        }

        if !self.do_undo && !self.do_redo {
            let state = self.collect_state(world);
            self.push_state(state);
        }

        if self.do_undo {
            self.do_undo = false;
            if self.top > 0 {
                self.top -= 1;
                let state = &self.states[self.top];
                state.undo(world);
                let snapshot = self.snapshot.as_mut().expect("Snapshot must exist.");
                state.undo(snapshot);
                snapshot.commit();
            } else {
                log::warn!("Nothing to undo.");
            }
        }

        if self.do_redo {
            self.do_redo = false;
            if self.top != self.states.len() {
                let state = &self.states[self.top];
                state.redo(world);
                let snapshot = self.snapshot.as_mut().expect("Snapshot must exist.");
                state.redo(snapshot);
                snapshot.commit();
                self.top += 1;
            } else {
                log::warn!("Nothing to redo.");
            }
        }
    }
}

impl Default for UndoRedoSystem {
    fn default() -> Self {
        Self::new()
    }
}
