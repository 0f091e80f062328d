use crate::world::component::component_type;
use crate::world::components::{NameComponent, PointLightComponent, TransformComponent};
use crate::world::schedule::{System, SystemAccess};
use crate::world::undo::UndoRedoSystem;
use crate::world::World;

#[derive(Clone, Default, PartialEq, Debug)]
struct IntComponent(i64);

#[derive(Clone, Default, PartialEq, Debug)]
struct MarkerA;

#[derive(Clone, Default, PartialEq, Debug)]
struct MarkerB;

#[test]
fn create_destroy_create() {
    let mut world = World::new();
    let e1 = world.create_entity();
    world.remove_entity(e1);
    world.commit();
    let e2 = world.create_entity();

    assert_eq!(e1.index(), e2.index());
    assert_eq!(e1.generation() + 1, e2.generation());
    assert!(!world.exists(e1));
    assert!(world.exists(e2));
}

#[test]
fn stale_ref_reads_as_none() {
    let mut world = World::new();
    let e = world.create_entity();
    let r = world.add_component(e, IntComponent(7));

    assert_eq!(world.get(r), Some(&IntComponent(7)));

    world.remove_component::<IntComponent>(e);
    // Deferred until the commit point.
    assert_eq!(world.get(r), Some(&IntComponent(7)));
    world.commit();
    assert_eq!(world.get(r), None);
}

#[test]
fn slot_reuse_invalidates_old_refs() {
    let mut world = World::new();
    let e1 = world.create_entity();
    let r1 = world.add_component(e1, IntComponent(1));
    world.remove_component::<IntComponent>(e1);
    world.commit();

    // The freed slot is handed out again with a bumped generation.
    let e2 = world.create_entity();
    let r2 = world.add_component(e2, IntComponent(2));

    assert_eq!(world.get(r1), None);
    assert_eq!(world.get(r2), Some(&IntComponent(2)));
}

#[test]
fn entity_removal_tears_down_components() {
    let mut world = World::new();
    let e = world.create_entity();
    let r = world.add_component(e, IntComponent(3));
    world.add_component(e, NameComponent::new("doomed"));

    world.remove_entity(e);
    world.commit();

    assert!(!world.exists(e));
    assert_eq!(world.get(r), None);
    assert_eq!(world.container_len(component_type::<IntComponent>().index()), 0);
    assert_eq!(world.container_len(component_type::<NameComponent>().index()), 0);
}

#[test]
fn multi_component_query() {
    let mut world = World::new();
    let e1 = world.create_entity();
    world.add_component(e1, MarkerA);
    world.add_component(e1, MarkerB);
    let e2 = world.create_entity();
    world.add_component(e2, MarkerA);
    let e3 = world.create_entity();
    world.add_component(e3, MarkerB);

    let both = world
        .query::<(&MarkerA, &MarkerB)>()
        .iter()
        .map(|(id, _)| id)
        .collect::<Vec<_>>();
    assert_eq!(both, vec![e1]);

    let only_a = world
        .query::<&MarkerA>()
        .iter()
        .map(|(id, _)| id)
        .collect::<Vec<_>>();
    assert_eq!(only_a, vec![e1, e2]);
}

#[test]
fn query_values_and_order() {
    let mut world = World::new();
    let mut expected = Vec::new();
    for i in 0..16 {
        let e = world.create_entity();
        world.add_component(e, IntComponent(i));
        expected.push((e, i));
    }
    // Punch holes so the free lists get exercised.
    for (e, _) in expected.drain(4..8) {
        world.remove_entity(e);
    }
    world.commit();

    let found = world
        .query::<&IntComponent>()
        .iter()
        .map(|(id, c)| (id, c.0))
        .collect::<Vec<_>>();
    assert_eq!(found, expected);
}

#[test]
fn query_with_tags() {
    let mut world = World::new();
    let tagged = world.create_entity();
    world.add_component(tagged, MarkerA);
    world.add_tag(tagged, "visible");
    let untagged = world.create_entity();
    world.add_component(untagged, MarkerA);

    let visible = world
        .query::<&MarkerA>()
        .with_tag("visible")
        .iter()
        .map(|(id, _)| id)
        .collect::<Vec<_>>();
    assert_eq!(visible, vec![tagged]);

    let hidden = world
        .query::<&MarkerA>()
        .without_tag("visible")
        .iter()
        .map(|(id, _)| id)
        .collect::<Vec<_>>();
    assert_eq!(hidden, vec![untagged]);
}

#[test]
fn tag_membership_is_idempotent() {
    let mut world = World::new();
    let e = world.create_entity();

    world.add_tag(e, "selected");
    world.add_tag(e, "selected");
    assert_eq!(world.tag_entities("selected").len(), 1);

    world.remove_tag(e, "selected");
    assert!(!world.has_tag(e, "selected"));
}

#[test]
fn groups_rebuild_after_structural_changes() {
    let mut world = World::new();
    let e1 = world.create_entity();
    world.add_component(e1, MarkerA);
    world.add_tag(e1, "lit");

    let types = [component_type::<MarkerA>()];
    assert_eq!(world.group(&types, &["lit"]), &[e1]);

    let e2 = world.create_entity();
    world.add_component(e2, MarkerA);
    // Not tagged yet: group unchanged.
    assert_eq!(world.group(&types, &["lit"]), &[e1]);

    world.add_tag(e2, "lit");
    assert_eq!(world.group(&types, &["lit"]), &[e1, e2]);

    world.remove_entity(e1);
    world.commit();
    assert_eq!(world.group(&types, &["lit"]), &[e2]);
}

#[test]
fn duplicate_component_is_rejected() {
    let mut world = World::new();
    let e = world.create_entity();
    world.add_component(e, IntComponent(1));

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        world.add_component(e, IntComponent(2));
    }));
    if cfg!(debug_assertions) {
        assert!(result.is_err());
    } else {
        assert!(result.is_ok());
        assert_eq!(world.get_by_entity::<IntComponent>(e), Some(&IntComponent(1)));
    }
}

struct CountingSystem {
    ticks: u64,
}

impl System for CountingSystem {
    fn name(&self) -> &'static str {
        "CountingSystem"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::none().with_read(component_type::<IntComponent>().index())
    }

    fn tick(&mut self, world: &World) {
        self.ticks += world.query::<&IntComponent>().iter().count() as u64;
    }
}

struct DoublingSystem;

impl System for DoublingSystem {
    fn name(&self) -> &'static str {
        "DoublingSystem"
    }

    fn access(&self) -> SystemAccess {
        SystemAccess::none().with_write(component_type::<IntComponent>().index())
    }

    fn update(&mut self, world: &World) {
        let Some(mut guard) = world.write::<IntComponent>() else {
            return;
        };
        let refs = guard.owners().iter().map(|(_, r)| *r).collect::<Vec<_>>();
        for r in refs {
            if let Some(value) = guard.component_mut(r) {
                value.0 *= 2;
            }
        }
    }
}

#[test]
fn systems_run_in_stages() {
    let mut world = World::new();
    let e = world.create_entity();
    world.add_component(e, IntComponent(21));

    world.register_system(Box::new(CountingSystem { ticks: 0 }));
    world.register_system(Box::new(DoublingSystem));

    world.tick();
    world.tick();

    assert_eq!(world.get_by_entity::<IntComponent>(e), Some(&IntComponent(84)));
    let counter = world.system_mut::<CountingSystem>().unwrap();
    assert_eq!(counter.ticks, 2);
}

#[test]
fn structural_changes_during_systems_are_deferred() {
    struct RemovalSystem;

    impl System for RemovalSystem {
        fn name(&self) -> &'static str {
            "RemovalSystem"
        }

        fn tick(&mut self, world: &World) {
            for (id, _) in world.query::<&IntComponent>().iter() {
                world.remove_component::<IntComponent>(id);
            }
        }

        fn post_update(&mut self, world: &World) {
            // Still observable in a later stage of the same tick.
            assert_eq!(world.query::<&IntComponent>().iter().count(), 1);
        }
    }

    let mut world = World::new();
    let e = world.create_entity();
    world.add_component(e, IntComponent(5));
    world.register_system(Box::new(RemovalSystem));

    world.tick();
    assert!(!world.has_component::<IntComponent>(e));
    assert!(world.exists(e));
}

fn world_with_undo() -> World {
    let mut world = World::new();
    world.register_system(Box::new(UndoRedoSystem::new()));
    // First tick takes the baseline snapshot.
    world.tick();
    world
}

#[test]
fn undo_reverts_property_edits() {
    let mut world = world_with_undo();
    let e = world.create_entity();
    world.add_component(e, NameComponent::new("before"));
    world.tick();

    world.get_mut_by_entity::<NameComponent>(e).unwrap().name = "after".to_string();
    world.tick();

    assert_eq!(world.get_by_entity::<NameComponent>(e).unwrap().name, "after");

    world.system_mut::<UndoRedoSystem>().unwrap().undo();
    world.tick();
    assert_eq!(world.get_by_entity::<NameComponent>(e).unwrap().name, "before");

    world.system_mut::<UndoRedoSystem>().unwrap().redo();
    world.tick();
    assert_eq!(world.get_by_entity::<NameComponent>(e).unwrap().name, "after");
}

#[test]
fn undo_restores_removed_entity() {
    let mut world = world_with_undo();
    let e = world.create_entity();
    world.add_component(e, NameComponent::new("keeper"));
    world.add_component(e, TransformComponent::default());
    world.tick();

    world.remove_entity(e);
    world.tick();
    assert!(!world.exists(e));

    world.system_mut::<UndoRedoSystem>().unwrap().undo();
    world.tick();
    assert!(world.exists(e));
    assert_eq!(world.get_by_entity::<NameComponent>(e).unwrap().name, "keeper");
    assert!(world.has_component::<TransformComponent>(e));
}

#[test]
fn undo_roundtrip_restores_serialized_state() {
    use crate::assets::scene;

    let mut world = world_with_undo();
    let e = world.create_entity();
    world.add_component(e, PointLightComponent::default());
    world.tick();

    let before = scene::save_to_vec(&world).unwrap();

    world
        .get_mut_by_entity::<PointLightComponent>(e)
        .unwrap()
        .intensity = 4.0;
    world.tick();
    assert_ne!(scene::save_to_vec(&world).unwrap(), before);

    world.system_mut::<UndoRedoSystem>().unwrap().undo();
    world.tick();
    assert_eq!(scene::save_to_vec(&world).unwrap(), before);
}

#[test]
fn undo_coalesces_rapid_edits_to_the_same_properties() {
    let mut world = world_with_undo();
    let e = world.create_entity();
    world.add_component(e, NameComponent::new("original"));
    world.tick();

    world.get_mut_by_entity::<NameComponent>(e).unwrap().name = "first".into();
    world.tick();
    let depth = world.system_mut::<UndoRedoSystem>().unwrap().stack_depth();

    // Same entity, same property set, well within the merge window.
    world.get_mut_by_entity::<NameComponent>(e).unwrap().name = "second".into();
    world.tick();
    let system = world.system_mut::<UndoRedoSystem>().unwrap();
    assert_eq!(system.stack_depth(), depth);
    system.undo();
    world.tick();

    assert_eq!(world.get_by_entity::<NameComponent>(e).unwrap().name, "original");
}

#[test]
fn redo_history_is_truncated_by_new_edits() {
    let mut world = world_with_undo();
    let e = world.create_entity();
    world.add_component(e, PointLightComponent::default());
    world.tick();

    world
        .get_mut_by_entity::<PointLightComponent>(e)
        .unwrap()
        .intensity = 2.0;
    world.tick();

    world.system_mut::<UndoRedoSystem>().unwrap().undo();
    world.tick();
    assert_eq!(
        world.get_by_entity::<PointLightComponent>(e).unwrap().intensity,
        1.0
    );

    // A fresh edit after an undo drops the redo branch.
    world
        .get_mut_by_entity::<PointLightComponent>(e)
        .unwrap()
        .intensity = 5.0;
    world.tick();

    let system = world.system_mut::<UndoRedoSystem>().unwrap();
    system.redo();
    world.tick();
    assert_eq!(
        world.get_by_entity::<PointLightComponent>(e).unwrap().intensity,
        5.0
    );
}

#[test]
fn randomized_identity_invariants() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(0x79617665);
    let mut world = World::new();
    let mut live = Vec::new();
    let mut dead = Vec::new();

    for _ in 0..2000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let id = world.create_entity();
            if rng.gen_bool(0.5) {
                world.add_component(id, IntComponent(rng.gen()));
            }
            live.push(id);
        } else {
            let id = live.swap_remove(rng.gen_range(0..live.len()));
            world.remove_entity(id);
            dead.push(id);
        }
    }
    world.commit();

    for id in &live {
        assert!(world.exists(*id));
    }
    for id in &dead {
        assert!(!world.exists(*id));
    }
    assert_eq!(world.entity_count(), live.len());
}
