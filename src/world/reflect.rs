use std::any::Any;
use std::collections::HashMap;

use nalgebra::Vector3;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::world::component::{component_type, Component, ComponentType, ComponentTypeIndex};
use crate::world::components::Transform;
use crate::world::entity::EntityId;
use crate::world::World;

/// Closed union of property values the editor can inspect, snapshot and
/// replay. Serialization of component payloads walks these in declaration
/// order.
#[derive(Clone, PartialEq, Debug)]
pub enum PropertyValue {
    String(String),
    Float(f32),
    Uint(u32),
    Bool(bool),
    Vec3(Vector3<f32>),
    Transform(Transform),
    Entity(EntityId),
}

#[derive(Clone, PartialEq, Debug)]
pub struct Property {
    pub name: &'static str,
    pub value: PropertyValue,
}

/// Wire tag of a property value; file payloads store values by declaration
/// order, so readers recover the variant from this.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PropertyKind {
    String,
    Float,
    Uint,
    Bool,
    Vec3,
    Transform,
    Entity,
}

/// One reflected property: a name, its wire kind and erased accessors.
/// Reflection is a plain data table, not generated code.
pub struct PropertyDesc {
    pub name: &'static str,
    pub kind: PropertyKind,
    pub get: fn(&dyn Any) -> PropertyValue,
    /// Returns false when the value variant does not match the property
    /// (schema drift); callers log and skip.
    pub set: fn(&mut dyn Any, &PropertyValue) -> bool,
}

/// Components that expose a property table.
pub trait Inspectable: Component + Clone + Default {
    /// Stable name used by scene files; must not change across versions.
    fn type_name() -> &'static str;
    fn properties() -> &'static [PropertyDesc];
}

/// A self-describing boxed copy of one component, detached from any world.
pub struct ComponentBox {
    ty: ComponentType,
    value: Box<dyn Any + Send + Sync>,
}

impl ComponentBox {
    pub fn ty(&self) -> ComponentType {
        self.ty
    }
}

/// Capability record for one component type, keyed by its `ComponentType`.
/// All dynamic dispatch on components funnels through these function
/// pointers instead of a trait object per component.
pub struct ComponentTraits {
    pub ty: ComponentType,
    pub type_name: &'static str,
    pub inspectable: bool,
    pub properties: &'static [PropertyDesc],
    pub box_component: fn(&World, EntityId) -> Option<ComponentBox>,
    pub add_or_replace: fn(&mut World, EntityId, &ComponentBox),
    pub add_default: fn(&mut World, EntityId),
    pub remove: fn(&mut World, EntityId),
    /// Visits every property of the entity's component with the getter.
    pub inspect: fn(&World, EntityId, &mut dyn FnMut(&'static str, PropertyValue)),
    /// Applies matching properties through the setters. Missing names or
    /// mismatched variants are logged and skipped, never fatal.
    pub apply: fn(&mut World, EntityId, &[Property]),
}

fn box_component_impl<T: Inspectable>(world: &World, id: EntityId) -> Option<ComponentBox> {
    let value = world.get_by_entity::<T>(id)?.clone();
    Some(ComponentBox {
        ty: component_type::<T>(),
        value: Box::new(value),
    })
}

fn add_or_replace_impl<T: Inspectable>(world: &mut World, id: EntityId, boxed: &ComponentBox) {
    let Some(value) = boxed.value.downcast_ref::<T>() else {
        log::error!("Component box type does not match its traits entry.");
        return;
    };
    if let Some(current) = world.get_mut_by_entity::<T>(id) {
        *current = value.clone();
    } else {
        world.add_component(id, value.clone());
    }
}

fn add_default_impl<T: Inspectable>(world: &mut World, id: EntityId) {
    if !world.has_component_index(id, component_type::<T>().index()) {
        world.add_component(id, T::default());
    }
}

fn remove_impl<T: Inspectable>(world: &mut World, id: EntityId) {
    world.remove_component::<T>(id);
}

fn inspect_impl<T: Inspectable>(
    world: &World,
    id: EntityId,
    visit: &mut dyn FnMut(&'static str, PropertyValue),
) {
    let Some(component) = world.get_by_entity::<T>(id) else {
        return;
    };
    for prop in T::properties() {
        visit(prop.name, (prop.get)(component as &dyn Any));
    }
}

fn apply_impl<T: Inspectable>(world: &mut World, id: EntityId, properties: &[Property]) {
    let Some(component) = world.get_mut_by_entity::<T>(id) else {
        log::warn!(
            "Cannot set properties, entity {} has no {}.",
            id,
            T::type_name()
        );
        return;
    };
    for property in properties {
        let Some(desc) = T::properties().iter().find(|d| d.name == property.name) else {
            log::error!(
                "Unable to set property \"{}\" on {}.",
                property.name,
                T::type_name()
            );
            continue;
        };
        if !(desc.set)(&mut *component, &property.value) {
            log::error!(
                "Property \"{}\" on {} has a mismatched value type.",
                property.name,
                T::type_name()
            );
        }
    }
}

struct TraitsRegistry {
    by_index: HashMap<ComponentTypeIndex, &'static ComponentTraits>,
    by_name: HashMap<&'static str, &'static ComponentTraits>,
}

static REGISTRY: Lazy<RwLock<TraitsRegistry>> = Lazy::new(|| {
    RwLock::new(TraitsRegistry {
        by_index: HashMap::new(),
        by_name: HashMap::new(),
    })
});

pub fn register_component_traits<T: Inspectable>() {
    let ty = component_type::<T>();
    let mut registry = REGISTRY.write();
    if registry.by_index.contains_key(&ty.index()) {
        return;
    }
    let traits: &'static ComponentTraits = Box::leak(Box::new(ComponentTraits {
        ty,
        type_name: T::type_name(),
        inspectable: true,
        properties: T::properties(),
        box_component: box_component_impl::<T>,
        add_or_replace: add_or_replace_impl::<T>,
        add_default: add_default_impl::<T>,
        remove: remove_impl::<T>,
        inspect: inspect_impl::<T>,
        apply: apply_impl::<T>,
    }));
    registry.by_index.insert(ty.index(), traits);
    registry.by_name.insert(traits.type_name, traits);
}

pub fn traits_for(index: ComponentTypeIndex) -> Option<&'static ComponentTraits> {
    REGISTRY.read().by_index.get(&index).copied()
}

pub fn traits_by_name(name: &str) -> Option<&'static ComponentTraits> {
    REGISTRY.read().by_name.get(name).copied()
}
