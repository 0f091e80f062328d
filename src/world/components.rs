use std::any::Any;

use nalgebra::{UnitQuaternion, Vector3};

use crate::world::reflect::{
    register_component_traits, Inspectable, PropertyDesc, PropertyKind, PropertyValue,
};

fn cast<T: 'static>(component: &dyn Any) -> &T {
    component
        .downcast_ref::<T>()
        .expect("Property accessor used with the wrong component type.")
}

fn cast_mut<T: 'static>(component: &mut dyn Any) -> &mut T {
    component
        .downcast_mut::<T>()
        .expect("Property accessor used with the wrong component type.")
}

/// TRS transform. Kept as separate fields so properties and file payloads
/// have a fixed layout.
#[derive(Clone, PartialEq, Debug)]
pub struct Transform {
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub scale: Vector3<f32>,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

#[derive(Clone, Default, PartialEq, Debug)]
pub struct NameComponent {
    pub name: String,
}

impl NameComponent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Inspectable for NameComponent {
    fn type_name() -> &'static str {
        "NameComponent"
    }

    fn properties() -> &'static [PropertyDesc] {
        static PROPS: &[PropertyDesc] = &[PropertyDesc {
            name: "name",
            kind: PropertyKind::String,
            get: |c| PropertyValue::String(cast::<NameComponent>(c).name.clone()),
            set: |c, v| match v {
                PropertyValue::String(s) => {
                    cast_mut::<NameComponent>(c).name = s.clone();
                    true
                }
                _ => false,
            },
        }];
        PROPS
    }
}

#[derive(Clone, Default, PartialEq, Debug)]
pub struct TransformComponent {
    pub transform: Transform,
}

impl Inspectable for TransformComponent {
    fn type_name() -> &'static str {
        "TransformComponent"
    }

    fn properties() -> &'static [PropertyDesc] {
        static PROPS: &[PropertyDesc] = &[PropertyDesc {
            name: "transform",
            kind: PropertyKind::Transform,
            get: |c| PropertyValue::Transform(cast::<TransformComponent>(c).transform.clone()),
            set: |c, v| match v {
                PropertyValue::Transform(t) => {
                    cast_mut::<TransformComponent>(c).transform = t.clone();
                    true
                }
                _ => false,
            },
        }];
        PROPS
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct PointLightComponent {
    pub color: Vector3<f32>,
    pub intensity: f32,
    pub radius: f32,
}

impl Default for PointLightComponent {
    fn default() -> Self {
        Self {
            color: Vector3::new(1.0, 1.0, 1.0),
            intensity: 1.0,
            radius: 10.0,
        }
    }
}

impl Inspectable for PointLightComponent {
    fn type_name() -> &'static str {
        "PointLightComponent"
    }

    fn properties() -> &'static [PropertyDesc] {
        static PROPS: &[PropertyDesc] = &[
            PropertyDesc {
                name: "color",
                kind: PropertyKind::Vec3,
                get: |c| PropertyValue::Vec3(cast::<PointLightComponent>(c).color),
                set: |c, v| match v {
                    PropertyValue::Vec3(value) => {
                        cast_mut::<PointLightComponent>(c).color = *value;
                        true
                    }
                    _ => false,
                },
            },
            PropertyDesc {
                name: "intensity",
                kind: PropertyKind::Float,
                get: |c| PropertyValue::Float(cast::<PointLightComponent>(c).intensity),
                set: |c, v| match v {
                    PropertyValue::Float(value) => {
                        cast_mut::<PointLightComponent>(c).intensity = *value;
                        true
                    }
                    _ => false,
                },
            },
            PropertyDesc {
                name: "radius",
                kind: PropertyKind::Float,
                get: |c| PropertyValue::Float(cast::<PointLightComponent>(c).radius),
                set: |c, v| match v {
                    PropertyValue::Float(value) => {
                        cast_mut::<PointLightComponent>(c).radius = *value;
                        true
                    }
                    _ => false,
                },
            },
        ];
        PROPS
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct SpotLightComponent {
    pub color: Vector3<f32>,
    pub intensity: f32,
    pub radius: f32,
    pub half_angle: f32,
}

impl Default for SpotLightComponent {
    fn default() -> Self {
        Self {
            color: Vector3::new(1.0, 1.0, 1.0),
            intensity: 1.0,
            radius: 10.0,
            half_angle: std::f32::consts::FRAC_PI_4,
        }
    }
}

impl Inspectable for SpotLightComponent {
    fn type_name() -> &'static str {
        "SpotLightComponent"
    }

    fn properties() -> &'static [PropertyDesc] {
        static PROPS: &[PropertyDesc] = &[
            PropertyDesc {
                name: "color",
                kind: PropertyKind::Vec3,
                get: |c| PropertyValue::Vec3(cast::<SpotLightComponent>(c).color),
                set: |c, v| match v {
                    PropertyValue::Vec3(value) => {
                        cast_mut::<SpotLightComponent>(c).color = *value;
                        true
                    }
                    _ => false,
                },
            },
            PropertyDesc {
                name: "intensity",
                kind: PropertyKind::Float,
                get: |c| PropertyValue::Float(cast::<SpotLightComponent>(c).intensity),
                set: |c, v| match v {
                    PropertyValue::Float(value) => {
                        cast_mut::<SpotLightComponent>(c).intensity = *value;
                        true
                    }
                    _ => false,
                },
            },
            PropertyDesc {
                name: "radius",
                kind: PropertyKind::Float,
                get: |c| PropertyValue::Float(cast::<SpotLightComponent>(c).radius),
                set: |c, v| match v {
                    PropertyValue::Float(value) => {
                        cast_mut::<SpotLightComponent>(c).radius = *value;
                        true
                    }
                    _ => false,
                },
            },
            PropertyDesc {
                name: "half_angle",
                kind: PropertyKind::Float,
                get: |c| PropertyValue::Float(cast::<SpotLightComponent>(c).half_angle),
                set: |c, v| match v {
                    PropertyValue::Float(value) => {
                        cast_mut::<SpotLightComponent>(c).half_angle = *value;
                        true
                    }
                    _ => false,
                },
            },
        ];
        PROPS
    }
}

/// Registers the traits of every built-in component. Idempotent.
pub fn register_builtin_components() {
    register_component_traits::<NameComponent>();
    register_component_traits::<TransformComponent>();
    register_component_traits::<PointLightComponent>();
    register_component_traits::<SpotLightComponent>();
}
