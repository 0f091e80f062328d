use std::io::{Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use thiserror::Error;

use crate::assets::{read_header, read_string, write_header, write_string};
use crate::consts::io::{FILE_MAGIC, SCENE_FILE_TYPE, SCENE_FILE_VERSION};
use crate::world::components::Transform;
use crate::world::entity::EntityId;
use crate::world::reflect::{traits_by_name, traits_for, Property, PropertyKind, PropertyValue};
use crate::world::World;

#[derive(Error, Debug)]
pub enum SceneError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad file magic")]
    BadMagic,
    #[error("not a scene file")]
    WrongType,
    #[error("unsupported scene version {0}")]
    UnsupportedVersion(u32),
    #[error("malformed scene: {0}")]
    Malformed(String),
}

fn write_value<W: Write>(writer: &mut W, value: &PropertyValue) -> std::io::Result<()> {
    match value {
        PropertyValue::String(s) => write_string(writer, s)?,
        PropertyValue::Float(f) => writer.write_f32::<LittleEndian>(*f)?,
        PropertyValue::Uint(u) => writer.write_u32::<LittleEndian>(*u)?,
        PropertyValue::Bool(b) => writer.write_u8(*b as u8)?,
        PropertyValue::Vec3(v) => {
            for i in 0..3 {
                writer.write_f32::<LittleEndian>(v[i])?;
            }
        }
        PropertyValue::Transform(t) => {
            for i in 0..3 {
                writer.write_f32::<LittleEndian>(t.position[i])?;
            }
            let coords = t.rotation.as_ref().coords;
            for i in 0..4 {
                writer.write_f32::<LittleEndian>(coords[i])?;
            }
            for i in 0..3 {
                writer.write_f32::<LittleEndian>(t.scale[i])?;
            }
        }
        PropertyValue::Entity(id) => writer.write_u64::<LittleEndian>(id.as_u64())?,
    }
    Ok(())
}

fn read_vec3<R: Read>(reader: &mut R) -> std::io::Result<Vector3<f32>> {
    Ok(Vector3::new(
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    ))
}

fn read_value<R: Read>(reader: &mut R, kind: PropertyKind) -> std::io::Result<PropertyValue> {
    Ok(match kind {
        PropertyKind::String => PropertyValue::String(read_string(reader)?),
        PropertyKind::Float => PropertyValue::Float(reader.read_f32::<LittleEndian>()?),
        PropertyKind::Uint => PropertyValue::Uint(reader.read_u32::<LittleEndian>()?),
        PropertyKind::Bool => PropertyValue::Bool(reader.read_u8()? != 0),
        PropertyKind::Vec3 => PropertyValue::Vec3(read_vec3(reader)?),
        PropertyKind::Transform => {
            let position = read_vec3(reader)?;
            let x = reader.read_f32::<LittleEndian>()?;
            let y = reader.read_f32::<LittleEndian>()?;
            let z = reader.read_f32::<LittleEndian>()?;
            let w = reader.read_f32::<LittleEndian>()?;
            let scale = read_vec3(reader)?;
            PropertyValue::Transform(Transform {
                position,
                rotation: UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
                scale,
            })
        }
        PropertyKind::Entity => PropertyValue::Entity(EntityId::from_u64(
            reader.read_u64::<LittleEndian>()?,
        )),
    })
}

/// Serializes the whole world: entities with parents, one block per
/// non-empty component container (payloads are the reflected properties in
/// declaration order), then the tag sets.
pub fn save<W: Write>(world: &World, writer: &mut W) -> Result<(), SceneError> {
    write_header(writer, SCENE_FILE_TYPE, SCENE_FILE_VERSION)?;

    writer.write_u64::<LittleEndian>(world.entity_count() as u64)?;
    for entity in world.entities() {
        writer.write_u64::<LittleEndian>(entity.id().as_u64())?;
        writer.write_u64::<LittleEndian>(entity.parent().as_u64())?;
    }

    let containers = world
        .component_types()
        .into_iter()
        .filter(|ty| world.container_len(ty.index()) > 0)
        .filter_map(|ty| traits_for(ty.index()))
        .collect::<Vec<_>>();
    writer.write_u64::<LittleEndian>(containers.len() as u64)?;

    for traits in containers {
        write_string(writer, traits.type_name)?;
        let owners = world.container_owner_ids(traits.ty.index());
        writer.write_u64::<LittleEndian>(owners.len() as u64)?;
        for owner in owners {
            let mut payload = Vec::new();
            let mut failed = None;
            (traits.inspect)(world, owner, &mut |_, value| {
                if failed.is_none() {
                    if let Err(e) = write_value(&mut payload, &value) {
                        failed = Some(e);
                    }
                }
            });
            if let Some(e) = failed {
                return Err(SceneError::Io(e));
            }
            writer.write_u64::<LittleEndian>(owner.as_u64())?;
            writer.write_u32::<LittleEndian>(payload.len() as u32)?;
            writer.write_all(&payload)?;
        }
    }

    let tags = world.tags();
    writer.write_u32::<LittleEndian>(tags.len() as u32)?;
    for (name, set) in tags {
        write_string(writer, name)?;
        writer.write_u64::<LittleEndian>(set.len() as u64)?;
        for id in set.iter() {
            writer.write_u64::<LittleEndian>(id.as_u64())?;
        }
    }

    Ok(())
}

pub fn save_to_vec(world: &World) -> Result<Vec<u8>, SceneError> {
    let mut bytes = Vec::new();
    save(world, &mut bytes)?;
    Ok(bytes)
}

pub fn save_to_file(world: &World, path: impl AsRef<Path>) -> Result<(), SceneError> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    save(world, &mut file)?;
    Ok(())
}

pub fn load<R: Read>(reader: &mut R) -> Result<World, SceneError> {
    let header = read_header(reader)?;
    if header.magic != FILE_MAGIC {
        return Err(SceneError::BadMagic);
    }
    if header.file_type != SCENE_FILE_TYPE {
        return Err(SceneError::WrongType);
    }
    if header.version > SCENE_FILE_VERSION {
        return Err(SceneError::UnsupportedVersion(header.version));
    }

    let mut world = World::new();

    let entity_count = reader.read_u64::<LittleEndian>()?;
    let mut parents = Vec::new();
    for _ in 0..entity_count {
        let id = EntityId::from_u64(reader.read_u64::<LittleEndian>()?);
        let parent = EntityId::from_u64(reader.read_u64::<LittleEndian>()?);
        if !id.is_valid() {
            return Err(SceneError::Malformed("null entity id".to_string()));
        }
        world.create_entity_with_id(id);
        if parent.is_valid() {
            parents.push((id, parent));
        }
    }
    for (id, parent) in parents {
        if !world.exists(parent) {
            return Err(SceneError::Malformed(format!(
                "entity {} has a dead parent {}",
                id, parent
            )));
        }
        world.set_parent(id, parent);
    }

    let container_count = reader.read_u64::<LittleEndian>()?;
    for _ in 0..container_count {
        let type_name = read_string(reader)?;
        let component_count = reader.read_u64::<LittleEndian>()?;
        let traits = traits_by_name(&type_name);
        if traits.is_none() {
            log::warn!("Skipping unknown component container \"{}\".", type_name);
        }

        for _ in 0..component_count {
            let owner = EntityId::from_u64(reader.read_u64::<LittleEndian>()?);
            let payload_len = reader.read_u32::<LittleEndian>()? as usize;
            let mut payload = vec![0u8; payload_len];
            reader.read_exact(&mut payload)?;

            let Some(traits) = traits else {
                continue;
            };
            if !world.exists(owner) {
                return Err(SceneError::Malformed(format!(
                    "component owner {} does not exist",
                    owner
                )));
            }

            (traits.add_default)(&mut world, owner);

            // Values are stored in declaration order. A payload from an
            // older writer may end early; unknown trailing bytes are
            // ignored.
            let mut cursor = std::io::Cursor::new(payload.as_slice());
            let mut properties = Vec::new();
            for desc in traits.properties {
                if cursor.position() >= payload.len() as u64 {
                    break;
                }
                properties.push(Property {
                    name: desc.name,
                    value: read_value(&mut cursor, desc.kind)?,
                });
            }
            (traits.apply)(&mut world, owner, &properties);
        }
    }

    let tag_count = reader.read_u32::<LittleEndian>()?;
    for _ in 0..tag_count {
        let name = read_string(reader)?;
        let id_count = reader.read_u64::<LittleEndian>()?;
        for _ in 0..id_count {
            let id = EntityId::from_u64(reader.read_u64::<LittleEndian>()?);
            if world.exists(id) {
                world.add_tag(id, &name);
            }
        }
    }

    // Loading must not leave change tracking behind.
    world.commit();
    Ok(world)
}

pub fn load_from_vec(bytes: &[u8]) -> Result<World, SceneError> {
    load(&mut std::io::Cursor::new(bytes))
}

pub fn load_from_file(path: impl AsRef<Path>) -> Result<World, SceneError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    load(&mut file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::components::{NameComponent, PointLightComponent, TransformComponent};

    fn sample_world() -> World {
        let mut world = World::new();
        let a = world.create_entity();
        world.add_component(a, NameComponent::new("root"));
        world.add_component(a, TransformComponent::default());

        let b = world.create_entity();
        world.add_component(b, NameComponent::new("light"));
        let mut light = PointLightComponent::default();
        light.intensity = 3.5;
        world.add_component(b, light);
        world.set_parent(b, a);
        world.add_tag(b, "lights");
        world.commit();
        world
    }

    #[test]
    fn roundtrip_preserves_entities_components_and_tags() {
        let world = sample_world();
        let bytes = save_to_vec(&world).unwrap();
        let loaded = load_from_vec(&bytes).unwrap();

        assert_eq!(loaded.entity_count(), 2);
        let ids = loaded.entities().map(|e| e.id()).collect::<Vec<_>>();
        assert_eq!(ids.len(), 2);

        let (a, b) = (ids[0], ids[1]);
        assert_eq!(loaded.get_by_entity::<NameComponent>(a).unwrap().name, "root");
        assert_eq!(loaded.parent(b), a);
        assert_eq!(
            loaded.get_by_entity::<PointLightComponent>(b).unwrap().intensity,
            3.5
        );
        assert!(loaded.has_tag(b, "lights"));
    }

    #[test]
    fn serialization_is_deterministic() {
        let world = sample_world();
        let first = save_to_vec(&world).unwrap();
        let reloaded = load_from_vec(&first).unwrap();
        let second = save_to_vec(&reloaded).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_foreign_files() {
        let mut bytes = save_to_vec(&sample_world()).unwrap();
        bytes[0] ^= 0xff;
        assert!(matches!(load_from_vec(&bytes), Err(SceneError::BadMagic)));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let bytes = save_to_vec(&sample_world()).unwrap();
        let truncated = &bytes[..bytes.len() - 4];
        assert!(matches!(load_from_vec(truncated), Err(SceneError::Io(_))));
    }

    #[test]
    fn unknown_trailing_payload_bytes_are_ignored() {
        let mut world = World::new();
        let e = world.create_entity();
        world.add_component(e, NameComponent::new("future"));
        world.commit();

        let bytes = save_to_vec(&world).unwrap();
        // Splice two extra bytes into the single component payload and fix
        // up its length prefix.
        let name_block = b"NameComponent";
        let at = bytes
            .windows(name_block.len())
            .position(|w| w == name_block)
            .unwrap();
        let count_at = at + name_block.len();
        let owner_at = count_at + 8;
        let len_at = owner_at + 8;
        let payload_len =
            u32::from_le_bytes(bytes[len_at..len_at + 4].try_into().unwrap()) as usize;

        let mut patched = bytes.clone();
        patched[len_at..len_at + 4].copy_from_slice(&((payload_len + 2) as u32).to_le_bytes());
        patched.splice(
            len_at + 4 + payload_len..len_at + 4 + payload_len,
            [0xde, 0xad],
        );

        let loaded = load_from_vec(&patched).unwrap();
        let id = loaded.entities().next().unwrap().id();
        assert_eq!(loaded.get_by_entity::<NameComponent>(id).unwrap().name, "future");
    }
}
