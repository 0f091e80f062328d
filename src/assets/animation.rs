use std::io::{Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use thiserror::Error;

use crate::assets::{read_header, read_string, write_header, write_string};
use crate::consts::io::{ANIMATION_FILE_TYPE, ANIMATION_FILE_VERSION, FILE_MAGIC};

#[derive(Error, Debug)]
pub enum AnimationError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad file magic")]
    BadMagic,
    #[error("not an animation file")]
    WrongType,
    #[error("unsupported animation version {0}")]
    UnsupportedVersion(u32),
    #[error("channels are not sorted by name (\"{0}\")")]
    ChannelOrder(String),
    #[error("key times of channel \"{0}\" are not strictly ascending")]
    KeyOrder(String),
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct AnimationKey {
    pub time: f32,
    pub position: Vector3<f32>,
    pub scale: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
}

/// Keyframes for one bone. Key times are strictly ascending.
#[derive(Clone, Debug)]
pub struct AnimationChannel {
    name: String,
    keys: Vec<AnimationKey>,
}

impl AnimationChannel {
    pub fn new(name: impl Into<String>, keys: Vec<AnimationKey>) -> Result<Self, AnimationError> {
        let name = name.into();
        if !keys.windows(2).all(|w| w[0].time < w[1].time) {
            return Err(AnimationError::KeyOrder(name));
        }
        Ok(Self { name, keys })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &[AnimationKey] {
        &self.keys
    }

    /// TRS sample at `time`: clamped at the ends, interpolated between the
    /// bracketing keys (linear for position and scale, spherical for
    /// rotation).
    pub fn sample(&self, time: f32) -> Option<AnimationKey> {
        let first = self.keys.first()?;
        if time <= first.time {
            return Some(*first);
        }
        let last = self.keys.last()?;
        if time >= last.time {
            return Some(*last);
        }

        let next = self.keys.partition_point(|k| k.time <= time);
        let a = &self.keys[next - 1];
        let b = &self.keys[next];
        let t = (time - a.time) / (b.time - a.time);

        Some(AnimationKey {
            time,
            position: a.position.lerp(&b.position, t),
            scale: a.scale.lerp(&b.scale, t),
            rotation: a.rotation.slerp(&b.rotation, t),
        })
    }
}

/// A named set of channels plus the clip duration. Channels are sorted by
/// name so lookups can bisect.
#[derive(Clone, Debug)]
pub struct Animation {
    duration: f32,
    channels: Vec<AnimationChannel>,
}

impl Animation {
    pub fn new(duration: f32, channels: Vec<AnimationChannel>) -> Result<Self, AnimationError> {
        if let Some(unsorted) = channels.windows(2).find(|w| w[0].name >= w[1].name) {
            return Err(AnimationError::ChannelOrder(unsorted[1].name.clone()));
        }
        Ok(Self { duration, channels })
    }

    pub fn duration(&self) -> f32 {
        self.duration
    }

    pub fn channels(&self) -> &[AnimationChannel] {
        &self.channels
    }

    pub fn channel(&self, name: &str) -> Option<&AnimationChannel> {
        self.channels
            .binary_search_by(|c| c.name.as_str().cmp(name))
            .ok()
            .map(|at| &self.channels[at])
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), AnimationError> {
        write_header(writer, ANIMATION_FILE_TYPE, ANIMATION_FILE_VERSION)?;
        writer.write_u32::<LittleEndian>(self.channels.len() as u32)?;
        writer.write_f32::<LittleEndian>(self.duration)?;

        for channel in &self.channels {
            write_string(writer, &channel.name)?;
            writer.write_u32::<LittleEndian>(channel.keys.len() as u32)?;
            for key in &channel.keys {
                writer.write_f32::<LittleEndian>(key.time)?;
                for i in 0..3 {
                    writer.write_f32::<LittleEndian>(key.position[i])?;
                }
                for i in 0..3 {
                    writer.write_f32::<LittleEndian>(key.scale[i])?;
                }
                let coords = key.rotation.as_ref().coords;
                for i in 0..4 {
                    writer.write_f32::<LittleEndian>(coords[i])?;
                }
            }
        }
        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AnimationError> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.save(&mut file)
    }

    pub fn load<R: Read>(reader: &mut R) -> Result<Self, AnimationError> {
        let header = read_header(reader)?;
        if header.magic != FILE_MAGIC {
            return Err(AnimationError::BadMagic);
        }
        if header.file_type != ANIMATION_FILE_TYPE {
            return Err(AnimationError::WrongType);
        }
        if header.version != ANIMATION_FILE_VERSION {
            return Err(AnimationError::UnsupportedVersion(header.version));
        }

        let channel_count = reader.read_u32::<LittleEndian>()?;
        let duration = reader.read_f32::<LittleEndian>()?;

        let mut channels = Vec::with_capacity(channel_count as usize);
        for _ in 0..channel_count {
            let name = read_string(reader)?;
            let key_count = reader.read_u32::<LittleEndian>()?;
            let mut keys = Vec::with_capacity(key_count as usize);
            for _ in 0..key_count {
                let time = reader.read_f32::<LittleEndian>()?;
                let mut position = [0.0f32; 3];
                for v in &mut position {
                    *v = reader.read_f32::<LittleEndian>()?;
                }
                let mut scale = [0.0f32; 3];
                for v in &mut scale {
                    *v = reader.read_f32::<LittleEndian>()?;
                }
                let mut rotation = [0.0f32; 4];
                for v in &mut rotation {
                    *v = reader.read_f32::<LittleEndian>()?;
                }
                keys.push(AnimationKey {
                    time,
                    position: Vector3::from(position),
                    scale: Vector3::from(scale),
                    rotation: UnitQuaternion::from_quaternion(Quaternion::new(
                        rotation[3],
                        rotation[0],
                        rotation[1],
                        rotation[2],
                    )),
                });
            }
            channels.push(AnimationChannel::new(name, keys)?);
        }

        Animation::new(duration, channels)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AnimationError> {
        let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
        Self::load(&mut file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(time: f32, x: f32) -> AnimationKey {
        AnimationKey {
            time,
            position: Vector3::new(x, 0.0, 0.0),
            scale: Vector3::new(1.0, 1.0, 1.0),
            rotation: UnitQuaternion::identity(),
        }
    }

    fn clip() -> Animation {
        Animation::new(
            2.0,
            vec![
                AnimationChannel::new("hips", vec![key(0.0, 0.0), key(1.0, 2.0), key(2.0, 4.0)])
                    .unwrap(),
                AnimationChannel::new("spine", vec![key(0.0, 1.0)]).unwrap(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn sampling_interpolates_and_clamps() {
        let clip = clip();
        let hips = clip.channel("hips").unwrap();

        assert_eq!(hips.sample(-1.0).unwrap().position.x, 0.0);
        assert_eq!(hips.sample(0.5).unwrap().position.x, 1.0);
        assert_eq!(hips.sample(3.0).unwrap().position.x, 4.0);
    }

    #[test]
    fn roundtrip() {
        let clip = clip();
        let mut bytes = Vec::new();
        clip.save(&mut bytes).unwrap();

        let loaded = Animation::load(&mut std::io::Cursor::new(&bytes)).unwrap();
        assert_eq!(loaded.duration(), 2.0);
        assert_eq!(loaded.channels().len(), 2);
        assert_eq!(loaded.channel("spine").unwrap().keys().len(), 1);
        assert_eq!(
            loaded.channel("hips").unwrap().sample(1.0).unwrap().position.x,
            2.0
        );
    }

    #[test]
    fn unsorted_channels_are_rejected() {
        let result = Animation::new(
            1.0,
            vec![
                AnimationChannel::new("spine", vec![key(0.0, 0.0)]).unwrap(),
                AnimationChannel::new("hips", vec![key(0.0, 0.0)]).unwrap(),
            ],
        );
        assert!(matches!(result, Err(AnimationError::ChannelOrder(_))));
    }

    #[test]
    fn non_ascending_keys_are_rejected() {
        let result = AnimationChannel::new("hips", vec![key(1.0, 0.0), key(1.0, 1.0)]);
        assert!(matches!(result, Err(AnimationError::KeyOrder(_))));
    }
}
