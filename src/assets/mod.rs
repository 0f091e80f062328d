pub mod animation;
pub mod scene;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::consts::io::FILE_MAGIC;

/// Framed file header: magic, file type, format version. Little endian,
/// like everything else on disk.
pub(crate) fn write_header<W: std::io::Write>(
    writer: &mut W,
    file_type: u32,
    version: u32,
) -> std::io::Result<()> {
    writer.write_u32::<LittleEndian>(FILE_MAGIC)?;
    writer.write_u32::<LittleEndian>(file_type)?;
    writer.write_u32::<LittleEndian>(version)?;
    Ok(())
}

pub(crate) struct Header {
    pub magic: u32,
    pub file_type: u32,
    pub version: u32,
}

pub(crate) fn read_header<R: std::io::Read>(reader: &mut R) -> std::io::Result<Header> {
    Ok(Header {
        magic: reader.read_u32::<LittleEndian>()?,
        file_type: reader.read_u32::<LittleEndian>()?,
        version: reader.read_u32::<LittleEndian>()?,
    })
}

/// Length-prefixed string, not null-terminated.
pub(crate) fn write_string<W: std::io::Write>(writer: &mut W, s: &str) -> std::io::Result<()> {
    writer.write_u32::<LittleEndian>(s.len() as u32)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

pub(crate) fn read_string<R: std::io::Read>(reader: &mut R) -> std::io::Result<String> {
    let len = reader.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid utf-8 string"))
}
