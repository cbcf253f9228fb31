//! File prefix — format anchor at offset 0.
//!
//! # On-disk layout (24 bytes)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic          = "BLOB"  (4 ASCII bytes)
//!    4      4   format_version = 1       (LE u32)
//!    8     16   file_id        random, stable for the file's lifetime
//! ```
//!
//! The file-id names the cross-process coordination primitives: every
//! process opening the same file derives the same lock and mapping names
//! from it.  It is generated once at creation and never rewritten.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const MAGIC: &[u8; 4] = b"BLOB";
pub const FORMAT_VERSION: u32 = 1;
pub const PREFIX_SIZE: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePrefix {
    pub format_version: u32,
    pub file_id: Uuid,
}

impl FilePrefix {
    /// A version-1 prefix with a fresh random file-id.
    pub fn new() -> Self {
        Self { format_version: FORMAT_VERSION, file_id: Uuid::new_v4() }
    }

    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(self.format_version)?;
        w.write_all(self.file_id.as_bytes())
    }

    /// Read and validate the 24-byte prefix.
    ///
    /// Short files, a wrong magic, and a version above
    /// [`FORMAT_VERSION`] all return [`Error::UnsupportedFormat`]; the
    /// engine turns that into a `false` result from `initialize`.
    pub fn read<R: Read>(mut r: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        match r.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(Error::UnsupportedFormat(
                    "file is shorter than the 24-byte prefix".into(),
                ))
            }
            Err(e) => return Err(e.into()),
        }
        if &magic != MAGIC {
            return Err(Error::UnsupportedFormat(format!(
                "bad magic {:02x}{:02x}{:02x}{:02x}",
                magic[0], magic[1], magic[2], magic[3]
            )));
        }

        let format_version = map_eof(r.read_u32::<LittleEndian>())?;
        if format_version > FORMAT_VERSION {
            return Err(Error::UnsupportedFormat(format!(
                "format version {format_version} (this build reads up to {FORMAT_VERSION})"
            )));
        }

        let mut id = [0u8; 16];
        map_eof(r.read_exact(&mut id))?;
        Ok(Self { format_version, file_id: Uuid::from_bytes(id) })
    }
}

impl Default for FilePrefix {
    fn default() -> Self {
        Self::new()
    }
}

fn map_eof<T>(r: io::Result<T>) -> Result<T> {
    r.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::UnsupportedFormat("file is shorter than the 24-byte prefix".into())
        } else {
            Error::Io(e)
        }
    })
}
