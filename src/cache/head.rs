//! Cache entry codecs.
//!
//! # Head payload (inside a `HEAD` chunk, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      2   key_len      UTF-8 byte length (LE u16)
//!    2      n   key          UTF-8 bytes
//!    .      8   ttl_ticks    expiry, 100-ns UTC ticks (LE i64)
//!    .      4   length       decoded value byte length (LE i32)
//!    .      4   chunk_count  (LE u32)
//!    .    4×n   chunk ids    ordered DATA chunk ids (LE u32 each)
//! ```
//!
//! # Data head (first byte of every `DATA` chunk payload)
//!
//! One byte selecting the payload compression.  Unknown values are an
//! error; a writer that compressed but gained nothing stamps `None` and
//! stores the raw bytes.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

// ── Cache head ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHead {
    pub key: String,
    pub ttl_ticks: i64,
    /// Total decoded byte length of the value.
    pub length: i32,
    /// Ordered `DATA` chunk ids holding the value's fragments.
    pub chunk_ids: Vec<u32>,
}

impl CacheHead {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let key = self.key.as_bytes();
        if key.len() > usize::from(u16::MAX) {
            return Err(Error::InvalidArgument("key exceeds 65535 UTF-8 bytes"));
        }
        let mut buf = Vec::with_capacity(2 + key.len() + 8 + 4 + 4 + 4 * self.chunk_ids.len());
        buf.write_u16::<LittleEndian>(key.len() as u16)?;
        buf.extend_from_slice(key);
        buf.write_i64::<LittleEndian>(self.ttl_ticks)?;
        buf.write_i32::<LittleEndian>(self.length)?;
        buf.write_u32::<LittleEndian>(self.chunk_ids.len() as u32)?;
        for &id in &self.chunk_ids {
            buf.write_u32::<LittleEndian>(id)?;
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(buf);
        let key_len = usize::from(short(r.read_u16::<LittleEndian>())?);
        let mut key = vec![0u8; key_len];
        short(r.read_exact(&mut key))?;
        let key = String::from_utf8(key)
            .map_err(|_| Error::InvalidHead("key is not valid UTF-8".into()))?;
        let ttl_ticks = short(r.read_i64::<LittleEndian>())?;
        let length = short(r.read_i32::<LittleEndian>())?;
        let count = short(r.read_u32::<LittleEndian>())? as usize;
        let list_bytes = count.checked_mul(4).unwrap_or(usize::MAX);
        if buf.len().saturating_sub(r.position() as usize) < list_bytes {
            return Err(Error::InvalidHead(format!(
                "chunk list of {count} ids overruns a {}-byte payload",
                buf.len()
            )));
        }
        let mut chunk_ids = Vec::with_capacity(count);
        for _ in 0..count {
            chunk_ids.push(short(r.read_u32::<LittleEndian>())?);
        }
        Ok(Self { key, ttl_ticks, length, chunk_ids })
    }
}

fn short<T>(r: std::io::Result<T>) -> Result<T> {
    r.map_err(|e| Error::InvalidHead(format!("payload too short: {e}")))
}

// ── Data head ────────────────────────────────────────────────────────────────

pub const DATA_HEAD_SIZE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCompression {
    None,
    Deflate,
}

impl DataCompression {
    pub fn encode(self) -> u8 {
        match self {
            DataCompression::None => 0,
            DataCompression::Deflate => 1,
        }
    }

    pub fn decode(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(DataCompression::None),
            1 => Ok(DataCompression::Deflate),
            other => Err(Error::UnknownCompression(other)),
        }
    }
}
