//! Chunk format — 26-byte header, payload, 2-byte footer.
//!
//! # On-disk layout (all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   type         0=FREE, 1=BLOB, 2=DATA, 3=HEAD, rest caller-defined
//!    4      4   id           nonzero, unique among live chunks
//!    8      4   user_data    opaque 32-bit tag (the cache stores a key hash)
//!   12      4   size         payload byte length
//!   16      8   added_ticks  100-ns UTC ticks at creation (LE i64)
//!   24      2   crc16        CRC-16/ARC of bytes 4..24
//! ```
//!
//! The payload follows the header; a 2-byte reserved footer (written as
//! zero, never validated) follows the payload.  Chunks are contiguous:
//! the next header starts at `position + 28 + size`.
//!
//! # CRC coverage
//!
//! The CRC covers bytes 4..24 only.  The type field is excluded because a
//! chunk is first written stamped `FREE` and its real type is patched in
//! after the flush; the stored CRC must hold in both states.  A header
//! whose type bytes are torn therefore still verifies, but the chunk is
//! then a well-formed record of one type or the other, which is exactly
//! what the two-step commit relies on.

use crc::{Crc, CRC_16_ARC};

use crate::error::{Error, Result};

pub const CHUNK_HEADER_SIZE: usize = 26;
pub const CHUNK_FOOTER_SIZE: usize = 2;
/// Header plus footer; a chunk occupies `CHUNK_OVERHEAD + size` bytes.
pub const CHUNK_OVERHEAD: usize = CHUNK_HEADER_SIZE + CHUNK_FOOTER_SIZE;

pub const CHUNK_FOOTER: [u8; CHUNK_FOOTER_SIZE] = [0, 0];

/// CRC-16/ARC: polynomial 0x8005, reflected, the classic table-driven CRC16.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

// ── Chunk type ───────────────────────────────────────────────────────────────

/// 32-bit chunk type tag.  `FREE` is the only value the engine interprets;
/// the reserved tags below are conventions of the cache layer, and any
/// other value is caller-defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkType(pub u32);

impl ChunkType {
    /// Reclaimable space.  Assigned by the engine, never by callers.
    pub const FREE: ChunkType = ChunkType(0);
    /// Reserved for whole-value blobs.
    pub const BLOB: ChunkType = ChunkType(1);
    /// Cache convention: one fragment of a cached value.
    pub const DATA: ChunkType = ChunkType(2);
    /// Cache convention: entry header referencing `DATA` chunks.
    pub const HEAD: ChunkType = ChunkType(3);

    #[inline]
    pub fn is_free(self) -> bool {
        self == ChunkType::FREE
    }
}

// ── Chunk record ─────────────────────────────────────────────────────────────

/// One chunk as tracked by the in-memory index.
///
/// This is a plain value: the authoritative copy lives in the storage info
/// under the coordinator's lock, and clones handed to selectors are
/// read-only snapshots.  `changing` and `read_count` exist only at runtime;
/// they are shared through the coordinator but never written to the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_type: ChunkType,
    pub id: u32,
    pub user_data: u32,
    pub size: u32,
    pub added_ticks: i64,
    pub position: u64,
    pub crc16: u16,
    /// A writer is mutating this chunk's region; skip it everywhere.
    pub changing: bool,
    /// Number of readers currently streaming this chunk's payload.
    pub read_count: u32,
}

impl ChunkInfo {
    pub fn new(
        chunk_type: ChunkType,
        id: u32,
        user_data: u32,
        size: u32,
        added_ticks: i64,
        position: u64,
    ) -> Self {
        let mut chunk = Self {
            chunk_type,
            id,
            user_data,
            size,
            added_ticks,
            position,
            crc16: 0,
            changing: false,
            read_count: 0,
        };
        chunk.crc16 = chunk.compute_crc();
        chunk
    }

    /// First payload byte.
    #[inline]
    pub fn payload_position(&self) -> u64 {
        self.position + CHUNK_HEADER_SIZE as u64
    }

    /// One past the footer; the next chunk's header position.
    #[inline]
    pub fn end_position(&self) -> u64 {
        self.position + CHUNK_OVERHEAD as u64 + u64::from(self.size)
    }

    /// CRC-16 over the id, user_data, size and added_ticks fields.
    pub fn compute_crc(&self) -> u16 {
        let mut buf = [0u8; 20];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.user_data.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..20].copy_from_slice(&self.added_ticks.to_le_bytes());
        CRC16.checksum(&buf)
    }

    /// Recompute `crc16` after mutating header fields.
    pub(crate) fn refresh_crc(&mut self) {
        self.crc16 = self.compute_crc();
    }

    /// Encode the 26-byte header, stamping `stamp` as the type field.
    ///
    /// The engine writes new chunks with `stamp = FREE` and patches the
    /// real type in afterwards; both stamps share the stored CRC.
    pub fn encode_header(&self, stamp: ChunkType) -> [u8; CHUNK_HEADER_SIZE] {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        buf[0..4].copy_from_slice(&stamp.0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.user_data.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.added_ticks.to_le_bytes());
        buf[24..26].copy_from_slice(&self.compute_crc().to_le_bytes());
        buf
    }

    /// Decode and validate a header read from `position`.
    ///
    /// Fails with [`Error::InvalidChunk`] on a CRC mismatch or a zero id.
    /// The payload-past-end-of-file check belongs to the caller, which
    /// knows the file length.
    pub fn decode_header(buf: &[u8; CHUNK_HEADER_SIZE], position: u64) -> Result<Self> {
        let chunk_type = ChunkType(u32::from_le_bytes(buf[0..4].try_into().unwrap()));
        let id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let user_data = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let size = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let added_ticks = i64::from_le_bytes(buf[16..24].try_into().unwrap());
        let stored_crc = u16::from_le_bytes(buf[24..26].try_into().unwrap());

        let chunk = Self {
            chunk_type,
            id,
            user_data,
            size,
            added_ticks,
            position,
            crc16: stored_crc,
            changing: false,
            read_count: 0,
        };

        let computed = chunk.compute_crc();
        if stored_crc != computed {
            return Err(Error::invalid_chunk(
                position,
                format!("header CRC mismatch (stored {stored_crc:#06x}, computed {computed:#06x})"),
            ));
        }
        if id == 0 {
            return Err(Error::invalid_chunk(position, "zero chunk id"));
        }
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChunkInfo {
        ChunkInfo::new(ChunkType::DATA, 7, 0xDEAD_BEEF, 256, 637_000_000_000_000_000, 24)
    }

    #[test]
    fn header_roundtrip() {
        let chunk = sample();
        let buf = chunk.encode_header(chunk.chunk_type);
        let back = ChunkInfo::decode_header(&buf, 24).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn stamp_keeps_crc_valid_in_both_states() {
        let chunk = sample();
        let mut buf = chunk.encode_header(ChunkType::FREE);

        // As written before the stamp: a valid FREE chunk.
        let free = ChunkInfo::decode_header(&buf, 24).unwrap();
        assert_eq!(free.chunk_type, ChunkType::FREE);
        assert_eq!(free.crc16, chunk.crc16);

        // After patching the 4 type bytes: a valid DATA chunk.
        buf[0..4].copy_from_slice(&ChunkType::DATA.0.to_le_bytes());
        let data = ChunkInfo::decode_header(&buf, 24).unwrap();
        assert_eq!(data.chunk_type, ChunkType::DATA);
        assert_eq!(data.crc16, chunk.crc16);
    }

    #[test]
    fn corrupted_field_fails_crc() {
        let chunk = sample();
        let mut buf = chunk.encode_header(chunk.chunk_type);
        buf[12] ^= 0xFF; // size field
        assert!(matches!(
            ChunkInfo::decode_header(&buf, 24),
            Err(Error::InvalidChunk { position: 24, .. })
        ));
    }

    #[test]
    fn zero_id_is_invalid() {
        let chunk = ChunkInfo::new(ChunkType::DATA, 0, 0, 16, 0, 24);
        let buf = chunk.encode_header(chunk.chunk_type);
        assert!(matches!(
            ChunkInfo::decode_header(&buf, 24),
            Err(Error::InvalidChunk { .. })
        ));
    }

    #[test]
    fn positions_are_contiguous() {
        let chunk = sample();
        assert_eq!(chunk.payload_position(), 24 + 26);
        assert_eq!(chunk.end_position(), 24 + 26 + 256 + 2);
    }
}
