//! Storage info — the in-memory chunk index shared through the coordinator.
//!
//! The info is the authoritative picture of the file: every chunk with its
//! runtime state, plus monotone version counters consumers use to invalidate
//! derived caches.  It lives inside the coordinator (a process-wide entry
//! for the in-process variant, a shared mapping for the cross-process one)
//! and the engine mutates it only inside the coordinator's critical section.
//!
//! # Serialized layout (all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      1   initialized        0 or 1
//!    1      8   modified_version
//!    9      8   added_version
//!   17      8   removed_version
//!   25      4   chunk_count
//! then per chunk (39 bytes each):
//!    0      8   position
//!    8      4   type
//!   12      4   id
//!   16      4   user_data
//!   20      4   size
//!   24      8   added_ticks
//!   32      2   crc16
//!   34      1   changing
//!   35      4   read_count
//! ```

use std::collections::HashMap;

use crate::chunk::{ChunkInfo, ChunkType};
use crate::error::{Error, Result};
use crate::prefix::PREFIX_SIZE;

pub const INFO_HEADER_SIZE: usize = 1 + 8 + 8 + 8 + 4;
pub const INFO_CHUNK_SIZE: usize = 8 + 4 + 4 + 4 + 4 + 8 + 2 + 1 + 4;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageInfo {
    /// Set once the index reflects the file (freshly scanned or inherited
    /// from another attached engine).
    pub initialized: bool,
    /// Bumped by the coordinator on every publish.
    pub modified_version: u64,
    /// Bumped exactly once per committed `add_chunk`.
    pub added_version: u64,
    /// Bumped exactly once per committed `remove_chunk`.
    pub removed_version: u64,
    chunks: Vec<ChunkInfo>,
    by_id: HashMap<u32, usize>,
}

impl StorageInfo {
    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&ChunkInfo> {
        self.by_id.get(&id).map(|&i| &self.chunks[i])
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut ChunkInfo> {
        let i = *self.by_id.get(&id)?;
        Some(&mut self.chunks[i])
    }

    /// Append a chunk.  Ids must be unique among tracked chunks.
    pub fn add(&mut self, chunk: ChunkInfo) {
        debug_assert!(!self.by_id.contains_key(&chunk.id), "duplicate chunk id {}", chunk.id);
        self.by_id.insert(chunk.id, self.chunks.len());
        self.chunks.push(chunk);
    }

    /// Remove a chunk by id, preserving list order.
    pub fn remove(&mut self, id: u32) -> Option<ChunkInfo> {
        let index = self.by_id.remove(&id)?;
        let chunk = self.chunks.remove(index);
        for slot in self.by_id.values_mut() {
            if *slot > index {
                *slot -= 1;
            }
        }
        Some(chunk)
    }

    /// Smallest positive integer not currently used as a chunk id.
    pub fn next_id(&self) -> u32 {
        let mut ids: Vec<u32> = self.chunks.iter().map(|c| c.id).collect();
        ids.sort_unstable();
        let mut next = 1u32;
        for id in ids {
            if id == next {
                next += 1;
            } else if id > next {
                break;
            }
        }
        next
    }

    /// Chunk whose header sits exactly at `position`.
    pub fn at_position(&self, position: u64) -> Option<&ChunkInfo> {
        self.chunks.iter().find(|c| c.position == position)
    }

    /// Chunk whose extent ends exactly at `position`.
    pub fn ending_at(&self, position: u64) -> Option<&ChunkInfo> {
        self.chunks.iter().find(|c| c.end_position() == position)
    }

    /// Last chunk in file-position order.
    pub fn last_by_position(&self) -> Option<&ChunkInfo> {
        self.chunks.iter().max_by_key(|c| c.position)
    }

    /// Where the next appended chunk starts: one past the last extent, or
    /// the file prefix when the index is empty.
    pub fn end_of_chunks(&self) -> u64 {
        self.chunks
            .iter()
            .map(|c| c.end_position())
            .max()
            .unwrap_or(PREFIX_SIZE as u64)
    }

    /// Payload sizes of free chunks, in file-position order.
    pub fn free_sizes(&self) -> Vec<u32> {
        let mut free: Vec<&ChunkInfo> =
            self.chunks.iter().filter(|c| c.chunk_type.is_free()).collect();
        free.sort_by_key(|c| c.position);
        free.iter().map(|c| c.size).collect()
    }

    // ── Shared-buffer codec ──────────────────────────────────────────────────

    pub fn serialized_size(&self) -> usize {
        INFO_HEADER_SIZE + self.chunks.len() * INFO_CHUNK_SIZE
    }

    /// Serialize into `buf`.  Returns the number of bytes written.
    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize> {
        let needed = self.serialized_size();
        if buf.len() < needed {
            return Err(Error::SharedBufferFull { needed, capacity: buf.len() });
        }

        buf[0] = u8::from(self.initialized);
        buf[1..9].copy_from_slice(&self.modified_version.to_le_bytes());
        buf[9..17].copy_from_slice(&self.added_version.to_le_bytes());
        buf[17..25].copy_from_slice(&self.removed_version.to_le_bytes());
        buf[25..29].copy_from_slice(&(self.chunks.len() as u32).to_le_bytes());

        let mut pos = INFO_HEADER_SIZE;
        for c in &self.chunks {
            let b = &mut buf[pos..pos + INFO_CHUNK_SIZE];
            b[0..8].copy_from_slice(&c.position.to_le_bytes());
            b[8..12].copy_from_slice(&c.chunk_type.0.to_le_bytes());
            b[12..16].copy_from_slice(&c.id.to_le_bytes());
            b[16..20].copy_from_slice(&c.user_data.to_le_bytes());
            b[20..24].copy_from_slice(&c.size.to_le_bytes());
            b[24..32].copy_from_slice(&c.added_ticks.to_le_bytes());
            b[32..34].copy_from_slice(&c.crc16.to_le_bytes());
            b[34] = u8::from(c.changing);
            b[35..39].copy_from_slice(&c.read_count.to_le_bytes());
            pos += INFO_CHUNK_SIZE;
        }
        Ok(pos)
    }

    /// Deserialize from `buf` (as produced by [`StorageInfo::write_to`]).
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < INFO_HEADER_SIZE {
            return Err(Error::SharedBufferFull {
                needed: INFO_HEADER_SIZE,
                capacity: buf.len(),
            });
        }
        let initialized = buf[0] != 0;
        let modified_version = u64::from_le_bytes(buf[1..9].try_into().unwrap());
        let added_version = u64::from_le_bytes(buf[9..17].try_into().unwrap());
        let removed_version = u64::from_le_bytes(buf[17..25].try_into().unwrap());
        let count = u32::from_le_bytes(buf[25..29].try_into().unwrap()) as usize;

        let needed = INFO_HEADER_SIZE + count * INFO_CHUNK_SIZE;
        if buf.len() < needed {
            return Err(Error::SharedBufferFull { needed, capacity: buf.len() });
        }

        let mut info = Self {
            initialized,
            modified_version,
            added_version,
            removed_version,
            chunks: Vec::with_capacity(count),
            by_id: HashMap::with_capacity(count),
        };
        let mut pos = INFO_HEADER_SIZE;
        for _ in 0..count {
            let b = &buf[pos..pos + INFO_CHUNK_SIZE];
            let chunk = ChunkInfo {
                position: u64::from_le_bytes(b[0..8].try_into().unwrap()),
                chunk_type: ChunkType(u32::from_le_bytes(b[8..12].try_into().unwrap())),
                id: u32::from_le_bytes(b[12..16].try_into().unwrap()),
                user_data: u32::from_le_bytes(b[16..20].try_into().unwrap()),
                size: u32::from_le_bytes(b[20..24].try_into().unwrap()),
                added_ticks: i64::from_le_bytes(b[24..32].try_into().unwrap()),
                crc16: u16::from_le_bytes(b[32..34].try_into().unwrap()),
                changing: b[34] != 0,
                read_count: u32::from_le_bytes(b[35..39].try_into().unwrap()),
            };
            info.add(chunk);
            pos += INFO_CHUNK_SIZE;
        }
        Ok(info)
    }

    /// Parse only the version counters: `(initialized, added, removed)`.
    pub fn read_versions(buf: &[u8]) -> Result<(bool, u64, u64)> {
        if buf.len() < INFO_HEADER_SIZE {
            return Err(Error::SharedBufferFull {
                needed: INFO_HEADER_SIZE,
                capacity: buf.len(),
            });
        }
        Ok((
            buf[0] != 0,
            u64::from_le_bytes(buf[9..17].try_into().unwrap()),
            u64::from_le_bytes(buf[17..25].try_into().unwrap()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticks;

    fn chunk(id: u32, position: u64, size: u32, chunk_type: ChunkType) -> ChunkInfo {
        ChunkInfo::new(chunk_type, id, id * 11, size, ticks::now(), position)
    }

    fn sample() -> StorageInfo {
        let mut info = StorageInfo { initialized: true, ..Default::default() };
        info.added_version = 3;
        info.removed_version = 1;
        info.modified_version = 9;
        info.add(chunk(1, 24, 256, ChunkType::DATA));
        info.add(chunk(2, 24 + 284, 100, ChunkType::FREE));
        let mut reading = chunk(3, 24 + 284 + 128, 64, ChunkType::HEAD);
        reading.read_count = 2;
        reading.changing = true;
        info.add(reading);
        info
    }

    #[test]
    fn serialize_roundtrip_is_identity() {
        let info = sample();
        let mut buf = vec![0u8; info.serialized_size()];
        let written = info.write_to(&mut buf).unwrap();
        assert_eq!(written, buf.len());
        let back = StorageInfo::read_from(&buf).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn write_to_rejects_small_buffer() {
        let info = sample();
        let mut buf = vec![0u8; info.serialized_size() - 1];
        assert!(matches!(
            info.write_to(&mut buf),
            Err(Error::SharedBufferFull { .. })
        ));
    }

    #[test]
    fn read_versions_matches_full_parse() {
        let info = sample();
        let mut buf = vec![0u8; info.serialized_size()];
        info.write_to(&mut buf).unwrap();
        let (initialized, added, removed) = StorageInfo::read_versions(&buf).unwrap();
        assert!(initialized);
        assert_eq!(added, info.added_version);
        assert_eq!(removed, info.removed_version);
    }

    #[test]
    fn next_id_fills_the_smallest_gap() {
        let mut info = StorageInfo::default();
        assert_eq!(info.next_id(), 1);
        info.add(chunk(1, 24, 16, ChunkType::DATA));
        info.add(chunk(2, 70, 16, ChunkType::DATA));
        info.add(chunk(4, 116, 16, ChunkType::DATA));
        assert_eq!(info.next_id(), 3);
        info.remove(1);
        assert_eq!(info.next_id(), 1);
    }

    #[test]
    fn remove_keeps_lookup_consistent() {
        let mut info = sample();
        info.remove(2).unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info.get(1).unwrap().id, 1);
        assert_eq!(info.get(3).unwrap().id, 3);
        assert!(info.get(2).is_none());
    }

    #[test]
    fn end_of_chunks_is_prefix_for_empty_index() {
        assert_eq!(StorageInfo::default().end_of_chunks(), 24);
    }
}
