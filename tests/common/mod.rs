//! Shared test helpers: raw file scanning and invariant checks.

use std::collections::HashSet;
use std::path::Path;

use blobfile::{ChunkInfo, CHUNK_HEADER_SIZE, PREFIX_SIZE};

/// Parse every chunk header in the file the way recovery does, asserting
/// contiguity along the way.
pub fn scan_chunks(path: &Path) -> Vec<ChunkInfo> {
    let data = std::fs::read(path).unwrap();
    assert!(data.len() >= PREFIX_SIZE, "file shorter than the prefix");
    assert_eq!(&data[0..4], b"BLOB");

    let mut chunks = Vec::new();
    let mut pos = PREFIX_SIZE;
    while pos < data.len() {
        let header: [u8; CHUNK_HEADER_SIZE] =
            data[pos..pos + CHUNK_HEADER_SIZE].try_into().expect("room for a header");
        let chunk = ChunkInfo::decode_header(&header, pos as u64).expect("header verifies");
        let end = chunk.end_position() as usize;
        assert!(end <= data.len(), "chunk {} runs past end of file", chunk.id);
        chunks.push(chunk);
        pos = end;
    }
    assert_eq!(pos, data.len(), "chunks cover the file with no gaps");
    chunks
}

/// File-level invariants that must hold after any operation sequence:
/// verifying headers, contiguous layout, unique ids, coalesced free space.
pub fn assert_invariants(path: &Path) {
    let chunks = scan_chunks(path);
    let mut ids = HashSet::new();
    for chunk in &chunks {
        assert!(ids.insert(chunk.id), "duplicate chunk id {}", chunk.id);
    }
    for pair in chunks.windows(2) {
        assert!(
            !(pair[0].chunk_type.is_free() && pair[1].chunk_type.is_free()),
            "adjacent free chunks at {} and {}",
            pair[0].position,
            pair[1].position
        );
    }
}
