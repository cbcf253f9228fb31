//! # blobfile — single-file blob storage with a TTL cache layer
//!
//! Format guarantees (frozen in v1):
//! - All numeric fields are little-endian; the prefix magic is `"BLOB"`
//! - The file starts with a fixed 24-byte prefix: magic, version, a random
//!   16-byte file-id that names all cross-process coordination primitives
//! - Every chunk is a 26-byte CRC-checked header, the payload, and a 2-byte
//!   reserved footer; chunks are contiguous with no gaps
//! - New chunks are written stamped `FREE` and patched to their real type
//!   after the flush, so a crash mid-write leaves well-formed free space
//! - The in-memory index is reconstructible by a forward header scan from
//!   offset 24; a torn tail is truncated at the first invalid header
//! - Adjacent free chunks are merged eagerly on release
//! - One writer at a time per file (in-process or across processes, through
//!   the pluggable coordinator); readers pin chunks and never block each
//!   other
//!
//! The [`storage::BlobStorage`] engine is the allocator; [`cache::BlobCache`]
//! layers a keyed TTL store on top of it, fragmenting values across `DATA`
//! chunks behind `HEAD` records.

pub mod cache;
pub mod cancel;
pub mod chunk;
pub mod coordinator;
pub mod error;
pub mod info;
pub mod prefix;
pub mod storage;
pub mod ticks;

// Flat re-exports for the most common types.
pub use cache::{BlobCache, CacheHead, CacheOptions, DataCompression, KeyComparer};
pub use cancel::CancelToken;
pub use chunk::{ChunkInfo, ChunkType, CHUNK_FOOTER_SIZE, CHUNK_HEADER_SIZE, CHUNK_OVERHEAD};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorKind};
pub use error::{Error, Result};
pub use info::StorageInfo;
pub use prefix::{FilePrefix, FORMAT_VERSION, MAGIC, PREFIX_SIZE};
pub use storage::{BlobStorage, StorageOptions, StorageSnapshot, StorageStatistics};
