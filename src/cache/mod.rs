//! Keyed TTL cache over the blob storage engine.
//!
//! A cache entry is one `HEAD` chunk plus the ordered `DATA` chunks it
//! references.  Values are fragmented into blocks of at most 5 MiB, each
//! optionally DEFLATE-compressed behind a one-byte data head, and every
//! chunk of an entry carries the key's 32-bit hash as its `user_data` tag.
//! An entry is valid when all referenced data chunks exist with the right
//! tag and the TTL has not passed; anything else reads as "not found"
//! rather than an error.
//!
//! Decoded heads are kept in an in-memory read-through index invalidated by
//! the engine's version counters: any remove clears it wholesale, and an
//! add drops the entries whose key hash may have gained a head.
//!
//! `cleanup` removes expired and broken entries, reaps orphaned data
//! chunks older than a day, truncates trailing free space, and evicts
//! whole entries (shortest TTL first) while the file exceeds the
//! configured size cap.

use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher24;

use crate::cancel::CancelToken;
use crate::chunk::{ChunkInfo, ChunkType};
use crate::error::{Error, Result};
use crate::storage::{BlobStorage, StorageOptions, StorageSnapshot};
use crate::ticks;

mod head;

pub use head::{CacheHead, DataCompression, DATA_HEAD_SIZE};

/// Largest value fragment stored in one `DATA` chunk.
pub const MAX_DATA_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Blocks at or below this size are appended without consulting the free
/// list; slot-fitting tiny blocks is not worth the bookkeeping.
const FREE_SLOT_MIN_BLOCK: usize = 1024;
/// A free slot is acceptable for a block when its size exceeds
/// `block / FREE_SLOT_DIVISOR` (and does not exceed the block).
const FREE_SLOT_DIVISOR: usize = 20;

/// Data chunks unreferenced for this long are reaped by `cleanup`.
const ORPHAN_AGE_TICKS: i64 = 24 * 3600 * ticks::TICKS_PER_SECOND;

/// Fixed SipHash-2-4 keys for the 32-bit key tag.  Part of the format:
/// every writer of a file must derive the same `user_data` for a key.
const KEY_HASH_K0: u64 = 0x626c_6f62_6669_6c65;
const KEY_HASH_K1: u64 = 0x6b65_7968_6173_6831;

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyComparer {
    #[default]
    CaseSensitive,
    /// Keys are folded to lower case before hashing, storage and lookup.
    CaseInsensitive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOptions {
    /// File size cap in bytes; 0 disables eviction.
    pub maximum_size: i64,
    /// Eviction target as a fraction of `maximum_size`.
    pub cutback_ratio: f64,
    pub can_compress: bool,
    /// Delete and recreate the file when it cannot be opened.
    pub remove_invalid_cache: bool,
    pub cleanup_at_initialize: bool,
    pub key_comparer: KeyComparer,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            maximum_size: 0,
            cutback_ratio: 0.8,
            can_compress: true,
            remove_invalid_cache: false,
            cleanup_at_initialize: true,
            key_comparer: KeyComparer::CaseSensitive,
        }
    }
}

// ── Head index ───────────────────────────────────────────────────────────────

/// One decoded head with the chunk record it came from.
#[derive(Debug, Clone)]
struct HeadRecord {
    chunk: ChunkInfo,
    head: CacheHead,
}

struct HeadIndexEntry {
    hash: u32,
    heads: Vec<HeadRecord>,
    /// `HEAD` chunk ids whose payload failed to decode.
    broken: Vec<u32>,
}

/// Read-through cache of decoded heads, keyed by folded key ("" = all).
#[derive(Default)]
struct HeadIndex {
    /// `(added_version, removed_version)` the entries were read under.
    versions: Option<(u64, u64)>,
    entries: HashMap<String, HeadIndexEntry>,
}

impl HeadIndex {
    /// Apply the version-counter invalidation rules against a fresh snapshot.
    fn revalidate(&mut self, snapshot: &StorageSnapshot) {
        let current = (snapshot.added_version, snapshot.removed_version);
        match self.versions {
            Some((added, removed)) if (added, removed) == current => {}
            Some((added, removed)) => {
                if removed != snapshot.removed_version {
                    self.entries.clear();
                } else if added != snapshot.added_version {
                    self.entries.remove("");
                    let head_hashes: HashSet<u32> = snapshot
                        .chunks()
                        .iter()
                        .filter(|c| c.chunk_type == ChunkType::HEAD)
                        .map(|c| c.user_data)
                        .collect();
                    self.entries.retain(|_, e| !head_hashes.contains(&e.hash));
                }
            }
            None => self.entries.clear(),
        }
        self.versions = Some(current);
    }
}

// ── Cache ────────────────────────────────────────────────────────────────────

pub struct BlobCache {
    storage: BlobStorage,
    options: CacheOptions,
    heads: Mutex<HeadIndex>,
}

impl BlobCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, CacheOptions::default(), StorageOptions::default())
    }

    pub fn with_options(
        path: impl Into<PathBuf>,
        options: CacheOptions,
        storage_options: StorageOptions,
    ) -> Self {
        Self {
            storage: BlobStorage::with_options(path, storage_options),
            options,
            heads: Mutex::new(HeadIndex::default()),
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn storage(&self) -> &BlobStorage {
        &self.storage
    }

    fn path(&self) -> &Path {
        self.storage.path()
    }

    fn fold(&self, key: &str) -> String {
        match self.options.key_comparer {
            KeyComparer::CaseSensitive => key.to_owned(),
            KeyComparer::CaseInsensitive => key.to_lowercase(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Open or create the cache file.
    ///
    /// A file grown past twice the configured cap is deleted outright (a
    /// cap that far exceeded means cleanup never ran to completion).  When
    /// `remove_invalid_cache` is set, an unreadable or unrecoverable file
    /// is deleted and recreated once.  Returns `false` when the file is
    /// unusable and deletion was not allowed.
    pub fn initialize(&mut self, cancel: &CancelToken) -> Result<bool> {
        cancel.check()?;

        if self.options.maximum_size > 0 {
            if let Ok(meta) = std::fs::metadata(self.path()) {
                if meta.len() > 2 * self.options.maximum_size as u64 {
                    log::warn!(
                        "{} is {} bytes, over twice the cap; deleting",
                        self.path().display(),
                        meta.len()
                    );
                    let _ = std::fs::remove_file(self.path());
                }
            }
        }

        let initialized = match self.storage.initialize(cancel) {
            Ok(true) => true,
            Ok(false) if self.options.remove_invalid_cache => self.delete_and_retry(cancel)?,
            Ok(false) => return Ok(false),
            Err(e @ (Error::Cancelled | Error::Timeout(_))) => return Err(e),
            Err(e) if self.options.remove_invalid_cache => {
                log::warn!("{} failed to open ({e}); deleting", self.path().display());
                self.delete_and_retry(cancel)?
            }
            Err(e) => return Err(e),
        };

        if initialized && self.options.cleanup_at_initialize {
            self.cleanup(Utc::now(), cancel)?;
        }
        Ok(initialized)
    }

    fn delete_and_retry(&mut self, cancel: &CancelToken) -> Result<bool> {
        if let Err(e) = std::fs::remove_file(self.path()) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        self.storage.initialize(cancel)
    }

    // ── Operations ───────────────────────────────────────────────────────────

    /// Store `data` under `key` until `ttl`.  An existing entry for the key
    /// is replaced; its chunks are released after the new entry commits.
    pub fn add(&self, key: &str, ttl: DateTime<Utc>, data: &[u8], cancel: &CancelToken) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("key must not be empty"));
        }
        if data.len() > i32::MAX as usize {
            return Err(Error::SizeOverflow(data.len() as u64));
        }
        let folded = self.fold(key);
        let hash = key_hash(&folded);
        let previous = self.load_heads(&folded, cancel)?;

        let mut chunk_ids = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            cancel.check()?;
            let remaining = data.len() - offset;
            let mut block_len = remaining.min(MAX_DATA_CHUNK_SIZE);
            if remaining > FREE_SLOT_MIN_BLOCK {
                if let Some(slot) = self.pick_free_slot(block_len, cancel)? {
                    block_len = slot;
                }
            }
            let block = &data[offset..offset + block_len];
            let payload = encode_data_payload(block, self.options.can_compress)?;
            let chunk = self.storage.add_chunk(ChunkType::DATA, hash, &payload, cancel)?;
            chunk_ids.push(chunk.id);
            offset += block_len;
        }

        let head = CacheHead {
            key: folded,
            ttl_ticks: ticks::from_datetime(ttl),
            length: data.len() as i32,
            chunk_ids,
        };
        self.storage.add_chunk(ChunkType::HEAD, hash, &head.encode()?, cancel)?;

        for record in &previous {
            self.remove_record(record, hash, cancel)?;
        }
        Ok(())
    }

    /// A free slot worth filling for a block of `block_len` bytes: larger
    /// than a twentieth of the block, no larger than the block.  Returns
    /// the block length that makes the stored payload (data head included)
    /// fill the slot exactly.
    fn pick_free_slot(&self, block_len: usize, cancel: &CancelToken) -> Result<Option<usize>> {
        let sizes = self.storage.free_chunk_sizes(cancel)?;
        Ok(sizes
            .into_iter()
            .map(|s| s as usize)
            .filter(|&s| s > DATA_HEAD_SIZE && s > block_len / FREE_SLOT_DIVISOR && s <= block_len)
            .max()
            .map(|s| s - DATA_HEAD_SIZE))
    }

    /// Read the entry for `key` into `sink`.  Returns `false` when there is
    /// no valid, unexpired entry; missing or mismatched chunks read as a
    /// miss, never as an error.
    pub fn get_into(&self, key: &str, sink: &mut dyn Write, cancel: &CancelToken) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("key must not be empty"));
        }
        let folded = self.fold(key);
        let hash = key_hash(&folded);
        let records = self.load_heads(&folded, cancel)?;
        if records.is_empty() {
            return Ok(false);
        }
        let snapshot = self.storage.snapshot(cancel)?;
        let Some(record) = latest_valid(&records, &snapshot, hash, ticks::now()) else {
            return Ok(false);
        };

        let ids = record.head.chunk_ids.clone();
        let mut written = 0u64;
        let found = self.storage.read_chunks(
            |snapshot| {
                ids.iter()
                    .map(|&id| {
                        snapshot
                            .get(id)
                            .filter(|c| c.chunk_type == ChunkType::DATA && c.user_data == hash)
                            .map(|c| c.id)
                    })
                    .collect::<Option<Vec<u32>>>()
            },
            |_, reader| {
                written += decode_data_payload(reader, sink)?;
                Ok(())
            },
            cancel,
        )?;
        if !found {
            return Ok(false);
        }
        if written != record.head.length as u64 {
            log::warn!(
                "entry for {:?} decoded to {} bytes, head says {}; treating as missing",
                record.head.key,
                written,
                record.head.length
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// The entry for `key` as a byte vector, `None` on a miss.
    pub fn get(&self, key: &str, cancel: &CancelToken) -> Result<Option<Vec<u8>>> {
        let mut data = Vec::new();
        Ok(self.get_into(key, &mut data, cancel)?.then_some(data))
    }

    /// Whether a valid, unexpired entry exists for `key`.  No payload I/O.
    pub fn exists(&self, key: &str, cancel: &CancelToken) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("key must not be empty"));
        }
        let folded = self.fold(key);
        let hash = key_hash(&folded);
        let records = self.load_heads(&folded, cancel)?;
        if records.is_empty() {
            return Ok(false);
        }
        let snapshot = self.storage.snapshot(cancel)?;
        Ok(latest_valid(&records, &snapshot, hash, ticks::now()).is_some())
    }

    /// Remove every head for `key` and the data chunks they reference.
    /// Returns whether anything was removed.
    pub fn remove(&self, key: &str, cancel: &CancelToken) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("key must not be empty"));
        }
        let folded = self.fold(key);
        let hash = key_hash(&folded);
        let records = self.load_heads(&folded, cancel)?;
        let mut removed = false;
        for record in &records {
            removed |= self.remove_record(record, hash, cancel)?;
        }
        Ok(removed)
    }

    fn remove_record(&self, record: &HeadRecord, hash: u32, cancel: &CancelToken) -> Result<bool> {
        let head_id = record.chunk.id;
        let mut removed = self
            .storage
            .remove_chunk(
                |s| {
                    s.get(head_id)
                        .filter(|c| c.chunk_type == ChunkType::HEAD && c.user_data == hash)
                        .map(|c| c.id)
                },
                cancel,
            )?
            .is_some();
        for &data_id in &record.head.chunk_ids {
            removed |= self
                .storage
                .remove_chunk(
                    |s| {
                        s.get(data_id)
                            .filter(|c| c.chunk_type == ChunkType::DATA && c.user_data == hash)
                            .map(|c| c.id)
                    },
                    cancel,
                )?
                .is_some();
        }
        Ok(removed)
    }

    // ── Cleanup ──────────────────────────────────────────────────────────────

    /// Remove invalid entries and reclaim space, as of `now`.
    ///
    /// Individual removal failures are logged and skipped so one stuck
    /// chunk cannot wedge the whole pass; cancellation still aborts.
    pub fn cleanup(&self, now: DateTime<Utc>, cancel: &CancelToken) -> Result<()> {
        let now_ticks = ticks::from_datetime(now);

        // Expired or incomplete entries go first.
        let (records, broken) = self.load_heads_full("", cancel)?;
        let snapshot = self.storage.snapshot(cancel)?;
        let mut good: Vec<&HeadRecord> = Vec::new();
        for record in &records {
            cancel.check()?;
            let hash = record.chunk.user_data;
            let complete = record.head.chunk_ids.iter().all(|&id| {
                snapshot
                    .get(id)
                    .map_or(false, |c| c.chunk_type == ChunkType::DATA && c.user_data == hash)
            });
            if record.head.ttl_ticks < now_ticks || !complete {
                self.tolerate(self.remove_record(record, hash, cancel))?;
            } else {
                good.push(record);
            }
        }
        for head_id in broken {
            cancel.check()?;
            self.tolerate(self.storage.remove_chunk(
                |s| s.get(head_id).filter(|c| c.chunk_type == ChunkType::HEAD).map(|c| c.id),
                cancel,
            ))?;
        }

        // Orphaned data chunks: referenced by no surviving head and older
        // than a day (younger ones may belong to an add in flight).
        let referenced: HashSet<u32> =
            good.iter().flat_map(|r| r.head.chunk_ids.iter().copied()).collect();
        let cutoff = now_ticks - ORPHAN_AGE_TICKS;
        let snapshot = self.storage.snapshot(cancel)?;
        let orphans: Vec<u32> = snapshot
            .chunks()
            .iter()
            .filter(|c| {
                c.chunk_type == ChunkType::DATA
                    && c.added_ticks < cutoff
                    && !referenced.contains(&c.id)
            })
            .map(|c| c.id)
            .collect();
        for id in orphans {
            cancel.check()?;
            self.tolerate(self.storage.remove_chunk(
                |s| {
                    s.get(id)
                        .filter(|c| {
                            c.chunk_type == ChunkType::DATA
                                && c.added_ticks < cutoff
                                && !referenced.contains(&c.id)
                        })
                        .map(|c| c.id)
                },
                cancel,
            ))?;
        }

        self.storage.cut_back_padding(cancel)?;

        if self.options.maximum_size > 0 {
            self.evict_to_cap(cancel)?;
        }
        Ok(())
    }

    /// Shrink the file under the cap by evicting whole entries, shortest
    /// TTL first (age as the tie-breaker), then truncating freed tail space.
    fn evict_to_cap(&self, cancel: &CancelToken) -> Result<()> {
        let maximum = self.options.maximum_size as u64;
        let stats = self.storage.statistics(cancel)?;
        if stats.file_size < maximum {
            return Ok(());
        }
        let target = (self.options.maximum_size as f64 * self.options.cutback_ratio) as i64;
        let mut space_needed = stats.file_size as i64 - target;
        log::info!(
            "{} is {} bytes (cap {maximum}); evicting {space_needed} bytes",
            self.path().display(),
            stats.file_size
        );

        let (mut records, _) = self.load_heads_full("", cancel)?;
        records.sort_by(|a, b| {
            a.head
                .ttl_ticks
                .cmp(&b.head.ttl_ticks)
                .then(a.chunk.added_ticks.cmp(&b.chunk.added_ticks))
        });
        for record in &records {
            if space_needed <= 0 {
                break;
            }
            cancel.check()?;
            self.tolerate(self.remove(&record.head.key, cancel))?;
            space_needed -= i64::from(record.head.length);
        }

        self.storage.cut_back_padding(cancel)
    }

    /// Swallow per-item cleanup failures, but never cancellation.
    fn tolerate<T>(&self, result: Result<T>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(e @ Error::Cancelled) => Err(e),
            Err(e) => {
                log::warn!("cleanup of {} skipped an item: {e}", self.path().display());
                Ok(())
            }
        }
    }

    // ── Head loading ─────────────────────────────────────────────────────────

    fn load_heads(&self, query: &str, cancel: &CancelToken) -> Result<Vec<HeadRecord>> {
        Ok(self.load_heads_full(query, cancel)?.0)
    }

    /// Decoded heads for `query` ("" = every head), read through the
    /// version-checked index.  Also returns the ids of head chunks whose
    /// payload failed to decode.
    fn load_heads_full(
        &self,
        query: &str,
        cancel: &CancelToken,
    ) -> Result<(Vec<HeadRecord>, Vec<u32>)> {
        let mut index = self.heads.lock();
        let snapshot = self.storage.snapshot(cancel)?;
        index.revalidate(&snapshot);

        let hash = if query.is_empty() { 0 } else { key_hash(query) };
        if let Some(entry) = index.entries.get(query) {
            return Ok((entry.heads.clone(), entry.broken.clone()));
        }

        let mut records = Vec::new();
        let mut broken = Vec::new();
        self.storage.read_chunks(
            |snapshot| {
                Some(
                    snapshot
                        .chunks()
                        .iter()
                        .filter(|c| {
                            c.chunk_type == ChunkType::HEAD
                                && (query.is_empty() || c.user_data == hash)
                        })
                        .map(|c| c.id)
                        .collect(),
                )
            },
            |chunk, reader| {
                let mut payload = Vec::with_capacity(chunk.size as usize);
                reader.read_to_end(&mut payload)?;
                match CacheHead::decode(&payload) {
                    Ok(head) => records.push(HeadRecord { chunk: chunk.clone(), head }),
                    Err(e) => {
                        log::warn!("head chunk {} does not decode: {e}", chunk.id);
                        broken.push(chunk.id);
                    }
                }
                Ok(())
            },
            cancel,
        )?;
        if !query.is_empty() {
            // The 32-bit tag can collide; compare the stored key.
            records.retain(|r| r.head.key == query);
        }

        index.entries.insert(
            query.to_owned(),
            HeadIndexEntry { hash, heads: records.clone(), broken: broken.clone() },
        );
        Ok((records, broken))
    }
}

// ── Free functions ───────────────────────────────────────────────────────────

/// 32-bit keyed-bucket tag for a folded key.
fn key_hash(folded_key: &str) -> u32 {
    let mut hasher = SipHasher24::new_with_keys(KEY_HASH_K0, KEY_HASH_K1);
    hasher.write(folded_key.as_bytes());
    hasher.finish() as u32
}

/// Newest head that is unexpired and whose data chunks all resolve.
fn latest_valid<'a>(
    records: &'a [HeadRecord],
    snapshot: &StorageSnapshot,
    hash: u32,
    now_ticks: i64,
) -> Option<&'a HeadRecord> {
    records
        .iter()
        .filter(|r| r.head.ttl_ticks > now_ticks)
        .filter(|r| {
            r.head.chunk_ids.iter().all(|&id| {
                snapshot
                    .get(id)
                    .map_or(false, |c| c.chunk_type == ChunkType::DATA && c.user_data == hash)
            })
        })
        .max_by_key(|r| r.chunk.added_ticks)
}

/// Build a data-chunk payload: one tag byte, then the block, DEFLATE
/// compressed when that actually wins.
fn encode_data_payload(block: &[u8], can_compress: bool) -> Result<Vec<u8>> {
    if can_compress {
        let mut encoder =
            DeflateEncoder::new(Vec::with_capacity(block.len() / 2 + 16), Compression::default());
        encoder.write_all(block)?;
        let compressed = encoder.finish()?;
        if compressed.len() < block.len() {
            let mut payload = Vec::with_capacity(DATA_HEAD_SIZE + compressed.len());
            payload.push(DataCompression::Deflate.encode());
            payload.extend_from_slice(&compressed);
            return Ok(payload);
        }
    }
    let mut payload = Vec::with_capacity(DATA_HEAD_SIZE + block.len());
    payload.push(DataCompression::None.encode());
    payload.extend_from_slice(block);
    Ok(payload)
}

/// Decode one data-chunk payload into `sink`, returning the decoded byte
/// count.
fn decode_data_payload(reader: &mut dyn Read, sink: &mut dyn Write) -> Result<u64> {
    let mut tag = [0u8; DATA_HEAD_SIZE];
    reader.read_exact(&mut tag)?;
    match DataCompression::decode(tag[0])? {
        DataCompression::None => Ok(io::copy(reader, sink)?),
        DataCompression::Deflate => {
            let mut decoder = DeflateDecoder::new(reader);
            Ok(io::copy(&mut decoder, sink)?)
        }
    }
}
