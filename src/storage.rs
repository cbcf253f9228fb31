//! Blob storage engine — a file-backed chunk allocator.
//!
//! One file holds a 24-byte prefix followed by contiguous chunks.  The
//! engine keeps the authoritative index in the coordinator and follows a
//! strict commit discipline so that a crash at any point leaves the file
//! scannable:
//!
//! 1. Under the lock: pick a slot (exact-fit free chunk, carve from a
//!    larger free chunk, or append at the end), assign the smallest unused
//!    id, publish the new record with `changing=true`.
//! 2. Outside the lock: write header, payload and footer with the type
//!    field stamped `FREE`, flush, then patch the real type in and flush
//!    again.  A crash between the flushes leaves a well-formed free chunk,
//!    so the file stays gap-free.
//! 3. Under the lock again: clear `changing`, bump `added_version`.
//!
//! Removal inverts this: the record is merged with free neighbours and
//! republished as a changing free chunk before the free header is written.
//! Readers never hold the lock while streaming; they pin chunks through
//! `read_count` and writers wait for quiescence through the coordinator's
//! event.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::chunk::{ChunkInfo, ChunkType, CHUNK_FOOTER, CHUNK_HEADER_SIZE, CHUNK_OVERHEAD};
use crate::coordinator::{self, CoordinatorConfig, CoordinatorGuard};
use crate::error::{Error, Result};
use crate::info::StorageInfo;
use crate::prefix::{FilePrefix, PREFIX_SIZE};
use crate::ticks;

/// Streaming reads hand out at most this much buffered data at a time.
const READ_BUFFER_SIZE: usize = 64 * 1024;

// ── Options and derived views ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageOptions {
    pub coordinator: CoordinatorConfig,
}

/// Space accounting for one storage file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStatistics {
    pub chunk_count: usize,
    pub free_chunk_count: usize,
    /// Payload bytes held by non-free chunks.
    pub used_space: u64,
    /// Payload bytes reusable through free chunks.
    pub free_space: u64,
    /// Prefix plus per-chunk header/footer bytes.
    pub overhead: u64,
    pub file_size: u64,
}

/// The filtered index view handed to selectors: stable chunks only
/// (non-free, not being changed), plus the version counters consumers use
/// to invalidate derived caches.
#[derive(Debug, Clone)]
pub struct StorageSnapshot {
    pub added_version: u64,
    pub removed_version: u64,
    chunks: Arc<Vec<ChunkInfo>>,
    by_id: HashMap<u32, usize>,
}

impl StorageSnapshot {
    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunks
    }

    pub fn get(&self, id: u32) -> Option<&ChunkInfo> {
        self.by_id.get(&id).map(|&i| &self.chunks[i])
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

struct Attached {
    file_id: Uuid,
    coordinator: Arc<dyn coordinator::Coordinator>,
    lock_timeout: Duration,
}

pub struct BlobStorage {
    path: PathBuf,
    options: StorageOptions,
    state: Option<Attached>,
}

impl BlobStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, StorageOptions::default())
    }

    pub fn with_options(path: impl Into<PathBuf>, options: StorageOptions) -> Self {
        Self { path: path.into(), options, state: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stable identifier from the file prefix, once initialized.
    pub fn file_id(&self) -> Option<Uuid> {
        self.state.as_ref().map(|s| s.file_id)
    }

    fn attached(&self) -> Result<&Attached> {
        self.state.as_ref().ok_or(Error::NotInitialized)
    }

    // ── Initialization and recovery ──────────────────────────────────────────

    /// Open or create the file and attach the coordinator.
    ///
    /// Returns `Ok(false)` when the file exists but is not a readable blob
    /// file (short, bad magic, unknown version); the caller decides whether
    /// to delete and retry.  When the coordinator reports an uninitialized
    /// index, the file is scanned from the prefix onwards and a torn tail
    /// is truncated at the first invalid chunk.
    pub fn initialize(&mut self, cancel: &CancelToken) -> Result<bool> {
        cancel.check()?;
        if self.state.is_some() {
            return Ok(true);
        }

        let prefix = match self.open_or_create() {
            Ok(prefix) => prefix,
            Err(Error::UnsupportedFormat(reason)) => {
                log::warn!("{}: {reason}", self.path.display());
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_owned();
        let coord = coordinator::attach(&self.options.coordinator, prefix.file_id, &dir)?;
        let lock_timeout = self
            .options
            .coordinator
            .lock_timeout
            .unwrap_or_else(|| coord.default_timeout());

        {
            let mut guard = coord.lock(lock_timeout, cancel)?;
            let mut info = guard.read_info()?;
            if !info.initialized {
                self.rebuild_index(&mut info, cancel)?;
                info.initialized = true;
                guard.write_info(info, true)?;
            }
        }

        self.state = Some(Attached { file_id: prefix.file_id, coordinator: coord, lock_timeout });
        Ok(true)
    }

    fn open_or_create(&self) -> Result<FilePrefix> {
        match OpenOptions::new().read(true).write(true).create_new(true).open(&self.path) {
            Ok(mut f) => {
                let prefix = FilePrefix::new();
                prefix.write(&mut f)?;
                f.sync_all()?;
                log::info!("created blob file {} ({})", self.path.display(), prefix.file_id);
                Ok(prefix)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let f = File::open(&self.path)?;
                let prefix = FilePrefix::read(&f)?;
                log::info!("opened blob file {} ({})", self.path.display(), prefix.file_id);
                Ok(prefix)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Scan the file from offset 24, appending every decodable chunk to the
    /// index.  The first invalid chunk truncates the file at its position.
    fn rebuild_index(&self, info: &mut StorageInfo, cancel: &CancelToken) -> Result<()> {
        let mut f = self.open_rw()?;
        let file_len = f.metadata()?.len();
        let mut position = PREFIX_SIZE as u64;
        let mut header = [0u8; CHUNK_HEADER_SIZE];
        let mut truncated = 0u64;

        while position < file_len {
            cancel.check()?;
            let decoded = (|| -> Result<ChunkInfo> {
                if position + CHUNK_HEADER_SIZE as u64 > file_len {
                    return Err(Error::invalid_chunk(
                        position,
                        "trailing bytes shorter than a chunk header",
                    ));
                }
                f.seek(SeekFrom::Start(position))?;
                f.read_exact(&mut header)?;
                let chunk = ChunkInfo::decode_header(&header, position)?;
                if chunk.end_position() > file_len {
                    return Err(Error::invalid_chunk(
                        position,
                        format!(
                            "payload of {} bytes runs past end of file ({file_len})",
                            chunk.size
                        ),
                    ));
                }
                if info.get(chunk.id).is_some() {
                    return Err(Error::invalid_chunk(
                        position,
                        format!("duplicate chunk id {}", chunk.id),
                    ));
                }
                Ok(chunk)
            })();

            match decoded {
                Ok(chunk) => {
                    position = chunk.end_position();
                    info.add(chunk);
                }
                Err(e @ Error::InvalidChunk { .. }) => {
                    log::warn!("recovering {}: {e}; truncating tail", self.path.display());
                    f.set_len(position)?;
                    f.sync_all()?;
                    truncated = file_len - position;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        log::info!(
            "indexed {} chunks in {} ({} bytes truncated)",
            info.len(),
            self.path.display(),
            truncated
        );
        Ok(())
    }

    // ── Mutation ─────────────────────────────────────────────────────────────

    /// Write a new chunk and return its committed record.
    ///
    /// Slot priority: an exact-size free chunk, then a free chunk large
    /// enough to carve the payload from (the remainder becomes a new free
    /// chunk), then an append at the end of the file.  Chunks currently
    /// being changed are never considered.
    pub fn add_chunk(
        &self,
        chunk_type: ChunkType,
        user_data: u32,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> Result<ChunkInfo> {
        let att = self.attached()?;
        if chunk_type.is_free() {
            return Err(Error::InvalidArgument("cannot add a FREE chunk"));
        }
        if payload.len() as u64 >= 1 << 32 {
            return Err(Error::SizeOverflow(payload.len() as u64));
        }
        let size = payload.len() as u32;
        cancel.check()?;

        let (mut chunk, residual) = {
            let mut guard = att.coordinator.lock(att.lock_timeout, cancel)?;
            let mut info = guard.read_info()?;
            let id = info.next_id();
            let mut residual: Option<ChunkInfo> = None;

            let exact = info
                .chunks()
                .iter()
                .find(|c| c.chunk_type.is_free() && !c.changing && c.size == size)
                .map(|c| (c.id, c.position));
            let carve = info
                .chunks()
                .iter()
                .find(|c| {
                    c.chunk_type.is_free()
                        && !c.changing
                        && u64::from(c.size) > u64::from(size) + CHUNK_OVERHEAD as u64
                })
                .map(|c| c.id);

            let position = if let Some((free_id, position)) = exact {
                info.remove(free_id);
                position
            } else if let Some(free_id) = carve {
                let free = info.get_mut(free_id).expect("carve candidate exists");
                let position = free.position;
                free.position += CHUNK_OVERHEAD as u64 + u64::from(size);
                free.size -= size + CHUNK_OVERHEAD as u32;
                free.changing = true;
                free.refresh_crc();
                residual = Some(free.clone());
                position
            } else {
                info.end_of_chunks()
            };

            let mut chunk = ChunkInfo::new(chunk_type, id, user_data, size, ticks::now(), position);
            chunk.changing = true;
            info.add(chunk.clone());
            guard.write_info(info, true)?;
            (chunk, residual)
        };

        log::trace!(
            "writing chunk {} ({} bytes, type {:#x}) at {}",
            chunk.id,
            size,
            chunk.chunk_type.0,
            chunk.position
        );
        self.write_new_chunk(&chunk, payload, residual.as_ref())?;

        cancel.check()?;
        let mut commit = vec![chunk.id];
        if let Some(r) = &residual {
            commit.push(r.id);
        }
        self.clear_changing(att, &commit, true, cancel)?;
        chunk.changing = false;
        Ok(chunk)
    }

    /// The two-step stamp: everything is written with the type field set to
    /// `FREE`, flushed, and only then is the real type patched in.
    fn write_new_chunk(
        &self,
        chunk: &ChunkInfo,
        payload: &[u8],
        residual: Option<&ChunkInfo>,
    ) -> Result<()> {
        let mut f = self.open_rw()?;
        f.seek(SeekFrom::Start(chunk.position))?;
        f.write_all(&chunk.encode_header(ChunkType::FREE))?;
        f.write_all(payload)?;
        f.write_all(&CHUNK_FOOTER)?;
        if let Some(r) = residual {
            f.seek(SeekFrom::Start(r.position))?;
            f.write_all(&r.encode_header(ChunkType::FREE))?;
        }
        f.sync_data()?;

        f.seek(SeekFrom::Start(chunk.position))?;
        f.write_all(&chunk.chunk_type.0.to_le_bytes())?;
        f.sync_data()?;
        Ok(())
    }

    /// Remove the chunk the selector picks from the stable view.
    ///
    /// Returns `Ok(None)` when the selector declines.  When the target is
    /// being read the call parks on the read-finish event and retries, so
    /// the selector may run several times.  The freed extent is eagerly
    /// merged with free neighbours; adjacent free chunks never survive a
    /// successful removal.
    pub fn remove_chunk<S>(&self, mut selector: S, cancel: &CancelToken) -> Result<Option<ChunkInfo>>
    where
        S: FnMut(&StorageSnapshot) -> Option<u32>,
    {
        let att = self.attached()?;
        loop {
            cancel.check()?;
            let outcome = {
                let mut guard = att.coordinator.lock(att.lock_timeout, cancel)?;
                let snapshot = Self::snapshot_from(guard.as_mut())?;
                let Some(id) = selector(&snapshot) else {
                    return Ok(None);
                };
                let target = match info_target(guard.as_mut(), id)? {
                    Some(t) => t,
                    None => {
                        return Err(Error::InvalidArgument(
                            "selector chose a chunk that is not removable",
                        ))
                    }
                };

                if target.read_count > 0 {
                    att.coordinator.signal_wait_required();
                    None
                } else {
                    let mut info = guard.read_info()?;
                    let mut free = ChunkInfo::new(
                        ChunkType::FREE,
                        target.id,
                        0,
                        target.size,
                        ticks::now(),
                        target.position,
                    );
                    free.changing = true;

                    // Forward merge: absorb a free, settled next neighbour.
                    if let Some(next) = info.at_position(free.end_position()).cloned() {
                        if next.chunk_type.is_free() && !next.changing {
                            free.size += CHUNK_OVERHEAD as u32 + next.size;
                            info.remove(next.id);
                        }
                    }
                    // Backward merge: extend into a free, settled previous
                    // neighbour and take over its position.
                    if let Some(prev) = info.ending_at(free.position).cloned() {
                        if prev.chunk_type.is_free() && !prev.changing {
                            free.position = prev.position;
                            free.size += CHUNK_OVERHEAD as u32 + prev.size;
                            info.remove(prev.id);
                        }
                    }
                    free.refresh_crc();

                    let slot = info.get_mut(target.id).expect("target is still indexed");
                    *slot = free.clone();
                    info.removed_version += 1;
                    guard.write_info(info, true)?;
                    Some((target, free))
                }
            };

            let (removed, free) = match outcome {
                None => {
                    att.coordinator.wait_for_read_finish(cancel)?;
                    continue;
                }
                Some(pair) => pair,
            };

            log::trace!(
                "removed chunk {} ({} bytes); free extent {} bytes at {}",
                removed.id,
                removed.size,
                free.size,
                free.position
            );
            let mut f = self.open_rw()?;
            f.seek(SeekFrom::Start(free.position))?;
            f.write_all(&free.encode_header(ChunkType::FREE))?;
            f.sync_data()?;

            self.clear_changing(att, &[free.id], false, cancel)?;
            return Ok(Some(removed));
        }
    }

    fn clear_changing(
        &self,
        att: &Attached,
        ids: &[u32],
        bump_added: bool,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut guard = att.coordinator.lock(att.lock_timeout, cancel)?;
        let mut info = guard.read_info()?;
        for &id in ids {
            if let Some(c) = info.get_mut(id) {
                c.changing = false;
            }
        }
        if bump_added {
            info.added_version += 1;
        }
        guard.write_info(info, true)
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Stream the chunks the selector picks, in the selector's order.
    ///
    /// Returns `Ok(false)` when the selector returns `None` (nothing is
    /// read), `Ok(true)` otherwise.  `on_chunk` receives each chunk's
    /// record and a reader over exactly `size` payload bytes.  Read counts
    /// are decremented even when streaming fails or the token fires.
    pub fn read_chunks<S, F>(&self, selector: S, mut on_chunk: F, cancel: &CancelToken) -> Result<bool>
    where
        S: FnOnce(&StorageSnapshot) -> Option<Vec<u32>>,
        F: FnMut(&ChunkInfo, &mut dyn Read) -> Result<()>,
    {
        let att = self.attached()?;
        cancel.check()?;

        let chosen: Vec<ChunkInfo> = {
            let mut guard = att.coordinator.lock(att.lock_timeout, cancel)?;
            let snapshot = Self::snapshot_from(guard.as_mut())?;
            let Some(ids) = selector(&snapshot) else {
                return Ok(false);
            };
            if ids.is_empty() {
                return Ok(true);
            }
            let mut info = guard.read_info()?;
            let mut chosen = Vec::with_capacity(ids.len());
            for id in ids {
                let c = info
                    .get_mut(id)
                    .ok_or(Error::InvalidArgument("selector chose an unknown chunk"))?;
                c.read_count += 1;
                chosen.push(c.clone());
            }
            guard.write_info(info, false)?;
            chosen
        };

        let streamed = self.stream_chunks(&chosen, &mut on_chunk, cancel);
        let finished = self.finish_reads(att, &chosen);
        streamed?;
        finished?;
        Ok(true)
    }

    fn stream_chunks(
        &self,
        chosen: &[ChunkInfo],
        on_chunk: &mut dyn FnMut(&ChunkInfo, &mut dyn Read) -> Result<()>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut f = self.open_read()?;
        for chunk in chosen {
            cancel.check()?;
            f.seek(SeekFrom::Start(chunk.payload_position()))?;
            let capacity = READ_BUFFER_SIZE.min(chunk.size.max(1) as usize);
            let mut reader =
                BufReader::with_capacity(capacity, (&mut f).take(u64::from(chunk.size)));
            on_chunk(chunk, &mut reader)?;
        }
        Ok(())
    }

    /// Drop the read pins taken by `read_chunks`.  Runs with its own token:
    /// a cancelled read must still release its pins.
    fn finish_reads(&self, att: &Attached, chosen: &[ChunkInfo]) -> Result<()> {
        let no_cancel = CancelToken::new();
        let mut guard = att.coordinator.lock(att.lock_timeout, &no_cancel)?;
        let mut info = guard.read_info()?;
        let mut any_finished = false;
        for chunk in chosen {
            if let Some(c) = info.get_mut(chunk.id) {
                c.read_count = c.read_count.saturating_sub(1);
                if c.read_count == 0 {
                    any_finished = true;
                }
            }
        }
        guard.write_info(info, false)?;
        drop(guard);
        if any_finished {
            att.coordinator.signal_read_finish();
        }
        Ok(())
    }

    /// Payload of one chunk, or `None` when the id is not in the stable view.
    pub fn read_chunk(&self, id: u32, cancel: &CancelToken) -> Result<Option<Vec<u8>>> {
        let mut data = Vec::new();
        let found = self.read_chunks(
            |snapshot| snapshot.get(id).map(|c| vec![c.id]),
            |chunk, reader| {
                data.reserve(chunk.size as usize);
                reader.read_to_end(&mut data)?;
                Ok(())
            },
            cancel,
        )?;
        Ok(found.then_some(data))
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Truncate trailing free chunks off the end of the file.
    pub fn cut_back_padding(&self, cancel: &CancelToken) -> Result<()> {
        let att = self.attached()?;
        cancel.check()?;
        let mut guard = att.coordinator.lock(att.lock_timeout, cancel)?;
        let mut info = guard.read_info()?;

        let mut truncate_to = None;
        loop {
            let last = match info.last_by_position() {
                Some(c) if c.chunk_type.is_free() && !c.changing => (c.id, c.position),
                _ => break,
            };
            truncate_to = Some(last.1);
            info.remove(last.0);
        }

        if let Some(position) = truncate_to {
            let f = self.open_rw()?;
            f.set_len(position)?;
            f.sync_all()?;
            log::debug!("cut {} back to {} bytes", self.path.display(), position);
            guard.write_info(info, true)?;
        }
        Ok(())
    }

    pub fn statistics(&self, cancel: &CancelToken) -> Result<StorageStatistics> {
        let att = self.attached()?;
        cancel.check()?;
        let mut guard = att.coordinator.lock(att.lock_timeout, cancel)?;
        let info = guard.read_info()?;

        let mut stats = StorageStatistics {
            chunk_count: info.len(),
            overhead: PREFIX_SIZE as u64 + (CHUNK_OVERHEAD * info.len()) as u64,
            file_size: std::fs::metadata(&self.path)?.len(),
            ..Default::default()
        };
        for c in info.chunks() {
            if c.chunk_type.is_free() {
                stats.free_chunk_count += 1;
                stats.free_space += u64::from(c.size);
            } else {
                stats.used_space += u64::from(c.size);
            }
        }
        Ok(stats)
    }

    /// Payload sizes of free chunks in file order, for allocation planning.
    pub fn free_chunk_sizes(&self, cancel: &CancelToken) -> Result<Vec<u32>> {
        let att = self.attached()?;
        cancel.check()?;
        let mut guard = att.coordinator.lock(att.lock_timeout, cancel)?;
        let info = guard.read_info()?;
        Ok(info.free_sizes())
    }

    /// The stable view plus version counters, for consumers that derive
    /// their own caches from the index.
    pub fn snapshot(&self, cancel: &CancelToken) -> Result<StorageSnapshot> {
        let att = self.attached()?;
        cancel.check()?;
        let mut guard = att.coordinator.lock(att.lock_timeout, cancel)?;
        Self::snapshot_from(guard.as_mut())
    }

    fn snapshot_from(guard: &mut (dyn CoordinatorGuard + '_)) -> Result<StorageSnapshot> {
        let (_, added_version, removed_version) = guard.versions()?;
        let chunks = guard.stable_chunks()?;
        let by_id = chunks.iter().enumerate().map(|(i, c)| (c.id, i)).collect();
        Ok(StorageSnapshot { added_version, removed_version, chunks, by_id })
    }

    // ── File handles ─────────────────────────────────────────────────────────

    fn open_rw(&self) -> Result<File> {
        Ok(OpenOptions::new().read(true).write(true).open(&self.path)?)
    }

    fn open_read(&self) -> Result<File> {
        Ok(File::open(&self.path)?)
    }
}

/// The selector's pick re-checked against the authoritative info: present,
/// not free, not mid-change.
fn info_target(guard: &mut (dyn CoordinatorGuard + '_), id: u32) -> Result<Option<ChunkInfo>> {
    let info = guard.read_info()?;
    Ok(info
        .get(id)
        .filter(|c| !c.chunk_type.is_free() && !c.changing)
        .cloned())
}
