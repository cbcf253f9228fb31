//! Cross-process coordinator — file-system primitives named by file-id.
//!
//! The named OS objects the in-process variant cannot provide are mapped
//! onto sidecar files every process derives from the file-id in the blob
//! prefix:
//!
//! - `<file-id>.lock` — the mutex.  An exclusive advisory lock held for the
//!   duration of a guard; acquired in try/sleep bursts against a deadline.
//! - `<file-id>.shm` — the shared memory.  A sparse file mapped writable,
//!   holding a small control header followed by the serialized
//!   [`StorageInfo`] in its shared-buffer layout.
//! - the read-finish event — a flag byte in the control header, polled with
//!   cancellation checks.
//!
//! # Liveness
//!
//! Real shared memory vanishes with its last attacher; a sidecar file does
//! not, so a crashed process could leave a mapping that disagrees with the
//! blob file.  Every attached coordinator therefore holds a shared advisory
//! lock on the `.shm` file for its lifetime.  An attaching coordinator that
//! can take the exclusive lock knows no other process is attached and
//! resets the mapped info to uninitialized, forcing the next `initialize`
//! to rebuild the index from the blob file instead of trusting the stale
//! mapping.  Advisory locks are released by the OS on process death, so a
//! crash cannot wedge this scheme.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs4::FileExt;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::chunk::ChunkInfo;
use crate::error::{Error, Result};
use crate::info::{StorageInfo, INFO_HEADER_SIZE};

use super::{
    Coordinator, CoordinatorGuard, DEFAULT_CROSS_PROCESS_TIMEOUT, EVENT_POLL_INTERVAL,
    LOCK_RETRY_DELAY,
};

/// Size of the shared mapping.  Roomy: the serialized index costs 39 bytes
/// per chunk, so this covers several hundred thousand chunks.
pub const SHARED_MAPPING_SIZE: usize = 25 * 1024 * 1024;

/// Bytes reserved ahead of the serialized info.
const CONTROL_SIZE: usize = 16;
/// Control byte 0: the read-finish event flag.
const EVENT_OFFSET: usize = 0;

pub struct CrossProcessCoordinator {
    file_id: Uuid,
    lock_path: PathBuf,
    /// Exclusive-lock target for the critical section.
    lock_file: File,
    /// Holds the shared presence lock for the coordinator's lifetime.
    shm_file: File,
    /// The mapping is only mutated while `lock_file` is held exclusively;
    /// this mutex serializes threads sharing one coordinator instance.
    mapping: Mutex<MmapMut>,
    /// Threads sharing this instance contend here first, because advisory
    /// locks on one descriptor do not exclude each other.
    thread_gate: Mutex<()>,
}

impl CrossProcessCoordinator {
    pub fn attach(file_id: Uuid, dir: &Path) -> Result<Arc<Self>> {
        let lock_path = dir.join(format!("{file_id}.lock"));
        let shm_path = dir.join(format!("{file_id}.shm"));

        let lock_file = open_sidecar(&lock_path)?;
        let shm_file = open_sidecar(&shm_path)?;
        if shm_file.metadata()?.len() < SHARED_MAPPING_SIZE as u64 {
            shm_file.set_len(SHARED_MAPPING_SIZE as u64)?;
        }

        // Safety: the mapping is private to this coordinator; cross-process
        // mutation is fenced by the exclusive lock on `lock_file` and
        // in-process access by the `mapping` mutex.
        let mut mapping = unsafe { MmapOptions::new().map_mut(&shm_file)? };

        if shm_file.try_lock_exclusive().is_ok() {
            // No other attacher is alive; whatever the mapping holds is
            // left over from a previous generation of processes.
            mapping[..CONTROL_SIZE + INFO_HEADER_SIZE].fill(0);
            mapping.flush_range(0, CONTROL_SIZE + INFO_HEADER_SIZE)?;
            shm_file.unlock()?;
            log::debug!("reset shared mapping for {file_id} (no live attachers)");
        }
        shm_file.lock_shared()?;

        Ok(Arc::new(Self {
            file_id,
            lock_path,
            lock_file,
            shm_file,
            mapping: Mutex::new(mapping),
            thread_gate: Mutex::new(()),
        }))
    }
}

impl Drop for CrossProcessCoordinator {
    fn drop(&mut self) {
        let _ = self.shm_file.unlock();
    }
}

/// A failed try-lock that means "someone else holds it", as opposed to a
/// real I/O failure.  The OS error differs per platform; fs4 knows it.
fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs4::lock_contended_error().raw_os_error()
}

fn open_sidecar(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(Error::Io)
}

impl Coordinator for CrossProcessCoordinator {
    fn file_id(&self) -> Uuid {
        self.file_id
    }

    fn default_timeout(&self) -> Duration {
        DEFAULT_CROSS_PROCESS_TIMEOUT
    }

    fn lock<'a>(
        &'a self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Box<dyn CoordinatorGuard + 'a>> {
        let deadline = Instant::now() + timeout;

        let gate = loop {
            if let Some(gate) = self.thread_gate.try_lock() {
                break gate;
            }
            cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            std::thread::sleep(LOCK_RETRY_DELAY.min(deadline - now));
        };

        loop {
            match self.lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(Box::new(CrossProcessGuard { coordinator: self, _gate: gate })),
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(e.into()),
            }
            cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "lock on {} still contended after {timeout:?}",
                    self.lock_path.display()
                );
                return Err(Error::Timeout(timeout));
            }
            std::thread::sleep(LOCK_RETRY_DELAY.min(deadline - now));
        }
    }

    fn wait_for_read_finish(&self, cancel: &CancelToken) -> Result<()> {
        loop {
            {
                let mapping = self.mapping.lock();
                if mapping[EVENT_OFFSET] != 0 {
                    return Ok(());
                }
            }
            cancel.check()?;
            std::thread::sleep(EVENT_POLL_INTERVAL);
        }
    }

    fn signal_read_finish(&self) {
        let mut mapping = self.mapping.lock();
        mapping[EVENT_OFFSET] = 1;
        let _ = mapping.flush_range(EVENT_OFFSET, 1);
    }

    fn signal_wait_required(&self) {
        let mut mapping = self.mapping.lock();
        mapping[EVENT_OFFSET] = 0;
        let _ = mapping.flush_range(EVENT_OFFSET, 1);
    }
}

// ── Guard ────────────────────────────────────────────────────────────────────

struct CrossProcessGuard<'a> {
    coordinator: &'a CrossProcessCoordinator,
    _gate: MutexGuard<'a, ()>,
}

impl std::fmt::Debug for CrossProcessGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossProcessGuard").finish_non_exhaustive()
    }
}

impl Drop for CrossProcessGuard<'_> {
    fn drop(&mut self) {
        let _ = self.coordinator.lock_file.unlock();
    }
}

impl CoordinatorGuard for CrossProcessGuard<'_> {
    fn read_info(&mut self) -> Result<StorageInfo> {
        let mapping = self.coordinator.mapping.lock();
        StorageInfo::read_from(&mapping[CONTROL_SIZE..])
    }

    fn write_info(&mut self, mut info: StorageInfo, _stable_changed: bool) -> Result<()> {
        info.modified_version += 1;
        let mut mapping = self.coordinator.mapping.lock();
        let written = info.write_to(&mut mapping[CONTROL_SIZE..])?;
        mapping.flush_range(CONTROL_SIZE, written)?;
        Ok(())
    }

    fn stable_chunks(&mut self) -> Result<Arc<Vec<ChunkInfo>>> {
        // No cached view across processes: every holder deserializes fresh.
        let info = self.read_info()?;
        let filtered: Vec<ChunkInfo> = info
            .chunks()
            .iter()
            .filter(|c| !c.chunk_type.is_free() && !c.changing)
            .cloned()
            .collect();
        Ok(Arc::new(filtered))
    }

    fn versions(&mut self) -> Result<(bool, u64, u64)> {
        let mapping = self.coordinator.mapping.lock();
        StorageInfo::read_versions(&mapping[CONTROL_SIZE..])
    }
}
