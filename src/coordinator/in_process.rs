//! In-process coordinator — one shared entry per file-id.
//!
//! All engines in the same process that attach the same file-id receive the
//! same entry: a mutex-guarded [`StorageInfo`], a manual-reset read-finish
//! event, and a cached stable-chunk view.  Entries live in a process-wide
//! registry and are destroyed when the last coordinator detaches.
//!
//! Lock acquisition uses short try-acquire bursts with cooperative delays
//! rather than a blocking acquire: file locks taken outside the engine
//! cannot be assumed, so a stuck holder must surface as a timeout instead
//! of a hang, and cancellation must win between attempts.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, MutexGuard};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::chunk::ChunkInfo;
use crate::error::{Error, Result};
use crate::info::StorageInfo;

use super::{
    Coordinator, CoordinatorGuard, DEFAULT_IN_PROCESS_TIMEOUT, EVENT_POLL_INTERVAL,
    LOCK_RETRY_DELAY,
};

// ── Shared per-file-id state ─────────────────────────────────────────────────

#[derive(Default, Debug)]
struct SharedState {
    info: StorageInfo,
    /// Cached filtered view; dropped on any publish with `stable_changed`.
    stable: Option<Arc<Vec<ChunkInfo>>>,
}

/// Manual-reset event for read quiescence.
#[derive(Default)]
struct Event {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    fn signal(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    fn reset(&self) {
        *self.set.lock() = false;
    }

    fn wait(&self, cancel: &CancelToken) -> Result<()> {
        let mut set = self.set.lock();
        loop {
            if *set {
                return Ok(());
            }
            cancel.check()?;
            let _ = self.cond.wait_for(&mut set, EVENT_POLL_INTERVAL);
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<SharedState>,
    read_finish: Event,
}

/// file-id → live shared entry.  Dead weak references are purged on attach;
/// the entry itself dies with the last `Arc`, which is the final detach.
static REGISTRY: Lazy<Mutex<HashMap<Uuid, Weak<Shared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

// ── Coordinator ──────────────────────────────────────────────────────────────

pub struct InProcessCoordinator {
    file_id: Uuid,
    shared: Arc<Shared>,
}

impl InProcessCoordinator {
    /// Attach to the per-file-id entry, creating it on first attach.
    pub fn attach(file_id: Uuid) -> Arc<Self> {
        let mut registry = REGISTRY.lock();
        registry.retain(|_, weak| weak.strong_count() > 0);
        let shared = match registry.get(&file_id).and_then(Weak::upgrade) {
            Some(shared) => shared,
            None => {
                let shared = Arc::new(Shared::default());
                registry.insert(file_id, Arc::downgrade(&shared));
                shared
            }
        };
        Arc::new(Self { file_id, shared })
    }
}

impl Coordinator for InProcessCoordinator {
    fn file_id(&self) -> Uuid {
        self.file_id
    }

    fn default_timeout(&self) -> Duration {
        DEFAULT_IN_PROCESS_TIMEOUT
    }

    fn lock<'a>(
        &'a self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Box<dyn CoordinatorGuard + 'a>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(state) = self.shared.state.try_lock() {
                return Ok(Box::new(InProcessGuard { state }));
            }
            cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            std::thread::sleep(LOCK_RETRY_DELAY.min(deadline - now));
        }
    }

    fn wait_for_read_finish(&self, cancel: &CancelToken) -> Result<()> {
        self.shared.read_finish.wait(cancel)
    }

    fn signal_read_finish(&self) {
        self.shared.read_finish.signal();
    }

    fn signal_wait_required(&self) {
        self.shared.read_finish.reset();
    }
}

// ── Guard ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct InProcessGuard<'a> {
    state: MutexGuard<'a, SharedState>,
}

impl CoordinatorGuard for InProcessGuard<'_> {
    fn read_info(&mut self) -> Result<StorageInfo> {
        Ok(self.state.info.clone())
    }

    fn write_info(&mut self, mut info: StorageInfo, stable_changed: bool) -> Result<()> {
        info.modified_version += 1;
        if stable_changed {
            self.state.stable = None;
        }
        self.state.info = info;
        Ok(())
    }

    fn stable_chunks(&mut self) -> Result<Arc<Vec<ChunkInfo>>> {
        if let Some(stable) = &self.state.stable {
            return Ok(stable.clone());
        }
        let filtered: Vec<ChunkInfo> = self
            .state
            .info
            .chunks()
            .iter()
            .filter(|c| !c.chunk_type.is_free() && !c.changing)
            .cloned()
            .collect();
        let stable = Arc::new(filtered);
        self.state.stable = Some(stable.clone());
        Ok(stable)
    }

    fn versions(&mut self) -> Result<(bool, u64, u64)> {
        let info = &self.state.info;
        Ok((info.initialized, info.added_version, info.removed_version))
    }
}
