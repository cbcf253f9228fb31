//! Concurrency coordination for a shared blob file.
//!
//! A coordinator owns the [`StorageInfo`] for one file-id and provides the
//! capability set storage correctness depends on:
//!
//! - a mutually exclusive critical section guarding the index ([`Coordinator::lock`]),
//! - shared access to the index from inside that section ([`CoordinatorGuard`]),
//! - a read-quiescence signal writers use to wait out active readers.
//!
//! Two variants exist.  The in-process coordinator keeps one entry per
//! file-id in a process-wide registry, so any number of engines in the same
//! process share the index and the lock.  The cross-process coordinator
//! maps the same capabilities onto file-system primitives derived from the
//! file-id, so unrelated processes coordinate through the same names.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::chunk::ChunkInfo;
use crate::error::Result;
use crate::info::StorageInfo;

mod in_process;
mod cross_process;

pub use cross_process::{CrossProcessCoordinator, SHARED_MAPPING_SIZE};
pub use in_process::InProcessCoordinator;

/// Default lock deadline for the in-process coordinator.
pub const DEFAULT_IN_PROCESS_TIMEOUT: Duration = Duration::from_millis(1000);
/// Default lock deadline for the cross-process coordinator.
pub const DEFAULT_CROSS_PROCESS_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Cooperative delay between lock attempts.  Short bursts instead of a
/// blocking acquire keep lock acquisition cancellable and let the embedding
/// application run its own priorities between attempts.
pub(crate) const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Poll interval for the read-quiescence signal and cross-process waits.
pub(crate) const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorKind {
    /// One shared entry per file-id inside this process.
    InProcess,
    /// File-system lock, shared mapping and polled event, named by file-id.
    CrossProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub kind: CoordinatorKind,
    /// Per-call lock deadline; `None` uses the variant default.
    pub lock_timeout: Option<Duration>,
    /// Place cross-process primitives in the system temp directory instead
    /// of next to the blob file, so processes with different working
    /// directories but the same file still meet.
    pub global_namespace: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { kind: CoordinatorKind::InProcess, lock_timeout: None, global_namespace: false }
    }
}

// ── Capability traits ────────────────────────────────────────────────────────

/// Exclusive access to the shared storage info, held for one commit pass.
/// Dropping the guard releases the critical section.
pub trait CoordinatorGuard: std::fmt::Debug {
    /// Snapshot of the authoritative info.
    fn read_info(&mut self) -> Result<StorageInfo>;

    /// Publish a new authoritative info.  `stable_changed` must be true
    /// whenever the set of stable chunks (non-free, non-changing) may have
    /// changed; read-count-only publishes pass false and keep the cached
    /// filtered view.
    fn write_info(&mut self, info: StorageInfo, stable_changed: bool) -> Result<()>;

    /// The filtered view selectors see: non-free, non-changing chunks.
    fn stable_chunks(&mut self) -> Result<Arc<Vec<ChunkInfo>>>;

    /// `(initialized, added_version, removed_version)` without a full snapshot.
    fn versions(&mut self) -> Result<(bool, u64, u64)>;
}

pub trait Coordinator: Send + Sync {
    fn file_id(&self) -> Uuid;

    fn default_timeout(&self) -> Duration;

    /// Enter the critical section, failing with [`crate::Error::Timeout`]
    /// once `timeout` elapses (measured from the first attempt) and with
    /// [`crate::Error::Cancelled`] when the token fires between attempts.
    fn lock<'a>(
        &'a self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Box<dyn CoordinatorGuard + 'a>>;

    /// Block until the read-finish event is set, checking `cancel` at every
    /// poll interval.  Callers must not hold the lock.
    fn wait_for_read_finish(&self, cancel: &CancelToken) -> Result<()>;

    /// Set the read-finish event, waking waiting writers.
    fn signal_read_finish(&self);

    /// Reset the read-finish event before releasing the lock and waiting.
    fn signal_wait_required(&self);
}

/// Attach the configured coordinator variant for `file_id`.
///
/// `blob_dir` is the directory holding the blob file; the cross-process
/// variant derives its primitive names inside it unless the global
/// namespace is requested.
pub(crate) fn attach(
    config: &CoordinatorConfig,
    file_id: Uuid,
    blob_dir: &Path,
) -> Result<Arc<dyn Coordinator>> {
    match config.kind {
        CoordinatorKind::InProcess => {
            let coordinator: Arc<dyn Coordinator> = InProcessCoordinator::attach(file_id);
            Ok(coordinator)
        }
        CoordinatorKind::CrossProcess => {
            let dir = if config.global_namespace {
                std::env::temp_dir()
            } else {
                blob_dir.to_owned()
            };
            let coordinator: Arc<dyn Coordinator> =
                CrossProcessCoordinator::attach(file_id, &dir)?;
            Ok(coordinator)
        }
    }
}
