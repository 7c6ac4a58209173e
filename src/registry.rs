//! The registry of live tracked entities.
//!
//! Every long-running unit of work the coordinator knows about — a worker
//! thread, a managed instance, a child process — is recorded here for the
//! duration of its life. Ids are allocated from a descending 64-bit counter,
//! so the natural ascending order of the map is exactly most-recent-first
//! and no id is ever reused.

use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

/// Unique identifier for a tracked entity.
pub type TrackedId = u64;

/// Microseconds since the Unix epoch.
pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn basename(path: &'static str) -> &'static str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Registration record for a live worker thread, owned instance, or
/// subprocess. Immutable once created.
#[derive(Debug, Clone)]
pub struct TrackedEntity {
    /// Registry-assigned identifier, descending over time.
    pub id: TrackedId,
    /// Human-readable description supplied at registration.
    pub description: String,
    /// Full path of the source file that registered the entity.
    pub file: &'static str,
    /// Final path component of [`Self::file`].
    pub file_basename: &'static str,
    /// Source line that registered the entity.
    pub line: u32,
    /// Registration timestamp, microseconds since the Unix epoch.
    pub t_added_us: u64,
}

impl TrackedEntity {
    fn new(id: TrackedId, description: String, file: &'static str, line: u32) -> Self {
        Self {
            id,
            description,
            file,
            file_basename: basename(file),
            line,
            t_added_us: now_micros(),
        }
    }

    /// Seconds the entity has been alive, at microsecond precision.
    #[must_use]
    pub fn age_seconds(&self) -> f64 {
        now_micros().saturating_sub(self.t_added_us) as f64 / 1e6
    }

    /// Compact `description @ basename:line` rendering for journal lines.
    #[must_use]
    pub fn short_display(&self) -> String {
        format!("{} @ {}:{}", self.description, self.file_basename, self.line)
    }

    /// One status-report line: `- description @ basename:line, up 1.234s`.
    #[must_use]
    pub fn status_line(&self) -> String {
        format!(
            "- {} @ {}:{}, up {:.3}s",
            self.description,
            self.file_basename,
            self.line,
            self.age_seconds()
        )
    }
}

/// Id allocator plus the map of live tracked entities.
///
/// Mutations take the exclusive lock; [`TrackedRegistry::dump`] iterates
/// under the shared lock. Removals additionally signal a condition variable
/// so the termination protocol can sleep until the registry drains.
pub(crate) struct TrackedRegistry {
    next_id: Mutex<TrackedId>,
    live: RwLock<BTreeMap<TrackedId, TrackedEntity>>,
    drain_lock: Mutex<()>,
    drain_cond: Condvar,
}

impl TrackedRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: Mutex::new(TrackedId::MAX),
            live: RwLock::new(BTreeMap::new()),
            drain_lock: Mutex::new(()),
            drain_cond: Condvar::new(),
        }
    }

    /// Allocate a fresh id and record the entity. Infallible.
    pub(crate) fn add(&self, description: String, file: &'static str, line: u32) -> TrackedId {
        let id = {
            let mut next_id = self.next_id.lock();
            let id = *next_id;
            *next_id = id.wrapping_sub(1);
            id
        };
        let entity = TrackedEntity::new(id, description, file, line);
        debug!(id, entity = %entity.short_display(), "tracking");
        self.live.write().insert(id, entity);
        id
    }

    /// Delete the entry; no-op if absent.
    pub(crate) fn remove(&self, id: TrackedId) {
        let removed = self.live.write().remove(&id);
        if let Some(entity) = removed {
            debug!(id, entity = %entity.short_display(), "no longer tracking");
            let _drain = self.drain_lock.lock();
            self.drain_cond.notify_all();
        }
    }

    /// Visit live entities in natural id order (most recent first), holding
    /// the shared read lock for the duration.
    pub(crate) fn dump<F: FnMut(&TrackedEntity)>(&self, mut visitor: F) {
        for entity in self.live.read().values() {
            visitor(entity);
        }
    }

    /// Immutable copy of the live map, for shutdown diagnostics.
    pub(crate) fn snapshot(&self) -> BTreeMap<TrackedId, TrackedEntity> {
        self.live.read().clone()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live.read().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.live.read().len()
    }

    /// Wait up to `grace` for the registry to become empty, invoking
    /// `on_removed` for every snapshot entity that disappears while waiting.
    /// Returns whether the registry drained in time.
    pub(crate) fn await_drained<F>(&self, grace: Duration, mut on_removed: F) -> bool
    where
        F: FnMut(&TrackedEntity),
    {
        let deadline = Instant::now() + grace;
        let mut awaited = self.snapshot();

        loop {
            {
                let live = self.live.read();
                awaited.retain(|id, entity| {
                    if live.contains_key(id) {
                        true
                    } else {
                        on_removed(entity);
                        false
                    }
                });
                if live.is_empty() {
                    return true;
                }
            }

            let mut slot = self.drain_lock.lock();
            // Removals completed between dropping the read lock above and
            // acquiring the drain lock would have notified no one; re-check
            // before committing to a wait.
            let moved_on = {
                let live = self.live.read();
                live.is_empty() || awaited.keys().any(|id| !live.contains_key(id))
            };
            if moved_on {
                continue;
            }

            if self.drain_cond.wait_until(&mut slot, deadline).timed_out() {
                drop(slot);
                let live = self.live.read();
                awaited.retain(|id, entity| {
                    if live.contains_key(id) {
                        true
                    } else {
                        on_removed(entity);
                        false
                    }
                });
                return live.is_empty();
            }
        }
    }
}
