//! Process-local, self-renewing timers keyed by (source, keyword).
//!
//! The registry of pending timers is owned by [`Scheduler`] and only reachable
//! through [`Scheduler::arm_next`] and [`Scheduler::clear_all`]. Nothing is
//! persisted: a restart starts with an empty registry, and callers decide
//! whether to re-arm from run history.
//!
//! # Invariants
//!
//! - At most one live timer per key. Arming an armed key aborts the old timer.
//! - A timer removes its own entry when it fires, before running its job, so
//!   a job that re-arms its own key never aborts itself.
//! - Every entry carries a generation number; a timer that lost a race with a
//!   newer `arm_next` finds a different generation and does nothing.

use crate::models::Source;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ScheduleKey {
    pub source: Source,
    pub keyword: String,
}

impl ScheduleKey {
    pub fn new(source: Source, keyword: impl Into<String>) -> Self {
        Self {
            source,
            keyword: keyword.into(),
        }
    }
}

/// A live timer as reported by [`Scheduler::armed_keys`].
#[derive(Debug, Clone, Serialize)]
pub struct ArmedTimer {
    pub key: ScheduleKey,
    pub due_at: DateTime<Utc>,
}

struct ScheduleEntry {
    generation: u64,
    handle: AbortHandle,
    due_at: DateTime<Utc>,
}

#[derive(Default)]
struct Registry {
    entries: Mutex<HashMap<ScheduleKey, ScheduleEntry>>,
    next_generation: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<ScheduleKey, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap to clone; clones share one registry.
#[derive(Clone, Default)]
pub struct Scheduler {
    registry: Arc<Registry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `job` to run once after `delay`, replacing any timer for `key`.
    pub fn arm_next<F>(&self, key: ScheduleKey, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.registry.next_generation.fetch_add(1, Ordering::Relaxed);
        let due_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let registry = Arc::clone(&self.registry);
        let task_key = key.clone();

        // Held across spawn + insert so a zero-delay timer cannot fire before
        // its own entry exists.
        let mut entries = self.registry.lock();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut entries = registry.lock();
                match entries.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        entries.remove(&task_key);
                    }
                    _ => return,
                }
            }
            info!(source = %task_key.source, keyword = %task_key.keyword, "Schedule fired");
            job.await;
        });

        let replaced = entries.insert(
            key.clone(),
            ScheduleEntry {
                generation,
                handle: handle.abort_handle(),
                due_at,
            },
        );
        if let Some(old) = replaced {
            old.handle.abort();
            debug!(source = %key.source, keyword = %key.keyword, "Replaced pending timer");
        }
        info!(source = %key.source, keyword = %key.keyword, %due_at, "Schedule armed");
    }

    /// Cancel every pending timer. Returns how many were cancelled.
    pub fn clear_all(&self) -> usize {
        let mut entries = self.registry.lock();
        let cleared = entries.len();
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
        if cleared > 0 {
            info!(cleared, "Cleared pending schedules");
        }
        cleared
    }

    /// Snapshot of live timers, soonest first.
    pub fn armed_keys(&self) -> Vec<ArmedTimer> {
        let entries = self.registry.lock();
        let mut armed: Vec<ArmedTimer> = entries
            .iter()
            .map(|(key, entry)| ArmedTimer {
                key: key.clone(),
                due_at: entry.due_at,
            })
            .collect();
        armed.sort_by_key(|t| t.due_at);
        armed
    }
}
