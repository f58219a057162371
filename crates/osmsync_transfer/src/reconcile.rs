//! Background reconciliation of cached changesets.
//!
//! Open changesets older than the configured minimum age are queried in one
//! batch and merged back into the cache. Runs are spaced by wall-clock time:
//! a tick arriving early, e.g. right after the host wakes from sleep, is
//! skipped rather than rescheduled.

use crate::cache::ChangesetCache;
use crate::config::ReconciliationConfig;
use crate::error::TransferResult;
use chrono::{DateTime, Utc};
use osmsync_protocol::Changeset;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Source of authoritative changeset state.
pub trait ChangesetFetcher: Send + Sync {
    /// Fetches the changesets with the given ids in one request.
    fn fetch_changesets(&self, ids: &[u64]) -> TransferResult<Vec<Changeset>>;
}

/// Result of one reconciliation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The previous run was too recent.
    Skipped,
    /// The cache was reconciled.
    Reconciled {
        /// Changesets queried.
        queried: usize,
        /// Cache entries changed.
        updated: usize,
    },
}

struct Shared {
    cache: Arc<ChangesetCache>,
    fetcher: Arc<dyn ChangesetFetcher>,
    config: ReconciliationConfig,
    tick: Mutex<()>,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl Shared {
    fn stale_candidates(&self, now: DateTime<Utc>) -> Vec<u64> {
        let min_age =
            chrono::Duration::from_std(self.config.min_age).unwrap_or(chrono::Duration::MAX);
        self.cache
            .list_open()
            .iter()
            .filter(|c| c.is_stale(now, min_age))
            .map(Changeset::id)
            .collect()
    }

    /// One tick. Ticks are serialized; only a successful run takes the
    /// interval slot, so a failed fetch can be retried right away.
    fn tick_at(&self, now: DateTime<Utc>) -> TransferResult<TickOutcome> {
        let _tick = self.tick.lock();
        if let Some(last) = *self.last_run.lock() {
            let interval = chrono::Duration::from_std(self.config.interval())
                .unwrap_or(chrono::Duration::MAX);
            let elapsed = now - last;
            if elapsed + chrono::Duration::seconds(1) < interval {
                debug!(
                    elapsed_secs = elapsed.num_seconds(),
                    "skipping reconciliation, last run too recent"
                );
                return Ok(TickOutcome::Skipped);
            }
        }

        let ids = self.stale_candidates(now);
        if ids.is_empty() {
            *self.last_run.lock() = Some(now);
            return Ok(TickOutcome::Reconciled {
                queried: 0,
                updated: 0,
            });
        }
        let fetched = self.fetcher.fetch_changesets(&ids)?;
        *self.last_run.lock() = Some(now);
        let updated = self.cache.update(fetched);
        info!(queried = ids.len(), updated, "reconciled open changesets");
        Ok(TickOutcome::Reconciled {
            queried: ids.len(),
            updated,
        })
    }
}

struct Running {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodic reconciliation task.
///
/// `start` and `stop` are idempotent. The task stops when dropped.
pub struct ReconciliationTask {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ReconciliationTask {
    /// Creates a stopped task.
    pub fn new(
        cache: Arc<ChangesetCache>,
        fetcher: Arc<dyn ChangesetFetcher>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache,
                fetcher,
                config,
                tick: Mutex::new(()),
                last_run: Mutex::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ReconciliationConfig {
        &self.shared.config
    }

    /// Time of the last successful run.
    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_run.lock()
    }

    /// Ids of open cached changesets old enough to be queried at `now`.
    pub fn stale_candidates(&self, now: DateTime<Utc>) -> Vec<u64> {
        self.shared.stale_candidates(now)
    }

    /// Runs one reconciliation as if the clock read `now`.
    pub fn tick_at(&self, now: DateTime<Utc>) -> TransferResult<TickOutcome> {
        self.shared.tick_at(now)
    }

    /// Runs one reconciliation now.
    pub fn run_once(&self) -> TransferResult<TickOutcome> {
        self.shared.tick_at(Utc::now())
    }

    /// Returns true while the schedule is active.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Starts the schedule.
    ///
    /// Returns false if it was already running or is disabled.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }
        if self.shared.config.is_disabled() {
            info!("changeset reconciliation disabled");
            return false;
        }

        let (shutdown, signal) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("changeset-reconciliation".to_string())
            .spawn(move || run_schedule(shared, signal));
        match spawned {
            Ok(handle) => {
                info!(
                    interval_minutes = self.shared.config.interval_minutes,
                    "changeset reconciliation started"
                );
                *running = Some(Running { shutdown, handle });
                true
            }
            Err(err) => {
                error!(error = %err, "failed to spawn reconciliation thread");
                false
            }
        }
    }

    /// Stops the schedule and waits for the worker to exit.
    ///
    /// Returns false if it was not running.
    pub fn stop(&self) -> bool {
        let Some(running) = self.running.lock().take() else {
            return false;
        };
        let _ = running.shutdown.send(());
        if running.handle.join().is_err() {
            warn!("reconciliation thread panicked");
        }
        info!("changeset reconciliation stopped");
        true
    }
}

impl Drop for ReconciliationTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ReconciliationTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationTask")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish()
    }
}

fn run_schedule(shared: Arc<Shared>, mut shutdown: oneshot::Receiver<()>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build reconciliation runtime");
            return;
        }
    };

    runtime.block_on(async move {
        tokio::select! {
            _ = &mut shutdown => return,
            _ = tokio::time::sleep(shared.config.initial_delay) => {}
        }
        let mut interval = tokio::time::interval(shared.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    match shared.tick_at(Utc::now()) {
                        Ok(outcome) => debug!(?outcome, "reconciliation tick"),
                        Err(err) => warn!(error = %err, "reconciliation failed"),
                    }
                }
            }
        }
    });
}
