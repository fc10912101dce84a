// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Periodic feed processing.
//!
//! One __cycle__ runs these steps in order:
//!
//! 1. Fetch the current snapshot from the feed, bounded by a timeout.
//! 2. Skip everything else if the feed did not change since the last fully
//!    processed revision.
//! 3. Reconcile the current snapshot against the stored one.
//! 4. Apply the change set to storage.
//! 5. Announce persisted additions, then record where they were delivered.
//! 6. Mark the feed revision as processed, but only if nothing failed.
//!
//! A failed fetch aborts the cycle before storage is touched. A fetch that
//! timed out keeps running in the background, and the next cycle waits on it
//! rather than starting another fetch of the same mirror. A cycle that
//! failed halfway leaves the revision unmarked, so the next cycle runs it
//! again. Reconciliation against the partially updated store picks up
//! exactly what is still missing.
//!
//! # Scheduling
//!
//! [`Watcher::run`] starts a cycle at every tick of a fixed interval. Cycles
//! never overlap: a cycle that outlasts the interval swallows the ticks it
//! missed instead of queueing them up.

use crate::{
    apply::{apply, ProcessingResult, UpdateFailure},
    notify::{Dispatcher, NotificationSink},
    reconcile::{reconcile, ChangeSet},
    repo::{self, FeedSource, FetchError, FetchedFeed},
    store::{SnapshotStore, StorageCoordinator, StoreError},
};

use chrono::Utc;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    task::{spawn_blocking, JoinHandle},
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};

/// Summary of one cycle.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Feed revision the cycle processed.
    pub blob_id: String,

    /// Feed did not change since last processed revision.
    pub unchanged: bool,

    /// Feed records that failed validation.
    pub rejected: usize,

    /// Identifiers that occurred more than once in a snapshot.
    pub duplicates: usize,

    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub failures: Vec<UpdateFailure>,

    /// Notifications delivered.
    pub delivered: usize,

    /// Deliveries recorded in message tracking.
    pub tracked: usize,
}

impl CycleReport {
    fn unchanged(blob_id: String, rejected: usize) -> Self {
        Self {
            blob_id,
            unchanged: true,
            rejected,
            ..Default::default()
        }
    }

    /// Check if cycle left nothing to retry.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.tracked == self.delivered
    }
}

/// Watches the feed and keeps storage and channels in sync with it.
pub struct Watcher<F, S, T = StorageCoordinator>
where
    F: FeedSource,
    S: NotificationSink,
    T: SnapshotStore + 'static,
{
    source: Arc<F>,
    store: Arc<T>,
    dispatcher: Dispatcher<S>,
    head_file: PathBuf,
    fetch_timeout: Duration,
    pending_fetch: Option<JoinHandle<repo::Result<FetchedFeed>>>,
}

impl<F, S, T> Watcher<F, S, T>
where
    F: FeedSource,
    S: NotificationSink,
    T: SnapshotStore + 'static,
{
    /// Construct new watcher.
    ///
    /// The last fully processed feed revision is kept in `head_file`.
    pub fn new(
        source: F,
        store: Arc<T>,
        dispatcher: Dispatcher<S>,
        head_file: impl Into<PathBuf>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            source: Arc::new(source),
            store,
            dispatcher,
            head_file: head_file.into(),
            fetch_timeout,
            pending_fetch: None,
        }
    }

    pub fn store(&self) -> &T {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    /// Run one full cycle.
    ///
    /// # Errors
    ///
    /// - Return [`CycleError::Fetch`] if the feed cannot be fetched in time.
    ///   Storage is not touched in that case.
    /// - Return [`CycleError::Store`] if the stored snapshot cannot be read.
    /// - Return [`CycleError::Head`] if the processed revision marker cannot
    ///   be read or written.
    #[instrument(skip(self), level = "debug")]
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let feed = self.fetch().await?;
        for error in &feed.rejected {
            warn!("skipping feed record: {error}");
        }

        if self.last_processed()?.as_deref() == Some(feed.blob_id.as_str()) {
            debug!("feed unchanged at {}", feed.blob_id);
            return Ok(CycleReport::unchanged(feed.blob_id, feed.rejected.len()));
        }

        let mut report = CycleReport {
            blob_id: feed.blob_id,
            rejected: feed.rejected.len(),
            ..Default::default()
        };

        let store = Arc::clone(&self.store);
        let current = feed.snapshot;
        let (change_set, result): (ChangeSet, ProcessingResult) =
            spawn_blocking(move || -> Result<_, StoreError> {
                let previous = store.get_listings()?;
                let change_set = reconcile(&current, &previous);
                let result = apply(&change_set, &*store);
                Ok((change_set, result))
            })
            .await??;

        report.duplicates = change_set.duplicates.len();
        report.added = result.added_count;
        report.updated = result.updated_count;
        report.removed = result.removed_count;
        report.failures = result.failures;

        let deliveries = self
            .dispatcher
            .dispatch(&result.added, Utc::now().timestamp())
            .await;
        report.delivered = deliveries.len();

        let store = Arc::clone(&self.store);
        report.tracked = spawn_blocking(move || {
            deliveries
                .iter()
                .filter(|record| {
                    let delivered = &record.delivered;
                    match store.add_message_tracking(
                        &record.id,
                        &delivered.message_id,
                        &delivered.channel_id,
                    ) {
                        Ok(()) => true,
                        Err(error) => {
                            warn!("failed to track message {}: {error}", delivered.message_id);
                            false
                        }
                    }
                })
                .count()
        })
        .await?;

        // INVARIANT: Only a fully processed revision may be marked, or a failed
        // cycle would never be retried.
        if report.is_complete() {
            self.mark_processed(&report.blob_id)?;
        } else {
            warn!("cycle incomplete, revision {} will be processed again", report.blob_id);
        }

        Ok(report)
    }

    /// Run cycles forever at a fixed interval, until interrupted.
    pub async fn run(&mut self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.run_cycle().await {
                    Ok(report) => log_report(&report),
                    Err(error) => error!("cycle aborted: {error}"),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    return;
                }
            }
        }
    }

    /// Fetch feed, resuming a fetch that outlived the previous cycle.
    ///
    /// A timed out fetch keeps running on the blocking pool, so it is kept
    /// and awaited again instead of starting a second fetch on the same
    /// mirror.
    async fn fetch(&mut self) -> Result<FetchedFeed> {
        let mut handle = match self.pending_fetch.take() {
            Some(handle) => {
                debug!("resuming fetch left over from previous cycle");
                handle
            }
            None => {
                let source = Arc::clone(&self.source);
                spawn_blocking(move || source.fetch())
            }
        };

        match timeout(self.fetch_timeout, &mut handle).await {
            Ok(joined) => Ok(joined.map_err(FetchError::from)??),
            Err(_) => {
                self.pending_fetch = Some(handle);
                Err(FetchError::Timeout(self.fetch_timeout).into())
            }
        }
    }

    fn last_processed(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.head_file) {
            Ok(blob_id) => Ok(Some(blob_id.trim().to_string())),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CycleError::Head {
                source,
                path: self.head_file.clone(),
            }),
        }
    }

    fn mark_processed(&self, blob_id: &str) -> Result<()> {
        let head_error = |source| CycleError::Head {
            source,
            path: self.head_file.clone(),
        };

        if let Some(parent) = self.head_file.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            mkdirp::mkdirp(parent).map_err(head_error)?;
        }
        fs::write(&self.head_file, format!("{blob_id}\n")).map_err(head_error)
    }
}

/// Log outcome of a cycle.
pub fn log_report(report: &CycleReport) {
    if report.unchanged {
        debug!("no feed changes at {}", report.blob_id);
        return;
    }

    info!(
        added = report.added,
        updated = report.updated,
        removed = report.removed,
        delivered = report.delivered,
        rejected = report.rejected,
        "processed feed revision {}",
        report.blob_id
    );
    for failure in &report.failures {
        warn!("listing {} not persisted: {}", failure.id, failure.reason);
    }
}

/// Read processed revision marker, if any.
pub fn read_head(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|blob_id| blob_id.trim().to_string())
}

/// Cycle error types.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    /// Feed could not be fetched.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Storage failed outside of a single listing.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Processed revision marker cannot be read or written.
    #[error("failed to access revision marker {:?}", path.display())]
    Head {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Blocking task could not finish.
    #[error(transparent)]
    Task(#[from] tokio::task::JoinError),
}

/// Friendly result alias :3
pub type Result<T, E = CycleError> = std::result::Result<T, E>;
