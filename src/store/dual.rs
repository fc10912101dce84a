// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Storage coordination across backends.
//!
//! The [`StorageCoordinator`] makes the file backend and the relational
//! backend look like one [`SnapshotStore`]. Its [`StorageMode`] decides which
//! backend serves reads and which backends receive writes:
//!
//! | Mode              | Reads from | Writes to       |
//! |-------------------|------------|-----------------|
//! | `file_only`       | file       | file            |
//! | `relational_only` | relational | relational      |
//! | `dual_write`      | file       | file, relational|
//!
//! # Fallback
//!
//! The relational backend is opened and probed once, when the coordinator
//! is connected. If either step fails, the coordinator drops to `file_only`
//! for its whole lifetime and remembers why in [`Fallback`]. After that, the
//! relational backend is never touched again.
//!
//! # Dual Writes
//!
//! Every write is attempted on each active backend, even when an earlier
//! backend already failed. The first failure is returned, so callers always
//! notice that backends may have diverged.

use crate::{
    listing::{FieldMap, Listing, ListingId, Snapshot, TrackingMap},
    store::{FileStore, Result, SnapshotStore, SqliteStore, StorageMode},
};

use tracing::{debug, error, info, warn};

/// Reason the coordinator left its configured mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallback {
    /// Mode that was asked for.
    pub requested: StorageMode,

    /// Why the relational backend was dropped.
    pub reason: String,
}

/// Health of each backend a coordinator uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHealth {
    pub mode: StorageMode,

    /// Health of file backend, if active.
    pub file: Option<bool>,

    /// Health of relational backend, if active.
    pub relational: Option<bool>,
}

/// One store over file and relational backends.
#[derive(Debug)]
pub struct StorageCoordinator<F = FileStore, R = SqliteStore> {
    mode: StorageMode,
    file: F,
    relational: Option<R>,
    fallback: Option<Fallback>,
}

impl<F, R> StorageCoordinator<F, R>
where
    F: SnapshotStore,
    R: SnapshotStore,
{
    /// Connect backends for given mode.
    ///
    /// The relational backend is only opened through `open_relational` when
    /// the mode needs it. A failure to open it, or a failed health probe, is
    /// not an error: the coordinator falls back to `file_only` instead.
    pub fn connect(mode: StorageMode, file: F, open_relational: impl FnOnce() -> Result<R>) -> Self {
        if mode == StorageMode::FileOnly {
            return Self {
                mode,
                file,
                relational: None,
                fallback: None,
            };
        }

        let reason = match open_relational() {
            Ok(relational) if relational.health_check() => {
                info!("storage running in {mode} mode");
                return Self {
                    mode,
                    file,
                    relational: Some(relational),
                    fallback: None,
                };
            }
            Ok(_) => "connectivity probe failed".to_string(),
            Err(error) => error.to_string(),
        };

        warn!("relational backend unavailable ({reason}), falling back to file_only mode");
        Self {
            mode: StorageMode::FileOnly,
            file,
            relational: None,
            fallback: Some(Fallback {
                requested: mode,
                reason,
            }),
        }
    }

    /// Effective mode, after any fallback.
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn fallback(&self) -> Option<&Fallback> {
        self.fallback.as_ref()
    }

    pub fn file_backend(&self) -> &F {
        &self.file
    }

    pub fn relational_backend(&self) -> Option<&R> {
        self.relational.as_ref()
    }

    /// Probe every active backend.
    pub fn backend_health(&self) -> BackendHealth {
        BackendHealth {
            mode: self.mode,
            file: self
                .mode
                .writes_file()
                .then(|| self.file.health_check()),
            relational: self.relational.as_ref().map(|relational| relational.health_check()),
        }
    }

    fn read<T>(&self, op: impl Fn(&dyn SnapshotStore) -> Result<T>) -> Result<T> {
        match (self.mode, &self.relational) {
            (StorageMode::RelationalOnly, Some(relational)) => op(relational),
            _ => op(&self.file),
        }
    }

    fn write(&self, action: &str, op: impl Fn(&dyn SnapshotStore) -> Result<()>) -> Result<()> {
        let mut first_error = None;

        if self.mode.writes_file() {
            match op(&self.file) {
                Ok(()) => debug!("{action} in file backend"),
                Err(err) => {
                    error!("failed to {action} in file backend: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(relational) = self.relational.as_ref().filter(|_| self.mode.writes_relational()) {
            match op(relational) {
                Ok(()) => debug!("{action} in relational backend"),
                Err(err) => {
                    error!("failed to {action} in relational backend: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl<F, R> SnapshotStore for StorageCoordinator<F, R>
where
    F: SnapshotStore,
    R: SnapshotStore,
{
    fn get_listings(&self) -> Result<Snapshot> {
        self.read(|store| store.get_listings())
    }

    fn save_listings(&self, snapshot: &Snapshot) -> Result<()> {
        self.write("save listings", |store| store.save_listings(snapshot))
    }

    fn get_listing(&self, id: &ListingId) -> Result<Listing> {
        self.read(|store| store.get_listing(id))
    }

    fn update_listing(&self, id: &ListingId, fields: &FieldMap) -> Result<()> {
        self.write("update listing", |store| store.update_listing(id, fields))
    }

    fn get_message_tracking(&self) -> Result<TrackingMap> {
        self.read(|store| store.get_message_tracking())
    }

    fn save_message_tracking(&self, tracking: &TrackingMap) -> Result<()> {
        self.write("save message tracking", |store| {
            store.save_message_tracking(tracking)
        })
    }

    fn add_message_tracking(
        &self,
        id: &ListingId,
        message_id: &str,
        channel_id: &str,
    ) -> Result<()> {
        self.write("add message tracking", |store| {
            store.add_message_tracking(id, message_id, channel_id)
        })
    }

    fn health_check(&self) -> bool {
        let health = self.backend_health();
        health.file.unwrap_or(true) && health.relational.unwrap_or(true)
    }

    fn find_listing_by_message_id(&self, message_id: &str) -> Result<Listing> {
        self.read(|store| store.find_listing_by_message_id(message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{listing::sample, store::StoreError};
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    /// In-memory store that counts writes it receives.
    #[derive(Default)]
    struct RecordingStore {
        healthy: bool,
        failing: bool,
        writes: Arc<AtomicUsize>,
        snapshot: Mutex<Snapshot>,
    }

    impl RecordingStore {
        fn new(healthy: bool, writes: &Arc<AtomicUsize>) -> Self {
            Self {
                healthy,
                writes: Arc::clone(writes),
                ..Default::default()
            }
        }

        fn failing(writes: &Arc<AtomicUsize>) -> Self {
            Self {
                healthy: true,
                failing: true,
                writes: Arc::clone(writes),
                ..Default::default()
            }
        }

        fn record(&self) -> crate::store::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                return Err(StoreError::BackendUnavailable("connection reset".into()));
            }
            Ok(())
        }
    }

    impl SnapshotStore for RecordingStore {
        fn get_listings(&self) -> crate::store::Result<Snapshot> {
            Ok(self.snapshot.lock().unwrap().clone())
        }

        fn save_listings(&self, snapshot: &Snapshot) -> crate::store::Result<()> {
            self.record()?;
            *self.snapshot.lock().unwrap() = snapshot.clone();
            Ok(())
        }

        fn get_listing(&self, id: &ListingId) -> crate::store::Result<Listing> {
            self.snapshot
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.clone()))
        }

        fn update_listing(&self, _: &ListingId, _: &FieldMap) -> crate::store::Result<()> {
            self.record()
        }

        fn get_message_tracking(&self) -> crate::store::Result<TrackingMap> {
            Ok(TrackingMap::new())
        }

        fn save_message_tracking(&self, _: &TrackingMap) -> crate::store::Result<()> {
            self.record()
        }

        fn add_message_tracking(&self, _: &ListingId, _: &str, _: &str) -> crate::store::Result<()> {
            self.record()
        }

        fn health_check(&self) -> bool {
            self.healthy
        }
    }

    type Coordinator = StorageCoordinator<RecordingStore, RecordingStore>;

    fn connect(mode: StorageMode, relational: Option<RecordingStore>) -> (Coordinator, Arc<AtomicUsize>) {
        let file_writes = Arc::new(AtomicUsize::new(0));
        let coordinator = Coordinator::connect(mode, RecordingStore::new(true, &file_writes), || {
            relational.ok_or_else(|| StoreError::BackendUnavailable("connection refused".into()))
        });
        (coordinator, file_writes)
    }

    #[test_case(StorageMode::DualWrite; "dual write")]
    #[test_case(StorageMode::RelationalOnly; "relational only")]
    #[test]
    fn failed_probe_falls_back_to_file_only(mode: StorageMode) -> Result<()> {
        use pretty_assertions::assert_eq;

        let relational_writes = Arc::new(AtomicUsize::new(0));
        let (coordinator, file_writes) =
            connect(mode, Some(RecordingStore::new(false, &relational_writes)));

        coordinator.save_listings(&Snapshot::new(vec![sample("a", 1)]))?;
        coordinator.add_message_tracking(&ListingId::new("a"), "m1", "c1")?;

        assert_eq!(coordinator.mode(), StorageMode::FileOnly);
        assert_eq!(
            coordinator.fallback(),
            Some(&Fallback {
                requested: mode,
                reason: "connectivity probe failed".into()
            })
        );
        assert_eq!(file_writes.load(Ordering::SeqCst), 2);
        assert_eq!(relational_writes.load(Ordering::SeqCst), 0);
        assert!(coordinator.relational_backend().is_none());

        Ok(())
    }

    #[test]
    fn failed_open_falls_back_to_file_only() {
        let (coordinator, _) = connect(StorageMode::DualWrite, None);

        assert_eq!(coordinator.mode(), StorageMode::FileOnly);
        assert_eq!(
            coordinator.fallback().map(|fallback| fallback.reason.as_str()),
            Some("storage backend unavailable: connection refused")
        );
    }

    #[test]
    fn file_only_never_opens_relational_backend() {
        let file_writes = Arc::new(AtomicUsize::new(0));
        let coordinator: Coordinator = StorageCoordinator::connect(
            StorageMode::FileOnly,
            RecordingStore::new(true, &file_writes),
            || panic!("relational backend opened in file_only mode"),
        );

        assert!(coordinator.fallback().is_none());
        assert_eq!(
            coordinator.backend_health(),
            BackendHealth {
                mode: StorageMode::FileOnly,
                file: Some(true),
                relational: None
            }
        );
    }

    #[test]
    fn dual_write_reaches_both_backends_and_reads_file() -> Result<()> {
        let relational_writes = Arc::new(AtomicUsize::new(0));
        let (coordinator, file_writes) = connect(
            StorageMode::DualWrite,
            Some(RecordingStore::new(true, &relational_writes)),
        );

        let snapshot = Snapshot::new(vec![sample("a", 1), sample("b", 2)]);
        coordinator.save_listings(&snapshot)?;

        assert_eq!(file_writes.load(Ordering::SeqCst), 1);
        assert_eq!(relational_writes.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.get_listings()?, snapshot);
        assert!(coordinator.health_check());

        Ok(())
    }

    #[test]
    fn dual_write_reports_relational_failure_after_file_write() {
        let relational_writes = Arc::new(AtomicUsize::new(0));
        let (coordinator, file_writes) = connect(
            StorageMode::DualWrite,
            Some(RecordingStore::failing(&relational_writes)),
        );

        let result = coordinator.save_listings(&Snapshot::new(vec![sample("a", 1)]));

        assert!(matches!(result, Err(StoreError::BackendUnavailable(_))));
        assert_eq!(file_writes.load(Ordering::SeqCst), 1);
        assert_eq!(relational_writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn relational_only_reads_and_writes_relational() -> Result<()> {
        let relational_writes = Arc::new(AtomicUsize::new(0));
        let (coordinator, file_writes) = connect(
            StorageMode::RelationalOnly,
            Some(RecordingStore::new(true, &relational_writes)),
        );

        coordinator.save_listings(&Snapshot::new(vec![sample("a", 1)]))?;

        assert_eq!(file_writes.load(Ordering::SeqCst), 0);
        assert_eq!(relational_writes.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.get_listing(&ListingId::new("a"))?, sample("a", 1));
        assert!(coordinator.file_backend().get_listings()?.is_empty());

        Ok(())
    }
}
