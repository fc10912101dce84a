// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Snapshot storage.
//!
//! Jobwatch persists two things between cycles: the last known snapshot of
//! listings, and the message tracking map linking listings to the
//! notifications posted for them. Both live behind the [`SnapshotStore`]
//! trait.
//!
//! # Backends
//!
//! - [`FileStore`] keeps each of the two as an independent JSON document, and
//!   backs up the previous document before every overwrite.
//! - [`SqliteStore`] keeps listings in a relational schema with child tables
//!   for locations, terms, and message tracking.
//! - [`StorageCoordinator`] wraps both behind one store, and selects between
//!   them through [`StorageMode`]. During migration it writes to both, while
//!   the file backend stays the source of truth for reads.
//!
//! # Referential Integrity
//!
//! The relational backend refuses to track messages for listings it does not
//! hold. The file backend does not check this, because its two documents are
//! written independently.
//!
//! # Concurrency
//!
//! Stores assume mutation is serialized upstream: only one cycle runs at a
//! time. Callers that need truly concurrent cycles must guard
//! [`SnapshotStore::save_listings`] and [`SnapshotStore::update_listing`]
//! with their own lock or version check.

pub mod dual;
pub mod file;
pub mod schema;
pub mod sqlite;

pub use dual::{BackendHealth, Fallback, StorageCoordinator};
pub use file::FileStore;
pub use sqlite::SqliteStore;

use crate::{
    config::StorageConfig,
    listing::{FieldMap, Listing, ListingId, Snapshot, TrackingMap, ValidationError},
};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
    time::Duration,
};

/// Persistent home of listings and message tracking.
pub trait SnapshotStore: Send + Sync {
    /// Load full snapshot.
    ///
    /// An empty snapshot is returned when nothing was persisted yet.
    fn get_listings(&self) -> Result<Snapshot>;

    /// Replace full snapshot.
    ///
    /// Readers either observe the old snapshot or the new one, never a mix.
    fn save_listings(&self, snapshot: &Snapshot) -> Result<()>;

    /// Load single listing.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::NotFound`] if no listing has given identifier.
    fn get_listing(&self, id: &ListingId) -> Result<Listing>;

    /// Update only the given fields of a listing.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::NotFound`] if no listing has given identifier.
    /// - Return [`StoreError::Validation`] if a field value has the wrong
    ///   type. Nothing is written in that case.
    fn update_listing(&self, id: &ListingId, fields: &FieldMap) -> Result<()>;

    /// Load message tracking map.
    fn get_message_tracking(&self) -> Result<TrackingMap>;

    /// Replace message tracking map.
    fn save_message_tracking(&self, tracking: &TrackingMap) -> Result<()>;

    /// Record a delivered notification for a listing.
    ///
    /// Re-delivery to the same channel replaces the previous entry for that
    /// channel.
    fn add_message_tracking(&self, id: &ListingId, message_id: &str, channel_id: &str)
        -> Result<()>;

    /// Probe read and write access. Never fails loudly.
    fn health_check(&self) -> bool;

    /// Resolve a delivered message back to the listing it announced.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::UnknownMessage`] if no tracking entry carries
    ///   given message identifier.
    /// - Return [`StoreError::NotFound`] if the tracked listing is gone.
    fn find_listing_by_message_id(&self, message_id: &str) -> Result<Listing> {
        let tracking = self.get_message_tracking()?;
        let id = tracking
            .iter()
            .find_map(|(id, entries)| {
                entries
                    .iter()
                    .any(|entry| entry.message_id == message_id)
                    .then_some(id)
            })
            .ok_or_else(|| StoreError::UnknownMessage(message_id.to_string()))?;

        self.get_listing(id)
    }
}

/// Storage backend selection.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Read and write flat files only.
    #[default]
    FileOnly,

    /// Read and write relational database only.
    RelationalOnly,

    /// Write both backends, read from flat files.
    DualWrite,
}

impl StorageMode {
    /// Check if mode writes to file backend.
    pub fn writes_file(self) -> bool {
        matches!(self, Self::FileOnly | Self::DualWrite)
    }

    /// Check if mode writes to relational backend.
    pub fn writes_relational(self) -> bool {
        matches!(self, Self::RelationalOnly | Self::DualWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileOnly => "file_only",
            Self::RelationalOnly => "relational_only",
            Self::DualWrite => "dual_write",
        }
    }
}

impl Display for StorageMode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Open storage described by configuration.
///
/// The file backend is always opened, since every mode may fall back to it.
/// The relational backend is only opened when the mode needs it. See
/// [`StorageCoordinator::connect`] for fallback behavior.
///
/// # Errors
///
/// - Return [`StoreError::Io`] if the file backend's directories cannot be
///   created.
pub fn open_storage(config: &StorageConfig) -> Result<StorageCoordinator> {
    let file = FileStore::open(&config.data_file, &config.messages_file)?
        .with_backup_limit(config.keep_backups);
    let database_path = config.database_path.clone();
    let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

    Ok(StorageCoordinator::connect(config.mode, file, move || {
        SqliteStore::open(database_path, busy_timeout)
    }))
}

/// Storage error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Listing does not exist.
    #[error("listing {0} not found")]
    NotFound(ListingId),

    /// No tracking entry carries message identifier.
    #[error("no listing tracks message {0}")]
    UnknownMessage(String),

    /// Backend cannot be reached.
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Storage did not answer in time.
    #[error("storage timed out: {0}")]
    Timeout(String),

    /// Listing data is malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// File system operation fails.
    #[error("failed to {action} {:?}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored document cannot be (de)serialized.
    #[error("malformed document at {:?}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Backup pattern cannot be built.
    #[error(transparent)]
    BackupPattern(#[from] glob::PatternError),

    /// Operations from SQLite fail.
    #[error(transparent)]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        match error.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Timeout(error.to_string())
            }
            _ => Self::Sqlite(error),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
