// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Flat file storage backend.
//!
//! Listings and message tracking each live in their own JSON document. Every
//! overwrite goes through a staging file that is renamed over the original,
//! so a crash mid-write leaves either the old document or the new one. The
//! old document is kept as a timestamped backup first, and only the newest
//! few backups survive.
//!
//! # On-Disk Format
//!
//! The listings document is a JSON array of listing records, exactly as the
//! upstream feed publishes them. The tracking document is a JSON object
//! keyed by listing identifier, where each value is a list of delivery
//! records. A single delivery record object is also accepted as value, which
//! is how older tracking documents stored one delivery per listing.

use crate::{
    listing::{FieldMap, Listing, ListingId, Snapshot, TrackingEntry, TrackingMap},
    store::{Result, SnapshotStore, StoreError},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs,
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// Default number of backups kept per document.
pub const DEFAULT_KEEP_BACKUPS: usize = 5;

/// JSON document storage.
#[derive(Debug, Clone)]
pub struct FileStore {
    data_file: PathBuf,
    messages_file: PathBuf,
    keep_backups: usize,
}

impl FileStore {
    /// Open file storage at given document paths.
    ///
    /// Documents do not need to exist yet, but their parent directories are
    /// created.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Io`] if parent directories cannot be created.
    pub fn open(data_file: impl Into<PathBuf>, messages_file: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            data_file: data_file.into(),
            messages_file: messages_file.into(),
            keep_backups: DEFAULT_KEEP_BACKUPS,
        };

        for document in [&store.data_file, &store.messages_file] {
            if let Some(parent) = document.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                mkdirp::mkdirp(parent).map_err(|source| StoreError::Io {
                    action: "create directory",
                    path: parent.into(),
                    source,
                })?;
            }
        }

        Ok(store)
    }

    /// Set number of backups kept per document.
    pub fn with_backup_limit(mut self, keep_backups: usize) -> Self {
        self.keep_backups = keep_backups;
        self
    }

    pub fn data_file(&self) -> &Path {
        self.data_file.as_path()
    }

    pub fn messages_file(&self) -> &Path {
        self.messages_file.as_path()
    }

    /// Load listings document without validating records.
    pub fn load_raw_listings(&self) -> Result<Vec<Value>> {
        match read_document(&self.data_file)? {
            Some(data) => serde_json::from_str(&data).map_err(json_error(&self.data_file)),
            None => Ok(Vec::new()),
        }
    }

    /// Load tracking document without validating entries.
    pub fn load_raw_tracking(&self) -> Result<Map<String, Value>> {
        match read_document(&self.messages_file)? {
            Some(data) => serde_json::from_str(&data).map_err(json_error(&self.messages_file)),
            None => Ok(Map::new()),
        }
    }

    /// Existing backups of a document, oldest first.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::BackupPattern`] if document path cannot be
    ///   turned into a search pattern.
    pub fn backups(&self, document: &Path) -> Result<Vec<PathBuf>> {
        let pattern = format!(
            "{}.backup.*",
            glob::Pattern::escape(&document.to_string_lossy())
        );

        let mut backups: Vec<(Vec<u64>, PathBuf)> = glob::glob(&pattern)?
            .filter_map(|entry| entry.ok())
            .filter_map(|backup| Some((backup_key(document, &backup)?, backup)))
            .collect();
        backups.sort();

        Ok(backups.into_iter().map(|(_, backup)| backup).collect())
    }

    /// Copy both documents aside under a label.
    ///
    /// Copies are named `<document>.<label>.<unix-secs>`, numbered past any
    /// copy already taken in the same second, so earlier copies are never
    /// replaced. Missing documents are skipped. Returns paths of created
    /// copies.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Io`] if a copy fails.
    pub fn backup_documents(&self, label: &str) -> Result<Vec<PathBuf>> {
        let mut copies = Vec::new();
        for document in [&self.data_file, &self.messages_file] {
            if !document.exists() {
                continue;
            }

            let copy = labeled_copy_path(document, label);
            fs::copy(document, &copy).map_err(|source| StoreError::Io {
                action: "back up",
                path: document.clone(),
                source,
            })?;
            copies.push(copy);
        }

        Ok(copies)
    }

    #[instrument(skip(self, document), level = "debug")]
    fn write_document<T: Serialize + ?Sized>(&self, path: &Path, document: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(document).map_err(json_error(path))?;
        let staging = with_suffix(path, "tmp");
        fs::write(&staging, data).map_err(io_error("write", &staging))?;

        if let Err(error) = self.replace_with(path, &staging) {
            if let Err(cleanup) = fs::remove_file(&staging) {
                warn!("failed to remove staging file {:?}: {cleanup}", staging.display());
            }
            return Err(error);
        }

        self.prune_backups(path)
    }

    /// Back up current document, then move staged document over it.
    fn replace_with(&self, path: &Path, staging: &Path) -> Result<()> {
        // INVARIANT: Previous document must be preserved before it gets replaced.
        if path.exists() {
            let backup = self.next_backup_path(path)?;
            if fs::hard_link(path, &backup).is_err() {
                fs::copy(path, &backup).map_err(io_error("back up", path))?;
            }
            debug!("backed up {:?} to {:?}", path.display(), backup.display());
        }

        fs::rename(staging, path).map_err(io_error("replace", path))
    }

    /// Backup name for current second, numbered past any backup already
    /// taken in the same second.
    fn next_backup_path(&self, document: &Path) -> Result<PathBuf> {
        let secs = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
        let next = self
            .backups(document)?
            .iter()
            .filter_map(|backup| backup_key(document, backup))
            .filter(|key| key.first() == Some(&secs))
            .map(|key| key.get(1).copied().unwrap_or_default() + 1)
            .max();

        Ok(match next {
            Some(n) => with_suffix(document, &format!("backup.{secs}.{n}")),
            None => with_suffix(document, &format!("backup.{secs}")),
        })
    }

    fn prune_backups(&self, document: &Path) -> Result<()> {
        // INVARIANT: A limit of zero keeps every backup.
        if self.keep_backups == 0 {
            return Ok(());
        }

        let backups = self.backups(document)?;
        let excess = backups.len().saturating_sub(self.keep_backups);
        for stale in &backups[..excess] {
            match fs::remove_file(stale) {
                Ok(()) => debug!("pruned backup {:?}", stale.display()),
                Err(error) => warn!("failed to prune backup {:?}: {error}", stale.display()),
            }
        }

        Ok(())
    }
}

impl SnapshotStore for FileStore {
    fn get_listings(&self) -> Result<Snapshot> {
        let Some(data) = read_document(&self.data_file)? else {
            return Ok(Snapshot::default());
        };

        let (snapshot, rejected) =
            Snapshot::from_json(&data).map_err(json_error(&self.data_file))?;
        for error in rejected {
            warn!("skipping stored listing: {error}");
        }

        Ok(snapshot)
    }

    fn save_listings(&self, snapshot: &Snapshot) -> Result<()> {
        self.write_document(&self.data_file, snapshot)
    }

    fn get_listing(&self, id: &ListingId) -> Result<Listing> {
        self.get_listings()?
            .into_iter()
            .find(|listing| &listing.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn update_listing(&self, id: &ListingId, fields: &FieldMap) -> Result<()> {
        let mut snapshot = self.get_listings()?;
        let listing = snapshot
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        listing.apply_fields(fields)?;

        self.save_listings(&snapshot)
    }

    fn get_message_tracking(&self) -> Result<TrackingMap> {
        let Some(data) = read_document(&self.messages_file)? else {
            return Ok(TrackingMap::new());
        };

        let records: BTreeMap<ListingId, TrackingRecord> =
            serde_json::from_str(&data).map_err(json_error(&self.messages_file))?;

        Ok(records
            .into_iter()
            .map(|(id, record)| (id, record.into()))
            .collect())
    }

    fn save_message_tracking(&self, tracking: &TrackingMap) -> Result<()> {
        self.write_document(&self.messages_file, tracking)
    }

    fn add_message_tracking(
        &self,
        id: &ListingId,
        message_id: &str,
        channel_id: &str,
    ) -> Result<()> {
        let mut tracking = self.get_message_tracking()?;
        let entries = tracking.entry(id.clone()).or_default();
        entries.retain(|entry| entry.channel_id != channel_id);
        entries.push(TrackingEntry {
            message_id: message_id.into(),
            channel_id: channel_id.into(),
            posted_at: Utc::now().timestamp(),
        });

        self.save_message_tracking(&tracking)
    }

    fn health_check(&self) -> bool {
        let readable = self.get_listings().is_ok() && self.get_message_tracking().is_ok();
        let probe = with_suffix(&self.data_file, "health");
        let writable = fs::write(&probe, b"ok")
            .and_then(|_| fs::remove_file(&probe))
            .is_ok();

        if !readable || !writable {
            warn!(readable, writable, "file storage health check failed");
        }

        readable && writable
    }
}

/// Parse one value of the tracking document.
///
/// # Errors
///
/// - Return [`serde_json::Error`] if value is neither a delivery record nor
///   a list of them.
pub fn parse_tracking_record(value: Value) -> serde_json::Result<Vec<TrackingEntry>> {
    serde_json::from_value::<TrackingRecord>(value).map(Into::into)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TrackingRecord {
    Channels(Vec<TrackingEntry>),
    Single(TrackingEntry),
}

impl From<TrackingRecord> for Vec<TrackingEntry> {
    fn from(record: TrackingRecord) -> Self {
        match record {
            TrackingRecord::Channels(entries) => entries,
            TrackingRecord::Single(entry) => vec![entry],
        }
    }
}

fn read_document(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(data) if data.trim().is_empty() => Ok(None),
        Ok(data) => Ok(Some(data)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            action: "read",
            path: path.into(),
            source,
        }),
    }
}

/// Sort key of a backup: its timestamp followed by its sequence number.
fn backup_key(document: &Path, backup: &Path) -> Option<Vec<u64>> {
    let document_name = document.file_name()?.to_str()?;
    let backup_name = backup.file_name()?.to_str()?;

    backup_name
        .strip_prefix(document_name)?
        .strip_prefix(".backup.")?
        .split('.')
        .map(|part| part.parse().ok())
        .collect()
}

fn labeled_copy_path(document: &Path, label: &str) -> PathBuf {
    let secs = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
    let mut copy = with_suffix(document, &format!("{label}.{secs}"));
    let mut sequence = 1;
    while copy.exists() {
        copy = with_suffix(document, &format!("{label}.{secs}.{sequence}"));
        sequence += 1;
    }

    copy
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn io_error<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> StoreError + 'a {
    move |source| StoreError::Io {
        action,
        path: path.into(),
        source,
    }
}

fn json_error(path: &Path) -> impl FnOnce(serde_json::Error) -> StoreError + '_ {
    move |source| StoreError::Json {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::{sample, Field};
    use anyhow::Result;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Result<FileStore> {
        Ok(FileStore::open(
            dir.path().join("data/listings.json"),
            dir.path().join("data/messages.json"),
        )?)
    }

    #[test]
    fn missing_documents_read_as_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir)?;

        assert!(store.get_listings()?.is_empty());
        assert!(store.get_message_tracking()?.is_empty());
        assert!(store.data_file().parent().is_some_and(Path::exists));

        Ok(())
    }

    #[test]
    fn corrupt_document_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir)?;
        fs::write(store.data_file(), "[{ not json")?;

        let result = store.get_listings();

        assert!(matches!(result, Err(StoreError::Json { .. })));
        Ok(())
    }

    #[test]
    fn save_listings_keeps_newest_backups_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir)?.with_backup_limit(2);

        let snapshots: Vec<Snapshot> = (1..=4)
            .map(|n| Snapshot::new((0..n).map(|i| sample(&format!("job-{i}"), 100)).collect()))
            .collect();
        for snapshot in &snapshots {
            store.save_listings(snapshot)?;
        }

        assert_eq!(store.get_listings()?, snapshots[3]);

        let backups = store.backups(store.data_file())?;
        assert_eq!(backups.len(), 2);
        let newest: Snapshot = serde_json::from_str(&fs::read_to_string(&backups[1])?)?;
        assert_eq!(newest, snapshots[2]);
        let oldest: Snapshot = serde_json::from_str(&fs::read_to_string(&backups[0])?)?;
        assert_eq!(oldest, snapshots[1]);

        Ok(())
    }

    #[test]
    fn zero_backup_limit_keeps_every_backup() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir)?.with_backup_limit(0);

        for n in 1..=3 {
            store.save_listings(&Snapshot::new(vec![sample("a", n)]))?;
        }

        assert_eq!(store.backups(store.data_file())?.len(), 2);
        Ok(())
    }

    #[test]
    fn failed_replace_removes_staging_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir)?;
        // INVARIANT: A directory can neither be backed up nor renamed over.
        fs::create_dir(store.data_file())?;

        let result = store.save_listings(&Snapshot::new(vec![sample("a", 100)]));

        assert!(matches!(result, Err(StoreError::Io { .. })));
        assert!(!with_suffix(store.data_file(), "tmp").exists());
        Ok(())
    }

    #[test]
    fn backup_documents_never_replaces_earlier_copies() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir)?;
        store.save_listings(&Snapshot::new(vec![sample("orig", 100)]))?;
        let first = store.backup_documents("pre_migration")?;

        store.save_listings(&Snapshot::new(vec![sample("changed", 100)]))?;
        let second = store.backup_documents("pre_migration")?;

        assert_eq!((first.len(), second.len()), (1, 1));
        assert_ne!(first[0], second[0]);
        let preserved: Snapshot = serde_json::from_str(&fs::read_to_string(&first[0])?)?;
        assert_eq!(preserved, Snapshot::new(vec![sample("orig", 100)]));
        Ok(())
    }

    #[test]
    fn update_listing_patches_given_fields_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir)?;
        store.save_listings(&Snapshot::new(vec![sample("a", 100), sample("b", 100)]))?;

        store.update_listing(
            &ListingId::new("a"),
            &FieldMap::from([(Field::Active, json!(false))]),
        )?;

        let mut expect = sample("a", 100);
        expect.active = false;
        assert_eq!(store.get_listing(&ListingId::new("a"))?, expect);
        assert_eq!(store.get_listing(&ListingId::new("b"))?, sample("b", 100));

        let missing = store.update_listing(
            &ListingId::new("zzz"),
            &FieldMap::from([(Field::Active, json!(false))]),
        );
        assert!(matches!(missing, Err(StoreError::NotFound(id)) if id.as_str() == "zzz"));

        Ok(())
    }

    #[test]
    fn legacy_tracking_document_is_accepted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir)?;
        fs::write(
            store.messages_file(),
            indoc! {r#"
                {
                  "a": { "message_id": "m1", "channel_id": "c1", "posted_at": 10 },
                  "b": [
                    { "message_id": "m2", "channel_id": "c1", "posted_at": 20 },
                    { "message_id": "m3", "channel_id": "c2", "posted_at": 21 }
                  ]
                }
            "#},
        )?;

        let tracking = store.get_message_tracking()?;

        assert_eq!(tracking[&ListingId::new("a")].len(), 1);
        assert_eq!(tracking[&ListingId::new("b")].len(), 2);
        assert_eq!(tracking[&ListingId::new("b")][1].message_id, "m3");

        Ok(())
    }

    #[test]
    fn add_message_tracking_replaces_channel_entry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir)?;
        store.save_listings(&Snapshot::new(vec![sample("a", 100)]))?;
        let id = ListingId::new("a");

        store.add_message_tracking(&id, "m1", "c1")?;
        store.add_message_tracking(&id, "m2", "c2")?;
        store.add_message_tracking(&id, "m3", "c1")?;

        let entries = &store.get_message_tracking()?[&id];
        let messages: Vec<&str> = entries.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(messages, vec!["m2", "m3"]);

        assert_eq!(store.find_listing_by_message_id("m3")?, sample("a", 100));
        assert!(matches!(
            store.find_listing_by_message_id("m1"),
            Err(StoreError::UnknownMessage(_))
        ));

        Ok(())
    }

    #[test]
    fn health_check_reports_unreadable_documents() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir)?;
        assert!(store.health_check());

        fs::write(store.messages_file(), "not json")?;
        assert!(!store.health_check());

        Ok(())
    }
}
