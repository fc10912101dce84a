// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Change set application.
//!
//! Applying a [`ChangeSet`] persists it into a [`SnapshotStore`] in three
//! phases: field updates one listing at a time, then all additions in one
//! bulk write, then all removals in one bulk write. A failure in one
//! listing's update never stops the rest of the batch. Every failure is
//! collected into the [`ProcessingResult`] instead.
//!
//! # Persist Before Notify
//!
//! Only listings that were actually persisted are handed back as
//! [`ProcessingResult::added`]. If the bulk addition fails, nothing is
//! announced, and the next cycle detects the same additions again.
//!
//! # Idempotence
//!
//! Applying a change set computed against the store's current contents, then
//! reconciling the same snapshot again, yields an empty change set. Additions
//! already present in the store are never appended a second time.

use crate::{
    listing::{Listing, ListingId},
    reconcile::{chronological, ChangeSet},
    store::{Result, SnapshotStore},
};

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

/// Listing that could not be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateFailure {
    pub id: ListingId,
    pub reason: String,
}

/// Outcome of applying a change set.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingResult {
    pub added_count: usize,
    pub updated_count: usize,
    pub removed_count: usize,
    pub failures: Vec<UpdateFailure>,

    /// No listing failed to persist.
    pub success: bool,

    /// Persisted additions, oldest posting first.
    pub added: Vec<Listing>,
}

/// Persist a change set into storage.
#[instrument(skip_all, level = "debug")]
pub fn apply<S>(change_set: &ChangeSet, store: &S) -> ProcessingResult
where
    S: SnapshotStore + ?Sized,
{
    let mut result = ProcessingResult::default();

    for update in &change_set.updated {
        let id = &update.job.id;
        match store.update_listing(id, &update.patch()) {
            Ok(()) => {
                debug!("updated listing {id}");
                result.updated_count += 1;
            }
            Err(error) => {
                warn!("failed to update listing {id}: {error}");
                result.failures.push(UpdateFailure {
                    id: id.clone(),
                    reason: error.to_string(),
                });
            }
        }
    }

    if !change_set.added.is_empty() {
        match append_listings(store, &change_set.added) {
            Ok(appended) => {
                result.added_count = appended.len();
                result.added = chronological(appended);
            }
            Err(error) => {
                warn!("failed to add {} listings: {error}", change_set.added.len());
                result.failures.extend(change_set.added.iter().map(|listing| UpdateFailure {
                    id: listing.id.clone(),
                    reason: error.to_string(),
                }));
            }
        }
    }

    if !change_set.removed.is_empty() {
        match remove_listings(store, &change_set.removed) {
            Ok(removed) => result.removed_count = removed,
            Err(error) => {
                warn!("failed to remove {} listings: {error}", change_set.removed.len());
                result.failures.extend(change_set.removed.iter().map(|listing| UpdateFailure {
                    id: listing.id.clone(),
                    reason: error.to_string(),
                }));
            }
        }
    }

    result.success = result.failures.is_empty();
    info!(
        added = result.added_count,
        updated = result.updated_count,
        removed = result.removed_count,
        failed = result.failures.len(),
        "applied change set"
    );

    result
}

/// Append additions the store does not hold yet, returning what was appended.
fn append_listings<S>(store: &S, added: &[Listing]) -> Result<Vec<Listing>>
where
    S: SnapshotStore + ?Sized,
{
    let mut snapshot = store.get_listings()?;
    let known: HashSet<ListingId> = snapshot.iter().map(|listing| listing.id.clone()).collect();

    // INVARIANT: A listing is never stored twice.
    let appended: Vec<Listing> = added
        .iter()
        .filter(|listing| !known.contains(&listing.id))
        .cloned()
        .collect();
    if appended.is_empty() {
        return Ok(appended);
    }

    snapshot.extend(appended.iter().cloned());
    store.save_listings(&snapshot)?;

    Ok(appended)
}

/// Drop removed listings from storage, returning how many were dropped.
fn remove_listings<S>(store: &S, removed: &[Listing]) -> Result<usize>
where
    S: SnapshotStore + ?Sized,
{
    let mut snapshot = store.get_listings()?;
    let gone: HashSet<&ListingId> = removed.iter().map(|listing| &listing.id).collect();

    let before = snapshot.len();
    snapshot.retain(|listing| !gone.contains(&listing.id));
    let dropped = before - snapshot.len();
    if dropped > 0 {
        store.save_listings(&snapshot)?;
    }

    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        listing::{sample, Field, FieldMap, Snapshot},
        reconcile::{reconcile, UpdatedListing},
        store::{FileStore, SqliteStore, StoreError},
    };
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn file_store(dir: &tempfile::TempDir) -> Result<FileStore> {
        Ok(FileStore::open(
            dir.path().join("listings.json"),
            dir.path().join("messages.json"),
        )?)
    }

    fn flagged(id: &str, active: bool) -> UpdatedListing {
        let mut job = sample(id, 100);
        job.active = active;
        let changes = crate::reconcile::diff(&sample(id, 100), &job).unwrap_or_default();
        UpdatedListing { job, changes }
    }

    #[test]
    fn batch_failure_does_not_stop_other_updates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = file_store(&dir)?;
        store.save_listings(&Snapshot::new(vec![sample("a", 100), sample("c", 100)]))?;

        let change_set = ChangeSet {
            updated: vec![flagged("a", false), flagged("b", false), flagged("c", false)],
            ..Default::default()
        };
        let result = apply(&change_set, &store);

        assert_eq!(result.updated_count, 2);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].id, ListingId::new("b"));
        assert!(!result.success);
        assert!(!store.get_listing(&ListingId::new("a"))?.active);
        assert!(!store.get_listing(&ListingId::new("c"))?.active);

        Ok(())
    }

    fn assert_applies_once<S: SnapshotStore>(store: &S) -> Result<()> {
        let mut closed = sample("b", 100);
        closed.active = false;
        let mut corrected = sample("c", 200);
        corrected.title = "Backend Intern".into();
        store.save_listings(&Snapshot::new(vec![
            sample("a", 100),
            sample("b", 100),
            sample("c", 100),
            sample("gone", 100),
        ]))?;
        let current = Snapshot::new(vec![
            sample("a", 100),
            closed,
            corrected,
            sample("new-late", 500),
            sample("new-early", 400),
        ]);

        let first = apply(&reconcile(&current, &store.get_listings()?), store);
        let second = apply(&reconcile(&current, &store.get_listings()?), store);

        assert!(first.success);
        assert_eq!(
            (first.added_count, first.updated_count, first.removed_count),
            (2, 2, 1)
        );
        let announced: Vec<&str> = first.added.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(announced, vec!["new-early", "new-late"]);

        assert_eq!(second, ProcessingResult { success: true, ..Default::default() });
        assert_eq!(store.get_listings()?, current);

        Ok(())
    }

    #[test]
    fn apply_is_idempotent_on_file_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert_applies_once(&file_store(&dir)?)
    }

    #[test]
    fn apply_is_idempotent_on_sqlite_store() -> Result<()> {
        assert_applies_once(&SqliteStore::open_in_memory()?)
    }

    #[test]
    fn additions_already_stored_are_not_announced_again() -> Result<()> {
        let store = SqliteStore::open_in_memory()?;
        store.save_listings(&Snapshot::new(vec![sample("a", 100)]))?;

        let change_set = ChangeSet {
            added: vec![sample("a", 100), sample("b", 100)],
            ..Default::default()
        };
        let result = apply(&change_set, &store);

        assert_eq!(result.added_count, 1);
        assert_eq!(result.added, vec![sample("b", 100)]);
        assert_eq!(store.get_listings()?.len(), 2);

        Ok(())
    }

    #[test]
    fn failed_addition_is_not_announced() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = file_store(&dir)?;
        std::fs::write(store.data_file(), "{ corrupt")?;

        let change_set = ChangeSet {
            added: vec![sample("a", 100)],
            ..Default::default()
        };
        let result = apply(&change_set, &store);

        assert_eq!(result.added_count, 0);
        assert!(result.added.is_empty());
        assert_eq!(result.failures.len(), 1);
        assert!(!result.success);

        Ok(())
    }

    #[test]
    fn content_correction_replaces_every_field() -> Result<()> {
        let store = SqliteStore::open_in_memory()?;
        store.save_listings(&Snapshot::new(vec![sample("a", 100)]))?;

        let mut corrected = sample("a", 200);
        corrected.url = "https://jobs.example.com/a-fixed".into();
        corrected.locations = vec!["Remote".into()];
        corrected.sponsorship = None;
        let change_set =
            reconcile(&Snapshot::new(vec![corrected.clone()]), &store.get_listings()?);
        let result = apply(&change_set, &store);

        assert!(result.success);
        assert_eq!(store.get_listing(&ListingId::new("a"))?, corrected);
        assert!(matches!(
            store.update_listing(
                &ListingId::new("zzz"),
                &FieldMap::from([(Field::Active, json!(true))])
            ),
            Err(StoreError::NotFound(_))
        ));

        Ok(())
    }
}
