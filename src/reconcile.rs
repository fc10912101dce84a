// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Snapshot reconciliation.
//!
//! Compare a freshly fetched snapshot against the previously stored snapshot,
//! and classify every listing as added, updated, or removed. Reconciliation is
//! a pure function of its two inputs. It performs no I/O and never modifies
//! either snapshot.
//!
//! # Primary Fields and Content Corrections
//!
//! Listings present in both snapshots are compared on a small set of primary
//! fields: `active`, `is_visible`, and `date_updated`. Upstream maintainers
//! bump `date_updated` whenever they correct a listing's content, without
//! necessarily touching its flags. So whenever `date_updated` differs, the
//! comparison escalates to every remaining field, and each differing field is
//! included in the diff.
//!
//! # Duplicate Identifiers
//!
//! Identifiers are expected to be unique within a snapshot. When they are not,
//! the __last__ record carrying an identifier supplies the listing's data,
//! while the __first__ record fixes its position in iteration order. Every
//! duplicate identifier is reported through [`ChangeSet::duplicates`] so the
//! caller can surface it.

use crate::listing::{Field, FieldMap, Listing, ListingId, Snapshot};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Old and new value of a changed field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// Field-level diff of a listing.
pub type Changes = BTreeMap<Field, FieldChange>;

/// Listing present in both snapshots whose fields changed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UpdatedListing {
    /// Listing as it appears in the current snapshot.
    pub job: Listing,

    /// Only the fields that actually changed.
    pub changes: Changes,
}

impl UpdatedListing {
    /// Check if update stems from an upstream content correction.
    pub fn is_content_correction(&self) -> bool {
        self.changes.contains_key(&Field::DateUpdated)
    }

    /// Field values to write back for this update.
    ///
    /// Content corrections rewrite the entire listing. Every other update
    /// only patches the fields that changed.
    pub fn patch(&self) -> FieldMap {
        if self.is_content_correction() {
            return self.job.to_fields();
        }

        self.changes
            .iter()
            .map(|(field, change)| (*field, change.new.clone()))
            .collect()
    }
}

/// Classified result of comparing two snapshots.
///
/// # Invariants
///
/// - A listing identifier appears in at most one of `added`, `updated`, and
///   `removed`.
/// - `added` and `updated` follow the current snapshot's iteration order.
/// - `removed` follows the previous snapshot's iteration order.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub added: Vec<Listing>,
    pub updated: Vec<UpdatedListing>,
    pub removed: Vec<Listing>,

    /// Identifiers that occurred more than once in either snapshot.
    pub duplicates: Vec<ListingId>,
}

impl ChangeSet {
    /// Check if reconciliation found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Added listings in the order they should be announced.
    ///
    /// Sorted chronologically by posting time. Listings posted at the same
    /// time keep their snapshot order.
    pub fn notification_order(&self) -> Vec<Listing> {
        chronological(self.added.clone())
    }
}

/// Reconcile current snapshot against previous snapshot.
pub fn reconcile(current: &Snapshot, previous: &Snapshot) -> ChangeSet {
    let current_index = SnapshotIndex::build(current);
    let previous_index = SnapshotIndex::build(previous);
    let mut change_set = ChangeSet::default();

    for id in &current_index.order {
        let listing = current_index.by_id[*id];
        match previous_index.by_id.get(*id) {
            None => change_set.added.push(listing.clone()),
            Some(old) => {
                if let Some(changes) = diff(old, listing) {
                    change_set.updated.push(UpdatedListing {
                        job: listing.clone(),
                        changes,
                    });
                }
            }
        }
    }

    for id in &previous_index.order {
        if !current_index.by_id.contains_key(*id) {
            change_set.removed.push(previous_index.by_id[*id].clone());
        }
    }

    let mut duplicates = current_index.duplicates;
    duplicates.extend(previous_index.duplicates);
    duplicates.sort();
    duplicates.dedup();
    change_set.duplicates = duplicates;

    change_set
}

/// Compute field-level diff between two versions of the same listing.
///
/// Returns `None` when no compared field differs.
pub fn diff(previous: &Listing, current: &Listing) -> Option<Changes> {
    let mut changes = Changes::new();
    for field in Field::PRIMARY {
        record_change(&mut changes, field, previous, current);
    }

    // INVARIANT: A new update timestamp means a content correction, so compare everything.
    if changes.contains_key(&Field::DateUpdated) {
        for field in Field::SECONDARY {
            record_change(&mut changes, field, previous, current);
        }
    }

    (!changes.is_empty()).then_some(changes)
}

/// Sort listings by posting time, keeping input order for ties.
pub fn chronological(mut listings: Vec<Listing>) -> Vec<Listing> {
    listings.sort_by_key(|listing| listing.date_posted);
    listings
}

fn record_change(changes: &mut Changes, field: Field, previous: &Listing, current: &Listing) {
    let old = previous.field(field);
    let new = current.field(field);
    if old != new {
        changes.insert(field, FieldChange { old, new });
    }
}

struct SnapshotIndex<'a> {
    order: Vec<&'a ListingId>,
    by_id: HashMap<&'a ListingId, &'a Listing>,
    duplicates: Vec<ListingId>,
}

impl<'a> SnapshotIndex<'a> {
    fn build(snapshot: &'a Snapshot) -> Self {
        let mut order = Vec::with_capacity(snapshot.len());
        let mut by_id = HashMap::with_capacity(snapshot.len());
        let mut duplicates = Vec::new();

        for listing in snapshot {
            // INVARIANT: Last record wins the data, first record keeps the position.
            match by_id.insert(&listing.id, listing) {
                None => order.push(&listing.id),
                Some(_) => duplicates.push(listing.id.clone()),
            }
        }

        Self {
            order,
            by_id,
            duplicates,
        }
    }
}
