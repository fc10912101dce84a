// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Migration from file storage to relational storage.
//!
//! Migration copies every listing and tracking entry of a [`FileStore`] into
//! a [`SqliteStore`], one record at a time, so a bad record only fails
//! itself. Records written by older versions may lack fields that are
//! required today. Those are filled in before validation:
//!
//! - A missing identifier gets a random one.
//! - A missing update time becomes the time of migration.
//! - A missing source becomes "file migration".
//! - A missing visibility becomes visible.
//!
//! Listings whose URL is already stored are skipped, so migration can be
//! re-run safely after a partial failure. Tracking entries are only copied
//! for listings the database holds.
//!
//! # Dry Runs
//!
//! A dry run validates everything and reports what would be copied, without
//! touching the database or creating backups.

use crate::{
    listing::{Listing, ListingId, ValidationError},
    store::{file::parse_tracking_record, FileStore, SqliteStore, StoreError},
};

use chrono::Utc;
use indicatif::ProgressBar;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Label of backups taken before migrating.
pub const BACKUP_LABEL: &str = "pre_migration";

/// Migration settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Validate only, write nothing.
    pub dry_run: bool,

    /// Copy file documents aside before migrating.
    pub backup: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            backup: true,
        }
    }
}

/// Outcome of a migration.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub listings_total: usize,
    pub listings_migrated: usize,

    /// Listings whose URL was already stored.
    pub listings_skipped: usize,
    pub listings_failed: usize,

    pub tracking_total: usize,
    pub tracking_migrated: usize,
    pub tracking_failed: usize,

    /// Records rejected by validation.
    pub rejected: Vec<ValidationError>,

    /// Backups created before migrating.
    pub backups: Vec<PathBuf>,

    /// Database holds at least everything reported as migrated.
    pub verified: bool,
}

impl MigrationReport {
    /// Check if every record was migrated or deliberately skipped.
    pub fn is_success(&self) -> bool {
        self.listings_failed == 0 && self.tracking_failed == 0 && self.verified
    }
}

/// Copy file storage into relational storage.
///
/// Progress advances once per listing and once per tracked listing.
///
/// # Errors
///
/// - Return [`StoreError`] if either document cannot be read, a backup
///   cannot be created, or the database cannot be queried. Failures of
///   single records are counted in the report instead.
#[instrument(skip_all, level = "debug")]
pub fn migrate(
    source: &FileStore,
    target: &SqliteStore,
    options: MigrationOptions,
    progress: &ProgressBar,
) -> Result<MigrationReport, StoreError> {
    let mut report = MigrationReport::default();

    if options.backup && !options.dry_run {
        report.backups = source.backup_documents(BACKUP_LABEL)?;
        for backup in &report.backups {
            info!("created backup {:?}", backup.display());
        }
    }

    let records = source.load_raw_listings()?;
    let tracking = source.load_raw_tracking()?;
    report.listings_total = records.len();
    progress.set_length(u64::try_from(records.len() + tracking.len()).unwrap_or(u64::MAX));

    let now = Utc::now().timestamp();
    for (index, record) in records.into_iter().enumerate() {
        progress.inc(1);

        let listing = match Listing::from_record(index, fill_missing(record, now)) {
            Ok(listing) => listing,
            Err(error) => {
                warn!("cannot migrate listing: {error}");
                report.rejected.push(error);
                report.listings_failed += 1;
                continue;
            }
        };
        progress.set_message(format!("{} - {}", listing.company_name, listing.title));

        if target.url_exists(&listing.url)? {
            warn!("listing {} already stored under URL {}, skipping", listing.id, listing.url);
            report.listings_skipped += 1;
            continue;
        }

        if options.dry_run {
            report.listings_migrated += 1;
            continue;
        }

        match target.insert_listing(&listing) {
            Ok(()) => report.listings_migrated += 1,
            Err(error) => {
                warn!("failed to migrate listing {}: {error}", listing.id);
                report.listings_failed += 1;
            }
        }
    }

    for (id, value) in tracking {
        progress.inc(1);
        let id = ListingId::new(id);

        let entries = match parse_tracking_record(value) {
            Ok(entries) => entries,
            Err(error) => {
                warn!("malformed tracking of listing {id}: {error}");
                report.tracking_total += 1;
                report.tracking_failed += 1;
                continue;
            }
        };

        report.tracking_total += entries.len();
        if options.dry_run {
            report.tracking_migrated += entries.len();
            continue;
        }

        for entry in entries {
            match target.insert_tracking(&id, &entry) {
                Ok(()) => report.tracking_migrated += 1,
                Err(error) => {
                    warn!("failed to migrate tracking of listing {id}: {error}");
                    report.tracking_failed += 1;
                }
            }
        }
    }

    report.verified = if options.dry_run {
        true
    } else {
        let (listings, tracking) = target.counts()?;
        listings >= report.listings_migrated && tracking >= report.tracking_migrated
    };

    info!(
        migrated = report.listings_migrated,
        skipped = report.listings_skipped,
        failed = report.listings_failed,
        tracking = report.tracking_migrated,
        verified = report.verified,
        dry_run = options.dry_run,
        "migration finished"
    );

    Ok(report)
}

/// Fill fields older records may lack.
fn fill_missing(mut record: Value, now: i64) -> Value {
    if let Value::Object(fields) = &mut record {
        fields
            .entry("id")
            .or_insert_with(|| Value::from(Uuid::new_v4().to_string()));
        fields.entry("date_updated").or_insert_with(|| Value::from(now));
        fields.entry("source").or_insert_with(|| Value::from("file migration"));
        fields.entry("is_visible").or_insert(Value::Bool(true));
    }

    record
}
