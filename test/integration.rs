// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{record, FeedFixture, RecordingSink, LISTINGS_PATH};

use anyhow::Result;
use chrono::Utc;
use jobwatch::{
    config::{NotifyConfig, RepositoryConfig, StorageConfig},
    listing::ListingId,
    notify::Dispatcher,
    pipeline::{read_head, CycleError},
    repo::{FeedRepository, FetchError},
    store::{open_storage, SnapshotStore, StorageMode},
    Watcher,
};
use pretty_assertions::assert_eq;
use std::{path::Path, sync::Arc, time::Duration};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    feed: FeedFixture,
    sink: RecordingSink,
}

impl Harness {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let feed = FeedFixture::new(dir.path().join("upstream"))?;

        Ok(Self {
            dir,
            feed,
            sink: RecordingSink::default(),
        })
    }

    fn storage_config(&self, mode: StorageMode) -> StorageConfig {
        let data = self.dir.path().join("data");
        StorageConfig {
            mode,
            data_file: data.join("listings.json"),
            messages_file: data.join("messages.json"),
            database_path: data.join("jobwatch.db"),
            head_file: data.join("HEAD"),
            ..Default::default()
        }
    }

    fn watcher(&self, url: String, storage: &StorageConfig) -> Result<Watcher<FeedRepository, RecordingSink>> {
        let repository = RepositoryConfig {
            url,
            local_path: self.dir.path().join("mirror.git"),
            listings_path: LISTINGS_PATH.into(),
            branch: None,
            fetch_timeout_secs: 30,
        };
        let notify = NotifyConfig {
            channels: vec!["jobs".into()],
            ..Default::default()
        };

        Ok(Watcher::new(
            FeedRepository::new(&repository),
            Arc::new(open_storage(storage)?),
            Dispatcher::new(self.sink.clone(), &notify),
            &storage.head_file,
            Duration::from_secs(30),
        ))
    }

    fn head(&self) -> Option<String> {
        read_head(&self.dir.path().join("data").join("HEAD"))
    }
}

fn ids(store: &impl SnapshotStore) -> Result<Vec<String>> {
    Ok(store
        .get_listings()?
        .iter()
        .map(|listing| listing.id.to_string())
        .collect())
}

#[tokio::test]
async fn first_cycle_stores_and_announces_oldest_first() -> Result<()> {
    let harness = Harness::new()?;
    let now = Utc::now().timestamp();
    harness
        .feed
        .publish(&[record("b", now - 100, now - 100), record("a", now - 200, now - 200)])?;
    let storage = harness.storage_config(StorageMode::DualWrite);
    let mut watcher = harness.watcher(harness.feed.url(), &storage)?;

    let first = watcher.run_cycle().await?;
    let second = watcher.run_cycle().await?;

    assert_eq!((first.added, first.delivered, first.tracked), (2, 2, 2));
    assert!(second.unchanged);
    assert_eq!(harness.sink.delivered_ids(), vec!["a", "b"]);
    assert_eq!(harness.head(), Some(first.blob_id));

    let store = watcher.store();
    assert_eq!(store.mode(), StorageMode::DualWrite);
    assert_eq!(ids(store)?, vec!["b", "a"]);
    assert_eq!(ids(store.file_backend())?, vec!["b", "a"]);
    assert_eq!(
        store.find_listing_by_message_id("msg-1")?.id,
        ListingId::new("a")
    );

    Ok(())
}

#[tokio::test]
async fn later_commit_updates_adds_and_removes() -> Result<()> {
    let harness = Harness::new()?;
    let now = Utc::now().timestamp();
    harness.feed.publish(&[
        record("a", now - 300, now - 300),
        record("b", now - 300, now - 300),
    ])?;
    let storage = harness.storage_config(StorageMode::FileOnly);
    let mut watcher = harness.watcher(harness.feed.url(), &storage)?;
    watcher.run_cycle().await?;

    let mut corrected = record("a", now - 300, now - 10);
    corrected["title"] = "Backend Intern".into();
    harness
        .feed
        .publish(&[corrected, record("c", now - 20, now - 20)])?;
    let report = watcher.run_cycle().await?;

    assert_eq!((report.added, report.updated, report.removed), (1, 1, 1));
    assert!(report.failures.is_empty());
    assert_eq!(harness.sink.delivered_ids(), vec!["a", "b", "c"]);

    let store = watcher.store();
    assert_eq!(ids(store)?, vec!["a", "c"]);
    let updated = store.get_listing(&ListingId::new("a"))?;
    assert_eq!(updated.title, "Backend Intern");
    assert_eq!(updated.date_updated, now - 10);

    Ok(())
}

#[tokio::test]
async fn malformed_records_are_skipped() -> Result<()> {
    let harness = Harness::new()?;
    let now = Utc::now().timestamp();
    let mut blank_title = record("c", now, now);
    blank_title["title"] = "   ".into();
    harness.feed.publish(&[
        record("a", now, now),
        serde_json::json!({ "title": "No Identifier" }),
        blank_title,
    ])?;
    let storage = harness.storage_config(StorageMode::FileOnly);
    let mut watcher = harness.watcher(harness.feed.url(), &storage)?;

    let report = watcher.run_cycle().await?;

    assert_eq!((report.added, report.rejected), (1, 2));
    assert_eq!(ids(watcher.store())?, vec!["a"]);

    Ok(())
}

#[tokio::test]
async fn unreachable_feed_leaves_store_untouched() -> Result<()> {
    let harness = Harness::new()?;
    let missing = harness.dir.path().join("nowhere");
    let storage = harness.storage_config(StorageMode::FileOnly);
    let mut watcher = harness.watcher(missing.to_string_lossy().into_owned(), &storage)?;

    let result = watcher.run_cycle().await;

    assert!(matches!(result, Err(CycleError::Fetch(FetchError::Git2(_)))));
    assert!(watcher.store().get_listings()?.is_empty());
    assert!(harness.sink.delivered_ids().is_empty());
    assert_eq!(harness.head(), None);

    Ok(())
}

#[tokio::test]
async fn unusable_database_falls_back_to_files() -> Result<()> {
    let harness = Harness::new()?;
    let now = Utc::now().timestamp();
    harness.feed.publish(&[record("a", now, now)])?;
    let mut storage = harness.storage_config(StorageMode::DualWrite);
    // INVARIANT: A directory can never be opened as a database.
    storage.database_path = harness.dir.path().to_path_buf();
    let mut watcher = harness.watcher(harness.feed.url(), &storage)?;

    let report = watcher.run_cycle().await?;

    let store = watcher.store();
    assert_eq!(store.mode(), StorageMode::FileOnly);
    assert_eq!(
        store.fallback().map(|fallback| fallback.requested),
        Some(StorageMode::DualWrite)
    );
    assert_eq!(report.added, 1);
    assert!(Path::new(&storage.data_file).exists());

    Ok(())
}
