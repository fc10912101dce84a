// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Job listing change detection.
//!
//! Jobwatch follows an upstream feed of job listings kept in a git
//! repository. Each __cycle__ reconciles the feed's current snapshot against
//! the last stored one, persists additions, updates, and removals, and
//! announces newly added listings to notification channels.
//!
//! # Layout
//!
//! - [`listing`] defines listings, snapshots, and message tracking records.
//! - [`reconcile`] computes change sets between two snapshots.
//! - [`store`] persists snapshots in a file backend, a relational backend,
//!   or both at once.
//! - [`apply`] writes change sets to storage.
//! - [`notify`] announces persisted additions to channels.
//! - [`repo`] fetches the feed from its git repository.
//! - [`pipeline`] ties everything together into periodic cycles.
//! - [`migrate`] copies file storage into relational storage.

pub mod apply;
pub mod config;
pub mod listing;
pub mod migrate;
pub mod notify;
pub mod path;
pub mod pipeline;
pub mod reconcile;
pub mod repo;
pub mod store;

pub use apply::{apply, ProcessingResult};
pub use listing::{Listing, ListingId, Snapshot};
pub use pipeline::{CycleReport, Watcher};
pub use reconcile::{reconcile, ChangeSet};
pub use store::{SnapshotStore, StorageCoordinator, StorageMode};
