// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Upstream listings feed.
//!
//! The feed is a JSON document of listing records kept inside a git
//! repository. Jobwatch keeps a local bare mirror of that repository, and
//! reads the document straight out of the tracked branch's tip commit, so no
//! working tree is ever checked out.
//!
//! # Synchronization
//!
//! The first fetch clones the mirror. Later fetches update the tracked
//! branch in place, forcing it to whatever the remote holds, so upstream
//! history rewrites never wedge the mirror. A mirror that cannot be opened
//! as a repository is removed and cloned again.
//!
//! # Change Marker
//!
//! Every fetched feed carries the object identifier of the listings blob it
//! was read from. Two fetches with the same identifier carry byte-identical
//! documents, so callers can skip reconciliation entirely.

use crate::{
    config::RepositoryConfig,
    listing::{Snapshot, ValidationError},
};

use auth_git2::{GitAuthenticator, Prompter};
use git2::{build::RepoBuilder, Config, FetchOptions, RemoteCallbacks, Repository};
use std::{
    fs,
    path::{Path, PathBuf},
    str::Utf8Error,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

/// Source of listing snapshots.
pub trait FeedSource: Send + Sync + 'static {
    /// Fetch the current snapshot.
    ///
    /// Blocks until the feed is fetched, or fails.
    fn fetch(&self) -> Result<FetchedFeed>;
}

/// Snapshot read from the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFeed {
    /// Object identifier of the listings document.
    pub blob_id: String,

    /// Valid listings in feed order.
    pub snapshot: Snapshot,

    /// Records that failed validation.
    pub rejected: Vec<ValidationError>,
}

/// Local bare mirror of the feed repository.
#[derive(Debug, Clone)]
pub struct FeedRepository {
    url: String,
    local_path: PathBuf,
    listings_path: PathBuf,
    branch: Option<String>,
    timeout: Duration,
}

impl FeedRepository {
    pub fn new(config: &RepositoryConfig) -> Self {
        Self {
            url: config.url.clone(),
            local_path: config.local_path.clone(),
            listings_path: config.listings_path.clone(),
            branch: config.branch.clone(),
            timeout: Duration::from_secs(config.fetch_timeout_secs),
        }
    }

    pub fn local_path(&self) -> &Path {
        self.local_path.as_path()
    }

    /// Bring the local mirror up to date with the remote.
    ///
    /// # Errors
    ///
    /// - Return [`FetchError::Git2`] if cloning or fetching fails, including
    ///   when the transfer outlives the fetch timeout.
    /// - Return [`FetchError::RemoveMirror`] if an invalid mirror cannot be
    ///   removed.
    #[instrument(skip(self), level = "debug")]
    pub fn sync(&self) -> Result<Repository> {
        let deadline = Instant::now() + self.timeout;

        if !self.local_path.exists() {
            return self.clone_mirror(deadline);
        }

        match Repository::open(&self.local_path) {
            Ok(repository) => {
                self.pull(&repository, deadline)?;
                Ok(repository)
            }
            Err(error) => {
                warn!(
                    "invalid mirror at {:?} ({error}), cloning again",
                    self.local_path.display()
                );
                fs::remove_dir_all(&self.local_path).map_err(|source| FetchError::RemoveMirror {
                    source,
                    path: self.local_path.clone(),
                })?;
                self.clone_mirror(deadline)
            }
        }
    }

    /// Read the listings document from the tracked branch's tip.
    ///
    /// # Errors
    ///
    /// - Return [`FetchError::MissingListings`] if the tip commit has no
    ///   listings document.
    /// - Return [`FetchError::Malformed`] if the document is not a JSON array.
    pub fn read_feed(&self, repository: &Repository) -> Result<FetchedFeed> {
        let branch = self.branch_name(repository)?;
        let tree = repository
            .find_reference(&format!("refs/heads/{branch}"))?
            .peel_to_tree()?;
        let entry = tree
            .get_path(&self.listings_path)
            .map_err(|_| FetchError::MissingListings {
                path: self.listings_path.clone(),
            })?;
        let blob = repository.find_blob(entry.id())?;

        let (snapshot, rejected) = Snapshot::from_json(std::str::from_utf8(blob.content())?)?;
        debug!(
            "read {} listings from {branch}, rejected {}",
            snapshot.len(),
            rejected.len()
        );

        Ok(FetchedFeed {
            blob_id: entry.id().to_string(),
            snapshot,
            rejected,
        })
    }

    fn clone_mirror(&self, deadline: Instant) -> Result<Repository> {
        info!("cloning {} into {:?}", self.url, self.local_path.display());
        let repository = self.with_fetch_options(deadline, |options| {
            let mut builder = RepoBuilder::new();
            builder.bare(true).fetch_options(options);
            if let Some(branch) = &self.branch {
                builder.branch(branch);
            }
            Ok(builder.clone(&self.url, &self.local_path)?)
        })?;

        Ok(repository)
    }

    fn pull(&self, repository: &Repository, deadline: Instant) -> Result<()> {
        let branch = self.branch_name(repository)?;
        let refspec = format!("+refs/heads/{branch}:refs/heads/{branch}");
        let mut remote = repository.find_remote("origin")?;

        self.with_fetch_options(deadline, |mut options| {
            remote.fetch(&[refspec.as_str()], Some(&mut options), None)?;
            Ok(())
        })?;
        debug!("fetched {refspec}");

        Ok(())
    }

    fn with_fetch_options<T>(
        &self,
        deadline: Instant,
        op: impl FnOnce(FetchOptions<'_>) -> Result<T>,
    ) -> Result<T> {
        let authenticator = GitAuthenticator::default().set_prompter(NoPrompter);
        let config = Config::open_default()?;

        let mut throttle = Instant::now();
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(authenticator.credentials(&config));
        callbacks.transfer_progress(|progress| {
            if throttle.elapsed() > Duration::from_secs(1) {
                throttle = Instant::now();
                debug!(
                    "received {}/{} objects",
                    progress.received_objects(),
                    progress.total_objects()
                );
            }

            // INVARIANT: Returning false aborts the transfer.
            Instant::now() < deadline
        });

        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);
        op(options)
    }

    fn branch_name(&self, repository: &Repository) -> Result<String> {
        if let Some(branch) = &self.branch {
            return Ok(branch.clone());
        }

        repository
            .head()
            .ok()
            .and_then(|head| head.shorthand().map(String::from))
            .ok_or_else(|| FetchError::NoBranch {
                path: self.local_path.clone(),
            })
    }
}

impl FeedSource for FeedRepository {
    fn fetch(&self) -> Result<FetchedFeed> {
        let repository = self.sync()?;
        self.read_feed(&repository)
    }
}

/// Git2 authentication prompter that never prompts.
///
/// Jobwatch runs unattended, so missing credentials fail the fetch instead
/// of blocking on a terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompter;

impl Prompter for NoPrompter {
    fn prompt_username_password(&mut self, url: &str, _config: &Config) -> Option<(String, String)> {
        warn!("authentication required at {url}, but no credentials are configured");
        None
    }

    fn prompt_password(&mut self, username: &str, url: &str, _config: &Config) -> Option<String> {
        warn!("authentication required at {url} for user {username}, but no password is configured");
        None
    }

    fn prompt_ssh_key_passphrase(&mut self, ssh_key_path: &Path, _config: &Config) -> Option<String> {
        warn!(
            "ssh key at {:?} needs a passphrase, but none is configured",
            ssh_key_path.display()
        );
        None
    }
}

/// Feed error types.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// Invalid mirror cannot be removed.
    #[error("failed to remove invalid mirror at {:?}", path.display())]
    RemoveMirror {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Mirror has no branch to read from.
    #[error("cannot determine branch to track in {:?}", path.display())]
    NoBranch { path: PathBuf },

    /// Tip commit lacks listings document.
    #[error("listings document {:?} missing from feed", path.display())]
    MissingListings { path: PathBuf },

    /// Listings document is not text.
    #[error("listings document is not valid UTF-8")]
    Encoding(#[from] Utf8Error),

    /// Listings document is not a JSON array.
    #[error("listings document is malformed")]
    Malformed(#[from] serde_json::Error),

    /// Fetch did not finish in time.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    /// Fetch task could not finish.
    #[error(transparent)]
    Task(#[from] tokio::task::JoinError),
}

/// Friendly result alias :3
pub type Result<T, E = FetchError> = std::result::Result<T, E>;
