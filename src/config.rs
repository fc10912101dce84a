// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Jobwatch reads one TOML configuration file with a section per concern:
//!
//! - `[repository]` names the feed repository and where to mirror it.
//! - `[storage]` selects the storage mode and where each backend keeps data.
//! - `[notify]` lists channels to announce new listings to.
//! - `[schedule]` sets how often the feed is checked.
//!
//! Every field has a default, so a missing section or field simply takes
//! the default value. Path fields go through shell expansion, so they may
//! refer to `~` and environment variables.

use crate::{path, store::StorageMode};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Feed repository tracked by default.
pub const DEFAULT_FEED_URL: &str = "https://github.com/SimplifyJobs/Summer2026-Internships.git";

/// Full configuration layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub repository: RepositoryConfig,
    pub storage: StorageConfig,
    pub notify: NotifyConfig,
    pub schedule: ScheduleConfig,
}

impl Config {
    /// Load configuration file.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file cannot be read.
    /// - Return any parse or validation error of [`Config::from_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        fs::read_to_string(path)
            .map_err(|source| ConfigError::Read {
                source,
                path: path.into(),
            })?
            .parse()
    }

    /// Check every value is in its allowed range.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Invalid`] for the first out of range value.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (
                "repository.url",
                !self.repository.url.trim().is_empty(),
                "must not be empty",
            ),
            (
                "repository.fetch_timeout_secs",
                self.repository.fetch_timeout_secs >= 1,
                "must be at least 1",
            ),
            (
                "notify.max_post_age_days",
                (1..=30).contains(&self.notify.max_post_age_days),
                "must be between 1 and 30",
            ),
            (
                "notify.max_retries",
                (1..=10).contains(&self.notify.max_retries),
                "must be between 1 and 10",
            ),
            (
                "notify.concurrency",
                self.notify.concurrency >= 1,
                "must be at least 1",
            ),
            (
                "schedule.check_interval_minutes",
                (1..=60).contains(&self.schedule.check_interval_minutes),
                "must be between 1 and 60",
            ),
        ];

        for (field, valid, reason) in checks {
            if !valid {
                return Err(ConfigError::Invalid {
                    field,
                    reason: reason.into(),
                });
            }
        }

        Ok(())
    }

    fn expand_paths(&mut self) -> Result<()> {
        let paths = [
            &mut self.repository.local_path,
            &mut self.storage.data_file,
            &mut self.storage.messages_file,
            &mut self.storage.database_path,
            &mut self.storage.head_file,
        ];

        for path in paths {
            *path = PathBuf::from(
                shellexpand::full(path.to_string_lossy().as_ref())
                    .map_err(ConfigError::ShellExpansion)?
                    .into_owned(),
            );
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        config.expand_paths()?;
        config.validate()?;

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Feed repository settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Remote URL of feed repository.
    pub url: String,

    /// Where to keep the local mirror.
    pub local_path: PathBuf,

    /// Path of listings document inside the repository.
    pub listings_path: PathBuf,

    /// Branch to track, remote default branch if unset.
    pub branch: Option<String>,

    pub fetch_timeout_secs: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.into(),
            local_path: data_path("feed.git"),
            listings_path: PathBuf::from(".github/scripts/listings.json"),
            branch: None,
            fetch_timeout_secs: 120,
        }
    }
}

/// Storage settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: StorageMode,

    /// Listings document of file backend.
    pub data_file: PathBuf,

    /// Tracking document of file backend.
    pub messages_file: PathBuf,

    /// Database of relational backend.
    pub database_path: PathBuf,

    /// Marker of last fully processed feed revision.
    pub head_file: PathBuf,

    pub busy_timeout_ms: u64,

    /// Backups kept per document of file backend.
    pub keep_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::default(),
            data_file: data_path("listings.json"),
            messages_file: data_path("messages.json"),
            database_path: data_path("jobwatch.db"),
            head_file: data_path("HEAD"),
            busy_timeout_ms: 5000,
            keep_backups: crate::store::file::DEFAULT_KEEP_BACKUPS,
        }
    }
}

/// Notification settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Channels to announce new listings to.
    pub channels: Vec<String>,

    /// Oldest posting age still worth announcing.
    pub max_post_age_days: u32,

    /// Consecutive failures before a channel is dropped.
    pub max_retries: u32,

    /// Channels notified at once per listing.
    pub concurrency: usize,

    /// Term left out of announcements because nearly every listing has it.
    pub default_term: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            max_post_age_days: 5,
            max_retries: 3,
            concurrency: 4,
            default_term: Some("Summer 2026".into()),
        }
    }
}

/// Schedule settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub check_interval_minutes: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_interval_minutes: 1,
        }
    }
}

fn data_path(name: &str) -> PathBuf {
    path::default_data_dir()
        .unwrap_or_else(|_| PathBuf::from("jobwatch"))
        .join(name)
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Configuration value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("JOBWATCH_HOME", "/srv/jobwatch")])]
    fn deserialize_config() -> anyhow::Result<()> {
        let result: Config = r#"
            [repository]
            url = "https://blah.org/listings.git"
            local_path = "$JOBWATCH_HOME/feed.git"
            branch = "dev"

            [storage]
            mode = "dual_write"
            data_file = "$JOBWATCH_HOME/listings.json"
            messages_file = "$JOBWATCH_HOME/messages.json"
            database_path = "$JOBWATCH_HOME/jobwatch.db"
            head_file = "$JOBWATCH_HOME/HEAD"

            [notify]
            channels = ["1234", "5678"]
            max_post_age_days = 7
        "#
        .parse()?;

        let expect = Config {
            repository: RepositoryConfig {
                url: "https://blah.org/listings.git".into(),
                local_path: "/srv/jobwatch/feed.git".into(),
                branch: Some("dev".into()),
                ..Default::default()
            },
            storage: StorageConfig {
                mode: StorageMode::DualWrite,
                data_file: "/srv/jobwatch/listings.json".into(),
                messages_file: "/srv/jobwatch/messages.json".into(),
                database_path: "/srv/jobwatch/jobwatch.db".into(),
                head_file: "/srv/jobwatch/HEAD".into(),
                ..Default::default()
            },
            notify: NotifyConfig {
                channels: vec!["1234".into(), "5678".into()],
                max_post_age_days: 7,
                ..Default::default()
            },
            schedule: ScheduleConfig::default(),
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn serialize_config() {
        let result = Config {
            repository: RepositoryConfig {
                url: "https://blah.org/listings.git".into(),
                local_path: "/srv/jobwatch/feed.git".into(),
                listings_path: "listings.json".into(),
                branch: None,
                fetch_timeout_secs: 60,
            },
            storage: StorageConfig {
                mode: StorageMode::FileOnly,
                data_file: "/srv/jobwatch/listings.json".into(),
                messages_file: "/srv/jobwatch/messages.json".into(),
                database_path: "/srv/jobwatch/jobwatch.db".into(),
                head_file: "/srv/jobwatch/HEAD".into(),
                busy_timeout_ms: 5000,
                keep_backups: 5,
            },
            notify: NotifyConfig {
                channels: vec!["1234".into(), "5678".into()],
                max_post_age_days: 5,
                max_retries: 3,
                concurrency: 4,
                default_term: None,
            },
            schedule: ScheduleConfig {
                check_interval_minutes: 2,
            },
        }
        .to_string();

        let expect = indoc! {r#"
            [repository]
            url = "https://blah.org/listings.git"
            local_path = "/srv/jobwatch/feed.git"
            listings_path = "listings.json"
            fetch_timeout_secs = 60

            [storage]
            mode = "file_only"
            data_file = "/srv/jobwatch/listings.json"
            messages_file = "/srv/jobwatch/messages.json"
            database_path = "/srv/jobwatch/jobwatch.db"
            head_file = "/srv/jobwatch/HEAD"
            busy_timeout_ms = 5000
            keep_backups = 5

            [notify]
            channels = [
                "1234",
                "5678",
            ]
            max_post_age_days = 5
            max_retries = 3
            concurrency = 4

            [schedule]
            check_interval_minutes = 2
        "#};

        assert_eq!(result, expect);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let result = "[notify]\nmax_post_age_days = 31\n".parse::<Config>();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { field: "notify.max_post_age_days", .. })
        ));

        let result = "[schedule]\ncheck_interval_minutes = 0\n".parse::<Config>();
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { field: "schedule.check_interval_minutes", .. })
        ));

        let result = "[storage]\nmode = \"postgres\"\n".parse::<Config>();
        assert!(matches!(result, Err(ConfigError::Deserialize(_))));
    }
}
