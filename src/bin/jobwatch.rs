// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use jobwatch::{
    config::Config,
    migrate::{migrate, MigrationOptions},
    notify::{format_details, Dispatcher, LogSink},
    path::default_config_file,
    pipeline::{log_report, read_head},
    repo::FeedRepository,
    store::{open_storage, FileStore, SnapshotStore, SqliteStore},
    Watcher,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::{fs, path::PathBuf, process::exit, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "jobwatch [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        match self.command {
            Command::Init(opts) => run_init(self.config, opts),
            Command::Run => run_watch(load_config(self.config)?).await,
            Command::Check => run_check(load_config(self.config)?).await,
            Command::Status(opts) => run_status(load_config(self.config)?, opts),
            Command::Lookup(opts) => run_lookup(load_config(self.config)?, opts),
            Command::Migrate(opts) => run_migrate(load_config(self.config)?, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Write default configuration file.
    #[command(override_usage = "jobwatch init [options]")]
    Init(InitOptions),

    /// Check feed periodically until interrupted.
    #[command(override_usage = "jobwatch run [options]")]
    Run,

    /// Run a single check of the feed.
    #[command(override_usage = "jobwatch check [options]")]
    Check,

    /// Show storage status.
    #[command(override_usage = "jobwatch status [options]")]
    Status(StatusOptions),

    /// Find listing a notification was posted for.
    #[command(override_usage = "jobwatch lookup [options] <message_id>")]
    Lookup(LookupOptions),

    /// Copy file storage into the database.
    #[command(override_usage = "jobwatch migrate [options]")]
    Migrate(MigrateOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Overwrite existing configuration file.
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct StatusOptions {
    /// Probe health of every active backend.
    #[arg(long)]
    pub health: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct LookupOptions {
    /// Message identifier to look up.
    #[arg(required = true, value_name = "message_id")]
    pub message_id: String,

    /// Print listing as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct MigrateOptions {
    /// Validate and report only, write nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Skip backing up file storage first.
    #[arg(long)]
    pub no_backup: bool,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    if let Some(path) = path {
        return Ok(Config::load(path)?);
    }

    let path = default_config_file()?;
    if path.exists() {
        return Ok(Config::load(path)?);
    }

    info!("no configuration at {:?}, using defaults", path.display());
    Ok(Config::default())
}

fn run_init(path: Option<PathBuf>, opts: InitOptions) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => default_config_file()?,
    };

    if path.exists() && !opts.force {
        bail!("configuration already exists at {:?}, use --force to overwrite", path.display());
    }

    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        mkdirp::mkdirp(parent)
            .with_context(|| format!("failed to create {:?}", parent.display()))?;
    }
    fs::write(&path, Config::default().to_string())
        .with_context(|| format!("failed to write {:?}", path.display()))?;
    info!("wrote default configuration to {:?}", path.display());

    Ok(())
}

fn watcher(config: &Config) -> Result<Watcher<FeedRepository, LogSink>> {
    let storage = open_storage(&config.storage)?;
    if let Some(fallback) = storage.fallback() {
        warn!(
            "requested {} storage, running file_only: {}",
            fallback.requested, fallback.reason
        );
    }

    let sink = LogSink::new(config.notify.default_term.clone());
    Ok(Watcher::new(
        FeedRepository::new(&config.repository),
        Arc::new(storage),
        Dispatcher::new(sink, &config.notify),
        &config.storage.head_file,
        Duration::from_secs(config.repository.fetch_timeout_secs),
    ))
}

async fn run_watch(config: Config) -> Result<()> {
    let mut watcher = watcher(&config)?;
    let period = Duration::from_secs(config.schedule.check_interval_minutes * 60);
    info!("checking {} every {period:?}", config.repository.url);
    watcher.run(period).await;

    Ok(())
}

async fn run_check(config: Config) -> Result<()> {
    let mut watcher = watcher(&config)?;
    let report = watcher.run_cycle().await?;
    log_report(&report);

    if !report.is_complete() {
        bail!("check finished with {} failed listings", report.failures.len());
    }

    Ok(())
}

fn run_status(config: Config, opts: StatusOptions) -> Result<()> {
    let storage = open_storage(&config.storage)?;
    let listings = storage.get_listings()?;
    let tracking = storage.get_message_tracking()?;

    println!("storage mode: {}", storage.mode());
    if let Some(fallback) = storage.fallback() {
        println!("requested mode: {} ({})", fallback.requested, fallback.reason);
    }
    println!("listings: {}", listings.len());
    println!("tracked listings: {}", tracking.len());
    println!(
        "last processed revision: {}",
        read_head(&config.storage.head_file).unwrap_or_else(|| "none".into())
    );

    let file = storage.file_backend();
    for document in [file.data_file(), file.messages_file()] {
        let backups = file.backups(document)?;
        match backups.last() {
            Some(latest) => println!(
                "backups of {}: {} (latest {})",
                document.display(),
                backups.len(),
                latest.display()
            ),
            None => println!("backups of {}: 0", document.display()),
        }
    }

    if opts.health {
        let health = storage.backend_health();
        let describe = |healthy: Option<bool>| match healthy {
            Some(true) => "healthy",
            Some(false) => "unhealthy",
            None => "inactive",
        };
        println!("file backend: {}", describe(health.file));
        println!("relational backend: {}", describe(health.relational));
    }

    Ok(())
}

fn run_lookup(config: Config, opts: LookupOptions) -> Result<()> {
    let storage = open_storage(&config.storage)?;
    let listing = storage.find_listing_by_message_id(&opts.message_id)?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        println!("{}", format_details(&listing));
    }

    Ok(())
}

fn run_migrate(config: Config, opts: MigrateOptions) -> Result<()> {
    let source = FileStore::open(&config.storage.data_file, &config.storage.messages_file)?
        .with_backup_limit(config.storage.keep_backups);
    let target = SqliteStore::open(
        &config.storage.database_path,
        Duration::from_millis(config.storage.busy_timeout_ms),
    )?;

    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}] {pos}/{len}",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(100));

    let options = MigrationOptions {
        dry_run: opts.dry_run,
        backup: !opts.no_backup,
    };
    let report = migrate(&source, &target, options, &bar)?;
    bar.finish_and_clear();

    println!(
        "listings: {} migrated, {} skipped, {} failed of {}",
        report.listings_migrated, report.listings_skipped, report.listings_failed, report.listings_total
    );
    println!(
        "tracking: {} migrated, {} failed of {}",
        report.tracking_migrated, report.tracking_failed, report.tracking_total
    );
    for backup in &report.backups {
        println!("backup: {}", backup.display());
    }

    if !report.is_success() {
        bail!("migration incomplete, see warnings above");
    }

    Ok(())
}
