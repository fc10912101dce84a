// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Relational schema migrations.
//!
//! Migrations run in order and are tracked in the `migrations` table, so
//! opening an existing database only applies what it is missing.

use crate::store::Result;

use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version = current_version(conn);
    debug!(current_version, target_version = CURRENT_VERSION, "running migrations");

    if current_version < 1 {
        migrate_v1_initial_schema(conn)?;
    }
    if current_version < 2 {
        migrate_v2_message_lookup(conn)?;
    }

    if current_version < CURRENT_VERSION {
        info!("database schema migrated to version {CURRENT_VERSION}");
    }

    Ok(())
}

/// Highest applied schema version, zero for a fresh database.
pub fn current_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM migrations", [], |row| {
        row.get(0)
    })
    .unwrap_or(0)
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "migration applied");
    Ok(())
}

/// V1: listings with child tables for locations, terms, and message tracking.
fn migrate_v1_initial_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS job_postings (
            id TEXT PRIMARY KEY,
            position INTEGER NOT NULL,
            date_updated INTEGER NOT NULL,
            url TEXT NOT NULL,
            company_name TEXT NOT NULL,
            title TEXT NOT NULL,
            sponsorship TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            source TEXT,
            date_posted INTEGER,
            company_url TEXT,
            is_visible INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS job_locations (
            id TEXT NOT NULL REFERENCES job_postings(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            location TEXT NOT NULL,
            PRIMARY KEY (id, location)
        );

        CREATE TABLE IF NOT EXISTS job_terms (
            id TEXT NOT NULL REFERENCES job_postings(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            term TEXT NOT NULL,
            PRIMARY KEY (id, term)
        );

        CREATE TABLE IF NOT EXISTS message_tracking (
            id TEXT NOT NULL REFERENCES job_postings(id) ON DELETE CASCADE,
            channel_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            posted_at INTEGER NOT NULL,
            PRIMARY KEY (id, channel_id)
        );

        CREATE INDEX IF NOT EXISTS idx_job_postings_position ON job_postings(position);
        CREATE INDEX IF NOT EXISTS idx_job_postings_url ON job_postings(url);
        CREATE INDEX IF NOT EXISTS idx_job_postings_date_posted ON job_postings(date_posted);
        "#,
    )?;

    record_migration(conn, 1, "initial_schema")
}

/// V2: reverse lookup from delivered message to listing.
fn migrate_v2_message_lookup(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_message_tracking_message_id
            ON message_tracking(message_id);",
    )?;

    record_migration(conn, 2, "message_lookup")
}
