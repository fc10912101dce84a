// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Relational storage backend on SQLite.
//!
//! Listings are stored one row each in `job_postings`, with their locations
//! and terms in child tables, and their delivered notifications in
//! `message_tracking`. Child rows cascade with their listing.
//!
//! Every multi-statement write runs in one transaction. Replacing the full
//! snapshot keeps the tracking rows of listings that survive the
//! replacement, so a snapshot save never silently forgets which messages
//! were already posted.

use crate::{
    listing::{Field, FieldMap, Listing, ListingId, Snapshot, TrackingEntry, TrackingMap},
    store::{schema, Result, SnapshotStore, StoreError},
};

use chrono::Utc;
use rusqlite::{
    params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension, Row,
};
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tracing::{debug, warn};

const LISTING_COLUMNS: &str = "id, title, company_name, url, company_url, sponsorship, \
     source, date_posted, date_updated, active, is_visible";

/// SQLite storage.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create database at given path.
    ///
    /// Pending schema migrations are applied.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Io`] if the parent directory cannot be created.
    /// - Return [`StoreError::Sqlite`] if the database cannot be opened or
    ///   migrated.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            mkdirp::mkdirp(parent).map_err(|source| StoreError::Io {
                action: "create directory",
                path: parent.into(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::run_migrations(&conn)?;
        debug!("opened database {:?}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a fresh in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Count stored listings and tracking entries.
    pub fn counts(&self) -> Result<(usize, usize)> {
        let conn = self.connection()?;
        let listings: i64 =
            conn.query_row("SELECT COUNT(*) FROM job_postings", [], |row| row.get(0))?;
        let tracking: i64 =
            conn.query_row("SELECT COUNT(*) FROM message_tracking", [], |row| row.get(0))?;

        Ok((
            usize::try_from(listings).unwrap_or_default(),
            usize::try_from(tracking).unwrap_or_default(),
        ))
    }

    /// Check if a listing with given URL is stored.
    pub fn url_exists(&self, url: &str) -> Result<bool> {
        let conn = self.connection()?;
        let found = conn
            .query_row("SELECT 1 FROM job_postings WHERE url = ?1", [url], |_| Ok(()))
            .optional()?;

        Ok(found.is_some())
    }

    /// Append one listing after every stored listing.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Sqlite`] if identifier is already taken.
    pub fn insert_listing(&self, listing: &Listing) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM job_postings",
            [],
            |row| row.get(0),
        )?;
        insert_listing(&tx, listing, position)?;
        tx.commit()?;

        Ok(())
    }

    /// Insert one tracking entry as-is, keeping its delivery time.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::NotFound`] if the listing is not stored.
    pub fn insert_tracking(&self, id: &ListingId, entry: &TrackingEntry) -> Result<()> {
        let conn = self.connection()?;
        if !listing_exists(&conn, id)? {
            return Err(StoreError::NotFound(id.clone()));
        }
        upsert_tracking(&conn, id, entry)
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::BackendUnavailable("database connection lock poisoned".into()))
    }
}

impl SnapshotStore for SqliteStore {
    fn get_listings(&self) -> Result<Snapshot> {
        let conn = self.connection()?;
        let mut locations = child_values(
            &conn,
            "SELECT id, location FROM job_locations ORDER BY id, position",
        )?;
        let mut terms =
            child_values(&conn, "SELECT id, term FROM job_terms ORDER BY id, position")?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {LISTING_COLUMNS} FROM job_postings ORDER BY position"
        ))?;
        let listings = stmt
            .query_map([], listing_from_row)?
            .map(|row| {
                let mut listing = row?;
                listing.locations = locations.remove(listing.id.as_str()).unwrap_or_default();
                listing.terms = terms.remove(listing.id.as_str()).unwrap_or_default();
                Ok(listing)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Snapshot::new(listings))
    }

    fn save_listings(&self, snapshot: &Snapshot) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let tracking = all_tracking(&tx)?;
        tx.execute("DELETE FROM job_postings", [])?;
        for (position, listing) in snapshot.iter().enumerate() {
            insert_listing(&tx, listing, i64::try_from(position).unwrap_or(i64::MAX))?;
        }

        // INVARIANT: Tracking of listings that survive the replacement is kept.
        let survivors: HashSet<&ListingId> = snapshot.iter().map(|listing| &listing.id).collect();
        for (id, entries) in &tracking {
            if survivors.contains(id) {
                for entry in entries {
                    upsert_tracking(&tx, id, entry)?;
                }
            }
        }

        tx.commit()?;
        debug!("saved {} listings", snapshot.len());

        Ok(())
    }

    fn get_listing(&self, id: &ListingId) -> Result<Listing> {
        let conn = self.connection()?;
        load_listing(&conn, id)
    }

    fn update_listing(&self, id: &ListingId, fields: &FieldMap) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let mut listing = load_listing(&tx, id)?;
        listing.apply_fields(fields)?;

        let scalars: Vec<Field> = fields
            .keys()
            .copied()
            .filter(|field| !matches!(field, Field::Locations | Field::Terms))
            .collect();
        if !scalars.is_empty() {
            let assignments: Vec<String> = scalars
                .iter()
                .enumerate()
                .map(|(index, field)| format!("{field} = ?{}", index + 2))
                .collect();
            let mut values = vec![SqlValue::Text(id.to_string())];
            values.extend(scalars.iter().map(|field| column_value(&listing, *field)));

            tx.execute(
                &format!("UPDATE job_postings SET {} WHERE id = ?1", assignments.join(", ")),
                params_from_iter(values),
            )?;
        }

        if fields.contains_key(&Field::Locations) {
            tx.execute("DELETE FROM job_locations WHERE id = ?1", [id.as_str()])?;
            insert_children(&tx, "job_locations", "location", id, &listing.locations)?;
        }
        if fields.contains_key(&Field::Terms) {
            tx.execute("DELETE FROM job_terms WHERE id = ?1", [id.as_str()])?;
            insert_children(&tx, "job_terms", "term", id, &listing.terms)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn get_message_tracking(&self) -> Result<TrackingMap> {
        let conn = self.connection()?;
        Ok(all_tracking(&conn)?.into_iter().collect())
    }

    fn save_message_tracking(&self, tracking: &TrackingMap) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM message_tracking", [])?;

        for (id, entries) in tracking {
            if !listing_exists(&tx, id)? {
                warn!("dropping tracking of unknown listing {id}");
                continue;
            }
            for entry in entries {
                upsert_tracking(&tx, id, entry)?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn add_message_tracking(
        &self,
        id: &ListingId,
        message_id: &str,
        channel_id: &str,
    ) -> Result<()> {
        self.insert_tracking(
            id,
            &TrackingEntry {
                message_id: message_id.into(),
                channel_id: channel_id.into(),
                posted_at: Utc::now().timestamp(),
            },
        )
    }

    fn health_check(&self) -> bool {
        let probe = || -> Result<()> {
            let conn = self.connection()?;
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            conn.execute_batch("BEGIN IMMEDIATE; ROLLBACK;")?;
            Ok(())
        };

        match probe() {
            Ok(()) => true,
            Err(error) => {
                warn!("database health check failed: {error}");
                false
            }
        }
    }

    fn find_listing_by_message_id(&self, message_id: &str) -> Result<Listing> {
        let conn = self.connection()?;
        let id: String = conn
            .query_row(
                "SELECT id FROM message_tracking WHERE message_id = ?1",
                [message_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::UnknownMessage(message_id.to_string()))?;

        load_listing(&conn, &ListingId::new(id))
    }
}

fn listing_from_row(row: &Row<'_>) -> rusqlite::Result<Listing> {
    Ok(Listing {
        id: ListingId::new(row.get::<_, String>(0)?),
        title: row.get(1)?,
        company_name: row.get(2)?,
        url: row.get(3)?,
        company_url: row.get(4)?,
        sponsorship: row.get(5)?,
        source: row.get(6)?,
        date_posted: row.get(7)?,
        date_updated: row.get(8)?,
        active: row.get(9)?,
        is_visible: row.get(10)?,
        locations: Vec::new(),
        terms: Vec::new(),
    })
}

fn load_listing(conn: &Connection, id: &ListingId) -> Result<Listing> {
    let mut listing = conn
        .query_row(
            &format!("SELECT {LISTING_COLUMNS} FROM job_postings WHERE id = ?1"),
            [id.as_str()],
            listing_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(id.clone()))?;

    let mut stmt =
        conn.prepare("SELECT location FROM job_locations WHERE id = ?1 ORDER BY position")?;
    listing.locations = stmt
        .query_map([id.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let mut stmt = conn.prepare("SELECT term FROM job_terms WHERE id = ?1 ORDER BY position")?;
    listing.terms = stmt
        .query_map([id.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    Ok(listing)
}

fn insert_listing(conn: &Connection, listing: &Listing, position: i64) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO job_postings ({LISTING_COLUMNS}, position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
            listing.id.as_str(),
            listing.title,
            listing.company_name,
            listing.url,
            listing.company_url,
            listing.sponsorship,
            listing.source,
            listing.date_posted,
            listing.date_updated,
            listing.active,
            listing.is_visible,
            position,
        ],
    )?;

    insert_children(conn, "job_locations", "location", &listing.id, &listing.locations)?;
    insert_children(conn, "job_terms", "term", &listing.id, &listing.terms)
}

fn insert_children(
    conn: &Connection,
    table: &str,
    column: &str,
    id: &ListingId,
    values: &[String],
) -> Result<()> {
    let mut stmt = conn.prepare(&format!(
        "INSERT OR IGNORE INTO {table} (id, {column}, position) VALUES (?1, ?2, ?3)"
    ))?;
    for (position, value) in values.iter().enumerate() {
        stmt.execute(params![id.as_str(), value, i64::try_from(position).unwrap_or(i64::MAX)])?;
    }

    Ok(())
}

fn child_values(conn: &Connection, query: &str) -> Result<HashMap<String, Vec<String>>> {
    let mut values: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = conn.prepare(query)?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (id, value) = row?;
        values.entry(id).or_default().push(value);
    }

    Ok(values)
}

fn all_tracking(conn: &Connection) -> Result<Vec<(ListingId, Vec<TrackingEntry>)>> {
    let mut stmt = conn.prepare(
        "SELECT id, message_id, channel_id, posted_at FROM message_tracking
         ORDER BY id, posted_at, channel_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            TrackingEntry {
                message_id: row.get(1)?,
                channel_id: row.get(2)?,
                posted_at: row.get(3)?,
            },
        ))
    })?;

    let mut tracking: Vec<(ListingId, Vec<TrackingEntry>)> = Vec::new();
    for row in rows {
        let (id, entry) = row?;
        match tracking.last_mut() {
            Some((last, entries)) if last.as_str() == id => entries.push(entry),
            _ => tracking.push((ListingId::new(id), vec![entry])),
        }
    }

    Ok(tracking)
}

fn listing_exists(conn: &Connection, id: &ListingId) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM job_postings WHERE id = ?1", [id.as_str()], |_| Ok(()))
        .optional()?;

    Ok(found.is_some())
}

fn upsert_tracking(conn: &Connection, id: &ListingId, entry: &TrackingEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO message_tracking (id, channel_id, message_id, posted_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (id, channel_id) DO UPDATE SET
            message_id = excluded.message_id,
            posted_at = excluded.posted_at",
        params![id.as_str(), entry.channel_id, entry.message_id, entry.posted_at],
    )?;

    Ok(())
}

fn column_value(listing: &Listing, field: Field) -> SqlValue {
    let text = |value: &Option<String>| value.clone().map_or(SqlValue::Null, SqlValue::Text);

    match field {
        Field::Url => SqlValue::Text(listing.url.clone()),
        Field::CompanyName => SqlValue::Text(listing.company_name.clone()),
        Field::Title => SqlValue::Text(listing.title.clone()),
        Field::Sponsorship => text(&listing.sponsorship),
        Field::Source => text(&listing.source),
        Field::CompanyUrl => text(&listing.company_url),
        Field::DatePosted => listing.date_posted.map_or(SqlValue::Null, SqlValue::Integer),
        Field::DateUpdated => SqlValue::Integer(listing.date_updated),
        Field::Active => SqlValue::Integer(i64::from(listing.active)),
        Field::IsVisible => SqlValue::Integer(i64::from(listing.is_visible)),
        Field::Locations | Field::Terms => SqlValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::sample;
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn save_listings_round_trips_snapshot_order() -> Result<()> {
        let store = SqliteStore::open_in_memory()?;
        let mut b = sample("b", 200);
        b.locations = vec!["Remote".into(), "Austin, TX".into(), "NYC".into()];
        b.sponsorship = None;
        let snapshot = Snapshot::new(vec![b, sample("a", 100), sample("c", 300)]);

        store.save_listings(&snapshot)?;

        assert_eq!(store.get_listings()?, snapshot);
        assert_eq!(store.get_listing(&ListingId::new("b"))?, snapshot.as_slice()[0]);

        Ok(())
    }

    #[test]
    fn save_listings_keeps_tracking_of_surviving_listings() -> Result<()> {
        let store = SqliteStore::open_in_memory()?;
        store.save_listings(&Snapshot::new(vec![sample("a", 100), sample("b", 100)]))?;
        store.add_message_tracking(&ListingId::new("a"), "m1", "c1")?;
        store.add_message_tracking(&ListingId::new("b"), "m2", "c1")?;

        store.save_listings(&Snapshot::new(vec![sample("a", 100), sample("c", 100)]))?;

        let tracking = store.get_message_tracking()?;
        assert_eq!(tracking.len(), 1);
        assert_eq!(tracking[&ListingId::new("a")][0].message_id, "m1");
        assert_eq!(store.counts()?, (2, 1));

        Ok(())
    }

    #[test]
    fn update_listing_patches_given_fields_only() -> Result<()> {
        let store = SqliteStore::open_in_memory()?;
        store.save_listings(&Snapshot::new(vec![sample("a", 100)]))?;
        let id = ListingId::new("a");

        store.update_listing(
            &id,
            &FieldMap::from([
                (Field::IsVisible, json!(false)),
                (Field::Terms, json!(["Fall 2026", "Summer 2026"])),
            ]),
        )?;

        let mut expect = sample("a", 100);
        expect.is_visible = false;
        expect.terms = vec!["Fall 2026".into(), "Summer 2026".into()];
        assert_eq!(store.get_listing(&id)?, expect);

        let missing = store.update_listing(
            &ListingId::new("zzz"),
            &FieldMap::from([(Field::Active, json!(false))]),
        );
        assert!(matches!(missing, Err(StoreError::NotFound(_))));

        let wrong = store.update_listing(&id, &FieldMap::from([(Field::Active, json!("no"))]));
        assert!(matches!(wrong, Err(StoreError::Validation(_))));
        assert_eq!(store.get_listing(&id)?, expect);

        Ok(())
    }

    #[test]
    fn tracking_requires_existing_listing() -> Result<()> {
        let store = SqliteStore::open_in_memory()?;
        store.save_listings(&Snapshot::new(vec![sample("a", 100)]))?;

        let result = store.add_message_tracking(&ListingId::new("ghost"), "m1", "c1");
        assert!(matches!(result, Err(StoreError::NotFound(_))));

        store.save_message_tracking(&TrackingMap::from([
            (
                ListingId::new("a"),
                vec![TrackingEntry {
                    message_id: "m7".into(),
                    channel_id: "c1".into(),
                    posted_at: 5,
                }],
            ),
            (
                ListingId::new("ghost"),
                vec![TrackingEntry {
                    message_id: "m8".into(),
                    channel_id: "c1".into(),
                    posted_at: 5,
                }],
            ),
        ]))?;

        assert_eq!(store.counts()?, (1, 1));
        assert_eq!(store.find_listing_by_message_id("m7")?, sample("a", 100));
        assert!(matches!(
            store.find_listing_by_message_id("m8"),
            Err(StoreError::UnknownMessage(_))
        ));

        Ok(())
    }

    #[test]
    fn open_creates_database_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/jobwatch.db");

        let store = SqliteStore::open(&path, Duration::from_millis(500))?;

        assert!(path.exists());
        assert!(store.health_check());
        assert!(!store.url_exists("https://jobs.example.com/a")?);
        store.insert_listing(&sample("a", 100))?;
        store.insert_listing(&sample("b", 100))?;
        assert!(store.url_exists("https://jobs.example.com/a")?);
        let ids: Vec<String> = store.get_listings()?.iter().map(|l| l.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        Ok(())
    }
}
