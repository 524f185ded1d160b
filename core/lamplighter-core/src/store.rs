//! SQLite persistence for presence state and heartbeats.
//!
//! The engine is the single writer of `presence_state`; the heartbeat
//! receiver is the single writer of `heartbeats`. Every access opens its own
//! connection so the two writers never share a handle, and per-alias
//! read-modify-write goes through an immediate transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::thread;

use crate::backoff::RetryPolicy;
use crate::error::{LamplighterError, Result};
use crate::presence::{Presence, PresenceRecord};

#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    retry: RetryPolicy,
}

impl Store {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_retry(path, RetryPolicy::default())
    }

    pub fn open_with_retry(path: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self> {
        let store = Self {
            path: path.into(),
            retry,
        };
        store
            .init_schema()
            .map_err(|err| LamplighterError::store("initialize schema", err))?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, alias: &str) -> Result<Option<PresenceRecord>> {
        self.with_connection(|conn| query_record(conn, alias))
            .map_err(|err| LamplighterError::store("read presence state", err))
    }

    /// Unconditional upsert ("create on first write"). Returns the committed
    /// timestamp.
    pub fn set(&self, alias: &str, state: Presence) -> Result<DateTime<Utc>> {
        self.set_at(alias, state, Utc::now())
    }

    pub fn set_at(&self, alias: &str, state: Presence, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO presence_state (alias, state, updated_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(alias) DO UPDATE SET \
                    state = excluded.state, \
                    updated_at = excluded.updated_at",
                params![alias, state.as_str(), at.to_rfc3339()],
            )
            .map_err(|err| format!("Failed to upsert presence state: {}", err))?;
            Ok(at)
        })
        .map_err(|err| LamplighterError::store("write presence state", err))
    }

    /// Compare-and-set for one alias: writes `next` only when the stored
    /// state still equals `expected` (`None` = no row yet). Returns the
    /// committed timestamp, or `None` when another writer got there first.
    pub fn transition(
        &self,
        alias: &str,
        expected: Option<Presence>,
        next: Presence,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| format!("Failed to begin transaction: {}", err))?;

            let current = query_record(&tx, alias)?.map(|record| record.state);
            if current != expected {
                return Ok(None);
            }

            tx.execute(
                "INSERT INTO presence_state (alias, state, updated_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(alias) DO UPDATE SET \
                    state = excluded.state, \
                    updated_at = excluded.updated_at",
                params![alias, next.as_str(), at.to_rfc3339()],
            )
            .map_err(|err| format!("Failed to write presence transition: {}", err))?;
            tx.commit()
                .map_err(|err| format!("Failed to commit presence transition: {}", err))?;
            Ok(Some(at))
        })
        .map_err(|err| LamplighterError::store("commit presence transition", err))
    }

    /// Records for the given aliases only, ordered by alias. Rows for
    /// aliases no longer configured are ignored.
    pub fn get_all(&self, aliases: &[String]) -> Result<Vec<PresenceRecord>> {
        if aliases.is_empty() {
            return Ok(Vec::new());
        }
        self.with_connection(|conn| {
            let placeholders: Vec<String> = (1..=aliases.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT alias, state, updated_at FROM presence_state \
                 WHERE alias IN ({}) ORDER BY alias ASC",
                placeholders.join(", ")
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|err| format!("Failed to prepare presence query: {}", err))?;
            let params: Vec<&dyn rusqlite::types::ToSql> = aliases
                .iter()
                .map(|alias| alias as &dyn rusqlite::types::ToSql)
                .collect();
            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|err| format!("Failed to query presence rows: {}", err))?;

            let mut records = Vec::new();
            for row in rows {
                let raw = row.map_err(|err| format!("Failed to decode presence row: {}", err))?;
                records.push(decode_record(raw)?);
            }
            Ok(records)
        })
        .map_err(|err| LamplighterError::store("list presence state", err))
    }

    pub fn record_heartbeat(&self, alias: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO heartbeats (alias, last_seen_at) VALUES (?1, ?2) \
                 ON CONFLICT(alias) DO UPDATE SET last_seen_at = excluded.last_seen_at",
                params![alias, at.to_rfc3339()],
            )
            .map_err(|err| format!("Failed to record heartbeat: {}", err))?;
            Ok(())
        })
        .map_err(|err| LamplighterError::store("record heartbeat", err))
    }

    pub fn last_seen(&self, alias: &str) -> Result<Option<DateTime<Utc>>> {
        self.with_connection(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT last_seen_at FROM heartbeats WHERE alias = ?1",
                    params![alias],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| format!("Failed to query heartbeat: {}", err))?;
            Ok(raw.and_then(parse_rfc3339))
        })
        .map_err(|err| LamplighterError::store("read heartbeat", err))
    }

    pub fn last_seen_all(&self, aliases: &[String]) -> Result<HashMap<String, DateTime<Utc>>> {
        let mut seen = HashMap::new();
        for alias in aliases {
            if let Some(at) = self.last_seen(alias)? {
                seen.insert(alias.clone(), at);
            }
        }
        Ok(seen)
    }

    fn init_schema(&self) -> std::result::Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS presence_state (
                    alias TEXT PRIMARY KEY,
                    state TEXT NOT NULL CHECK (state IN ('home', 'away')),
                    updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS heartbeats (
                    alias TEXT PRIMARY KEY,
                    last_seen_at TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))?;
            import_legacy_state(conn)?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> std::result::Result<T, String>,
    ) -> std::result::Result<T, String> {
        self.retry.run(thread::sleep, |attempt| {
            let result = self.open_connection().and_then(|mut conn| op(&mut conn));
            if let Err(err) = &result {
                tracing::debug!(attempt, error = %err, path = %self.path.display(), "State store access failed");
            }
            result
        })
    }

    fn open_connection(&self) -> std::result::Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create state dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

fn query_record(conn: &Connection, alias: &str) -> std::result::Result<Option<PresenceRecord>, String> {
    let raw = conn
        .query_row(
            "SELECT alias, state, updated_at FROM presence_state WHERE alias = ?1",
            params![alias],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()
        .map_err(|err| format!("Failed to query presence state: {}", err))?;
    raw.map(decode_record).transpose()
}

fn decode_record(
    (alias, state_raw, updated_raw): (String, String, String),
) -> std::result::Result<PresenceRecord, String> {
    let state = Presence::from_str(&state_raw)
        .ok_or_else(|| format!("Unknown presence state for {}: {}", alias, state_raw))?;
    let updated_at = parse_rfc3339(updated_raw)
        .ok_or_else(|| format!("Invalid updated_at timestamp for {}", alias))?;
    Ok(PresenceRecord {
        alias,
        state,
        updated_at,
    })
}

/// Older installs kept a `state(who, state, updated)` table with epoch
/// seconds. Carry those rows over once so a restart does not re-seed.
fn import_legacy_state(conn: &Connection) -> std::result::Result<(), String> {
    let legacy: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'state'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| format!("Failed to query sqlite_master: {}", err))?;
    if legacy.is_none() {
        return Ok(());
    }

    let imported = conn
        .execute(
            "INSERT OR IGNORE INTO presence_state (alias, state, updated_at) \
             SELECT who, state, strftime('%Y-%m-%dT%H:%M:%SZ', updated, 'unixepoch') \
             FROM state WHERE state IN ('home', 'away') AND who IS NOT NULL",
            [],
        )
        .map_err(|err| format!("Failed to import legacy state rows: {}", err))?;
    conn.execute("DROP TABLE state", [])
        .map_err(|err| format!("Failed to drop legacy state table: {}", err))?;
    if imported > 0 {
        tracing::info!(rows = imported, "Imported legacy presence state");
    }
    Ok(())
}

fn parse_rfc3339(value: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
