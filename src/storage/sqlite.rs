//! SQLite Storage
//!
//! Durable `Storage` backend on a single SQLite database. Addresses are
//! stored as order-preserving BLOB keys so keyset pagination and CIDR
//! containment are plain byte comparisons.

use crate::domain::ports::{
    Allowlist, AllowlistEntry, AllowlistId, BatchFailure, BatchOutcome, EntryId, NewSource,
    NodeFilter, NodeObservation, NodeQuery, Period, Source, SourceId, Storage,
};
use crate::error::{Error, Result};
use crate::net::{Cidr, NodeAddress};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

const SCHEMA: &str = r#"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        url TEXT NOT NULL,
        period_secs INTEGER NOT NULL,
        last_execution_us INTEGER,
        version INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS allowlists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS allowlist_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        list_id INTEGER NOT NULL REFERENCES allowlists(id) ON DELETE CASCADE,
        cidr TEXT NOT NULL,
        range_start BLOB NOT NULL,
        range_end BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_allowlist_entries_list
        ON allowlist_entries(list_id, range_start, range_end);

    CREATE TABLE IF NOT EXISTS nodes (
        addr BLOB NOT NULL,
        source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
        version INTEGER NOT NULL,
        observed_at_us INTEGER NOT NULL,
        PRIMARY KEY (addr, source_id, version)
    ) WITHOUT ROWID;

    CREATE INDEX IF NOT EXISTS idx_nodes_source ON nodes(source_id, addr);
"#;

const SOURCE_COLUMNS: &str =
    "id, name, url, period_secs, last_execution_us, version, enabled";

const LIST_NODES: &str = r#"
    WITH selected AS (
        SELECT DISTINCT n.addr FROM nodes n
        WHERE (?1 IS NULL OR n.addr > ?1)
          AND (?2 IS NULL OR n.source_id = ?2)
          AND (?3 IS NULL OR EXISTS (
                SELECT 1 FROM allowlist_entries e
                WHERE e.list_id = ?3 AND n.addr BETWEEN e.range_start AND e.range_end))
          AND (?4 IS NULL OR NOT EXISTS (
                SELECT 1 FROM allowlist_entries e
                WHERE e.list_id = ?4 AND n.addr BETWEEN e.range_start AND e.range_end))
        ORDER BY n.addr
        LIMIT ?5
    )
    SELECT n.addr, n.source_id, n.version, n.observed_at_us
    FROM nodes n JOIN selected s ON n.addr = s.addr
    WHERE (?2 IS NULL OR n.source_id = ?2)
    ORDER BY n.addr, n.source_id, n.version
"#;

// =============================================================================
// Row Mapping
// =============================================================================

struct SourceRow {
    id: i64,
    name: String,
    url: String,
    period_secs: i64,
    last_execution_us: Option<i64>,
    version: i64,
    enabled: bool,
}

impl SourceRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            url: row.get(2)?,
            period_secs: row.get(3)?,
            last_execution_us: row.get(4)?,
            version: row.get(5)?,
            enabled: row.get(6)?,
        })
    }

    fn into_source(self) -> Result<Source> {
        let period = u64::try_from(self.period_secs)
            .map_err(|_| Error::Internal(format!("negative period for source {}", self.id)))
            .and_then(Period::from_secs)?;
        let last_execution = self.last_execution_us.map(from_micros).transpose()?;

        Ok(Source {
            id: SourceId(self.id),
            name: self.name,
            url: self.url,
            period,
            last_execution,
            version: self.version,
            enabled: self.enabled,
        })
    }
}

fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_micros(us: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(us)
        .ok_or_else(|| Error::Internal(format!("timestamp out of range: {}us", us)))
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

// =============================================================================
// SQLite Store
// =============================================================================

/// SQLite-backed `Storage`
///
/// A single connection behind a mutex; every operation runs to completion
/// under the lock, which also serializes the conditional prepare update.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::init_schema(&conn)?;
        info!(path = %path.display(), journal_mode = %mode, "Opened SQLite store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn fetch_source(conn: &Connection, id: SourceId) -> Result<Source> {
        conn.query_row(
            &format!("SELECT {} FROM sources WHERE id = ?1", SOURCE_COLUMNS),
            params![id.0],
            SourceRow::read,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("Source", id))?
        .into_source()
    }

    fn query_sources(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Source>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, SourceRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(SourceRow::into_source).collect()
    }

    fn ensure_allowlist(conn: &Connection, id: AllowlistId) -> Result<()> {
        let exists = conn
            .query_row("SELECT 1 FROM allowlists WHERE id = ?1", params![id.0], |_| Ok(()))
            .optional()?;
        exists.ok_or_else(|| Error::not_found("Allowlist", id))
    }
}

#[async_trait]
impl Storage for SqliteStore {
    async fn create_source(&self, source: NewSource) -> Result<Source> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO sources (name, url, period_secs, enabled) VALUES (?1, ?2, ?3, ?4)",
            params![
                source.name,
                source.url,
                source.period.as_secs() as i64,
                source.enabled
            ],
        );
        match inserted {
            Ok(_) => Self::fetch_source(&conn, SourceId(conn.last_insert_rowid())),
            Err(e) if is_constraint_violation(&e) => {
                Err(Error::already_exists("Source", source.name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_source(&self, id: SourceId) -> Result<Source> {
        Self::fetch_source(&self.conn.lock(), id)
    }

    async fn list_sources(&self, after: Option<SourceId>, limit: usize) -> Result<Vec<Source>> {
        let conn = self.conn.lock();
        Self::query_sources(
            &conn,
            &format!(
                "SELECT {} FROM sources WHERE id > ?1 ORDER BY id LIMIT ?2",
                SOURCE_COLUMNS
            ),
            params![after.map_or(0, |a| a.0), limit as i64],
        )
    }

    async fn list_eligible_sources(&self, now: DateTime<Utc>) -> Result<Vec<Source>> {
        let conn = self.conn.lock();
        Self::query_sources(
            &conn,
            &format!(
                "SELECT {} FROM sources \
                 WHERE enabled = 1 \
                   AND (last_execution_us IS NULL OR last_execution_us + period_secs * 1000000 < ?1) \
                 ORDER BY id",
                SOURCE_COLUMNS
            ),
            params![to_micros(now)],
        )
    }

    async fn prepare_execution(&self, id: SourceId, now: DateTime<Utc>) -> Result<Source> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sources SET last_execution_us = ?2, version = version + 1 \
             WHERE id = ?1 AND enabled = 1 \
               AND (last_execution_us IS NULL OR last_execution_us + period_secs * 1000000 < ?2)",
            params![id.0, to_micros(now)],
        )?;

        if changed == 0 {
            // Distinguish a missing row from a claimed window
            Self::fetch_source(&conn, id)?;
            return Err(Error::ExecutionNotEligible { source_id: id.0 });
        }
        Self::fetch_source(&conn, id)
    }

    async fn start_source(&self, id: SourceId) -> Result<Source> {
        let conn = self.conn.lock();
        let changed = conn.execute("UPDATE sources SET enabled = 1 WHERE id = ?1", params![id.0])?;
        if changed == 0 {
            return Err(Error::not_found("Source", id));
        }
        Self::fetch_source(&conn, id)
    }

    async fn stop_source(&self, id: SourceId) -> Result<Source> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sources SET enabled = 0, version = version + 1 WHERE id = ?1",
            params![id.0],
        )?;
        if changed == 0 {
            return Err(Error::not_found("Source", id));
        }
        Self::fetch_source(&conn, id)
    }

    async fn batch_insert_nodes(&self, rows: Vec<NodeObservation>) -> Result<BatchOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut outcome = BatchOutcome::default();

        {
            let mut known = HashMap::new();
            let mut exists_stmt = tx.prepare("SELECT 1 FROM sources WHERE id = ?1")?;
            let mut insert_stmt = tx.prepare(
                "INSERT INTO nodes (addr, source_id, version, observed_at_us) \
                 VALUES (?1, ?2, ?3, ?4) ON CONFLICT DO NOTHING",
            )?;

            for (index, row) in rows.into_iter().enumerate() {
                let exists = match known.get(&row.source_id) {
                    Some(exists) => *exists,
                    None => {
                        let exists = exists_stmt.exists(params![row.source_id.0])?;
                        known.insert(row.source_id, exists);
                        exists
                    }
                };
                if !exists {
                    outcome.failures.push(BatchFailure {
                        index,
                        error: Error::not_found("Source", row.source_id),
                    });
                    continue;
                }

                let changed = insert_stmt.execute(params![
                    row.address.to_key(),
                    row.source_id.0,
                    row.version,
                    to_micros(row.observed_at)
                ])?;
                if changed == 0 {
                    outcome.failures.push(BatchFailure {
                        index,
                        error: Error::DuplicateObservation {
                            address: row.address.to_string(),
                            source_id: row.source_id.0,
                            version: row.version,
                        },
                    });
                } else {
                    outcome.inserted += 1;
                }
            }
        }

        tx.commit()?;
        debug!(
            inserted = outcome.inserted,
            failed = outcome.failures.len(),
            "Committed node batch"
        );
        Ok(outcome)
    }

    async fn list_nodes(&self, query: &NodeQuery) -> Result<Vec<NodeObservation>> {
        let conn = self.conn.lock();

        let (source, inside, outside) = match query.filter {
            NodeFilter::All => (None, None, None),
            NodeFilter::Source(id) => (Some(id.0), None, None),
            NodeFilter::InsideAllowlist(id) => {
                Self::ensure_allowlist(&conn, id)?;
                (None, Some(id.0), None)
            }
            NodeFilter::OutsideAllowlist(id) => {
                Self::ensure_allowlist(&conn, id)?;
                (None, None, Some(id.0))
            }
        };
        let after = query.after.map(|a| a.to_key());
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

        let mut stmt = conn.prepare(LIST_NODES)?;
        let raw = stmt
            .query_map(params![after, source, inside, outside, limit], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw.into_iter()
            .map(|(addr, source_id, version, observed_at_us)| {
                Ok(NodeObservation {
                    address: NodeAddress::from_key(&addr)?,
                    source_id: SourceId(source_id),
                    version,
                    observed_at: from_micros(observed_at_us)?,
                })
            })
            .collect()
    }

    async fn create_allowlist(&self, name: &str) -> Result<Allowlist> {
        let conn = self.conn.lock();
        match conn.execute("INSERT INTO allowlists (name) VALUES (?1)", params![name]) {
            Ok(_) => Ok(Allowlist {
                id: AllowlistId(conn.last_insert_rowid()),
                name: name.to_string(),
            }),
            Err(e) if is_constraint_violation(&e) => Err(Error::already_exists("Allowlist", name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_allowlist(&self, id: AllowlistId) -> Result<Allowlist> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name FROM allowlists WHERE id = ?1",
            params![id.0],
            |row| {
                Ok(Allowlist {
                    id: AllowlistId(row.get(0)?),
                    name: row.get(1)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::not_found("Allowlist", id))
    }

    async fn list_allowlists(&self, after: Option<AllowlistId>, limit: usize) -> Result<Vec<Allowlist>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name FROM allowlists WHERE id > ?1 ORDER BY id LIMIT ?2")?;
        let lists = stmt
            .query_map(params![after.map_or(0, |a| a.0), limit as i64], |row| {
                Ok(Allowlist {
                    id: AllowlistId(row.get(0)?),
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(lists)
    }

    async fn delete_allowlist(&self, id: AllowlistId) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM allowlists WHERE id = ?1", params![id.0])?;
        if changed == 0 {
            return Err(Error::not_found("Allowlist", id));
        }
        Ok(())
    }

    async fn add_allowlist_entry(&self, list_id: AllowlistId, cidr: Cidr) -> Result<AllowlistEntry> {
        let conn = self.conn.lock();
        Self::ensure_allowlist(&conn, list_id)?;
        let (start, end) = cidr.key_range();
        conn.execute(
            "INSERT INTO allowlist_entries (list_id, cidr, range_start, range_end) \
             VALUES (?1, ?2, ?3, ?4)",
            params![list_id.0, cidr.to_string(), start, end],
        )?;
        Ok(AllowlistEntry {
            id: EntryId(conn.last_insert_rowid()),
            cidr,
            allowlist_id: list_id,
        })
    }

    async fn remove_allowlist_entry(&self, list_id: AllowlistId, entry_id: EntryId) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM allowlist_entries WHERE id = ?1 AND list_id = ?2",
            params![entry_id.0, list_id.0],
        )?;
        if changed == 0 {
            return Err(Error::not_found("Allowlist entry", entry_id));
        }
        Ok(())
    }

    async fn list_allowlist_entries(&self, list_id: AllowlistId) -> Result<Vec<AllowlistEntry>> {
        let conn = self.conn.lock();
        Self::ensure_allowlist(&conn, list_id)?;
        let mut stmt =
            conn.prepare("SELECT id, cidr FROM allowlist_entries WHERE list_id = ?1 ORDER BY id")?;
        let raw = stmt
            .query_map(params![list_id.0], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raw.into_iter()
            .map(|(id, cidr)| {
                Ok(AllowlistEntry {
                    id: EntryId(id),
                    cidr: Cidr::parse(&cidr)?,
                    allowlist_id: list_id,
                })
            })
            .collect()
    }

    async fn health_check(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
        Ok(one == 1)
    }

    fn backend_name(&self) -> &str {
        "sqlite"
    }
}
