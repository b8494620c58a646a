use crate::StorageError;
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::collections::BTreeSet;
use tracing::info;

pub const MONITOR_SCHEMA_VERSION: i64 = 1;

/// Expected shape of one table. Every column outside the primary key carries
/// a default so that a rebuild can backfill columns an older file lacks.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TableSpec {
    pub name: &'static str,
    pub create_sql: &'static str,
    pub columns: &'static [&'static str],
    pub indexes: &'static [&'static str],
}

pub(crate) const TABLES: [TableSpec; 4] = [
    TableSpec {
        name: "events",
        create_sql: "
            CREATE TABLE events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL DEFAULT '',
                workspace_id TEXT NOT NULL DEFAULT '',
                event_type TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL DEFAULT 'terminal',
                content TEXT NOT NULL DEFAULT '',
                timestamp INTEGER NOT NULL DEFAULT 0
            )
        ",
        columns: &[
            "id",
            "session_id",
            "workspace_id",
            "event_type",
            "source",
            "content",
            "timestamp",
        ],
        indexes: &[
            "CREATE INDEX IF NOT EXISTS idx_events_session_ts ON events (session_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_events_workspace_ts ON events (workspace_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_events_ts ON events (timestamp)",
        ],
    },
    TableSpec {
        name: "observations",
        create_sql: "
            CREATE TABLE observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL DEFAULT '',
                workspace_id TEXT NOT NULL DEFAULT '',
                text TEXT NOT NULL DEFAULT '',
                depth TEXT NOT NULL DEFAULT 'standard',
                timestamp INTEGER NOT NULL DEFAULT 0
            )
        ",
        columns: &[
            "id",
            "session_id",
            "workspace_id",
            "text",
            "depth",
            "timestamp",
        ],
        indexes: &[
            "CREATE INDEX IF NOT EXISTS idx_observations_session_ts ON observations (session_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_observations_workspace_ts ON observations (workspace_id, timestamp)",
        ],
    },
    TableSpec {
        name: "lessons",
        create_sql: "
            CREATE TABLE lessons (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category TEXT NOT NULL DEFAULT 'workflow',
                content TEXT NOT NULL UNIQUE,
                confidence REAL NOT NULL DEFAULT 0.5,
                source_workspace TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0
            )
        ",
        columns: &[
            "id",
            "category",
            "content",
            "confidence",
            "source_workspace",
            "created_at",
            "updated_at",
        ],
        indexes: &[
            "CREATE INDEX IF NOT EXISTS idx_lessons_confidence ON lessons (confidence DESC, updated_at DESC)",
        ],
    },
    TableSpec {
        name: "pattern_occurrences",
        create_sql: "
            CREATE TABLE pattern_occurrences (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL DEFAULT '',
                workspace_id TEXT NOT NULL DEFAULT '',
                pattern_code TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT 'behavioral',
                confidence REAL NOT NULL DEFAULT 0,
                evidence TEXT NOT NULL DEFAULT '',
                timestamp INTEGER NOT NULL DEFAULT 0
            )
        ",
        columns: &[
            "id",
            "session_id",
            "workspace_id",
            "pattern_code",
            "category",
            "confidence",
            "evidence",
            "timestamp",
        ],
        indexes: &[
            "CREATE INDEX IF NOT EXISTS idx_patterns_workspace_ts ON pattern_occurrences (workspace_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_patterns_code ON pattern_occurrences (pattern_code)",
        ],
    },
];

pub(crate) fn migrate(conn: &mut Connection) -> Result<(), StorageError> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > MONITOR_SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: current,
            supported: MONITOR_SCHEMA_VERSION,
        });
    }

    let tx = conn.transaction()?;
    for table in &TABLES {
        migrate_table(&tx, table).map_err(|err| StorageError::Migration {
            table: table.name,
            reason: err.to_string(),
        })?;
    }
    tx.execute_batch(&format!("PRAGMA user_version = {MONITOR_SCHEMA_VERSION}"))?;
    tx.commit()?;
    Ok(())
}

fn migrate_table(tx: &Transaction<'_>, table: &TableSpec) -> Result<(), rusqlite::Error> {
    let exists = tx
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
            [table.name],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    if !exists {
        tx.execute_batch(table.create_sql)?;
        create_indexes(tx, table)?;
        return Ok(());
    }

    let existing = column_names(tx, table.name)?;
    let missing = table
        .columns
        .iter()
        .filter(|column| !existing.contains(**column))
        .copied()
        .collect::<Vec<_>>();

    if missing.is_empty() {
        create_indexes(tx, table)?;
        return Ok(());
    }

    info!(
        table = table.name,
        missing = ?missing,
        "rebuilding table to add missing columns"
    );

    let legacy = format!("{}_legacy", table.name);
    let shared = table
        .columns
        .iter()
        .filter(|column| existing.contains(**column))
        .copied()
        .collect::<Vec<_>>()
        .join(", ");

    tx.execute_batch(&format!("ALTER TABLE {} RENAME TO {legacy}", table.name))?;
    tx.execute_batch(table.create_sql)?;
    if !shared.is_empty() {
        tx.execute_batch(&format!(
            "INSERT INTO {} ({shared}) SELECT {shared} FROM {legacy}",
            table.name
        ))?;
    }
    // Indexes follow the renamed table, so the legacy copy has to go before
    // they can be recreated under their original names.
    tx.execute_batch(&format!("DROP TABLE {legacy}"))?;
    create_indexes(tx, table)?;
    Ok(())
}

fn create_indexes(tx: &Transaction<'_>, table: &TableSpec) -> Result<(), rusqlite::Error> {
    for index in table.indexes {
        tx.execute_batch(index)?;
    }
    Ok(())
}

pub(crate) fn column_names(
    conn: &Connection,
    table_name: &str,
) -> Result<BTreeSet<String>, rusqlite::Error> {
    let mut statement = conn.prepare(&format!("PRAGMA table_info({table_name})"))?;
    let rows = statement.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = BTreeSet::new();
    for row in rows {
        columns.insert(row?);
    }
    Ok(columns)
}
