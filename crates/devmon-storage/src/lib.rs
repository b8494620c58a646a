mod schema;

use devmon_core::{
    Depth, EventSource, LessonCategory, LessonDraft, NewEvent, NewPatternOccurrence,
    PatternCategory, PatternCode, SessionContext, StoredEvent, StoredLesson, StoredObservation,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use schema::MONITOR_SCHEMA_VERSION;

const DAY_MS: i64 = 86_400_000;
const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);
const CHECKPOINT_EVERY_WRITES: u64 = 50;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration of table {table} failed: {reason}")]
    Migration { table: &'static str, reason: String },
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store connection lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Full,
    Truncate,
}

impl CheckpointMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passive => "PASSIVE",
            Self::Full => "FULL",
            Self::Truncate => "TRUNCATE",
        }
    }
}

/// Aggregate of one pattern code inside an analytics window.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternStat {
    pub code: PatternCode,
    pub category: PatternCategory,
    pub count: u64,
    pub mean_confidence: f64,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub events: usize,
    pub observations: usize,
    pub pattern_occurrences: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.events + self.observations + self.pattern_occurrences
    }
}

/// Workspace-scoped persistence for captured activity and everything derived
/// from it.
///
/// All reads and writes go through one connection behind a mutex, so a single
/// store can be shared between the capture tasks and the analysis loop.
pub struct MonitorStore {
    conn: Mutex<Connection>,
    context: SessionContext,
    writes: AtomicU64,
}

impl MonitorStore {
    pub fn open(path: impl AsRef<Path>, context: SessionContext) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, context)
    }

    pub fn open_in_memory(context: SessionContext) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, context)
    }

    fn from_connection(mut conn: Connection, context: SessionContext) -> Result<Self, StorageError> {
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(journal_mode = %journal_mode, "store journal mode");
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        schema::migrate(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            context,
            writes: AtomicU64::new(0),
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn note_write(&self, conn: &Connection) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % CHECKPOINT_EVERY_WRITES == 0 {
            if let Err(err) = run_checkpoint(conn, CheckpointMode::Passive) {
                warn!("store_checkpoint_failed: {err}");
            }
        }
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn append_event(&self, event: &NewEvent) -> Result<StoredEvent, StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO events (session_id, workspace_id, event_type, source, content, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                self.context.session_id,
                self.context.workspace_id,
                event.event_type,
                event.source.as_str(),
                event.content,
                event.timestamp,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.note_write(&conn);

        Ok(StoredEvent {
            id,
            session_id: self.context.session_id.clone(),
            workspace_id: self.context.workspace_id.clone(),
            event_type: event.event_type.clone(),
            source: event.source,
            content: event.content.clone(),
            timestamp: event.timestamp,
        })
    }

    /// Events of the current session and workspace at or after `since`,
    /// oldest first with insertion order breaking timestamp ties.
    pub fn events_since(&self, since: i64) -> Result<Vec<StoredEvent>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT id, session_id, workspace_id, event_type, source, content, timestamp
            FROM events
            WHERE session_id = ?1 AND workspace_id = ?2 AND timestamp >= ?3
            ORDER BY timestamp ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map(
            params![self.context.session_id, self.context.workspace_id, since],
            event_from_row,
        )?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn append_observation(
        &self,
        text: &str,
        depth: Depth,
        timestamp: i64,
    ) -> Result<StoredObservation, StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO observations (session_id, workspace_id, text, depth, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                self.context.session_id,
                self.context.workspace_id,
                text,
                depth.as_str(),
                timestamp,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.note_write(&conn);

        Ok(StoredObservation {
            id,
            session_id: self.context.session_id.clone(),
            workspace_id: self.context.workspace_id.clone(),
            text: text.to_string(),
            depth,
            timestamp,
        })
    }

    /// Most recent observations of this workspace written by other sessions.
    pub fn past_observations(
        &self,
        exclude_session: &str,
        limit: usize,
    ) -> Result<Vec<StoredObservation>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT id, session_id, workspace_id, text, depth, timestamp
            FROM observations
            WHERE workspace_id = ?1 AND session_id != ?2
            ORDER BY timestamp DESC, id DESC
            LIMIT ?3
            ",
        )?;
        let rows = stmt.query_map(
            params![self.context.workspace_id, exclude_session, limit as i64],
            observation_from_row,
        )?;

        let mut observations = Vec::new();
        for row in rows {
            observations.push(row?);
        }
        Ok(observations)
    }

    /// The current session's last `limit` observations, oldest first.
    pub fn session_observations(&self, limit: usize) -> Result<Vec<StoredObservation>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT id, session_id, workspace_id, text, depth, timestamp
            FROM observations
            WHERE session_id = ?1 AND workspace_id = ?2
            ORDER BY timestamp DESC, id DESC
            LIMIT ?3
            ",
        )?;
        let rows = stmt.query_map(
            params![self.context.session_id, self.context.workspace_id, limit as i64],
            observation_from_row,
        )?;

        let mut observations = Vec::new();
        for row in rows {
            observations.push(row?);
        }
        observations.reverse();
        Ok(observations)
    }

    /// Inserts a lesson or bumps the confidence of the existing row with the
    /// same content. The bump is applied inside SQLite so concurrent writers
    /// never lose an increment.
    pub fn upsert_lesson(
        &self,
        draft: &LessonDraft,
        increment: f64,
    ) -> Result<StoredLesson, StorageError> {
        let now = devmon_core::now_ms();
        let confidence = draft.confidence.clamp(0.0, 1.0);
        let increment = increment.max(0.0);

        let conn = self.lock()?;
        let lesson = conn.query_row(
            "
            INSERT INTO lessons (category, content, confidence, source_workspace, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(content) DO UPDATE SET
                confidence = MIN(1.0, lessons.confidence + ?6),
                updated_at = excluded.updated_at
            RETURNING id, category, content, confidence, source_workspace, created_at, updated_at
            ",
            params![
                draft.category.as_str(),
                draft.content,
                confidence,
                self.context.workspace_id,
                now,
                increment,
            ],
            lesson_from_row,
        )?;
        self.note_write(&conn);
        Ok(lesson)
    }

    pub fn recent_lessons(&self, limit: usize) -> Result<Vec<StoredLesson>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT id, category, content, confidence, source_workspace, created_at, updated_at
            FROM lessons
            ORDER BY confidence DESC, updated_at DESC, id DESC
            LIMIT ?1
            ",
        )?;
        let rows = stmt.query_map([limit as i64], lesson_from_row)?;

        let mut lessons = Vec::new();
        for row in rows {
            lessons.push(row?);
        }
        Ok(lessons)
    }

    pub fn append_pattern_occurrence(
        &self,
        occurrence: &NewPatternOccurrence,
    ) -> Result<i64, StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO pattern_occurrences (
                session_id,
                workspace_id,
                pattern_code,
                category,
                confidence,
                evidence,
                timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                self.context.session_id,
                self.context.workspace_id,
                occurrence.code.as_str(),
                occurrence.category().as_str(),
                occurrence.confidence,
                occurrence.evidence,
                occurrence.timestamp,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.note_write(&conn);
        Ok(id)
    }

    /// Per-code counts for this workspace over the last `window_days` days,
    /// most frequent first.
    pub fn pattern_analytics(
        &self,
        window_days: i64,
        now: i64,
    ) -> Result<Vec<PatternStat>, StorageError> {
        let since = now.saturating_sub(window_days.max(0).saturating_mul(DAY_MS));
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT pattern_code, category, COUNT(*), AVG(confidence), MAX(timestamp)
            FROM pattern_occurrences
            WHERE workspace_id = ?1 AND timestamp >= ?2
            GROUP BY pattern_code, category
            ORDER BY COUNT(*) DESC, MAX(timestamp) DESC
            ",
        )?;
        let rows = stmt.query_map(params![self.context.workspace_id, since], |row| {
            let code: String = row.get(0)?;
            let category: String = row.get(1)?;
            let count: i64 = row.get(2)?;
            Ok(PatternStat {
                code: parse_column(&code, 0)?,
                category: parse_column(&category, 1)?,
                count: count.max(0) as u64,
                mean_confidence: row.get(3)?,
                last_seen: row.get(4)?,
            })
        })?;

        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }

    /// Deletes events and observations older than the horizon and pattern
    /// occurrences older than twice the horizon. Lessons are kept.
    pub fn purge_older_than(
        &self,
        retention_days: i64,
        now: i64,
    ) -> Result<PurgeReport, StorageError> {
        let horizon = retention_days.max(0).saturating_mul(DAY_MS);
        let cutoff = now.saturating_sub(horizon);
        let pattern_cutoff = now.saturating_sub(horizon.saturating_mul(2));

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let events = tx.execute("DELETE FROM events WHERE timestamp < ?1", [cutoff])?;
        let observations = tx.execute("DELETE FROM observations WHERE timestamp < ?1", [cutoff])?;
        let pattern_occurrences = tx.execute(
            "DELETE FROM pattern_occurrences WHERE timestamp < ?1",
            [pattern_cutoff],
        )?;
        tx.commit()?;
        self.note_write(&conn);

        Ok(PurgeReport {
            events,
            observations,
            pattern_occurrences,
        })
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let exists = conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn table_columns(&self, table_name: &str) -> Result<BTreeSet<String>, StorageError> {
        let conn = self.lock()?;
        Ok(schema::column_names(&conn, table_name)?)
    }

    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<(), StorageError> {
        let conn = self.lock()?;
        run_checkpoint(&conn, mode)
    }

    /// Flushes the write-ahead log into the main file. Failures are logged,
    /// the connection itself is released when the last handle drops.
    pub fn close(&self) -> Result<(), StorageError> {
        let conn = self.lock()?;
        if let Err(err) = run_checkpoint(&conn, CheckpointMode::Truncate) {
            warn!("store_close_checkpoint_failed: {err}");
        }
        Ok(())
    }
}

fn run_checkpoint(conn: &Connection, mode: CheckpointMode) -> Result<(), StorageError> {
    conn.query_row(
        &format!("PRAGMA wal_checkpoint({})", mode.as_str()),
        [],
        |_| Ok(()),
    )?;
    Ok(())
}

fn parse_column<T>(value: &str, index: usize) -> Result<T, rusqlite::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.parse::<T>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn event_from_row(row: &Row<'_>) -> Result<StoredEvent, rusqlite::Error> {
    let source: String = row.get(4)?;
    Ok(StoredEvent {
        id: row.get(0)?,
        session_id: row.get(1)?,
        workspace_id: row.get(2)?,
        event_type: row.get(3)?,
        source: parse_column::<EventSource>(&source, 4)?,
        content: row.get(5)?,
        timestamp: row.get(6)?,
    })
}

fn observation_from_row(row: &Row<'_>) -> Result<StoredObservation, rusqlite::Error> {
    let depth: String = row.get(4)?;
    Ok(StoredObservation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        workspace_id: row.get(2)?,
        text: row.get(3)?,
        depth: parse_column::<Depth>(&depth, 4)?,
        timestamp: row.get(5)?,
    })
}

fn lesson_from_row(row: &Row<'_>) -> Result<StoredLesson, rusqlite::Error> {
    let category: String = row.get(1)?;
    Ok(StoredLesson {
        id: row.get(0)?,
        category: parse_column::<LessonCategory>(&category, 1)?,
        content: row.get(2)?,
        confidence: row.get(3)?,
        source_workspace: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::NamedTempFile;

    fn ts() -> i64 {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
            .single()
            .expect("valid timestamp")
            .timestamp_millis()
    }

    fn context(session: &str) -> SessionContext {
        SessionContext::new(session, "/work/devmon")
    }

    fn command(content: &str, timestamp: i64) -> NewEvent {
        NewEvent::new(EventSource::Terminal, "command", content, timestamp)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn migrate_creates_all_tables() {
        let store = MonitorStore::open_in_memory(context("s1")).expect("open store");

        for table in ["events", "observations", "lessons", "pattern_occurrences"] {
            assert!(store.table_exists(table).expect("table exists"), "{table}");
        }
        assert_eq!(
            store.schema_version().expect("schema version"),
            MONITOR_SCHEMA_VERSION
        );
    }

    #[test]
    fn reopen_is_idempotent_and_keeps_rows() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let store = MonitorStore::open(file.path(), context("s1")).expect("open store");
            store
                .append_event(&command("cargo test", ts()))
                .expect("append event");
            store.close().expect("close");
        }

        let reopened = MonitorStore::open(file.path(), context("s1")).expect("reopen store");
        assert_eq!(reopened.events_since(0).expect("events").len(), 1);
    }

    #[test]
    fn legacy_table_missing_columns_is_rebuilt_with_defaults() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let conn = Connection::open(file.path()).expect("open legacy");
            conn.execute_batch(
                "
                CREATE TABLE events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    source TEXT NOT NULL,
                    content TEXT NOT NULL,
                    timestamp INTEGER NOT NULL
                );
                CREATE INDEX idx_events_ts ON events (timestamp);
                INSERT INTO events (session_id, event_type, source, content, timestamp)
                VALUES ('s1', 'command', 'terminal', 'ls -la', 42);
                ",
            )
            .expect("seed legacy schema");
        }

        let store = MonitorStore::open(file.path(), SessionContext::new("s1", ""))
            .expect("open migrated store");

        let columns = store.table_columns("events").expect("columns");
        assert!(columns.contains("workspace_id"));
        assert!(!store.table_exists("events_legacy").expect("legacy gone"));

        let events = store.events_since(0).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content, "ls -la");
        assert_eq!(events[0].workspace_id, "");
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let conn = Connection::open(file.path()).expect("open");
            conn.execute_batch("PRAGMA user_version = 99")
                .expect("bump version");
        }

        let err = MonitorStore::open(file.path(), context("s1"))
            .err()
            .expect("must reject newer schema");
        assert!(matches!(
            err,
            StorageError::UnsupportedSchemaVersion { found: 99, .. }
        ));
    }

    #[test]
    fn failed_rebuild_rolls_back_every_table() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let conn = Connection::open(file.path()).expect("open legacy");
            conn.execute_batch(
                "
                CREATE TABLE lessons (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    content TEXT NOT NULL,
                    confidence REAL NOT NULL
                );
                INSERT INTO lessons (content, confidence) VALUES ('run tests first', 0.5);
                INSERT INTO lessons (content, confidence) VALUES ('run tests first', 0.7);
                ",
            )
            .expect("seed legacy lessons");
        }

        let err = MonitorStore::open(file.path(), context("s1"))
            .err()
            .expect("duplicate lessons cannot be rebuilt");
        assert!(matches!(
            err,
            StorageError::Migration {
                table: "lessons",
                ..
            }
        ));

        let conn = Connection::open(file.path()).expect("reopen raw");
        let tables = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .expect("prepare")
            .query_map([], |row| row.get::<_, String>(0))
            .expect("query")
            .collect::<Result<Vec<_>, _>>()
            .expect("tables");
        assert!(tables.contains(&"lessons".to_string()));
        for absent in ["events", "observations", "lessons_legacy", "pattern_occurrences"] {
            assert!(!tables.contains(&absent.to_string()), "{absent} left behind");
        }
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("user_version");
        assert_eq!(version, 0);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM lessons", [], |row| row.get(0))
            .expect("legacy rows");
        assert_eq!(rows, 2);
    }

    #[test]
    fn events_since_orders_by_timestamp_then_insertion() {
        let store = MonitorStore::open_in_memory(context("s1")).expect("open store");
        let base = ts();
        store.append_event(&command("third", base + 20)).expect("e1");
        store.append_event(&command("first", base)).expect("e2");
        store.append_event(&command("second-a", base + 10)).expect("e3");
        store.append_event(&command("second-b", base + 10)).expect("e4");

        let contents = store
            .events_since(0)
            .expect("events")
            .into_iter()
            .map(|event| event.content)
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["first", "second-a", "second-b", "third"]);

        let tail = store.events_since(base + 10).expect("tail");
        assert_eq!(tail.len(), 3);
        assert!(tail.iter().all(|event| event.timestamp >= base + 10));
    }

    #[test]
    fn events_are_scoped_to_session_and_workspace() {
        let file = NamedTempFile::new().expect("temp file");
        let first = MonitorStore::open(file.path(), context("s1")).expect("first");
        let second = MonitorStore::open(file.path(), context("s2")).expect("second");
        let other_ws = MonitorStore::open(file.path(), SessionContext::new("s1", "/elsewhere"))
            .expect("other workspace");

        first.append_event(&command("mine", ts())).expect("append");
        second.append_event(&command("theirs", ts())).expect("append");
        other_ws.append_event(&command("elsewhere", ts())).expect("append");

        let events = first.events_since(0).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content, "mine");
    }

    #[test]
    fn observations_split_by_session_within_workspace() {
        let file = NamedTempFile::new().expect("temp file");
        let earlier = MonitorStore::open(file.path(), context("old")).expect("old session");
        let current = MonitorStore::open(file.path(), context("new")).expect("new session");
        let foreign = MonitorStore::open(file.path(), SessionContext::new("x", "/other"))
            .expect("foreign workspace");

        for offset in 0..3 {
            earlier
                .append_observation(&format!("old {offset}"), Depth::Standard, ts() + offset)
                .expect("old observation");
        }
        foreign
            .append_observation("foreign", Depth::Quick, ts() + 100)
            .expect("foreign observation");
        for offset in 0..7 {
            current
                .append_observation(&format!("new {offset}"), Depth::Deep, ts() + 10 + offset)
                .expect("new observation");
        }

        let past = current.past_observations("new", 5).expect("past");
        assert_eq!(
            past.iter().map(|obs| obs.text.as_str()).collect::<Vec<_>>(),
            vec!["old 2", "old 1", "old 0"]
        );

        let mine = current.session_observations(5).expect("session");
        assert_eq!(mine.len(), 5);
        assert_eq!(mine.first().map(|obs| obs.text.as_str()), Some("new 2"));
        assert_eq!(mine.last().map(|obs| obs.text.as_str()), Some("new 6"));
        assert_eq!(mine[0].depth, Depth::Deep);
    }

    #[test]
    fn lesson_upsert_accumulates_and_caps_confidence() {
        let store = MonitorStore::open_in_memory(context("s1")).expect("open store");
        let draft = LessonDraft {
            category: LessonCategory::Testing,
            content: "Run the focused test before the full suite.".to_string(),
            confidence: 0.5,
        };

        let first = store.upsert_lesson(&draft, 0.1).expect("insert");
        assert!(approx(first.confidence, 0.5));

        let second = store.upsert_lesson(&draft, 0.1).expect("bump");
        assert_eq!(second.id, first.id);
        assert!(approx(second.confidence, 0.6));

        for _ in 0..10 {
            store.upsert_lesson(&draft, 0.1).expect("bump");
        }
        let lessons = store.recent_lessons(10).expect("lessons");
        assert_eq!(lessons.len(), 1);
        assert!(approx(lessons[0].confidence, 1.0));
        assert_eq!(lessons[0].source_workspace, "/work/devmon");

        let other = LessonDraft {
            content: "Commit after each green test run.".to_string(),
            ..draft.clone()
        };
        store.upsert_lesson(&other, 0.1).expect("distinct lesson");
        let lessons = store.recent_lessons(10).expect("lessons");
        assert_eq!(lessons.len(), 2);
        assert_eq!(lessons[0].content, draft.content);
    }

    #[test]
    fn retention_purges_by_horizon() {
        let store = MonitorStore::open_in_memory(context("s1")).expect("open store");
        let now = ts();
        let day = DAY_MS;

        store.append_event(&command("stale", now - 31 * day)).expect("stale");
        store.append_event(&command("fresh", now - 29 * day)).expect("fresh");
        store
            .append_observation("stale observation", Depth::Quick, now - 31 * day)
            .expect("stale obs");
        for (age_days, evidence) in [(59, "kept"), (61, "dropped")] {
            store
                .append_pattern_occurrence(&NewPatternOccurrence {
                    code: PatternCode::ThrashLoop,
                    confidence: 0.8,
                    evidence: evidence.to_string(),
                    timestamp: now - age_days * day,
                })
                .expect("pattern");
        }
        store
            .upsert_lesson(
                &LessonDraft {
                    category: LessonCategory::Workflow,
                    content: "Lessons survive retention.".to_string(),
                    confidence: 0.5,
                },
                0.1,
            )
            .expect("lesson");

        let report = store.purge_older_than(30, now).expect("purge");
        assert_eq!(
            report,
            PurgeReport {
                events: 1,
                observations: 1,
                pattern_occurrences: 1,
            }
        );
        assert_eq!(report.total(), 3);

        let remaining = store.events_since(0).expect("events");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "fresh");
        assert_eq!(store.recent_lessons(5).expect("lessons").len(), 1);

        let stats = store.pattern_analytics(90, now).expect("analytics");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 1);
    }

    #[test]
    fn pattern_analytics_groups_by_code_within_window() {
        let store = MonitorStore::open_in_memory(context("s1")).expect("open store");
        let now = ts();
        let occurrences = [
            (PatternCode::MissingTests, 0.6, now - 1_000),
            (PatternCode::MissingTests, 0.8, now - 500),
            (PatternCode::ScopeCreep, 0.9, now - 2_000),
            (PatternCode::ScopeCreep, 0.9, now - 10 * DAY_MS),
        ];
        for (code, confidence, timestamp) in occurrences {
            store
                .append_pattern_occurrence(&NewPatternOccurrence {
                    code,
                    confidence,
                    evidence: "observed".to_string(),
                    timestamp,
                })
                .expect("append occurrence");
        }

        let stats = store.pattern_analytics(7, now).expect("analytics");
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].code, PatternCode::MissingTests);
        assert_eq!(stats[0].category, PatternCategory::Tactical);
        assert_eq!(stats[0].count, 2);
        assert!(approx(stats[0].mean_confidence, 0.7));
        assert_eq!(stats[0].last_seen, now - 500);
        assert_eq!(stats[1].code, PatternCode::ScopeCreep);
        assert_eq!(stats[1].count, 1);
    }

    #[test]
    fn checkpoints_run_on_file_backed_store() {
        let file = NamedTempFile::new().expect("temp file");
        let store = MonitorStore::open(file.path(), context("s1")).expect("open store");
        for index in 0..(CHECKPOINT_EVERY_WRITES + 1) {
            store
                .append_event(&command("echo", ts() + index as i64))
                .expect("append");
        }
        store
            .checkpoint(CheckpointMode::Full)
            .expect("full checkpoint");
        store.close().expect("close");
    }
}
