use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{AgentInstance, Event, EventType, Group, Task, TaskDependency};

/// Async SQLite-backed store for groups, tasks, dependencies, instances and
/// events. Every other component reads and writes through this.
///
/// Cloning is cheap: clones share the same background connection.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

pub type StoreResult<T> = Result<T, tokio_rusqlite::Error>;

pub(crate) const TASK_COLUMNS: &str = "id, group_id, parent_id, title, description, task_type,
    priority, assigned_to, claimed_by, status, created_by, created_at, started_at,
    completed_at, rejection_reason, revision_of, error";

pub(crate) const GROUP_COLUMNS: &str =
    "id, title, origin_role, status, created_by, created_at, completed_at";

pub(crate) const INSTANCE_COLUMNS: &str =
    "id, role, status, current_task, started_at, last_heartbeat, status_changed_at";

const EVENT_COLUMNS: &str = "id, event_type, group_id, task_id, agent_id, payload, timestamp";

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Run `function` on the store's connection thread.
    pub async fn call<F, R>(&self, function: F) -> StoreResult<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(function).await
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> StoreResult<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS id_sequences (
                        prefix TEXT PRIMARY KEY,
                        value  INTEGER NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS "groups" (
                        id           TEXT PRIMARY KEY,
                        title        TEXT NOT NULL,
                        origin_role  TEXT NOT NULL,
                        status       TEXT NOT NULL,
                        created_by   TEXT NOT NULL,
                        created_at   TEXT NOT NULL,
                        completed_at TEXT
                    );

                    CREATE TABLE IF NOT EXISTS tasks (
                        id               TEXT PRIMARY KEY,
                        group_id         TEXT NOT NULL REFERENCES "groups"(id),
                        parent_id        TEXT,
                        title            TEXT NOT NULL,
                        description      TEXT,
                        task_type        TEXT NOT NULL,
                        priority         TEXT NOT NULL,
                        priority_rank    INTEGER NOT NULL,
                        assigned_to      TEXT NOT NULL,
                        claimed_by       TEXT,
                        status           TEXT NOT NULL,
                        created_by       TEXT NOT NULL,
                        created_at       TEXT NOT NULL,
                        started_at       TEXT,
                        completed_at     TEXT,
                        rejection_reason TEXT,
                        revision_of      TEXT,
                        error            TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_claimable
                        ON tasks(assigned_to, status, priority_rank DESC, created_at);
                    CREATE INDEX IF NOT EXISTS idx_tasks_group  ON tasks(group_id);
                    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

                    CREATE TABLE IF NOT EXISTS task_dependencies (
                        task_id     TEXT NOT NULL REFERENCES tasks(id),
                        blocked_by  TEXT NOT NULL REFERENCES tasks(id),
                        resolved    INTEGER NOT NULL DEFAULT 0,
                        resolved_at TEXT,
                        PRIMARY KEY (task_id, blocked_by),
                        CHECK (task_id <> blocked_by)
                    );

                    CREATE INDEX IF NOT EXISTS idx_deps_blocked_by
                        ON task_dependencies(blocked_by, resolved);

                    CREATE TABLE IF NOT EXISTS agent_instances (
                        id                TEXT PRIMARY KEY,
                        role              TEXT NOT NULL,
                        status            TEXT NOT NULL,
                        current_task      TEXT,
                        started_at        TEXT NOT NULL,
                        last_heartbeat    TEXT NOT NULL,
                        status_changed_at TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_instances_role ON agent_instances(role);

                    CREATE TABLE IF NOT EXISTS events (
                        id         TEXT PRIMARY KEY,
                        event_type TEXT NOT NULL,
                        group_id   TEXT,
                        task_id    TEXT,
                        agent_id   TEXT,
                        payload    TEXT NOT NULL,
                        timestamp  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
                    "#,
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Append the durable copy of an event.
    pub async fn append_event(&self, event: &Event) -> StoreResult<()> {
        let event = event.clone();
        self.conn
            .call(move |conn| {
                insert_event(conn, &event)?;
                Ok(())
            })
            .await
    }

    /// Most recent `limit` events (oldest first), optionally of one type.
    pub async fn list_events(
        &self,
        event_type: Option<EventType>,
        limit: usize,
    ) -> StoreResult<Vec<Event>> {
        let type_str = event_type.map(|t| t.as_str().to_string());
        self.conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {EVENT_COLUMNS} FROM (
                        SELECT rowid AS seq, {EVENT_COLUMNS} FROM events
                        WHERE (?1 IS NULL OR event_type = ?1)
                        ORDER BY rowid DESC LIMIT ?2
                     ) ORDER BY seq ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params![type_str, limit as i64], row_to_event)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by the board and instance manager
// ---------------------------------------------------------------------------

/// Canonical text form for timestamps; fixed-width so it sorts lexically.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Atomically bump and return the counter stored under `key`.
pub(crate) fn next_sequence(conn: &rusqlite::Connection, key: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO id_sequences (prefix, value) VALUES (?1, 1)
         ON CONFLICT(prefix) DO UPDATE SET value = value + 1
         RETURNING value",
        rusqlite::params![key],
        |row| row.get(0),
    )
}

/// `CD` + 4 -> `CD-004`.
pub fn format_id(prefix: &str, seq: i64) -> String {
    format!("{prefix}-{seq:03}")
}

pub(crate) fn insert_event(conn: &rusqlite::Connection, event: &Event) -> rusqlite::Result<()> {
    conn.execute(
        &format!("INSERT INTO events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        rusqlite::params![
            event.id.to_string(),
            event.event_type.as_str(),
            event.group_id,
            event.task_id,
            event.agent_id,
            event.payload.to_string(),
            ts(event.timestamp),
        ],
    )?;
    Ok(())
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_col<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_err(idx, e))
}

fn time_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn opt_time_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

pub(crate) fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        group_id: row.get(1)?,
        parent_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        task_type: row.get(5)?,
        priority: parse_col(row, 6)?,
        assigned_to: row.get(7)?,
        claimed_by: row.get(8)?,
        status: parse_col(row, 9)?,
        created_by: row.get(10)?,
        created_at: time_col(row, 11)?,
        started_at: opt_time_col(row, 12)?,
        completed_at: opt_time_col(row, 13)?,
        rejection_reason: row.get(14)?,
        revision_of: row.get(15)?,
        error: row.get(16)?,
    })
}

pub(crate) fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        title: row.get(1)?,
        origin_role: row.get(2)?,
        status: parse_col(row, 3)?,
        created_by: row.get(4)?,
        created_at: time_col(row, 5)?,
        completed_at: opt_time_col(row, 6)?,
    })
}

pub(crate) fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentInstance> {
    Ok(AgentInstance {
        id: row.get(0)?,
        role: row.get(1)?,
        status: parse_col(row, 2)?,
        current_task: row.get(3)?,
        started_at: time_col(row, 4)?,
        last_heartbeat: time_col(row, 5)?,
        status_changed_at: time_col(row, 6)?,
    })
}

pub(crate) fn row_to_dependency(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskDependency> {
    let resolved: i64 = row.get(2)?;
    Ok(TaskDependency {
        task_id: row.get(0)?,
        blocked_by: row.get(1)?,
        resolved: resolved != 0,
        resolved_at: opt_time_col(row, 3)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let id: String = row.get(0)?;
    let payload: String = row.get(5)?;
    Ok(Event {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?,
        event_type: parse_col(row, 1)?,
        group_id: row.get(2)?,
        task_id: row.get(3)?,
        agent_id: row.get(4)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_err(5, e))?,
        timestamp: time_col(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_id_pads_to_three_digits() {
        assert_eq!(format_id("CD", 4), "CD-004");
        assert_eq!(format_id("FEAT", 12), "FEAT-012");
        assert_eq!(format_id("RV", 1234), "RV-1234");
    }

    #[test]
    fn timestamps_sort_lexically() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::microseconds(1);
        assert!(ts(earlier) < ts(later));
    }

    #[tokio::test]
    async fn sequences_are_monotonic_per_prefix() {
        let store = Store::new_in_memory().await.expect("store");
        let values = store
            .call(|conn| {
                let a1 = next_sequence(conn, "task:CD")?;
                let a2 = next_sequence(conn, "task:CD")?;
                let b1 = next_sequence(conn, "task:RV")?;
                let a3 = next_sequence(conn, "task:CD")?;
                Ok((a1, a2, b1, a3))
            })
            .await
            .expect("sequence");
        assert_eq!(values, (1, 2, 1, 3));
    }

    #[tokio::test]
    async fn events_round_trip_through_store() {
        let store = Store::new_in_memory().await.expect("store");
        let event = Event::new(EventType::AgentHeartbeat).with_agent("coder-1");
        store.append_event(&event).await.expect("append");
        store
            .append_event(&Event::new(EventType::TaskCreated))
            .await
            .expect("append");

        let all = store.list_events(None, 10).await.expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, event.id);

        let beats = store
            .list_events(Some(EventType::AgentHeartbeat), 10)
            .await
            .expect("list");
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].agent_id.as_deref(), Some("coder-1"));
    }
}
