use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use crate::store::{next_sequence, row_to_instance, ts, Store, INSTANCE_COLUMNS};
use crate::types::{AgentInstance, InstanceStatus};

/// Default window after which a silent instance counts as stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(90);

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("unknown instance: {0}")]
    Unknown(String),

    #[error("instance already registered: {0}")]
    Duplicate(String),

    #[error("store error: {0}")]
    Store(#[from] tokio_rusqlite::Error),
}

impl From<rusqlite::Error> for InstanceError {
    fn from(e: rusqlite::Error) -> Self {
        InstanceError::Store(tokio_rusqlite::Error::Rusqlite(e))
    }
}

pub type Result<T> = std::result::Result<T, InstanceError>;

/// An instance whose last heartbeat is older than the staleness window.
#[derive(Debug, Clone)]
pub struct StaleInstance {
    pub instance: AgentInstance,
    pub silent_for: Duration,
}

/// Registry of running worker instances and their liveness.
#[derive(Clone)]
pub struct InstanceManager {
    store: Store,
    stale_after: Duration,
}

impl InstanceManager {
    pub fn new(store: Store, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Register a new `idle` instance of `role` with id `role-N`.
    pub async fn register_instance(&self, role: &str) -> Result<AgentInstance> {
        let role = role.to_string();
        let instance = self
            .store
            .call(move |conn| {
                let tx = conn.transaction()?;
                let seq = next_sequence(&tx, &format!("instance:{role}"))?;
                let instance = insert_instance(&tx, &format!("{role}-{seq}"), &role)?;
                tx.commit()?;
                Ok(instance)
            })
            .await?;
        info!(instance_id = %instance.id, role = %instance.role, "instance registered");
        Ok(instance)
    }

    /// Register an instance under a caller-chosen id.
    pub async fn register_instance_with_id(&self, id: &str, role: &str) -> Result<AgentInstance> {
        let id = id.to_string();
        let role = role.to_string();
        let instance = self
            .store
            .call(move |conn| {
                let exists = conn
                    .query_row(
                        "SELECT 1 FROM agent_instances WHERE id = ?1",
                        params![id],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if exists {
                    return Ok(Err(InstanceError::Duplicate(id)));
                }
                Ok(Ok(insert_instance(conn, &id, &role)?))
            })
            .await??;
        info!(instance_id = %instance.id, role = %instance.role, "instance registered");
        Ok(instance)
    }

    /// Set status and current task. Also counts as a heartbeat.
    /// `status_changed_at` only moves when the status actually changes.
    pub async fn update_status(
        &self,
        id: &str,
        status: InstanceStatus,
        current_task: Option<&str>,
    ) -> Result<AgentInstance> {
        let owned = id.to_string();
        let current_task = current_task.map(str::to_string);
        let updated = self
            .store
            .call(move |conn| {
                let now = ts(Utc::now());
                let row = conn
                    .query_row(
                        &format!(
                            "UPDATE agent_instances
                             SET status_changed_at = CASE WHEN status = ?2
                                     THEN status_changed_at ELSE ?4 END,
                                 status = ?2, current_task = ?3, last_heartbeat = ?4
                             WHERE id = ?1
                             RETURNING {INSTANCE_COLUMNS}"
                        ),
                        params![owned, status.as_str(), current_task, now],
                        row_to_instance,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        let instance = updated.ok_or_else(|| InstanceError::Unknown(id.to_string()))?;
        debug!(instance_id = %instance.id, status = %instance.status, "instance status updated");
        Ok(instance)
    }

    pub async fn heartbeat(&self, id: &str) -> Result<()> {
        let owned = id.to_string();
        let changed = self
            .store
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE agent_instances SET last_heartbeat = ?2 WHERE id = ?1",
                    params![owned, ts(Utc::now())],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(InstanceError::Unknown(id.to_string()));
        }
        Ok(())
    }

    pub async fn get_instance(&self, id: &str) -> Result<Option<AgentInstance>> {
        let id = id.to_string();
        Ok(self
            .store
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {INSTANCE_COLUMNS} FROM agent_instances WHERE id = ?1"),
                        params![id],
                        row_to_instance,
                    )
                    .optional()?)
            })
            .await?)
    }

    pub async fn get_all_instances(&self) -> Result<Vec<AgentInstance>> {
        self.query(None).await
    }

    pub async fn get_instances_by_role(&self, role: &str) -> Result<Vec<AgentInstance>> {
        self.query(Some(role.to_string())).await
    }

    /// Returns `false` if no such instance was registered.
    pub async fn remove_instance(&self, id: &str) -> Result<bool> {
        let owned = id.to_string();
        let removed = self
            .store
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM agent_instances WHERE id = ?1", params![owned])?)
            })
            .await?;
        if removed > 0 {
            info!(instance_id = %id, "instance removed");
        }
        Ok(removed > 0)
    }

    /// Drop every registered instance. Liveness is process-local, so the
    /// daemon calls this at startup before any loop registers.
    pub async fn purge_all(&self) -> Result<usize> {
        let purged = self
            .store
            .call(|conn| Ok(conn.execute("DELETE FROM agent_instances", [])?))
            .await?;
        if purged > 0 {
            info!(purged, "purged instances left over from a previous run");
        }
        Ok(purged)
    }

    pub fn is_stale(&self, instance: &AgentInstance, now: DateTime<Utc>) -> bool {
        silent_for(instance, now) > self.stale_after
    }

    pub async fn stale_instances(&self) -> Result<Vec<StaleInstance>> {
        self.stale_instances_at(Utc::now()).await
    }

    /// Instances whose heartbeat is older than the window, measured at `now`.
    pub async fn stale_instances_at(&self, now: DateTime<Utc>) -> Result<Vec<StaleInstance>> {
        let instances = self.get_all_instances().await?;
        Ok(instances
            .into_iter()
            .filter(|i| self.is_stale(i, now))
            .map(|instance| StaleInstance {
                silent_for: silent_for(&instance, now),
                instance,
            })
            .collect())
    }

    async fn query(&self, role: Option<String>) -> Result<Vec<AgentInstance>> {
        Ok(self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {INSTANCE_COLUMNS} FROM agent_instances
                     WHERE (?1 IS NULL OR role = ?1)
                     ORDER BY role, started_at, rowid"
                ))?;
                let rows = stmt.query_map(params![role], row_to_instance)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?)
    }
}

fn silent_for(instance: &AgentInstance, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(instance.last_heartbeat)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

fn insert_instance(
    conn: &rusqlite::Connection,
    id: &str,
    role: &str,
) -> rusqlite::Result<AgentInstance> {
    let now = ts(Utc::now());
    conn.query_row(
        &format!(
            "INSERT INTO agent_instances
                 (id, role, status, current_task, started_at, last_heartbeat, status_changed_at)
             VALUES (?1, ?2, 'idle', NULL, ?3, ?3, ?3)
             RETURNING {INSTANCE_COLUMNS}"
        ),
        params![id, role, now],
        row_to_instance,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_change_timestamp_only_moves_on_change() {
        let store = Store::new_in_memory().await.expect("store");
        let manager = InstanceManager::new(store, DEFAULT_STALE_AFTER);
        let registered = manager.register_instance("coder").await.expect("register");

        let same = manager
            .update_status(&registered.id, InstanceStatus::Idle, None)
            .await
            .expect("update");
        assert_eq!(same.status_changed_at, registered.status_changed_at);
        assert!(same.last_heartbeat >= registered.last_heartbeat);

        tokio::time::sleep(Duration::from_millis(2)).await;

        let working = manager
            .update_status(&registered.id, InstanceStatus::Working, Some("CD-001"))
            .await
            .expect("update");
        assert!(working.status_changed_at > registered.status_changed_at);
        assert_eq!(working.current_task.as_deref(), Some("CD-001"));
    }

    #[test]
    fn silence_is_never_negative() {
        let now = Utc::now();
        let instance = AgentInstance {
            id: "coder-1".into(),
            role: "coder".into(),
            status: InstanceStatus::Idle,
            current_task: None,
            started_at: now,
            last_heartbeat: now + chrono::Duration::seconds(5),
            status_changed_at: now,
        };
        assert_eq!(silent_for(&instance, now), Duration::ZERO);
    }
}
