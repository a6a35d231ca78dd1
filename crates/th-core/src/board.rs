//! The task board: groups, tasks and the dependency graph between them.
//!
//! Every mutation runs inside one `IMMEDIATE` SQLite transaction. Events
//! produced by a mutation are written to the `events` table in that same
//! transaction and published on the [`EventBus`] only after it commits.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{IdPrefixScope, RoleDirectory, RolePrefixes};
use crate::event_bus::EventBus;
use crate::store::{
    format_id, insert_event, next_sequence, row_to_dependency, row_to_group, row_to_task, ts,
    Store, GROUP_COLUMNS, TASK_COLUMNS,
};
use crate::types::{
    Event, EventType, Group, GroupStatus, NewTask, Priority, Task, TaskDependency, TaskStatus,
};

const TERMINAL: &str = "('completed', 'failed', 'rejected')";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("task {task_id} cannot depend on {blocked_by}: it would create a cycle")]
    CycleDetected { task_id: String, blocked_by: String },

    #[error("task {0} cannot depend on itself")]
    SelfDependency(String),

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("unknown group: {0}")]
    UnknownGroup(String),

    #[error("id already in use: {0}")]
    DuplicateId(String),

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    #[error("store error: {0}")]
    Store(#[from] tokio_rusqlite::Error),

    #[error("corrupt board state: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for BoardError {
    fn from(e: rusqlite::Error) -> Self {
        BoardError::Store(tokio_rusqlite::Error::Rusqlite(e))
    }
}

pub type Result<T> = std::result::Result<T, BoardError>;

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Narrows [`TaskBoard::get_board`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardFilter {
    pub group_id: Option<String>,
    pub assigned_to: Option<String>,
    pub claimed_by: Option<String>,
    pub task_type: Option<String>,
    pub priority: Option<Priority>,
}

impl BoardFilter {
    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn assigned_to(mut self, role: impl Into<String>) -> Self {
        self.assigned_to = Some(role.into());
        self
    }
}

// ---------------------------------------------------------------------------
// TaskBoard
// ---------------------------------------------------------------------------

/// Shared handle to the board. Cheap to clone.
#[derive(Clone)]
pub struct TaskBoard {
    store: Store,
    roles: Arc<RoleDirectory>,
    bus: EventBus,
}

impl TaskBoard {
    pub fn new(store: Store, roles: RoleDirectory, bus: EventBus) -> Self {
        Self {
            store,
            roles: Arc::new(roles),
            bus,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn roles(&self) -> &RoleDirectory {
        &self.roles
    }

    // -- Groups ------------------------------------------------------------

    pub async fn create_group(
        &self,
        title: impl Into<String>,
        origin_role: &str,
        created_by: impl Into<String>,
    ) -> Result<Group> {
        let prefix = match self.roles.get(origin_role) {
            Some(RolePrefixes {
                group_prefix: Some(prefix),
                ..
            }) => prefix.clone(),
            Some(_) => {
                return Err(BoardError::UnknownRole(format!(
                    "{origin_role} (no group prefix)"
                )))
            }
            None => return Err(BoardError::UnknownRole(origin_role.to_string())),
        };
        let title = title.into();
        let origin_role = origin_role.to_string();
        let created_by = created_by.into();

        let group = self
            .mutate(move |conn, events| {
                let id = format_id(&prefix, next_sequence(conn, &format!("group:{prefix}"))?);
                if fetch_group(conn, &id)?.is_some() {
                    return Err(BoardError::DuplicateId(id));
                }
                let group = Group {
                    id,
                    title,
                    origin_role,
                    status: GroupStatus::Active,
                    created_by,
                    created_at: Utc::now(),
                    completed_at: None,
                };
                conn.execute(
                    r#"INSERT INTO "groups" (id, title, origin_role, status, created_by, created_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
                    params![
                        group.id,
                        group.title,
                        group.origin_role,
                        group.status.as_str(),
                        group.created_by,
                        ts(group.created_at),
                    ],
                )?;
                events.push(
                    Event::for_group(EventType::GroupCreated, &group)
                        .with_fields(json!({ "created_by": group.created_by })),
                );
                Ok(group)
            })
            .await?;

        info!(group_id = %group.id, origin_role = %group.origin_role, "group created");
        Ok(group)
    }

    pub async fn get_group(&self, group_id: &str) -> Result<Group> {
        let group_id = group_id.to_string();
        self.read(move |conn| {
            fetch_group(conn, &group_id)?.ok_or_else(|| BoardError::UnknownGroup(group_id.clone()))
        })
        .await
    }

    /// All groups, oldest first.
    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"SELECT {GROUP_COLUMNS} FROM "groups" ORDER BY created_at, rowid"#
            ))?;
            let rows = stmt.query_map([], row_to_group)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    // -- Tasks -------------------------------------------------------------

    /// Create a task, `blocked` if any dependency is unresolved and
    /// `pending` otherwise. Validation failures persist nothing and do not
    /// consume an id.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let prefix = self.task_prefix(&new)?;

        let task = self
            .mutate(move |conn, events| {
                let group = fetch_group(conn, &new.group_id)?
                    .ok_or_else(|| BoardError::UnknownGroup(new.group_id.clone()))?;
                for referenced in [&new.parent_id, &new.revision_of].into_iter().flatten() {
                    if fetch_task(conn, referenced)?.is_none() {
                        return Err(BoardError::UnknownTask(referenced.clone()));
                    }
                }

                let mut deps: Vec<(String, TaskStatus)> = Vec::new();
                for dep in &new.blocked_by {
                    if deps.iter().any(|(id, _)| id == dep) {
                        continue;
                    }
                    let status = fetch_task(conn, dep)?
                        .map(|t| t.status)
                        .ok_or_else(|| BoardError::InvalidDependency(format!("unknown task {dep}")))?;
                    deps.push((dep.clone(), status));
                }

                let id = format_id(&prefix, next_sequence(conn, &format!("task:{prefix}"))?);
                if fetch_task(conn, &id)?.is_some() {
                    return Err(BoardError::DuplicateId(id));
                }

                let now = Utc::now();
                let now_str = ts(now);
                let unresolved = deps.iter().any(|(_, s)| *s != TaskStatus::Completed);
                let status = if unresolved {
                    TaskStatus::Blocked
                } else {
                    TaskStatus::Pending
                };

                conn.execute(
                    "INSERT INTO tasks (id, group_id, parent_id, title, description, task_type,
                         priority, priority_rank, assigned_to, status, created_by, created_at,
                         revision_of)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        id,
                        new.group_id,
                        new.parent_id,
                        new.title,
                        new.description,
                        new.task_type,
                        new.priority.as_str(),
                        new.priority.rank(),
                        new.assigned_to,
                        status.as_str(),
                        new.created_by,
                        now_str,
                        new.revision_of,
                    ],
                )?;

                for (dep, dep_status) in &deps {
                    if dep == &id {
                        return Err(BoardError::SelfDependency(id));
                    }
                    if has_cycle_in(conn, &id, dep)? {
                        return Err(BoardError::CycleDetected {
                            task_id: id,
                            blocked_by: dep.clone(),
                        });
                    }
                    let resolved = *dep_status == TaskStatus::Completed;
                    conn.execute(
                        "INSERT INTO task_dependencies (task_id, blocked_by, resolved, resolved_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![id, dep, resolved, resolved.then(|| now_str.clone())],
                    )?;
                }

                if group.status == GroupStatus::Completed {
                    reopen_group(conn, &group.id)?;
                }

                let task = fetch_task(conn, &id)?
                    .ok_or_else(|| BoardError::Corrupt(format!("task {id} vanished after insert")))?;
                events.push(Event::for_task(EventType::TaskCreated, &task).with_fields(json!({
                    "task_type": task.task_type,
                    "priority": task.priority.as_str(),
                    "created_by": task.created_by,
                    "blocked_by": new.blocked_by,
                })));
                Ok(task)
            })
            .await?;

        info!(
            task_id = %task.id,
            group_id = %task.group_id,
            assigned_to = %task.assigned_to,
            status = %task.status,
            "task created"
        );
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        let task_id = task_id.to_string();
        self.read(move |conn| {
            fetch_task(conn, &task_id)?.ok_or_else(|| BoardError::UnknownTask(task_id.clone()))
        })
        .await
    }

    /// Add a `task_id` blocked-by `blocked_by` edge between existing tasks.
    /// A `pending` task moves back to `blocked` when the new edge is
    /// unresolved.
    pub async fn add_dependency(&self, task_id: &str, blocked_by: &str) -> Result<Task> {
        if task_id == blocked_by {
            return Err(BoardError::SelfDependency(task_id.to_string()));
        }
        let task_id = task_id.to_string();
        let blocked_by = blocked_by.to_string();

        self.mutate(move |conn, _events| {
            let task = require_task(conn, &task_id)?;
            let dep = fetch_task(conn, &blocked_by)?.ok_or_else(|| {
                BoardError::InvalidDependency(format!("unknown task {blocked_by}"))
            })?;
            if !matches!(task.status, TaskStatus::Blocked | TaskStatus::Pending) {
                return Err(BoardError::InvalidDependency(format!(
                    "task {task_id} is already {}",
                    task.status
                )));
            }
            if has_cycle_in(conn, &task_id, &blocked_by)? {
                return Err(BoardError::CycleDetected {
                    task_id,
                    blocked_by,
                });
            }

            let resolved = dep.status == TaskStatus::Completed;
            let now = ts(Utc::now());
            conn.execute(
                "INSERT OR IGNORE INTO task_dependencies (task_id, blocked_by, resolved, resolved_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![task_id, blocked_by, resolved, resolved.then_some(now)],
            )?;
            if !resolved && task.status == TaskStatus::Pending {
                conn.execute(
                    "UPDATE tasks SET status = 'blocked' WHERE id = ?1 AND status = 'pending'",
                    params![task_id],
                )?;
            }
            require_task(conn, &task_id)
        })
        .await
    }

    /// Atomically claim the best pending task for `role`: highest priority
    /// first, then oldest. `None` means there is nothing to do.
    pub async fn claim_task(&self, role: &str, instance_id: &str) -> Result<Option<Task>> {
        let role = role.to_string();
        let instance_id = instance_id.to_string();

        let claimed = self
            .mutate(move |conn, events| {
                let task = conn
                    .query_row(
                        &format!(
                            "UPDATE tasks
                             SET status = 'in_progress', claimed_by = ?2, started_at = ?3
                             WHERE id = (
                                 SELECT id FROM tasks
                                 WHERE assigned_to = ?1 AND status = 'pending'
                                 ORDER BY priority_rank DESC, created_at ASC, rowid ASC
                                 LIMIT 1
                             ) AND status = 'pending'
                             RETURNING {TASK_COLUMNS}"
                        ),
                        params![role, instance_id, ts(Utc::now())],
                        row_to_task,
                    )
                    .optional()?;
                if let Some(task) = &task {
                    events.push(Event::for_task(EventType::TaskClaimed, task));
                }
                Ok(task)
            })
            .await?;

        if let Some(task) = &claimed {
            debug!(task_id = %task.id, claimed_by = ?task.claimed_by, "task claimed");
        }
        Ok(claimed)
    }

    /// Complete an `in_progress` task, resolve every edge it blocks, move
    /// dependents with no unresolved edges to `pending`, and settle the
    /// group.
    pub async fn complete_task(&self, task_id: &str) -> Result<Task> {
        let task_id = task_id.to_string();

        let (task, unblocked) = self
            .mutate(move |conn, events| {
                let current = require_task(conn, &task_id)?;
                if current.status != TaskStatus::InProgress {
                    return Err(BoardError::InvalidTransition {
                        task_id,
                        from: current.status,
                        to: TaskStatus::Completed,
                    });
                }
                let now = ts(Utc::now());
                let task = conn.query_row(
                    &format!(
                        "UPDATE tasks SET status = 'completed', completed_at = ?2
                         WHERE id = ?1 RETURNING {TASK_COLUMNS}"
                    ),
                    params![task_id, now],
                    row_to_task,
                )?;
                events.push(Event::for_task(EventType::TaskCompleted, &task));

                conn.execute(
                    "UPDATE task_dependencies SET resolved = 1, resolved_at = ?2
                     WHERE blocked_by = ?1 AND resolved = 0",
                    params![task_id, now],
                )?;

                let unblocked: Vec<String> = {
                    let mut stmt = conn.prepare(
                        "UPDATE tasks SET status = 'pending'
                         WHERE status = 'blocked'
                           AND id IN (SELECT task_id FROM task_dependencies WHERE blocked_by = ?1)
                           AND NOT EXISTS (
                               SELECT 1 FROM task_dependencies d
                               WHERE d.task_id = tasks.id AND d.resolved = 0
                           )
                         RETURNING id",
                    )?;
                    let rows = stmt.query_map(params![task_id], |row| row.get(0))?;
                    rows.collect::<rusqlite::Result<_>>()?
                };

                settle_group(conn, &task.group_id, &now, events)?;
                Ok((task, unblocked))
            })
            .await?;

        info!(task_id = %task.id, unblocked = ?unblocked, "task completed");
        Ok(task)
    }

    /// Fail a non-terminal task and cascade the failure to every transitive
    /// non-terminal dependent still waiting on it.
    pub async fn fail_task(&self, task_id: &str, error: Option<String>) -> Result<Task> {
        let task_id = task_id.to_string();

        let (task, cascaded) = self
            .mutate(move |conn, events| {
                let current = require_task(conn, &task_id)?;
                if current.status.is_terminal() {
                    return Err(BoardError::InvalidTransition {
                        task_id,
                        from: current.status,
                        to: TaskStatus::Failed,
                    });
                }
                let now = ts(Utc::now());
                let task = conn.query_row(
                    &format!(
                        "UPDATE tasks SET status = 'failed', error = ?2, completed_at = ?3
                         WHERE id = ?1 RETURNING {TASK_COLUMNS}"
                    ),
                    params![task_id, error, now],
                    row_to_task,
                )?;
                events.push(
                    Event::for_task(EventType::TaskFailed, &task)
                        .with_fields(json!({ "error": task.error })),
                );

                let attribution = format!("dependency {task_id} failed");
                let mut groups = BTreeSet::from([task.group_id.clone()]);
                let mut cascaded = Vec::new();
                let mut visited = HashSet::from([task_id.clone()]);
                let mut queue = VecDeque::from([task_id.clone()]);

                while let Some(current) = queue.pop_front() {
                    let dependents: Vec<String> = {
                        let mut stmt = conn.prepare_cached(
                            "SELECT task_id FROM task_dependencies
                             WHERE blocked_by = ?1 AND resolved = 0",
                        )?;
                        let rows = stmt.query_map(params![current], |row| row.get(0))?;
                        rows.collect::<rusqlite::Result<_>>()?
                    };
                    for dependent in dependents {
                        if !visited.insert(dependent.clone()) {
                            continue;
                        }
                        let failed = conn
                            .query_row(
                                &format!(
                                    "UPDATE tasks
                                     SET status = 'failed', claimed_by = NULL, error = ?2,
                                         completed_at = ?3
                                     WHERE id = ?1 AND status NOT IN {TERMINAL}
                                     RETURNING {TASK_COLUMNS}"
                                ),
                                params![dependent, attribution, now],
                                row_to_task,
                            )
                            .optional()?;
                        if let Some(failed) = failed {
                            groups.insert(failed.group_id.clone());
                            events.push(Event::for_task(EventType::TaskFailed, &failed).with_fields(
                                json!({ "error": attribution, "cascaded_from": task_id }),
                            ));
                            cascaded.push(failed.id);
                        }
                        queue.push_back(dependent);
                    }
                }

                for group_id in &groups {
                    settle_group(conn, group_id, &now, events)?;
                }
                Ok((task, cascaded))
            })
            .await?;

        warn!(
            task_id = %task.id,
            error = ?task.error,
            cascaded = ?cascaded,
            "task failed"
        );
        Ok(task)
    }

    /// Reject a `pending` or `in_progress` task. Dependents are left alone.
    pub async fn reject_task(&self, task_id: &str, reason: impl Into<String>) -> Result<Task> {
        let task_id = task_id.to_string();
        let reason = reason.into();

        let task = self
            .mutate(move |conn, events| {
                let current = require_task(conn, &task_id)?;
                if !current.status.can_transition_to(&TaskStatus::Rejected) {
                    return Err(BoardError::InvalidTransition {
                        task_id,
                        from: current.status,
                        to: TaskStatus::Rejected,
                    });
                }
                let now = ts(Utc::now());
                let task = conn.query_row(
                    &format!(
                        "UPDATE tasks SET status = 'rejected', rejection_reason = ?2,
                             completed_at = ?3
                         WHERE id = ?1 RETURNING {TASK_COLUMNS}"
                    ),
                    params![task_id, reason, now],
                    row_to_task,
                )?;
                events.push(
                    Event::for_task(EventType::TaskRejected, &task)
                        .with_fields(json!({ "reason": task.rejection_reason })),
                );
                settle_group(conn, &task.group_id, &now, events)?;
                Ok(task)
            })
            .await?;

        info!(task_id = %task.id, reason = ?task.rejection_reason, "task rejected");
        Ok(task)
    }

    // -- Recovery ----------------------------------------------------------

    /// Put an orphaned `in_progress` task back to `pending`. Returns `None`
    /// if the task is no longer `in_progress`.
    pub async fn reset_task(&self, task_id: &str) -> Result<Option<Task>> {
        let task_id = task_id.to_string();
        self.mutate(move |conn, events| requeue(conn, &task_id, None, "orphaned", events))
            .await
    }

    /// Hand a claimed task back to the queue. Only succeeds while
    /// `instance_id` still holds the claim.
    pub async fn release_task(&self, task_id: &str, instance_id: &str) -> Result<Option<Task>> {
        let task_id = task_id.to_string();
        let instance_id = instance_id.to_string();
        self.mutate(move |conn, events| {
            requeue(conn, &task_id, Some(instance_id.as_str()), "released", events)
        })
        .await
    }

    /// Move a `blocked` task whose dependencies are all terminal to
    /// `pending`. Returns `None` if the task no longer qualifies.
    pub async fn unblock_task(&self, task_id: &str) -> Result<Option<Task>> {
        let task_id = task_id.to_string();
        self.mutate(move |conn, events| {
            let task = conn
                .query_row(
                    &format!(
                        "UPDATE tasks SET status = 'pending'
                         WHERE id = ?1 AND status = 'blocked' AND NOT EXISTS (
                             SELECT 1 FROM task_dependencies d
                             JOIN tasks b ON b.id = d.blocked_by
                             WHERE d.task_id = ?1 AND b.status NOT IN {TERMINAL}
                         )
                         RETURNING {TASK_COLUMNS}"
                    ),
                    params![task_id],
                    row_to_task,
                )
                .optional()?;
            if let Some(task) = &task {
                events.push(
                    Event::for_task(EventType::TaskRecovered, task)
                        .with_fields(json!({ "reason": "stuck_blocked" })),
                );
            }
            Ok(task)
        })
        .await
    }

    pub async fn list_in_progress(&self) -> Result<Vec<Task>> {
        self.read(|conn| {
            Ok(query_tasks(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'in_progress'
                     ORDER BY started_at, rowid"
                ),
                [],
            )?)
        })
        .await
    }

    /// `blocked` tasks none of whose dependencies can still complete.
    pub async fn list_stuck_blocked(&self) -> Result<Vec<Task>> {
        self.read(|conn| {
            Ok(query_tasks(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks t
                     WHERE t.status = 'blocked' AND NOT EXISTS (
                         SELECT 1 FROM task_dependencies d
                         JOIN tasks b ON b.id = d.blocked_by
                         WHERE d.task_id = t.id AND b.status NOT IN {TERMINAL}
                     )
                     ORDER BY t.created_at, t.rowid"
                ),
                [],
            )?)
        })
        .await
    }

    // -- Graph -------------------------------------------------------------

    /// Would making `task_id` wait on `proposed_blocked_by` close a cycle?
    pub async fn has_cycle(&self, task_id: &str, proposed_blocked_by: &str) -> Result<bool> {
        let task_id = task_id.to_string();
        let proposed = proposed_blocked_by.to_string();
        self.read(move |conn| Ok(has_cycle_in(conn, &task_id, &proposed)?))
            .await
    }

    /// Edges where `task_id` is the waiting side.
    pub async fn dependencies_of(&self, task_id: &str) -> Result<Vec<TaskDependency>> {
        let task_id = task_id.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, blocked_by, resolved, resolved_at FROM task_dependencies
                 WHERE task_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![task_id], row_to_dependency)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    // -- Views -------------------------------------------------------------

    /// Tasks bucketed by status. Every status is present as a key; each
    /// bucket is in claim order.
    pub async fn get_board(&self, filter: BoardFilter) -> Result<BTreeMap<TaskStatus, Vec<Task>>> {
        self.read(move |conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<String> = Vec::new();
            let mut push = |column: &str, value: Option<String>| {
                if let Some(value) = value {
                    values.push(value);
                    clauses.push(format!("{column} = ?{}", values.len()));
                }
            };
            push("group_id", filter.group_id);
            push("assigned_to", filter.assigned_to);
            push("claimed_by", filter.claimed_by);
            push("task_type", filter.task_type);
            push("priority", filter.priority.map(|p| p.as_str().to_string()));

            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            let tasks = query_tasks(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks {where_clause}
                     ORDER BY priority_rank DESC, created_at ASC, rowid ASC"
                ),
                rusqlite::params_from_iter(values.iter()),
            )?;

            let mut board: BTreeMap<TaskStatus, Vec<Task>> =
                TaskStatus::ALL.iter().map(|s| (*s, Vec::new())).collect();
            for task in tasks {
                board.entry(task.status).or_default().push(task);
            }
            Ok(board)
        })
        .await
    }

    /// Number of tasks waiting to be claimed by `role`.
    pub async fn pending_count(&self, role: &str) -> Result<usize> {
        let role = role.to_string();
        self.read(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE assigned_to = ?1 AND status = 'pending'",
                params![role],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    pub async fn status_counts(&self) -> Result<BTreeMap<TaskStatus, usize>> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts: BTreeMap<TaskStatus, usize> =
                TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
            for row in rows {
                let (status, count) = row?;
                let status: TaskStatus = status
                    .parse()
                    .map_err(|e| BoardError::Corrupt(format!("{e}")))?;
                counts.insert(status, count as usize);
            }
            Ok(counts)
        })
        .await
    }

    // -- Internals ---------------------------------------------------------

    fn task_prefix(&self, new: &NewTask) -> Result<String> {
        let assignee = self
            .roles
            .get(&new.assigned_to)
            .ok_or_else(|| BoardError::UnknownRole(new.assigned_to.clone()))?;
        let prefixes = match self.roles.prefix_scope() {
            IdPrefixScope::Assignee => assignee,
            IdPrefixScope::Creator => self.creator_prefixes(&new.created_by).unwrap_or(assignee),
        };
        Ok(prefixes.task_prefix.clone())
    }

    /// Creators are either role names or instance ids of the form `role-N`.
    fn creator_prefixes(&self, created_by: &str) -> Option<&RolePrefixes> {
        self.roles.get(created_by).or_else(|| {
            created_by
                .rsplit_once('-')
                .and_then(|(role, _)| self.roles.get(role))
        })
    }

    async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.store.call(move |conn| Ok(f(conn))).await?
    }

    /// Run `f` in an immediate transaction, persist the events it pushes,
    /// commit, then publish them. Any error rolls everything back.
    async fn mutate<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection, &mut Vec<Event>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (value, events) = self
            .store
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut events = Vec::new();
                let value = match f(&tx, &mut events) {
                    Ok(value) => value,
                    Err(e) => return Ok(Err(e)),
                };
                for event in &events {
                    insert_event(&tx, event)?;
                }
                tx.commit()?;
                Ok(Ok((value, events)))
            })
            .await??;

        for event in events {
            self.bus.emit(event);
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// SQL helpers
// ---------------------------------------------------------------------------

fn fetch_task(conn: &Connection, id: &str) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id],
        row_to_task,
    )
    .optional()
}

fn require_task(conn: &Connection, id: &str) -> Result<Task> {
    fetch_task(conn, id)?.ok_or_else(|| BoardError::UnknownTask(id.to_string()))
}

fn fetch_group(conn: &Connection, id: &str) -> rusqlite::Result<Option<Group>> {
    conn.query_row(
        &format!(r#"SELECT {GROUP_COLUMNS} FROM "groups" WHERE id = ?1"#),
        params![id],
        row_to_group,
    )
    .optional()
}

fn query_tasks<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> rusqlite::Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_task)?;
    rows.collect()
}

/// BFS from `proposed` along unresolved blocked-by edges. Reaching
/// `task_id` means the new edge would close a loop.
fn has_cycle_in(conn: &Connection, task_id: &str, proposed: &str) -> rusqlite::Result<bool> {
    if task_id == proposed {
        return Ok(true);
    }
    let mut stmt = conn.prepare_cached(
        "SELECT blocked_by FROM task_dependencies WHERE task_id = ?1 AND resolved = 0",
    )?;
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([proposed.to_string()]);

    while let Some(current) = queue.pop_front() {
        if current == task_id {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        let rows = stmt.query_map(params![current], |row| row.get::<_, String>(0))?;
        for next in rows {
            let next = next?;
            if !visited.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    Ok(false)
}

/// Mark the group completed once none of its tasks can still change.
fn settle_group(
    conn: &Connection,
    group_id: &str,
    now: &str,
    events: &mut Vec<Event>,
) -> Result<()> {
    let open: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM tasks WHERE group_id = ?1 AND status NOT IN {TERMINAL}"),
        params![group_id],
        |row| row.get(0),
    )?;
    if open > 0 {
        return Ok(());
    }
    let group = conn
        .query_row(
            &format!(
                r#"UPDATE "groups" SET status = 'completed', completed_at = ?2
                   WHERE id = ?1 AND status = 'active'
                   RETURNING {GROUP_COLUMNS}"#
            ),
            params![group_id, now],
            row_to_group,
        )
        .optional()?;
    if let Some(group) = group {
        info!(group_id = %group.id, "group completed");
        events.push(Event::for_group(EventType::GroupCompleted, &group));
    }
    Ok(())
}

/// A completed group that gains a new task is active again.
fn reopen_group(conn: &Connection, group_id: &str) -> rusqlite::Result<()> {
    let changed = conn.execute(
        r#"UPDATE "groups" SET status = 'active', completed_at = NULL
           WHERE id = ?1 AND status = 'completed'"#,
        params![group_id],
    )?;
    if changed > 0 {
        info!(group_id, "group reopened");
    }
    Ok(())
}

fn requeue(
    conn: &Connection,
    task_id: &str,
    claimant: Option<&str>,
    reason: &str,
    events: &mut Vec<Event>,
) -> Result<Option<Task>> {
    let Some(previous) = fetch_task(conn, task_id)? else {
        return Err(BoardError::UnknownTask(task_id.to_string()));
    };
    if previous.status != TaskStatus::InProgress {
        return Ok(None);
    }
    if claimant.is_some() && previous.claimed_by.as_deref() != claimant {
        return Ok(None);
    }
    let task = conn.query_row(
        &format!(
            "UPDATE tasks SET status = 'pending', claimed_by = NULL, started_at = NULL
             WHERE id = ?1 RETURNING {TASK_COLUMNS}"
        ),
        params![task_id],
        row_to_task,
    )?;
    events.push(
        Event::for_task(EventType::TaskRecovered, &task).with_fields(json!({
            "reason": reason,
            "previous_claimant": previous.claimed_by,
        })),
    );
    info!(task_id, reason, previous_claimant = ?previous.claimed_by, "task requeued");
    Ok(Some(task))
}
