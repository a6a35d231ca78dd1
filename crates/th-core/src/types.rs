use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted string did not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a task. Variants are declared in lifecycle order so that
/// board projections iterate `blocked` first and terminal buckets last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Blocked,
    Pending,
    InProgress,
    Completed,
    Failed,
    Rejected,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Blocked,
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Blocked => "blocked",
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Rejected => "rejected",
        }
    }

    /// `completed`, `failed` and `rejected` are one-way.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Rejected
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `InProgress -> Pending` covers orphan recovery and release by a
    /// stopping worker; `Blocked -> Pending` covers both normal dependency
    /// resolution and the stuck-blocked safety net; `Pending -> Blocked`
    /// happens when a dependency is added to a waiting task.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Blocked, TaskStatus::Pending)
                | (TaskStatus::Blocked, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Blocked)
                | (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Rejected)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Rejected)
                | (TaskStatus::InProgress, TaskStatus::Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocked" => Ok(TaskStatus::Blocked),
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "rejected" => Ok(TaskStatus::Rejected),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Numeric rank used by the claim index (higher is claimed first).
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(ParseEnumError::new("priority", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Active,
    Completed,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Active => "active",
            GroupStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(GroupStatus::Active),
            "completed" => Ok(GroupStatus::Completed),
            other => Err(ParseEnumError::new("group status", other)),
        }
    }
}

/// A root initiative tying related tasks together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub title: String,
    pub origin_role: String,
    pub status: GroupStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub group_id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub task_type: String,
    pub priority: Priority,
    pub assigned_to: String,
    pub claimed_by: Option<String>,
    pub status: TaskStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub revision_of: Option<String>,
    /// Last error context for a failed task.
    pub error: Option<String>,
}

impl Task {
    /// The root task whose failure took this one down, read from the
    /// `dependency <id> failed` attribution.
    pub fn cascaded_from(&self) -> Option<&str> {
        if self.status != TaskStatus::Failed {
            return None;
        }
        self.error
            .as_deref()?
            .strip_prefix("dependency ")?
            .strip_suffix(" failed")
            .filter(|root| !root.is_empty() && !root.contains(' '))
    }

    pub fn is_cascaded_failure(&self) -> bool {
        self.cascaded_from().is_some()
    }
}

/// Parameters for [`crate::board::TaskBoard::create_task`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub group_id: String,
    pub title: String,
    pub description: Option<String>,
    pub task_type: String,
    pub assigned_to: String,
    pub created_by: String,
    pub priority: Priority,
    pub parent_id: Option<String>,
    pub blocked_by: Vec<String>,
    pub revision_of: Option<String>,
}

impl NewTask {
    pub fn new(
        group_id: impl Into<String>,
        title: impl Into<String>,
        task_type: impl Into<String>,
        assigned_to: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            title: title.into(),
            task_type: task_type.into(),
            assigned_to: assigned_to.into(),
            created_by: created_by.into(),
            ..Self::default()
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn blocked_by<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_by = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn revision_of(mut self, task_id: impl Into<String>) -> Self {
        self.revision_of = Some(task_id.into());
        self
    }
}

/// A `(task_id, blocked_by)` edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task_id: String,
    pub blocked_by: String,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// AgentInstance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Idle,
    Working,
    Blocked,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Idle => "idle",
            InstanceStatus::Working => "working",
            InstanceStatus::Blocked => "blocked",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(InstanceStatus::Idle),
            "working" => Ok(InstanceStatus::Working),
            "blocked" => Ok(InstanceStatus::Blocked),
            "stopped" => Ok(InstanceStatus::Stopped),
            "error" => Ok(InstanceStatus::Error),
            other => Err(ParseEnumError::new("instance status", other)),
        }
    }
}

/// One running worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: String,
    pub role: String,
    pub status: InstanceStatus,
    pub current_task: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "group.created")]
    GroupCreated,
    #[serde(rename = "group.completed")]
    GroupCompleted,
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.claimed")]
    TaskClaimed,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.rejected")]
    TaskRejected,
    #[serde(rename = "task.recovered")]
    TaskRecovered,
    #[serde(rename = "agent.status_changed")]
    AgentStatusChanged,
    #[serde(rename = "agent.heartbeat")]
    AgentHeartbeat,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        EventType::GroupCreated,
        EventType::GroupCompleted,
        EventType::TaskCreated,
        EventType::TaskClaimed,
        EventType::TaskCompleted,
        EventType::TaskFailed,
        EventType::TaskRejected,
        EventType::TaskRecovered,
        EventType::AgentStatusChanged,
        EventType::AgentHeartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::GroupCreated => "group.created",
            EventType::GroupCompleted => "group.completed",
            EventType::TaskCreated => "task.created",
            EventType::TaskClaimed => "task.claimed",
            EventType::TaskCompleted => "task.completed",
            EventType::TaskFailed => "task.failed",
            EventType::TaskRejected => "task.rejected",
            EventType::TaskRecovered => "task.recovered",
            EventType::AgentStatusChanged => "agent.status_changed",
            EventType::AgentHeartbeat => "agent.heartbeat",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("event type", s))
    }
}

/// An immutable, append-only record of something that happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub group_id: Option<String>,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            group_id: None,
            task_id: None,
            agent_id: None,
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Event about a task; carries the task's id, group, status and claimant.
    pub fn for_task(event_type: EventType, task: &Task) -> Self {
        let mut event = Self::new(event_type);
        event.task_id = Some(task.id.clone());
        event.group_id = Some(task.group_id.clone());
        event.agent_id = task.claimed_by.clone();
        event.payload = serde_json::json!({
            "title": task.title,
            "status": task.status.as_str(),
            "assigned_to": task.assigned_to,
        });
        event
    }

    pub fn for_group(event_type: EventType, group: &Group) -> Self {
        let mut event = Self::new(event_type);
        event.group_id = Some(group.id.clone());
        event.payload = serde_json::json!({
            "title": group.title,
            "status": group.status.as_str(),
            "origin_role": group.origin_role,
        });
        event
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Merge `fields` into the payload object.
    pub fn with_fields(mut self, fields: serde_json::Value) -> Self {
        match (&mut self.payload, fields) {
            (serde_json::Value::Object(existing), serde_json::Value::Object(extra)) => {
                existing.extend(extra);
            }
            (slot, extra) => *slot = extra,
        }
        self
    }
}
