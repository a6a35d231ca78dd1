use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Priority;

/// Top-level configuration loaded from `~/.taskhive/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
}

impl Config {
    /// Load config from `~/.taskhive/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.agents.validate()?;
        let mut prefixes = BTreeSet::new();
        for (name, role) in &self.roles {
            role.validate(name, &self.roles)?;
            for prefix in std::iter::once(&role.task_prefix).chain(role.group_prefix.iter()) {
                if !prefixes.insert(prefix.clone()) {
                    return Err(ConfigError::Validation(format!(
                        "prefix '{}' is used by more than one role",
                        prefix
                    )));
                }
            }
        }
        Ok(())
    }

    /// Prefix directory consumed by the task board.
    pub fn role_directory(&self) -> RoleDirectory {
        let mut dir = RoleDirectory::new();
        for (name, role) in &self.roles {
            dir = dir.with_role(name, &role.task_prefix, role.group_prefix.as_deref());
        }
        dir.with_prefix_scope(self.board.id_prefix_scope)
    }

    /// Store path with a leading `~/` expanded to the home directory.
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskhive")
            .join("config.toml")
    }

    /// A three-role pipeline (planner -> coder -> reviewer) written by
    /// `th init`.
    pub fn starter() -> Self {
        let mut roles = BTreeMap::new();
        roles.insert(
            "planner".to_string(),
            RoleConfig {
                task_prefix: "PL".into(),
                group_prefix: Some("FEAT".into()),
                command: vec!["sh".into(), "-c".into(), "echo planned: $TASKHIVE_TITLE".into()],
                handoff: vec![HandoffRule::new("Implement {title}", "implementation", "coder")],
                ..RoleConfig::default()
            },
        );
        roles.insert(
            "coder".to_string(),
            RoleConfig {
                task_prefix: "CD".into(),
                max_instances: 4,
                command: vec!["sh".into(), "-c".into(), "echo implemented: $TASKHIVE_TITLE".into()],
                handoff: vec![HandoffRule::new("Review {id}", "code_review", "reviewer")],
                ..RoleConfig::default()
            },
        );
        roles.insert(
            "reviewer".to_string(),
            RoleConfig {
                task_prefix: "RV".into(),
                max_instances: 2,
                command: vec!["sh".into(), "-c".into(), "echo approved: $TASKHIVE_TITLE".into()],
                reject_exit_code: Some(3),
                on_reject: vec![HandoffRule::new("Address review {id}", "implementation", "coder")],
                ..RoleConfig::default()
            },
        );
        Self {
            roles,
            ..Config::default()
        }
    }
}

pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.taskhive/taskhive.db".into()
}

/// Which role's task prefix numbers a new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdPrefixScope {
    /// The role the task is assigned to (`CD-` tasks are always coder work).
    #[default]
    Assignee,
    /// The role that created the task; falls back to the assignee when the
    /// creator is not a configured role (e.g. a human operator).
    Creator,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BoardConfig {
    #[serde(default)]
    pub id_prefix_scope: IdPrefixScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            heartbeat_interval_secs: default_heartbeat(),
            task_timeout_secs: default_task_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl AgentsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "agents.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval_secs == 0 || self.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "agents intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

fn default_poll_interval() -> u64 {
    5
}
fn default_heartbeat() -> u64 {
    15
}
fn default_task_timeout() -> u64 {
    1800
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    5
}
fn default_backoff_multiplier() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    /// An instance whose last heartbeat is older than this is stale.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

impl ReconcilerConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

fn default_reconcile_interval() -> u64 {
    30
}
fn default_stale_after() -> u64 {
    90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_autoscale_interval")]
    pub interval_secs: u64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_autoscale_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_autoscale_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_event_history")]
    pub event_history: usize,
    /// How often the daemon logs a metrics snapshot; 0 disables it.
    #[serde(default = "default_metrics_log")]
    pub metrics_log_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_grace(),
            event_history: default_event_history(),
            metrics_log_secs: default_metrics_log(),
        }
    }
}

fn default_grace() -> u64 {
    30
}
fn default_event_history() -> usize {
    10_000
}
fn default_metrics_log() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Per-role settings: id prefixes, scaling bounds, execution command and
/// handoff rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub task_prefix: String,
    /// Roles with a group prefix may start new groups.
    #[serde(default)]
    pub group_prefix: Option<String>,
    #[serde(default = "default_min_instances")]
    pub min_instances: usize,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: usize,
    #[serde(default = "default_scale_down_idle")]
    pub scale_down_idle_minutes: u64,
    /// Program and arguments run by the command executor.
    #[serde(default)]
    pub command: Vec<String>,
    /// Exit code that marks the task as rejected rather than failed.
    #[serde(default)]
    pub reject_exit_code: Option<i32>,
    #[serde(default)]
    pub handoff: Vec<HandoffRule>,
    #[serde(default)]
    pub on_reject: Vec<HandoffRule>,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            task_prefix: String::new(),
            group_prefix: None,
            min_instances: default_min_instances(),
            max_instances: default_max_instances(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_idle_minutes: default_scale_down_idle(),
            command: Vec::new(),
            reject_exit_code: None,
            handoff: Vec::new(),
            on_reject: Vec::new(),
        }
    }
}

impl RoleConfig {
    pub fn scale_down_idle(&self) -> Duration {
        Duration::from_secs(self.scale_down_idle_minutes * 60)
    }

    fn validate(&self, name: &str, roles: &BTreeMap<String, RoleConfig>) -> Result<(), ConfigError> {
        validate_prefix(name, &self.task_prefix)?;
        if let Some(group_prefix) = &self.group_prefix {
            validate_prefix(name, group_prefix)?;
        }
        if self.min_instances > self.max_instances {
            return Err(ConfigError::Validation(format!(
                "roles.{name}: min_instances ({}) exceeds max_instances ({})",
                self.min_instances, self.max_instances
            )));
        }
        if self.scale_up_threshold == 0 {
            return Err(ConfigError::Validation(format!(
                "roles.{name}: scale_up_threshold must be at least 1"
            )));
        }
        for (section, rules) in [("handoff", &self.handoff), ("on_reject", &self.on_reject)] {
            for (idx, rule) in rules.iter().enumerate() {
                if !roles.contains_key(&rule.assigned_to) {
                    return Err(ConfigError::Validation(format!(
                        "roles.{name}.{section}[{idx}]: unknown role '{}'",
                        rule.assigned_to
                    )));
                }
                if let Some(bad) = rule.after.iter().find(|&&sibling| sibling >= idx) {
                    return Err(ConfigError::Validation(format!(
                        "roles.{name}.{section}[{idx}]: 'after' may only reference earlier entries (got {bad})"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn validate_prefix(role: &str, prefix: &str) -> Result<(), ConfigError> {
    if prefix.is_empty()
        || !prefix
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return Err(ConfigError::Validation(format!(
            "roles.{role}: prefix '{prefix}' must be non-empty uppercase ASCII"
        )));
    }
    Ok(())
}

fn default_min_instances() -> usize {
    1
}
fn default_max_instances() -> usize {
    1
}
fn default_scale_up_threshold() -> usize {
    3
}
fn default_scale_down_idle() -> u64 {
    10
}

/// A follow-on task created after a task of the owning role finishes.
///
/// `title` and `description` accept `{id}` and `{title}` placeholders that
/// expand to the finished task's id and title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRule {
    pub title: String,
    pub task_type: String,
    pub assigned_to: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Defaults to the finished task's priority.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Indices of earlier rules in the same list this task depends on.
    #[serde(default)]
    pub after: Vec<usize>,
    /// Only fire when the finished task has this type.
    #[serde(default)]
    pub when_task_type: Option<String>,
}

impl HandoffRule {
    pub fn new(
        title: impl Into<String>,
        task_type: impl Into<String>,
        assigned_to: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            task_type: task_type.into(),
            assigned_to: assigned_to.into(),
            description: None,
            priority: None,
            after: Vec::new(),
            when_task_type: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RoleDirectory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolePrefixes {
    pub task_prefix: String,
    pub group_prefix: Option<String>,
}

/// Role name -> id prefixes, handed to the task board at construction.
#[derive(Debug, Clone, Default)]
pub struct RoleDirectory {
    roles: HashMap<String, RolePrefixes>,
    scope: IdPrefixScope,
}

impl RoleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(
        mut self,
        role: impl Into<String>,
        task_prefix: impl Into<String>,
        group_prefix: Option<&str>,
    ) -> Self {
        self.roles.insert(
            role.into(),
            RolePrefixes {
                task_prefix: task_prefix.into(),
                group_prefix: group_prefix.map(str::to_string),
            },
        );
        self
    }

    pub fn with_prefix_scope(mut self, scope: IdPrefixScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn prefix_scope(&self) -> IdPrefixScope {
        self.scope
    }

    pub fn get(&self, role: &str) -> Option<&RolePrefixes> {
        self.roles.get(role)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }
}
