use std::collections::{BTreeMap, HashMap};

use th_core::config::{HandoffRule, RoleConfig};
use th_core::types::{Priority, Task};
use tracing::debug;

// ---------------------------------------------------------------------------
// Handoff
// ---------------------------------------------------------------------------

/// What a follow-on task waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyRef {
    /// An existing task on the board.
    Task(String),
    /// An earlier handoff in the same batch, by index.
    Sibling(usize),
}

/// A follow-on task to create after a task finishes. Handoffs are created
/// in the finished task's group with the finished task as parent.
#[derive(Debug, Clone, PartialEq)]
pub struct Handoff {
    pub title: String,
    pub description: Option<String>,
    pub task_type: String,
    pub assigned_to: String,
    /// `None` inherits the finished task's priority.
    pub priority: Option<Priority>,
    pub blocked_by: Vec<DependencyRef>,
    pub revision_of: Option<String>,
}

impl Handoff {
    pub fn new(
        title: impl Into<String>,
        task_type: impl Into<String>,
        assigned_to: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            description: None,
            task_type: task_type.into(),
            assigned_to: assigned_to.into(),
            priority: None,
            blocked_by: Vec::new(),
            revision_of: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Wait for the `index`-th handoff of the same batch.
    pub fn after(mut self, index: usize) -> Self {
        self.blocked_by.push(DependencyRef::Sibling(index));
        self
    }

    pub fn blocked_by_task(mut self, task_id: impl Into<String>) -> Self {
        self.blocked_by.push(DependencyRef::Task(task_id.into()));
        self
    }

    pub fn revision_of(mut self, task_id: impl Into<String>) -> Self {
        self.revision_of = Some(task_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Decides which tasks a finished task spawns.
pub trait Router: Send + Sync {
    /// Called after `task` completed with `output`.
    fn route(&self, role: &str, task: &Task, output: &str) -> Vec<Handoff>;

    /// Called after `task` was rejected with `reason`.
    fn on_rejected(&self, _role: &str, _task: &Task, _reason: &str) -> Vec<Handoff> {
        Vec::new()
    }
}

/// Spawns nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRouting;

impl Router for NoRouting {
    fn route(&self, _role: &str, _task: &Task, _output: &str) -> Vec<Handoff> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// ConfigRouter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct RoleRules {
    handoff: Vec<HandoffRule>,
    on_reject: Vec<HandoffRule>,
}

/// Router driven by the `[[roles.<name>.handoff]]` and
/// `[[roles.<name>.on_reject]]` tables.
///
/// Titles and descriptions expand `{id}`, `{title}` and `{parent}` from the
/// finished task; rejection rules also expand `{reason}`. Revisions created
/// by `on_reject` point at the rejected task's parent (the work under
/// review), or at the rejected task itself when it has none.
#[derive(Debug, Clone, Default)]
pub struct ConfigRouter {
    roles: HashMap<String, RoleRules>,
}

impl ConfigRouter {
    pub fn new(roles: &BTreeMap<String, RoleConfig>) -> Self {
        let roles = roles
            .iter()
            .map(|(name, role)| {
                (
                    name.clone(),
                    RoleRules {
                        handoff: role.handoff.clone(),
                        on_reject: role.on_reject.clone(),
                    },
                )
            })
            .collect();
        Self { roles }
    }

    fn expand(rules: &[HandoffRule], task: &Task, vars: &[(&str, &str)]) -> Vec<Handoff> {
        // Rules filtered out by `when_task_type` shift the indices `after`
        // refers to, so remap them onto the emitted batch.
        let mut emitted_index: Vec<Option<usize>> = Vec::with_capacity(rules.len());
        let mut out = Vec::new();

        for rule in rules {
            let applies = rule
                .when_task_type
                .as_deref()
                .map_or(true, |t| t == task.task_type);
            if !applies {
                emitted_index.push(None);
                continue;
            }

            let mut handoff = Handoff::new(
                render(&rule.title, vars),
                rule.task_type.clone(),
                rule.assigned_to.clone(),
            );
            handoff.description = rule.description.as_deref().map(|d| render(d, vars));
            handoff.priority = rule.priority;
            for &sibling in &rule.after {
                match emitted_index.get(sibling).copied().flatten() {
                    Some(idx) => handoff.blocked_by.push(DependencyRef::Sibling(idx)),
                    None => debug!(sibling, "handoff dependency skipped by task type filter"),
                }
            }

            emitted_index.push(Some(out.len()));
            out.push(handoff);
        }
        out
    }
}

impl Router for ConfigRouter {
    fn route(&self, role: &str, task: &Task, _output: &str) -> Vec<Handoff> {
        let Some(rules) = self.roles.get(role) else {
            return Vec::new();
        };
        let parent = task.parent_id.as_deref().unwrap_or_default();
        let vars = [("id", task.id.as_str()), ("title", task.title.as_str()), ("parent", parent)];
        Self::expand(&rules.handoff, task, &vars)
    }

    fn on_rejected(&self, role: &str, task: &Task, reason: &str) -> Vec<Handoff> {
        let Some(rules) = self.roles.get(role) else {
            return Vec::new();
        };
        let parent = task.parent_id.as_deref().unwrap_or_default();
        let vars = [
            ("id", task.id.as_str()),
            ("title", task.title.as_str()),
            ("parent", parent),
            ("reason", reason),
        ];
        let target = task.parent_id.clone().unwrap_or_else(|| task.id.clone());
        Self::expand(&rules.on_reject, task, &vars)
            .into_iter()
            .map(|h| h.revision_of(target.clone()))
            .collect()
    }
}

/// Replace each `{name}` in `template` with its value.
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_known_placeholders_only() {
        let out = render("Review {id}: {title} {unknown}", &[("id", "CD-001"), ("title", "parser")]);
        assert_eq!(out, "Review CD-001: parser {unknown}");
    }
}
