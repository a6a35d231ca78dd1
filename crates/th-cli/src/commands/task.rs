use th_core::types::{NewTask, TaskStatus};

use super::Workspace;

pub async fn create(ws: &Workspace, new: NewTask) -> anyhow::Result<()> {
    let task = ws.board.create_task(new).await?;
    println!("Created {} [{}] for {}", task.id, task.status, task.assigned_to);
    if task.status == TaskStatus::Blocked {
        let deps = ws.board.dependencies_of(&task.id).await?;
        let waiting: Vec<&str> = deps
            .iter()
            .filter(|d| !d.resolved)
            .map(|d| d.blocked_by.as_str())
            .collect();
        println!("  waiting on: {}", waiting.join(", "));
    }
    Ok(())
}

pub async fn reject(ws: &Workspace, task_id: &str, reason: &str) -> anyhow::Result<()> {
    let task = ws.board.reject_task(task_id, reason).await?;
    println!("Rejected {}: {reason}", task.id);
    Ok(())
}

/// Fail a task. Tasks that (transitively) depend on it fail too.
pub async fn fail(ws: &Workspace, task_id: &str, error: Option<String>) -> anyhow::Result<()> {
    let task = ws.board.fail_task(task_id, error).await?;
    println!("Failed {}", task.id);
    if let Some(error) = &task.error {
        println!("  error: {error}");
    }
    Ok(())
}
