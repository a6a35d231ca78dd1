use std::collections::BTreeMap;

use th_core::board::BoardFilter;
use th_core::types::{Task, TaskStatus};

use super::Workspace;

pub async fn run(ws: &Workspace, filter: BoardFilter) -> anyhow::Result<()> {
    let board = ws.board.get_board(filter).await?;
    print!("{}", render(&board));
    Ok(())
}

/// One section per non-empty status, highest priority first.
pub fn render(board: &BTreeMap<TaskStatus, Vec<Task>>) -> String {
    let mut out = String::new();
    for (status, tasks) in board {
        if tasks.is_empty() {
            continue;
        }
        out.push_str(&format!("{} ({})\n", status, tasks.len()));
        for t in tasks {
            let claimant = t
                .claimed_by
                .as_deref()
                .map(|c| format!(" @{c}"))
                .unwrap_or_default();
            out.push_str(&format!(
                "  {:<8} {:<8} {:<10} {}{}\n",
                t.id,
                t.priority.as_str(),
                t.assigned_to,
                t.title,
                claimant
            ));
        }
    }
    if out.is_empty() {
        out.push_str("Board is empty.\n");
    }
    out
}
