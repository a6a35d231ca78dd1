use chrono::Utc;
use th_core::types::AgentInstance;

use super::Workspace;

pub async fn run(ws: &Workspace) -> anyhow::Result<()> {
    let instances = ws.instances.get_all_instances().await?;
    let now = Utc::now();
    let rows: Vec<(AgentInstance, bool)> = instances
        .into_iter()
        .map(|i| {
            let stale = ws.instances.is_stale(&i, now);
            (i, stale)
        })
        .collect();
    print!("{}", render(&rows));
    Ok(())
}

pub fn render(rows: &[(AgentInstance, bool)]) -> String {
    if rows.is_empty() {
        return "No instances registered. Is th-daemon running?\n".to_string();
    }
    let now = Utc::now();
    let mut out = String::new();
    for (i, stale) in rows {
        let silent = (now - i.last_heartbeat).num_seconds().max(0);
        out.push_str(&format!(
            "{:<14} {:<10} {:<12} {:<10} last seen {silent}s ago{}\n",
            i.id,
            i.role,
            i.status.as_str(),
            i.current_task.as_deref().unwrap_or("-"),
            if *stale { "  STALE" } else { "" }
        ));
    }
    out
}
