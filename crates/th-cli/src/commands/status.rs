use th_core::types::{GroupStatus, TaskStatus};

use super::Workspace;

/// Print task counts per status, open groups and instance liveness.
pub async fn run(ws: &Workspace) -> anyhow::Result<()> {
    let counts = ws.board.status_counts().await?;
    let groups = ws.board.list_groups().await?;
    let instances = ws.instances.get_all_instances().await?;
    let stale = ws.instances.stale_instances().await?;

    let total: usize = counts.values().sum();
    let open = groups
        .iter()
        .filter(|g| g.status == GroupStatus::Active)
        .count();

    println!("taskhive status  (v{})", env!("CARGO_PKG_VERSION"));
    println!("{}", "-".repeat(40));
    println!("Store:          {}", ws.config.store_path().display());
    println!("Groups:         {} ({open} active)", groups.len());
    println!("Instances:      {} ({} stale)", instances.len(), stale.len());
    println!("Total tasks:    {total}");
    for status in TaskStatus::ALL {
        println!(
            "  {:<13} {}",
            format!("{}:", status.as_str()),
            counts.get(&status).copied().unwrap_or(0)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_workspace;

    #[tokio::test]
    async fn status_on_empty_board() {
        let ws = test_workspace().await;
        assert!(run(&ws).await.is_ok());
    }
}
