use th_core::types::Group;

use super::Workspace;

pub async fn create(ws: &Workspace, title: &str, role: &str, created_by: &str) -> anyhow::Result<()> {
    let group = ws.board.create_group(title, role, created_by).await?;
    println!("Created group {} ({})", group.id, group.title);
    Ok(())
}

pub async fn list(ws: &Workspace) -> anyhow::Result<()> {
    let groups = ws.board.list_groups().await?;
    print!("{}", render(&groups));
    Ok(())
}

pub fn render(groups: &[Group]) -> String {
    if groups.is_empty() {
        return "No groups.\n".to_string();
    }
    let mut out = String::new();
    for g in groups {
        out.push_str(&format!(
            "{:<10} {:<10} {:<10} {}\n",
            g.id,
            g.status.as_str(),
            g.origin_role,
            g.title
        ));
    }
    out
}
