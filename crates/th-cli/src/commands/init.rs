use std::path::Path;

use anyhow::Context;
use th_core::config::Config;

/// Write the starter config to `path`. Refuses to overwrite unless `force`.
pub fn run(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let text = Config::starter().to_toml()?;
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote starter config to {}", path.display());
    Ok(())
}
