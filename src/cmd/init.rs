//! Root directory setup: `buildmgr init`.

use std::path::Path;

use anyhow::Result;
use buildmgr::init::init_root;

pub fn cmd_init(root: &Path) -> Result<()> {
    let result = init_root(root)?;
    if result.created.is_empty() {
        println!("{} is already initialized.", result.root.display());
        return Ok(());
    }
    println!("Initialized {}", result.root.display());
    for path in &result.created {
        let shown = path.strip_prefix(&result.root).unwrap_or(path);
        println!("  created {}", shown.display());
    }
    Ok(())
}
