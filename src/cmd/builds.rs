//! Read-only build queries: `buildmgr builds`, `buildmgr show`.

use std::path::Path;

use anyhow::{Context, Result};
use buildmgr::config::Config;
use buildmgr::console::{PAGE_SIZE, build_line};
use buildmgr::store::Store;

fn open_store(root: &Path) -> Result<Store> {
    let config = Config::at(root.to_path_buf());
    if !config.db_path.exists() {
        anyhow::bail!(
            "No database at {}. Run 'buildmgr init' or 'buildmgr serve' first.",
            config.db_path.display()
        );
    }
    Store::open(&config.db_path).context("Failed to open database")
}

pub async fn cmd_builds(root: &Path, page: usize) -> Result<()> {
    let store = open_store(root)?;
    let page = page.max(1);
    let records = store
        .list_build_records(PAGE_SIZE, (page - 1) * PAGE_SIZE)
        .await?;
    if records.is_empty() {
        println!("No builds on page {}.", page);
        return Ok(());
    }
    for record in &records {
        println!("{}", build_line(record));
    }
    Ok(())
}

pub async fn cmd_show(root: &Path, id: &str) -> Result<()> {
    let store = open_store(root)?;
    let record = store.get_build_record(id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    if let Some(active) = store.get_active_process_record().await?
        && active.id == record.id
    {
        println!("Active process since {}", active.created_time.to_rfc3339());
    }
    Ok(())
}
