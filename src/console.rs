//! Interactive operator console.
//!
//! Menus block on the terminal, so every prompt runs on the blocking pool
//! while the queues keep working.

use anyhow::{Context, Result};
use buildmgr_common::{BuildRecord, BuildStatus};
use console::style;
use dialoguer::{Select, theme::ColorfulTheme};

use crate::runner::RunSupervisor;
use crate::settings::SettingsHandle;
use crate::store::Store;

pub const PAGE_SIZE: usize = 10;

pub struct Console {
    store: Store,
    runner: RunSupervisor,
    settings: SettingsHandle,
}

enum PageItem {
    Build(usize),
    Next,
    Previous,
    Back,
}

async fn select(prompt: impl Into<String>, items: Vec<String>) -> Result<Option<usize>> {
    let prompt = prompt.into();
    tokio::task::spawn_blocking(move || {
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .items(&items)
            .default(0)
            .interact_opt()
    })
    .await
    .context("Console prompt task failed")?
    .context("Console prompt failed")
}

/// One row of the build list.
pub fn build_line(record: &BuildRecord) -> String {
    format!(
        "{}  {:<10}  {}",
        record.id,
        record.status().as_str(),
        record.created_time.format("%Y-%m-%d %H:%M:%S")
    )
}

/// Whether the console offers to start `record`.
fn startable(record: &BuildRecord) -> bool {
    record.status() == BuildStatus::Built
}

/// Menu rows for one page of builds. `has_next` is whether another page
/// follows.
fn page_items(records: &[BuildRecord], page: usize, has_next: bool) -> (Vec<String>, Vec<PageItem>) {
    let mut labels = Vec::new();
    let mut items = Vec::new();
    for (i, record) in records.iter().enumerate() {
        labels.push(format!("{}. {}", i + 1, build_line(record)));
        items.push(PageItem::Build(i));
    }
    if has_next {
        labels.push("n. Next page".into());
        items.push(PageItem::Next);
    }
    if page > 0 {
        labels.push("p. Previous page".into());
        items.push(PageItem::Previous);
    }
    labels.push("0. Back".into());
    items.push(PageItem::Back);
    (labels, items)
}

impl Console {
    pub fn new(store: Store, runner: RunSupervisor, settings: SettingsHandle) -> Self {
        Self {
            store,
            runner,
            settings,
        }
    }

    /// Run until the operator exits.
    pub async fn run(&self) -> Result<()> {
        loop {
            let choice = select(
                "buildmgr",
                vec![
                    "1. Current process".into(),
                    "2. Builds".into(),
                    "3. Settings".into(),
                    "0. Exit".into(),
                ],
            )
            .await?;
            match choice {
                Some(0) => self.current_process_menu().await?,
                Some(1) => self.builds_menu().await?,
                Some(2) => self.settings_menu().await?,
                _ => return Ok(()),
            }
        }
    }

    async fn current_process_menu(&self) -> Result<()> {
        let Some(active) = self.runner.current_process() else {
            println!("{}", style("No process is running.").dim());
            return Ok(());
        };
        println!(
            "{} {} since {} ({:?})",
            style("Current process:").bold(),
            active.id,
            active.created_time.format("%Y-%m-%d %H:%M:%S"),
            self.runner.state()
        );

        let choice = select(
            "Current process",
            vec!["1. Restart".into(), "2. Stop".into(), "0. Back".into()],
        )
        .await?;
        match choice {
            Some(0) => {
                if self.runner.restart_current_process().await {
                    println!("{}", style("Restarted.").green());
                } else {
                    println!("{}", style("Restart failed, see the log.").red());
                }
            }
            Some(1) => {
                if self.runner.delete_current_process().await {
                    println!("{}", style("Stopped.").green());
                } else {
                    println!("{}", style("Stop failed, see the log.").red());
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn builds_menu(&self) -> Result<()> {
        let mut page = 0;
        loop {
            // One extra row tells whether a next page exists.
            let mut records = self
                .store
                .list_build_records(PAGE_SIZE + 1, page * PAGE_SIZE)
                .await?;
            let has_next = records.len() > PAGE_SIZE;
            records.truncate(PAGE_SIZE);
            if records.is_empty() && page == 0 {
                println!("{}", style("No builds yet.").dim());
                return Ok(());
            }

            let (labels, items) = page_items(&records, page, has_next);
            let choice = select(format!("Builds (page {})", page + 1), labels).await?;
            match choice.and_then(|i| items.get(i)) {
                Some(PageItem::Build(i)) => self.build_details(&records[*i]).await?,
                Some(PageItem::Next) => page += 1,
                Some(PageItem::Previous) => page = page.saturating_sub(1),
                Some(PageItem::Back) | None => return Ok(()),
            }
        }
    }

    async fn build_details(&self, record: &BuildRecord) -> Result<()> {
        let record = self.store.get_build_record(&record.id).await?;
        println!("{}", serde_json::to_string_pretty(&record)?);

        let choice = select(
            format!("Build {}", record.id),
            vec!["1. Start".into(), "0. Back".into()],
        )
        .await?;
        if choice == Some(0) {
            if startable(&record) {
                self.runner.enqueue(&record.id);
                println!("{}", style(format!("Start of {} queued.", record.id)).green());
            } else {
                println!(
                    "{}",
                    style(format!("Build {} is {}; only built records start.", record.id, record.status()))
                        .yellow()
                );
            }
        }
        Ok(())
    }

    async fn settings_menu(&self) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(&self.settings.get())?);
        let choice = select("Settings", vec!["1. Reload".into(), "0. Back".into()]).await?;
        if choice == Some(0) {
            match self.settings.reload() {
                Ok(settings) => {
                    for warning in settings.validate() {
                        println!("{} {}", style("warning:").yellow(), warning);
                    }
                    println!("{}", style("Settings reloaded.").green());
                }
                Err(e) => println!("{} {:#}", style("Reload failed:").red(), e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildmgr_common::BuildState;
    use chrono::{TimeZone, Utc};

    fn record(id: &str) -> BuildRecord {
        BuildRecord {
            id: id.into(),
            state: BuildState::Enqueued,
            created_time: Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap(),
        }
    }

    #[test]
    fn test_build_line() {
        let line = build_line(&record("1a2b3c4d"));
        assert!(line.starts_with("1a2b3c4d  enqueued"));
        assert!(line.ends_with("2024-03-05 14:07:09"));
    }

    #[test]
    fn test_only_built_records_are_startable() {
        let artifact = buildmgr_common::Artifact {
            starting: buildmgr_common::LaunchDescriptor::new("index.js"),
            result: None,
        };
        let mut r = record("1a2b3c4d");
        assert!(!startable(&r));
        r.state = BuildState::Built(artifact.clone());
        assert!(startable(&r));
        r.state = BuildState::Running(artifact.clone());
        assert!(!startable(&r));
        r.state = BuildState::RunError(artifact);
        assert!(!startable(&r));
    }

    #[test]
    fn test_first_page_has_no_previous() {
        let records: Vec<_> = (0..PAGE_SIZE).map(|i| record(&format!("{:08x}", i))).collect();
        let (labels, items) = page_items(&records, 0, true);
        assert_eq!(labels.len(), PAGE_SIZE + 2);
        assert!(labels[0].starts_with("1. 00000000"));
        assert!(matches!(items[PAGE_SIZE], PageItem::Next));
        assert!(matches!(items.last(), Some(PageItem::Back)));
        assert!(!items.iter().any(|i| matches!(i, PageItem::Previous)));
    }

    #[test]
    fn test_last_page_has_no_next() {
        let records = vec![record("ffff0000")];
        let (labels, items) = page_items(&records, 2, false);
        assert_eq!(labels, vec!["1. ffff0000  enqueued    2024-03-05 14:07:09", "p. Previous page", "0. Back"]);
        assert!(matches!(items[1], PageItem::Previous));
    }
}
