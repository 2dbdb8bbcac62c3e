//! Terminal implementation of the core `Prompter`.
//!
//! dialoguer blocks the calling thread, so every prompt runs on the blocking
//! pool. When stdin/stdout are not a terminal, or `--yes` was given, prompts
//! are answered without asking.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use dialoguer::{Confirm, Select};
use tracing::{info, warn};

use assetsync_core::conflict::{ConflictEntry, Resolution};
use assetsync_core::host::{FileCollisionChoice, FolderCollisionChoice, Prompter};
use assetsync_core::models::AssetIdentifier;

use crate::style;

pub struct TerminalPrompter {
    interactive: bool,
}

impl TerminalPrompter {
    pub fn new(assume_yes: bool) -> Self {
        let interactive = !assume_yes && console::user_attended();
        if !interactive {
            info!("prompts will be answered automatically");
        }
        Self { interactive }
    }
}

/// Run a dialoguer prompt on the blocking pool. Any terminal error counts
/// as a dismissed prompt.
async fn ask<T, F>(prompt: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> dialoguer::Result<Option<T>> + Send + 'static,
{
    match tokio::task::spawn_blocking(prompt).await {
        Ok(Ok(answer)) => answer,
        Ok(Err(e)) => {
            warn!(error = %e, "prompt failed");
            None
        }
        Err(e) => {
            warn!(error = %e, "prompt task failed");
            None
        }
    }
}

async fn confirm(message: String) -> bool {
    ask(move || Confirm::new().with_prompt(message).default(false).interact_opt())
        .await
        .unwrap_or(false)
}

fn conflict_table(conflicts: &[ConflictEntry]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Asset", "Local", "Incoming", "Changed remotely"]);
    for c in conflicts {
        table.add_row(vec![
            Cell::new(&c.name),
            Cell::new(&c.local.version),
            Cell::new(&c.asset.version),
            Cell::new(if c.drifted { "yes" } else { "no" }),
        ]);
    }
    table
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn resolve_conflicts(
        &self,
        conflicts: &[ConflictEntry],
    ) -> Option<Vec<(AssetIdentifier, Resolution)>> {
        if !self.interactive {
            return Some(
                conflicts
                    .iter()
                    .map(|c| (c.asset.clone(), Resolution::Replace))
                    .collect(),
            );
        }

        println!();
        println!("{}", style::header("Already imported"));
        println!("{}", conflict_table(conflicts));

        let mut decisions = Vec::with_capacity(conflicts.len());
        for c in conflicts {
            let prompt = format!("{} ({} -> {})", c.name, c.local.version, c.asset.version);
            let choice = ask(move || {
                Select::new()
                    .with_prompt(prompt)
                    .items(&["Replace", "Ignore"])
                    .default(0)
                    .interact_opt()
            })
            .await?;
            let resolution = if choice == 0 {
                Resolution::Replace
            } else {
                Resolution::Ignore
            };
            decisions.push((c.asset.clone(), resolution));
        }
        Some(decisions)
    }

    async fn confirm_overwrite(&self, requested: &AssetIdentifier, existing: &AssetIdentifier) -> bool {
        if !self.interactive {
            return true;
        }
        confirm(format!(
            "{} is already imported. Replace it with version {}?",
            existing, requested.version
        ))
        .await
    }

    async fn folder_collision(&self, path: &Path) -> FolderCollisionChoice {
        if !self.interactive {
            return FolderCollisionChoice::CreateNewFolder;
        }
        let prompt = format!("{} already exists and has other files in it", path.display());
        let choice = ask(move || {
            Select::new()
                .with_prompt(prompt)
                .items(&["Import into it anyway", "Use a new folder", "Cancel"])
                .default(1)
                .interact_opt()
        })
        .await;
        match choice {
            Some(0) => FolderCollisionChoice::ContinueInPlace,
            Some(1) => FolderCollisionChoice::CreateNewFolder,
            _ => FolderCollisionChoice::Cancel,
        }
    }

    async fn file_collision(&self, path: &Path) -> FileCollisionChoice {
        if !self.interactive {
            return FileCollisionChoice::CreateNewFolder;
        }
        let prompt = format!("A file named {} is in the way", path.display());
        let choice = ask(move || {
            Select::new()
                .with_prompt(prompt)
                .items(&["Use a new folder", "Cancel"])
                .default(0)
                .interact_opt()
        })
        .await;
        match choice {
            Some(0) => FileCollisionChoice::CreateNewFolder,
            _ => FileCollisionChoice::Cancel,
        }
    }

    async fn confirm_remove(&self, asset: &AssetIdentifier, paths: &[PathBuf]) -> bool {
        if !self.interactive {
            return true;
        }
        println!();
        println!("{}", style::header(&format!("Files of {}", asset)));
        for path in paths {
            println!("  {}", style::dim(&path.display().to_string()));
        }
        confirm(format!("Delete these {} file(s)?", paths.len())).await
    }
}
