//! Status dashboard: live imports, tracked imports, and recent batches.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use assetsync_core::config::AppConfig;
use assetsync_core::db::Database;
use assetsync_core::host::{FileIndex, ManifestFileIndex};

use crate::app;
use crate::style;

pub fn run_status(config: &AppConfig, db: &Database, limit: u32) -> Result<()> {
    println!();
    println!("{}", style::header("AssetSync"));
    println!("{}", "═".repeat(9));
    println!();
    println!("  Project    {}", config.workspace.project_root.display());
    println!("  Assets     {}", config.workspace.assets_root().display());
    println!();

    // In-flight state as last persisted; it may belong to another process.
    let snapshot = db.load_snapshot().context("failed to read import state")?;
    if snapshot.operations.is_empty() && snapshot.pending.is_empty() {
        println!("{}", style::success("No imports in progress"));
    } else {
        println!("  {}", style::header("In progress"));
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Asset", "Status", "Progress", "Destination", "Started"]);
        for op in &snapshot.operations {
            table.add_row(vec![
                Cell::new(op.asset.to_string()),
                style::status_cell(&op.status.to_string()),
                Cell::new(format!("{:.0}%", op.progress() * 100.0)),
                Cell::new(op.destination_path.display().to_string()),
                Cell::new(op.started_at.format("%Y-%m-%d %H:%M").to_string()),
            ]);
        }
        for p in snapshot
            .pending
            .iter()
            .filter(|p| !snapshot.operations.iter().any(|op| op.asset == p.asset))
        {
            table.add_row(vec![
                Cell::new(p.asset.to_string()),
                style::status_cell("queued"),
                Cell::new("—"),
                Cell::new("—"),
                Cell::new("—"),
            ]);
        }
        println!("{}", table);
        println!(
            "  {}",
            style::dim("Run 'assetsync resume' to continue or 'assetsync cancel <asset>' to stop.")
        );
    }
    println!();

    let files = ManifestFileIndex::open(&config.workspace.project_root);
    let index = app::open_index(config, &files)?;
    let tracked = index.tracked_assets();
    if !tracked.is_empty() {
        println!("  {}", style::header(&format!("Imported ({})", tracked.len())));
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Asset", "Files", "Missing"]);
        for asset in &tracked {
            let records = index.records_for(asset);
            let missing = records
                .iter()
                .filter(|r| files.path_of(&r.artifact_id).is_none())
                .count();
            table.add_row(vec![
                Cell::new(asset.to_string()),
                Cell::new(records.len()),
                Cell::new(missing),
            ]);
        }
        println!("{}", table);
        println!();
    }

    let history = db
        .list_batch_history(limit)
        .context("failed to list batch history")?;
    if !history.is_empty() {
        println!("  {}", style::header("Recent batches"));
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Finished", "Status", "Assets", "Placed", "Details"]);
        for entry in &history {
            table.add_row(vec![
                Cell::new(&entry.finished_at[..19.min(entry.finished_at.len())]),
                style::status_cell(&entry.status),
                Cell::new(entry.asset_count),
                Cell::new(entry.placed_count),
                Cell::new(entry.details.as_deref().unwrap_or("")),
            ]);
        }
        println!("{}", table);
        println!();
    }

    Ok(())
}
