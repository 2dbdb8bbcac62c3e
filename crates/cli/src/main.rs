//! AssetSync command-line importer.
//!
//! Imports remote assets and their dependencies into a local project,
//! resumes interrupted imports, removes imported assets, and reports status.

mod app;
mod progress;
mod prompt;
mod signals;
mod status;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::HumanBytes;
use tracing_subscriber::EnvFilter;

use assetsync_core::cache::{CacheEvictor, CacheSettings};
use assetsync_core::config::AppConfig;
use assetsync_core::host::{FileSystem, LocalFileSystem};
use assetsync_core::models::{AssetIdentifier, SyncMode};

use crate::app::App;
use crate::prompt::TerminalPrompter;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// AssetSync command-line importer.
#[derive(Parser, Debug)]
#[command(
    name = "assetsync",
    version,
    about = "Import versioned remote assets and their dependencies into a local project"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./assetsync.toml")]
    config: PathBuf,

    /// Log level override: trace, debug, info, warn, error.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Answer every prompt with its non-destructive default.
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import assets (org/project/asset@version) and their dependencies.
    Import {
        #[arg(required = true)]
        assets: Vec<String>,

        /// Follow dependencies to their latest versions.
        #[arg(long)]
        latest: bool,

        /// Review already-imported assets before replacing them.
        #[arg(long)]
        review: bool,
    },

    /// Continue imports interrupted by a crash or shutdown.
    Resume,

    /// Cancel an interrupted import and clean up its downloads.
    Cancel { asset: String },

    /// Delete an imported asset's files from the project.
    Remove { asset: String },

    /// Print the folder an imported asset lives in.
    Show { asset: String },

    /// Show imports in progress, imported assets, and recent batches.
    Status {
        /// Number of recent batches to show.
        #[arg(short, long, default_value = "10")]
        limit: u32,
    },

    /// Manage the metadata cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./assetsync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Show how much space the cache uses.
    Usage,
    /// Evict least recently used files if the cache is over budget.
    Evict,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("Error: {:#}", e)));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => {
            init_tracing(cli.log_level.as_deref().unwrap_or("warn"));
            cmd_init(&output)
        }
        Commands::Validate => {
            init_tracing(cli.log_level.as_deref().unwrap_or("warn"));
            cmd_validate(&cli.config)
        }
        command => {
            let mut config = load_config(&cli.config)?;
            init_tracing(
                cli.log_level
                    .as_deref()
                    .unwrap_or(&config.workspace.log_level),
            );

            match command {
                Commands::Import {
                    assets,
                    latest,
                    review,
                } => {
                    if latest {
                        config.import.sync_mode = SyncMode::Latest;
                    }
                    cmd_import(config, cli.yes, &assets, review).await
                }
                Commands::Resume => cmd_resume(config, cli.yes).await,
                Commands::Cancel { asset } => cmd_cancel(config, cli.yes, &asset).await,
                Commands::Remove { asset } => cmd_remove(config, cli.yes, &asset).await,
                Commands::Show { asset } => cmd_show(config, &asset),
                Commands::Status { limit } => {
                    let db = app::open_database(&config)?;
                    status::run_status(&config, &db, limit)
                }
                Commands::Cache { action } => cmd_cache(&config, action),
                Commands::Init { .. } | Commands::Validate => unreachable!(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_and_resolve(path).context("failed to load configuration file")
}

fn parse_asset(s: &str) -> Result<AssetIdentifier> {
    s.parse::<AssetIdentifier>().map_err(|e| anyhow::anyhow!(e))
}

fn build_app(config: AppConfig, assume_yes: bool) -> Result<App> {
    App::build(config, Arc::new(TerminalPrompter::new(assume_yes)))
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_import(config: AppConfig, assume_yes: bool, assets: &[String], review: bool) -> Result<()> {
    let ids = assets
        .iter()
        .map(|s| parse_asset(s))
        .collect::<Result<Vec<_>>>()?;
    let app = build_app(config, assume_yes)?;
    let orchestrator = Arc::clone(&app.orchestrator);

    let started = app
        .run(async {
            let resumed = orchestrator
                .restore()
                .await
                .context("failed to restore interrupted imports")?;
            if resumed > 0 {
                println!("{}", style::warn(&format!("Resuming {} interrupted transfer(s)", resumed)));
            }
            if ids.len() == 1 && !review {
                let started = orchestrator.start_import(&ids[0]).await?;
                if !started && orchestrator.is_importing(&ids[0]) {
                    println!(
                        "{}",
                        style::warn(&format!("{} is still part of an unfinished batch; waiting for it to settle", ids[0]))
                    );
                }
                Ok::<_, anyhow::Error>(usize::from(started))
            } else {
                Ok::<_, anyhow::Error>(orchestrator.import_assets(&ids).await?)
            }
        })
        .await?;

    if started == 0 {
        println!("{}", style::warn("Nothing was imported"));
    }
    Ok(())
}

async fn cmd_resume(config: AppConfig, assume_yes: bool) -> Result<()> {
    let app = build_app(config, assume_yes)?;
    let orchestrator = Arc::clone(&app.orchestrator);
    let resumed = app
        .run(async { Ok::<_, anyhow::Error>(orchestrator.restore().await?) })
        .await?;
    if resumed == 0 && app.orchestrator.operations().is_empty() {
        println!("{}", style::success("Nothing to resume"));
    }
    Ok(())
}

async fn cmd_cancel(config: AppConfig, assume_yes: bool, asset: &str) -> Result<()> {
    let id = parse_asset(asset)?;
    let app = build_app(config, assume_yes)?;
    let orchestrator = Arc::clone(&app.orchestrator);
    let cancelled = app
        .run(async {
            orchestrator.restore().await?;
            Ok::<_, anyhow::Error>(orchestrator.cancel_import(&id))
        })
        .await?;
    if cancelled {
        println!("{}", style::success(&format!("Cancelled import of {}", id)));
    } else {
        println!("{}", style::warn(&format!("No import of {} is in progress", id)));
    }
    Ok(())
}

async fn cmd_remove(config: AppConfig, assume_yes: bool, asset: &str) -> Result<()> {
    let id = parse_asset(asset)?;
    let app = build_app(config, assume_yes)?;

    let snapshot = app.db.load_snapshot().context("failed to read import state")?;
    if snapshot.operations.iter().any(|op| op.asset.same_asset(&id))
        || snapshot.pending.iter().any(|p| p.asset.same_asset(&id))
    {
        anyhow::bail!(
            "{} has an unfinished import; run 'assetsync resume' or 'assetsync cancel {}' first",
            id,
            asset
        );
    }

    match app.orchestrator.remove_import(&id).await? {
        None => println!("{}", style::warn("Nothing was removed")),
        Some(report) => {
            println!(
                "{}",
                style::success(&format!("Removed {} path(s) of {}", report.removed.len(), id))
            );
            for (path, reason) in &report.failed {
                println!("{}", style::error(&format!("{}: {}", path.display(), reason)));
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} path(s) could not be deleted", report.failed.len());
            }
        }
    }
    Ok(())
}

fn cmd_show(config: AppConfig, asset: &str) -> Result<()> {
    let id = parse_asset(asset)?;
    let app = build_app(config, true)?;
    match app.orchestrator.show_in_project(&id) {
        Some(path) => {
            println!("{}", path.display());
            Ok(())
        }
        None => anyhow::bail!("{} is not imported", id),
    }
}

fn cmd_cache(config: &AppConfig, action: CacheAction) -> Result<()> {
    let dir = config.cache_dir();
    let settings = CacheSettings::from(&config.cache);
    match action {
        CacheAction::Usage => {
            let used = LocalFileSystem.dir_size(&dir);
            println!("  Cache dir : {}", dir.display());
            println!("  Used      : {}", HumanBytes(used));
            println!("  Budget    : {}", HumanBytes(settings.max_bytes));
        }
        CacheAction::Evict => {
            let evictor = CacheEvictor::new(&dir, settings);
            let report = evictor
                .check_and_evict(None)
                .context("cache eviction failed")?;
            if report.evicted.is_empty() {
                println!("{}", style::success("Cache is within budget"));
            } else {
                println!(
                    "{}",
                    style::success(&format!(
                        "Evicted {} file(s), freed {}",
                        report.evicted.len(),
                        HumanBytes(report.freed_bytes)
                    ))
                );
            }
            println!("  Size now  : {}", HumanBytes(report.size_after));
        }
    }
    Ok(())
}

const DEFAULT_CONFIG: &str = r#"# AssetSync Configuration
# See documentation for all available options.

[workspace]
project_root = "."
assets_dir = "Assets"
data_dir = ".assetsync"
log_level = "warn"

[remote]
api_url = "https://assets.example.com/api/v1"
token_env = "ASSETSYNC_TOKEN"
request_timeout_secs = 30

[transfer]
max_concurrent = 30
progress_step = 0.05
tick_interval_ms = 100

[cache]
# max_size_bytes = 10737418240
shrink_delta_bytes = 2147483648
lookback_secs = 60

[import]
companion_suffix = ".meta"
sync_mode = "pinned"
"#;

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, DEFAULT_CONFIG).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Set remote.api_url and workspace.project_root");
    println!("  2. Export the token variable (ASSETSYNC_TOKEN) if the API needs one");
    println!(
        "  3. Validate with: assetsync validate --config {}",
        output.display()
    );
    println!(
        "  4. Import with: assetsync import org/project/asset@version --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    let _ = config.resolve_env_vars();
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    let (cache_max, default_max) = config.cache.effective_max();
    println!();
    println!("Configuration summary:");
    println!("  API URL        : {}", config.remote.api_url);
    println!(
        "  API token      : {}",
        if config.remote.token.is_some() {
            "set"
        } else {
            "not set"
        }
    );
    println!("  Assets root    : {}", config.workspace.assets_root().display());
    println!("  Data directory : {}", config.workspace.data_dir.display());
    println!("  Max transfers  : {}", config.transfer.max_concurrent);
    println!(
        "  Cache budget   : {}{}",
        HumanBytes(cache_max),
        if default_max { " (default)" } else { "" }
    );
    println!();
    println!("Configuration is valid.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_import() {
        let cli = Cli::try_parse_from([
            "assetsync",
            "--config",
            "/tmp/a.toml",
            "import",
            "acme/props/chair@3",
            "--latest",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/a.toml"));
        match cli.command {
            Commands::Import { assets, latest, review } => {
                assert_eq!(assets, vec!["acme/props/chair@3"]);
                assert!(latest);
                assert!(!review);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assetsync.toml");
        cmd_init(&path).unwrap();
        let config = AppConfig::load_from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.transfer.max_concurrent, 30);
        assert!(cmd_init(&path).is_err());
    }

    #[test]
    fn test_parse_asset_rejects_garbage() {
        assert!(parse_asset("acme/props/chair@1").is_ok());
        assert!(parse_asset("chair").is_err());
    }
}
