//! Object graph assembly and the host tick loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use assetsync_core::cache::{CacheEvictor, CacheSettings};
use assetsync_core::config::AppConfig;
use assetsync_core::conflict::ConflictResolver;
use assetsync_core::db::Database;
use assetsync_core::events::EventBus;
use assetsync_core::host::{HttpAssetSource, HttpTransport, LocalFileSystem, ManifestFileIndex, Prompter};
use assetsync_core::import::{ImportOrchestrator, ImportServices, ImportSettings};
use assetsync_core::index::LocalImportIndex;
use assetsync_core::transfer::{TransferEngine, TransferSettings};

use crate::{progress, signals};

/// Database file inside the data directory.
pub const DB_FILE: &str = "assetsync.db";

pub fn open_database(config: &AppConfig) -> Result<Database> {
    let db_path = config.workspace.data_dir.join(DB_FILE);
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    Ok(db)
}

pub fn open_index(config: &AppConfig, files: &ManifestFileIndex) -> Result<LocalImportIndex> {
    LocalImportIndex::load(config.workspace.data_dir.join("index"), files)
        .context("failed to load import index")
}

/// Everything an import command needs, wired once.
pub struct App {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub bus: EventBus,
    pub orchestrator: Arc<ImportOrchestrator>,
}

impl App {
    pub fn build(config: AppConfig, prompter: Arc<dyn Prompter>) -> Result<Self> {
        let db = Arc::new(open_database(&config)?);
        let bus = EventBus::default();

        let cache_dir = config.cache_dir();
        let evictor = Arc::new(CacheEvictor::new(&cache_dir, CacheSettings::from(&config.cache)));
        let source = Arc::new(
            HttpAssetSource::new(&config.remote, &cache_dir, evictor)
                .context("failed to create asset source client")?,
        );
        let transport = Arc::new(
            HttpTransport::new(Duration::from_secs(config.remote.request_timeout_secs))
                .context("failed to create download client")?,
        );
        let engine = Arc::new(TransferEngine::new(
            transport,
            TransferSettings::from(&config.transfer),
            bus.clone(),
        ));

        let files = Arc::new(ManifestFileIndex::open(&config.workspace.project_root));
        let index = Arc::new(open_index(&config, &files)?);
        let resolver = Arc::new(ConflictResolver::new(
            source.clone(),
            index.clone(),
            prompter.clone(),
        ));

        let orchestrator = ImportOrchestrator::new(
            ImportSettings::from(&config),
            ImportServices {
                engine,
                resolver,
                source,
                fs: Arc::new(LocalFileSystem),
                files,
                index,
                prompter,
                db: db.clone(),
                bus: bus.clone(),
            },
        );
        debug!("import pipeline assembled");

        Ok(Self {
            config,
            db,
            bus,
            orchestrator,
        })
    }

    /// Run `work` and then tick until every batch is finalized. An
    /// interrupt at any point cancels all in-flight imports; the loop keeps
    /// ticking so cancelled batches are cleaned up.
    pub async fn run<F, T>(&self, work: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let bars = progress::spawn(&self.bus);
        let orchestrator = Arc::clone(&self.orchestrator);
        let watcher = tokio::spawn(async move {
            signals::wait_for_interrupt().await;
            warn!("interrupted, cancelling imports");
            orchestrator.cancel_all();
        });

        let outcome = match work.await {
            Ok(value) => self.drive().await.map(|()| value),
            Err(e) => {
                // Let anything that did start wind down.
                if let Err(drive_err) = self.drive().await {
                    error!(error = %drive_err, "failed to finish in-flight imports");
                }
                Err(e)
            }
        };

        watcher.abort();
        bars.abort();
        outcome
    }

    async fn drive(&self) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.transfer.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut first_error = None;

        loop {
            interval.tick().await;
            if let Err(e) = self.orchestrator.tick() {
                error!(error = %e, "import tick failed");
                first_error.get_or_insert(e);
            }
            if !self.orchestrator.has_active_work() {
                break;
            }
        }
        info!("all imports settled");

        match first_error {
            Some(e) => Err(e).context("placing imported files failed"),
            None => Ok(()),
        }
    }
}
