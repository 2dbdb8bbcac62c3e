//! Top-level import orchestration.
//!
//! An import request becomes a batch: the requested asset plus its
//! dependencies, one [`ImportOperation`] each. Every operation negotiates a
//! destination folder, downloads its files through the [`TransferEngine`]
//! into a private staging directory, and waits. When every operation of the
//! batch is terminal, one placement pass moves the files of the successful
//! operations into the project under a single file-index batch scope.
//!
//! Transfer completions reach the orchestrator through [`ImportOrchestrator::tick`],
//! which must be called periodically by the host.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::conflict::{CollectedAsset, ConflictResolver};
use crate::db::Database;
use crate::errors::{ConflictError, ImportError};
use crate::events::{EventBus, ImportEvent, TransferEvent};
use crate::host::{
    AssetSource, FileCollisionChoice, FileIndex, FileSystem, FolderCollisionChoice,
    IndexBatchScope, Prompter, RemoteFile,
};
use crate::index::LocalImportIndex;
use crate::models::{
    ArtifactId, AssetIdentifier, AssetLineage, BatchStatus, ImportOperation, ImportSnapshot,
    ImportStatus, LocalArtifactRecord, PendingImport, RelocationStash, StashedArtifact, SyncMode,
    TransferId, TransferJob, TransferStatus,
};
use crate::transfer::TransferEngine;

/// Paths and policies the orchestrator needs from the configuration.
#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub assets_root: PathBuf,
    /// Parent of the `downloads/` staging and `stash/` relocation areas.
    pub data_dir: PathBuf,
    pub ignore_patterns: Vec<String>,
    pub companion_suffix: String,
    pub sync_mode: SyncMode,
}

impl From<&AppConfig> for ImportSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            assets_root: config.workspace.assets_root(),
            data_dir: config.workspace.data_dir.clone(),
            ignore_patterns: config.import.ignore_patterns.clone(),
            companion_suffix: config.import.companion_suffix.clone(),
            sync_mode: config.import.sync_mode,
        }
    }
}

/// Collaborators, assembled once at startup.
pub struct ImportServices {
    pub engine: Arc<TransferEngine>,
    pub resolver: Arc<ConflictResolver>,
    pub source: Arc<dyn AssetSource>,
    pub fs: Arc<dyn FileSystem>,
    pub files: Arc<dyn FileIndex>,
    pub index: Arc<LocalImportIndex>,
    pub prompter: Arc<dyn Prompter>,
    pub db: Arc<Database>,
    pub bus: EventBus,
}

/// Result of a confirmed [`ImportOrchestrator::remove_import`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

#[derive(Debug, Default)]
struct BatchState {
    members: Vec<AssetIdentifier>,
    /// All members have been registered; the barrier may release.
    sealed: bool,
}

#[derive(Default)]
struct OrchestratorState {
    operations: HashMap<AssetIdentifier, ImportOperation>,
    pending: Vec<PendingImport>,
    collecting: HashMap<AssetLineage, CancellationToken>,
    job_index: HashMap<TransferId, AssetIdentifier>,
    batches: HashMap<String, BatchState>,
}

impl OrchestratorState {
    fn live_operation(&self, asset: &AssetIdentifier) -> Option<&ImportOperation> {
        self.operations
            .values()
            .find(|op| op.asset.same_asset(asset) && !op.status.is_terminal())
    }

    /// Operation of the same remote asset whose batch has not finalized yet.
    /// It may already be terminal.
    fn unfinalized_operation(&self, asset: &AssetIdentifier) -> Option<&ImportOperation> {
        self.operations.values().find(|op| op.asset.same_asset(asset))
    }

    fn is_importing(&self, asset: &AssetIdentifier) -> bool {
        self.collecting.contains_key(&asset.lineage()) || self.unfinalized_operation(asset).is_some()
    }
}

fn lock_state(m: &Mutex<OrchestratorState>) -> MutexGuard<'_, OrchestratorState> {
    m.lock().unwrap_or_else(|poisoned| {
        warn!("orchestrator mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Releases the dependency-collection claim on drop.
struct CollectingGuard<'a> {
    state: &'a Mutex<OrchestratorState>,
    keys: Vec<AssetLineage>,
}

impl Drop for CollectingGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock_state(self.state);
        for key in &self.keys {
            state.collecting.remove(key);
        }
    }
}

enum Collision {
    Continue,
    NewFolder,
    Cancel,
}

struct Placement {
    destination: PathBuf,
    stash: Option<RelocationStash>,
}

pub struct ImportOrchestrator {
    settings: ImportSettings,
    engine: Arc<TransferEngine>,
    resolver: Arc<ConflictResolver>,
    source: Arc<dyn AssetSource>,
    fs: Arc<dyn FileSystem>,
    files: Arc<dyn FileIndex>,
    index: Arc<LocalImportIndex>,
    prompter: Arc<dyn Prompter>,
    db: Arc<Database>,
    bus: EventBus,
    shutdown: CancellationToken,
    state: Mutex<OrchestratorState>,
}

impl ImportOrchestrator {
    pub fn new(settings: ImportSettings, services: ImportServices) -> Arc<Self> {
        Arc::new(Self {
            settings,
            engine: services.engine,
            resolver: services.resolver,
            source: services.source,
            fs: services.fs,
            files: services.files,
            index: services.index,
            prompter: services.prompter,
            db: services.db,
            bus: services.bus,
            shutdown: CancellationToken::new(),
            state: Mutex::new(OrchestratorState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        lock_state(&self.state)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The live operation for `asset` (exact version first, then any
    /// version of the same remote asset).
    pub fn get_import_operation(&self, asset: &AssetIdentifier) -> Option<ImportOperation> {
        let state = self.lock();
        state
            .operations
            .get(asset)
            .or_else(|| state.operations.values().find(|op| op.asset.same_asset(asset)))
            .cloned()
    }

    /// `true` from dependency collection until the asset's batch has been
    /// finalized, so a failed member cannot be restarted while its batch is
    /// still open.
    pub fn is_importing(&self, asset: &AssetIdentifier) -> bool {
        self.lock().is_importing(asset)
    }

    /// Current state of `asset`; `None` means idle.
    pub fn status_of(&self, asset: &AssetIdentifier) -> Option<ImportStatus> {
        let state = self.lock();
        if state.collecting.contains_key(&asset.lineage()) {
            return Some(ImportStatus::DependencyCollection);
        }
        state
            .operations
            .values()
            .find(|op| op.asset.same_asset(asset))
            .map(|op| op.status)
    }

    /// All live operations, oldest first.
    pub fn operations(&self) -> Vec<ImportOperation> {
        let mut ops: Vec<_> = self.lock().operations.values().cloned().collect();
        ops.sort_by_key(|op| op.started_at);
        ops
    }

    /// Tracked imports and how many files each has.
    pub fn tracked(&self) -> Vec<(AssetIdentifier, usize)> {
        self.index
            .tracked_assets()
            .into_iter()
            .map(|a| {
                let n = self.index.records_for(&a).len();
                (a, n)
            })
            .collect()
    }

    /// `true` while any batch, operation, or dependency collection is live.
    pub fn has_active_work(&self) -> bool {
        let state = self.lock();
        !state.operations.is_empty() || !state.batches.is_empty() || !state.collecting.is_empty()
    }

    /// Folder the asset lives in (or is being imported into).
    pub fn show_in_project(&self, asset: &AssetIdentifier) -> Option<PathBuf> {
        if let Some(op) = self.get_import_operation(asset) {
            return Some(op.destination_path);
        }
        self.prior_destination(asset)
    }

    // -----------------------------------------------------------------------
    // Starting imports
    // -----------------------------------------------------------------------

    /// Import one asset and its dependencies.
    ///
    /// Returns `Ok(false)` if the asset is already being imported, the user
    /// declined to overwrite a local copy, or the request was cancelled
    /// during dependency collection.
    pub async fn start_import(self: &Arc<Self>, asset: &AssetIdentifier) -> Result<bool, ImportError> {
        let token = self.shutdown.child_token();
        {
            let mut state = self.lock();
            if state.is_importing(asset) {
                info!(%asset, "import already in progress");
                return Ok(false);
            }
            state.collecting.insert(asset.lineage(), token.clone());
        }
        let guard = CollectingGuard {
            state: &self.state,
            keys: vec![asset.lineage()],
        };

        if let Some(existing) = self.index.local_version_of(asset) {
            let confirmed = tokio::select! {
                _ = token.cancelled() => false,
                ok = self.prompter.confirm_overwrite(asset, &existing) => ok,
            };
            if !confirmed {
                info!(%asset, %existing, "overwrite declined");
                return Ok(false);
            }
        }

        let collected = self
            .resolver
            .collect_dependencies(std::slice::from_ref(asset), self.settings.sync_mode, &token)
            .await?;
        if token.is_cancelled() {
            info!(%asset, "import cancelled during dependency collection");
            return Ok(false);
        }

        let selected: Vec<CollectedAsset> = collected
            .into_iter()
            .filter(|c| {
                if c.requested {
                    return true;
                }
                if self.is_importing_elsewhere(&c.asset, asset) {
                    debug!(dependency = %c.asset, "dependency already importing, skipping");
                    return false;
                }
                if self.index.local_version_of(&c.asset).as_ref() == Some(&c.asset) {
                    debug!(dependency = %c.asset, "dependency already imported, skipping");
                    return false;
                }
                true
            })
            .collect();

        let pending = self.register_pending(selected)?;
        drop(guard);
        if pending.is_empty() {
            return Ok(false);
        }
        self.run_batch(pending).await?;
        Ok(true)
    }

    /// Import several assets through full conflict resolution as one batch.
    /// Returns the number of operations started.
    pub async fn import_assets(self: &Arc<Self>, requested: &[AssetIdentifier]) -> Result<usize, ImportError> {
        let token = self.shutdown.child_token();
        let wanted: Vec<AssetIdentifier> = {
            let mut state = self.lock();
            let wanted: Vec<AssetIdentifier> = requested
                .iter()
                .filter(|a| {
                    let busy = state.is_importing(a);
                    if busy {
                        info!(asset = %a, "import already in progress, skipping");
                    }
                    !busy
                })
                .cloned()
                .collect();
            for a in &wanted {
                state.collecting.insert(a.lineage(), token.clone());
            }
            wanted
        };
        if wanted.is_empty() {
            return Ok(0);
        }
        let guard = CollectingGuard {
            state: &self.state,
            keys: wanted.iter().map(AssetIdentifier::lineage).collect(),
        };

        let approved = match self
            .resolver
            .resolve(&wanted, self.settings.sync_mode, &self.settings.assets_root, token)
            .await
        {
            Ok(approved) => approved,
            Err(ConflictError::Unresolved) => {
                self.record_unresolved(&wanted);
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let approved: Vec<CollectedAsset> = approved
            .into_iter()
            .filter(|c| c.requested || !self.is_importing_elsewhere(&c.asset, &c.asset))
            .collect();
        if approved.is_empty() {
            info!("nothing approved for import");
            return Ok(0);
        }

        let pending = self.register_pending(approved)?;
        drop(guard);
        let count = pending.len();
        if count > 0 {
            self.run_batch(pending).await?;
        }
        Ok(count)
    }

    /// A dismissed conflict prompt cancels the whole request. It never opened
    /// a batch, so only the history records it.
    fn record_unresolved(&self, assets: &[AssetIdentifier]) {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let names: Vec<String> = assets.iter().map(ToString::to_string).collect();
        let details = format!("{}: {}", names.join(", "), ImportError::ConflictUnresolved);
        info!(assets = assets.len(), "conflict prompt dismissed, nothing imported");
        if let Err(e) = self.db.insert_batch_history(
            &batch_id,
            BatchStatus::Cancelled,
            assets.len(),
            0,
            Some(details.as_str()),
        ) {
            warn!(error = %e, "failed to record batch history");
        }
    }

    /// Live operation for `asset` that is not the collection claimed by
    /// `claimant`.
    fn is_importing_elsewhere(&self, asset: &AssetIdentifier, claimant: &AssetIdentifier) -> bool {
        let state = self.lock();
        state.unfinalized_operation(asset).is_some()
            || (asset.lineage() != claimant.lineage()
                && state.collecting.contains_key(&asset.lineage()))
    }

    /// Open a new batch for `assets`. Assets already pending in another batch
    /// are left out; an empty result means no batch was opened.
    fn register_pending(&self, assets: Vec<CollectedAsset>) -> Result<Vec<PendingImport>, ImportError> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let pending = {
            let mut state = self.lock();
            let pending: Vec<PendingImport> = assets
                .into_iter()
                .filter(|c| {
                    let queued = state.pending.iter().any(|p| p.asset == c.asset);
                    if queued {
                        debug!(asset = %c.asset, "already pending in another batch, skipping");
                    }
                    !queued
                })
                .map(|c| PendingImport {
                    asset: c.asset,
                    name: c.name,
                    batch_id: batch_id.clone(),
                })
                .collect();
            if pending.is_empty() {
                return Ok(pending);
            }
            state.pending.extend(pending.iter().cloned());
            state.batches.insert(batch_id.clone(), BatchState::default());
            pending
        };
        info!(batch = %batch_id, assets = pending.len(), "registered import batch");

        if let Err(e) = self.persist() {
            // An unsealed batch would never release; drop it again.
            let mut state = self.lock();
            state.pending.retain(|p| p.batch_id != batch_id);
            state.batches.remove(&batch_id);
            return Err(e);
        }
        Ok(pending)
    }

    /// Create an operation per pending import, seal the batch, and run every
    /// new operation's download phase concurrently.
    async fn run_batch(self: &Arc<Self>, pending: Vec<PendingImport>) -> Result<(), ImportError> {
        let mut started = Vec::new();
        let mut batch_ids = HashSet::new();

        for p in pending {
            batch_ids.insert(p.batch_id.clone());
            let exists = self.lock().operations.contains_key(&p.asset);
            if exists {
                self.join_batch(&p.batch_id, &p.asset);
                continue;
            }

            let staging = self
                .settings
                .data_dir
                .join("downloads")
                .join(uuid::Uuid::new_v4().simple().to_string());
            let negotiated = if self.shutdown.is_cancelled() {
                Ok(None)
            } else {
                self.negotiate_destination(&p).await
            };

            let mut op = ImportOperation {
                asset: p.asset.clone(),
                name: p.name.clone(),
                destination_path: self.default_destination(&p),
                staging_path: staging,
                started_at: Utc::now(),
                status: ImportStatus::Queued,
                error: None,
                batch_id: p.batch_id.clone(),
                stash: None,
                fingerprint: None,
                jobs: Vec::new(),
            };
            match negotiated {
                Ok(Some(placement)) => {
                    op.destination_path = placement.destination;
                    op.stash = placement.stash;
                    started.push(p.asset.clone());
                }
                Ok(None) => {
                    info!(asset = %p.asset, "import cancelled at destination negotiation");
                    op.status = ImportStatus::Cancelled;
                }
                Err(e) => {
                    warn!(asset = %p.asset, error = %e, "destination negotiation failed");
                    op.status = ImportStatus::Error;
                    op.error = Some(e.to_string());
                }
            }
            let finalized = op.status.is_terminal().then(|| ImportEvent::Finalized {
                asset: op.asset.clone(),
                status: op.status,
                error: op.error.clone(),
            });

            self.lock().operations.insert(p.asset.clone(), op);
            self.join_batch(&p.batch_id, &p.asset);
            if let Some(event) = finalized {
                self.bus.publish(event);
            }
        }

        {
            let mut state = self.lock();
            for id in &batch_ids {
                if let Some(batch) = state.batches.get_mut(id) {
                    batch.sealed = true;
                }
            }
        }
        // The next tick persists again; the downloads must start regardless.
        if let Err(e) = self.persist() {
            error!(error = %e, "failed to persist import state");
        }

        let mut downloads = JoinSet::new();
        for asset in started {
            let this = Arc::clone(self);
            downloads.spawn(async move { this.download(asset).await });
        }
        while let Some(joined) = downloads.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "download phase task failed");
            }
        }
        Ok(())
    }

    fn join_batch(&self, batch_id: &str, asset: &AssetIdentifier) {
        let mut state = self.lock();
        let batch = state.batches.entry(batch_id.to_string()).or_default();
        if !batch.members.contains(asset) {
            batch.members.push(asset.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Destination negotiation
    // -----------------------------------------------------------------------

    fn default_destination(&self, pending: &PendingImport) -> PathBuf {
        self.settings
            .assets_root
            .join(sanitize_folder_name(&pending.name, &pending.asset))
    }

    /// Folder a previous import of the same remote asset was placed into.
    fn prior_destination(&self, asset: &AssetIdentifier) -> Option<PathBuf> {
        self.index.records_for(asset).into_iter().find_map(|record| {
            let live = self.files.path_of(&record.artifact_id)?;
            strip_relative(&live, &record.original_relative_path)
        })
    }

    fn reserved_destinations(&self) -> HashSet<PathBuf> {
        self.lock()
            .operations
            .values()
            .filter(|op| !op.status.is_terminal())
            .map(|op| op.destination_path.clone())
            .collect()
    }

    fn next_free_folder(&self, base: &Path, reserved: &HashSet<PathBuf>) -> PathBuf {
        let parent = base.parent().unwrap_or(&self.settings.assets_root);
        let name = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Import".into());
        (1u32..)
            .map(|n| parent.join(format!("{} {}", name, n)))
            .find(|candidate| !self.fs.exists(candidate) && !reserved.contains(candidate))
            .unwrap_or_else(|| parent.join(format!("{} {}", name, uuid::Uuid::new_v4().simple())))
    }

    async fn negotiate_destination(&self, pending: &PendingImport) -> Result<Option<Placement>, ImportError> {
        let prior = self.prior_destination(&pending.asset);
        let mut target = prior.clone().unwrap_or_else(|| self.default_destination(pending));
        let stash = match &prior {
            Some(dir) => self.stash_prior_files(&pending.asset, dir)?,
            None => None,
        };

        let reserved = self.reserved_destinations();
        if reserved.contains(&target) {
            target = self.next_free_folder(&target, &reserved);
        } else if self.fs.exists(&target) {
            let collision = if self.fs.is_dir(&target) {
                let occupied = self
                    .fs
                    .walk_files(&target)
                    .map(|files| !files.is_empty())
                    .unwrap_or(true);
                if occupied {
                    match self.prompter.folder_collision(&target).await {
                        FolderCollisionChoice::ContinueInPlace => Collision::Continue,
                        FolderCollisionChoice::CreateNewFolder => Collision::NewFolder,
                        FolderCollisionChoice::Cancel => Collision::Cancel,
                    }
                } else {
                    Collision::Continue
                }
            } else {
                match self.prompter.file_collision(&target).await {
                    FileCollisionChoice::CreateNewFolder => Collision::NewFolder,
                    FileCollisionChoice::Cancel => Collision::Cancel,
                }
            };
            match collision {
                Collision::Continue => {}
                Collision::NewFolder => target = self.next_free_folder(&target, &reserved),
                Collision::Cancel => {
                    if let Some(stash) = &stash {
                        self.restore_stash(stash);
                    }
                    return Ok(None);
                }
            }
        }

        debug!(asset = %pending.asset, destination = %target.display(), "destination negotiated");
        Ok(Some(Placement {
            destination: target,
            stash,
        }))
    }

    /// Move the previously imported files of `asset` out of `dir` into a
    /// fresh stash directory.
    fn stash_prior_files(&self, asset: &AssetIdentifier, dir: &Path) -> Result<Option<RelocationStash>, ImportError> {
        let mut stash = RelocationStash {
            stash_dir: self
                .settings
                .data_dir
                .join("stash")
                .join(uuid::Uuid::new_v4().simple().to_string()),
            original_dir: dir.to_path_buf(),
            files: Vec::new(),
            artifacts: Vec::new(),
        };

        for record in self.index.records_for(asset) {
            let Some(live) = self.files.path_of(&record.artifact_id) else {
                continue;
            };
            let Ok(rel) = live.strip_prefix(dir) else {
                continue;
            };
            let rel = rel.to_path_buf();
            for candidate in [rel.clone(), with_suffix(&rel, &self.settings.companion_suffix)] {
                let from = dir.join(&candidate);
                if !self.fs.exists(&from) {
                    continue;
                }
                if let Err(source) = self.fs.move_file(&from, &stash.stash_dir.join(&candidate)) {
                    self.restore_stash(&stash);
                    return Err(ImportError::FileSystem { path: from, source });
                }
                stash.files.push(candidate);
            }
            stash.artifacts.push(StashedArtifact { path: rel, record });
        }

        if stash.files.is_empty() {
            return Ok(None);
        }
        info!(%asset, files = stash.files.len(), stash = %stash.stash_dir.display(), "stashed previous import");
        Ok(Some(stash))
    }

    /// Move stashed files back where they came from and bind them to their
    /// old artifact ids again.
    fn restore_stash(&self, stash: &RelocationStash) {
        let _scope = IndexBatchScope::begin(self.files.as_ref());
        for rel in &stash.files {
            let from = stash.stash_dir.join(rel);
            let to = stash.original_dir.join(rel);
            if let Err(e) = self.fs.move_file(&from, &to) {
                error!(from = %from.display(), to = %to.display(), error = %e, "failed to restore stashed file");
            }
        }
        for stashed in &stash.artifacts {
            let path = stash.original_dir.join(&stashed.path);
            if self.fs.exists(&path) {
                self.files.register(&path, Some(&stashed.record.artifact_id));
            }
        }
        self.discard_stash(stash);
        debug!(dir = %stash.original_dir.display(), "restored stashed files");
    }

    fn discard_stash(&self, stash: &RelocationStash) {
        if self.fs.exists(&stash.stash_dir) {
            if let Err(e) = self.fs.remove_dir_all(&stash.stash_dir) {
                warn!(dir = %stash.stash_dir.display(), error = %e, "failed to remove stash directory");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Download phase
    // -----------------------------------------------------------------------

    async fn download(&self, asset: AssetIdentifier) {
        let staging = {
            let state = self.lock();
            match state.operations.get(&asset) {
                Some(op) if op.status == ImportStatus::Queued => op.staging_path.clone(),
                _ => return,
            }
        };

        let prepared = self.prepare_jobs(&asset, &staging).await;

        let mut finalized = None;
        let to_enqueue = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(op) = state.operations.get_mut(&asset) else {
                return;
            };
            if op.status != ImportStatus::Queued {
                debug!(%asset, "operation ended before its transfers were queued");
                Vec::new()
            } else {
                match prepared {
                    Ok((fingerprint, jobs)) => {
                        op.fingerprint = fingerprint;
                        op.jobs = jobs.clone();
                        op.status = ImportStatus::InProgress;
                        for job in &jobs {
                            state.job_index.insert(job.id, asset.clone());
                        }
                        jobs
                    }
                    Err(e) => {
                        warn!(%asset, error = %e, "download phase failed");
                        op.status = ImportStatus::Error;
                        op.error = Some(e.to_string());
                        finalized = Some(ImportEvent::Finalized {
                            asset: asset.clone(),
                            status: ImportStatus::Error,
                            error: op.error.clone(),
                        });
                        Vec::new()
                    }
                }
            }
        };

        if !to_enqueue.is_empty() {
            info!(%asset, files = to_enqueue.len(), "queued transfers");
        }
        for job in to_enqueue {
            self.engine.enqueue(job);
        }
        if let Some(event) = finalized {
            self.bus.publish(event);
        }
        if let Err(e) = self.persist() {
            error!(error = %e, "failed to persist import state");
        }
    }

    async fn prepare_jobs(
        &self,
        asset: &AssetIdentifier,
        staging: &Path,
    ) -> Result<(Option<String>, Vec<TransferJob>), ImportError> {
        let metadata = self.source.sync(asset, SyncMode::Pinned).await?;
        let listed = self.source.list_files(asset).await?;
        let eligible = select_files(
            listed,
            &self.settings.ignore_patterns,
            &self.settings.companion_suffix,
        );
        if eligible.is_empty() {
            return Err(ImportError::NothingToImport(asset.to_string()));
        }

        let mut jobs = Vec::with_capacity(eligible.len());
        for file in &eligible {
            let url = self.source.download_url(asset, file).await?;
            jobs.push(
                self.engine
                    .create(url, staging.join(&file.path))
                    .with_total_bytes(file.size),
            );
        }
        Ok((metadata.fingerprint, jobs))
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance the transfer engine, attribute its events, and finalize every
    /// batch whose members are all terminal.
    ///
    /// Errors are unexpected placement failures; the batch has still been
    /// cleaned up when one is returned.
    pub fn tick(&self) -> Result<(), ImportError> {
        let events = self.engine.tick();
        let mut outgoing = Vec::new();
        let mut cancel_jobs = Vec::new();
        let mut changed = false;

        {
            let mut guard = self.lock();
            let state = &mut *guard;
            for event in &events {
                let id = event.id();
                let Some(asset) = state.job_index.get(&id).cloned() else {
                    continue;
                };
                let Some(op) = state.operations.get_mut(&asset) else {
                    continue;
                };
                let Some(pos) = op.jobs.iter().position(|j| j.id == id) else {
                    continue;
                };

                match event {
                    TransferEvent::Progress { progress, .. } => {
                        op.jobs[pos].progress = *progress;
                        op.jobs[pos].status = TransferStatus::InProgress;
                        if !op.status.is_terminal() {
                            outgoing.push(ImportEvent::Progress {
                                asset: asset.clone(),
                                progress: op.progress(),
                            });
                        }
                    }
                    TransferEvent::Finalized { status, error, .. } => {
                        changed = true;
                        state.job_index.remove(&id);
                        op.jobs[pos].status = *status;
                        op.jobs[pos].error = error.clone();
                        if *status == TransferStatus::Success {
                            op.jobs[pos].progress = 1.0;
                        }
                        if op.status.is_terminal() {
                            continue;
                        }

                        match status {
                            TransferStatus::Success => {
                                if op.jobs.iter().all(|j| j.status == TransferStatus::Success) {
                                    op.status = ImportStatus::Success;
                                    info!(%asset, files = op.jobs.len(), "all transfers complete");
                                }
                            }
                            TransferStatus::Error | TransferStatus::Cancelled => {
                                if *status == TransferStatus::Error {
                                    let path = op
                                        .relative_path_of(&op.jobs[pos])
                                        .unwrap_or_else(|| op.jobs[pos].dest_path.clone());
                                    op.status = ImportStatus::Error;
                                    op.error = Some(
                                        ImportError::Transfer {
                                            path: path.display().to_string(),
                                            detail: error.clone().unwrap_or_default(),
                                        }
                                        .to_string(),
                                    );
                                } else {
                                    op.status = ImportStatus::Cancelled;
                                }
                                warn!(%asset, status = %op.status, "import failed, cancelling sibling transfers");
                                cancel_jobs.extend(
                                    op.jobs
                                        .iter()
                                        .filter(|j| !j.status.is_terminal())
                                        .map(|j| j.id),
                                );
                            }
                            _ => {}
                        }
                        if op.status.is_terminal() {
                            outgoing.push(ImportEvent::Finalized {
                                asset: asset.clone(),
                                status: op.status,
                                error: op.error.clone(),
                            });
                        }
                    }
                }
            }
        }

        for id in cancel_jobs {
            self.engine.cancel(id);
        }
        for event in outgoing {
            self.bus.publish(event);
        }

        let finalized = self.finalize_ready_batches();
        if changed || !matches!(finalized, Ok(0)) {
            self.persist()?;
        }
        finalized.map(|_| ())
    }

    fn finalize_ready_batches(&self) -> Result<usize, ImportError> {
        let ready: Vec<(String, Vec<ImportOperation>)> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let ids: Vec<String> = state
                .batches
                .iter()
                .filter(|(_, batch)| {
                    batch.sealed
                        && batch.members.iter().all(|a| {
                            state
                                .operations
                                .get(a)
                                .map_or(true, |op| op.status.is_terminal())
                        })
                })
                .map(|(id, _)| id.clone())
                .collect();

            ids.into_iter()
                .map(|id| {
                    let batch = state.batches.remove(&id).unwrap_or_default();
                    let ops: Vec<ImportOperation> = batch
                        .members
                        .iter()
                        .filter_map(|a| state.operations.remove(a))
                        .collect();
                    for op in &ops {
                        for job in &op.jobs {
                            state.job_index.remove(&job.id);
                        }
                    }
                    state.pending.retain(|p| p.batch_id != id);
                    (id, ops)
                })
                .collect()
        };

        let count = ready.len();
        let mut first_error = None;
        for (batch_id, ops) in ready {
            if let Err(e) = self.finalize_batch(&batch_id, ops) {
                error!(batch = %batch_id, error = %e, "batch finalization failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// The single placement pass of a batch.
    fn finalize_batch(&self, batch_id: &str, ops: Vec<ImportOperation>) -> Result<(), ImportError> {
        let status = BatchStatus::derive(ops.iter().map(|op| op.status));
        let mut placed = Vec::new();
        let mut move_failures = 0usize;
        let mut tracked = Vec::new();

        let result = {
            let _scope = IndexBatchScope::begin(self.files.as_ref());
            for op in &ops {
                if op.status == ImportStatus::Success {
                    let (paths, records, failures) = self.place_files(op);
                    placed.extend(paths);
                    move_failures += failures;
                    tracked.push((op.asset.clone(), records));
                    if let Some(stash) = &op.stash {
                        self.discard_stash(stash);
                    }
                } else if let Some(stash) = &op.stash {
                    self.restore_stash(stash);
                }
            }
            self.files.refresh();
            if tracked.is_empty() {
                Ok(())
            } else {
                self.index.track_batch(tracked).map_err(ImportError::from)
            }
        };

        for op in &ops {
            if self.fs.exists(&op.staging_path) {
                if let Err(e) = self.fs.remove_dir_all(&op.staging_path) {
                    warn!(dir = %op.staging_path.display(), error = %e, "failed to remove download directory");
                }
            }
        }

        info!(
            batch = %batch_id,
            %status,
            operations = ops.len(),
            placed = placed.len(),
            move_failures,
            "batch finalized"
        );
        let details = ops
            .iter()
            .filter_map(|op| match (&op.error, op.status) {
                (Some(e), _) => Some(format!("{}: {}", op.asset, e)),
                (None, ImportStatus::Cancelled) => Some(format!("{}: {}", op.asset, ImportError::Cancelled)),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("; ");
        if let Err(e) = self.db.insert_batch_history(
            batch_id,
            status,
            ops.len(),
            placed.len(),
            (!details.is_empty()).then_some(details.as_str()),
        ) {
            warn!(error = %e, "failed to record batch history");
        }
        self.bus.publish(ImportEvent::BatchFinalized {
            batch_id: batch_id.to_string(),
            status,
            placed,
        });
        result
    }

    /// Move one operation's staged files into its destination. Move failures
    /// are logged and counted; the remaining files are still placed.
    fn place_files(&self, op: &ImportOperation) -> (Vec<PathBuf>, Vec<LocalArtifactRecord>, usize) {
        let suffix = &self.settings.companion_suffix;
        let prior: HashMap<PathBuf, ArtifactId> = self
            .index
            .records_for(&op.asset)
            .into_iter()
            .map(|r| (primary_of(&r.original_relative_path, suffix), r.artifact_id))
            .collect();

        let mut placed = Vec::new();
        let mut records = Vec::new();
        let mut failures = 0usize;

        for job in &op.jobs {
            let Some(rel) = op.relative_path_of(job) else {
                continue;
            };
            let target = op.destination_path.join(&rel);
            if self.fs.exists(&target) {
                if let Err(e) = self.fs.remove_file(&target) {
                    error!(path = %target.display(), error = %e, "failed to delete previous file");
                    failures += 1;
                    continue;
                }
            }
            if let Err(e) = self.fs.move_file(&job.dest_path, &target) {
                error!(from = %job.dest_path.display(), to = %target.display(), error = %e, "failed to move file into place");
                failures += 1;
                continue;
            }
            placed.push(target.clone());

            if is_companion(&rel, suffix) {
                continue;
            }
            let artifact_id = self.files.register(&target, prior.get(&primary_of(&rel, suffix)));
            records.push(LocalArtifactRecord {
                artifact_id,
                asset: op.asset.clone(),
                original_relative_path: rel,
                fingerprint: op.fingerprint.clone(),
            });
        }
        (placed, records, failures)
    }

    // -----------------------------------------------------------------------
    // Cancel / remove
    // -----------------------------------------------------------------------

    /// Cancel every transfer of the asset's live operation and finalize it
    /// as cancelled. Returns `false` if nothing was in flight.
    pub fn cancel_import(&self, asset: &AssetIdentifier) -> bool {
        let (jobs, event) = {
            let mut state = self.lock();
            if let Some(token) = state.collecting.get(&asset.lineage()) {
                token.cancel();
                info!(%asset, "cancelled dependency collection");
                return true;
            }
            let Some(key) = state.live_operation(asset).map(|op| op.asset.clone()) else {
                return false;
            };
            let Some(op) = state.operations.get_mut(&key) else {
                return false;
            };
            op.status = ImportStatus::Cancelled;
            let jobs: Vec<TransferId> = op
                .jobs
                .iter()
                .filter(|j| !j.status.is_terminal())
                .map(|j| j.id)
                .collect();
            let event = ImportEvent::Finalized {
                asset: key,
                status: ImportStatus::Cancelled,
                error: None,
            };
            (jobs, event)
        };

        info!(%asset, transfers = jobs.len(), "import cancelled");
        for id in jobs {
            self.engine.cancel(id);
        }
        self.bus.publish(event);
        if let Err(e) = self.persist() {
            error!(error = %e, "failed to persist import state");
        }
        true
    }

    /// Cancel all in-flight work, including dependency collection and
    /// pending prompts.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
        let live: Vec<AssetIdentifier> = {
            let state = self.lock();
            state
                .operations
                .values()
                .filter(|op| !op.status.is_terminal())
                .map(|op| op.asset.clone())
                .collect()
        };
        for asset in live {
            self.cancel_import(&asset);
        }
    }

    /// Delete an imported asset's files (with companions and now-empty
    /// ancestor folders) and stop tracking it.
    ///
    /// Returns `Ok(None)` if the asset is not tracked, is being imported, or
    /// the user declined.
    pub async fn remove_import(&self, asset: &AssetIdentifier) -> Result<Option<RemovalReport>, ImportError> {
        let records = self.index.records_for(asset);
        if records.is_empty() {
            info!(%asset, "asset is not imported");
            return Ok(None);
        }
        if self.is_importing(asset) {
            warn!(%asset, "cannot remove an asset while it is being imported");
            return Ok(None);
        }

        let suffix = &self.settings.companion_suffix;
        let mut paths = Vec::new();
        for record in &records {
            let Some(live) = self.files.path_of(&record.artifact_id) else {
                continue;
            };
            let companion = with_suffix(&live, suffix);
            paths.push(live);
            if self.fs.exists(&companion) {
                paths.push(companion);
            }
        }

        if !self.prompter.confirm_remove(asset, &paths).await {
            info!(%asset, "removal declined");
            return Ok(None);
        }

        let mut report = RemovalReport::default();
        {
            let _scope = IndexBatchScope::begin(self.files.as_ref());
            for path in &paths {
                match self.fs.remove_file(path) {
                    Ok(()) => {
                        self.files.forget(path);
                        report.removed.push(path.clone());
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to delete file");
                        report.failed.push((path.clone(), e.to_string()));
                    }
                }
            }

            for dir in self.emptied_folders(&paths) {
                let Ok(children) = self.fs.list_dir(&dir) else {
                    continue;
                };
                if !children.is_empty() {
                    continue;
                }
                match self.fs.remove_dir(&dir) {
                    Ok(()) => report.removed.push(dir.clone()),
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "failed to delete folder");
                        report.failed.push((dir.clone(), e.to_string()));
                        continue;
                    }
                }
                let companion = with_suffix(&dir, suffix);
                if self.fs.exists(&companion) {
                    match self.fs.remove_file(&companion) {
                        Ok(()) => report.removed.push(companion),
                        Err(e) => report.failed.push((companion, e.to_string())),
                    }
                }
            }
            self.files.refresh();
        }

        self.index.untrack(asset)?;
        info!(
            %asset,
            removed = report.removed.len(),
            failed = report.failed.len(),
            "import removed"
        );
        Ok(Some(report))
    }

    /// Ancestor folders of `paths` inside the assets root, deepest first.
    fn emptied_folders(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let root = &self.settings.assets_root;
        let mut dirs: Vec<PathBuf> = Vec::new();
        for path in paths {
            for dir in path.ancestors().skip(1) {
                if dir == root.as_path() || !dir.starts_with(root) {
                    break;
                }
                if !dirs.iter().any(|d| d == dir) {
                    dirs.push(dir.to_path_buf());
                }
            }
        }
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        dirs
    }

    /// The host deleted some files; drop their records.
    pub fn on_artifacts_deleted(&self, ids: &[ArtifactId]) -> Result<Vec<AssetIdentifier>, ImportError> {
        let touched = self.index.remove_artifacts(ids)?;
        if !touched.is_empty() {
            info!(assets = touched.len(), "untracked deleted artifacts");
        }
        Ok(touched)
    }

    // -----------------------------------------------------------------------
    // Snapshot / restore
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> ImportSnapshot {
        let state = self.lock();
        let mut operations: Vec<ImportOperation> = state.operations.values().cloned().collect();
        operations.sort_by_key(|op| op.started_at);
        ImportSnapshot {
            operations,
            pending: state.pending.clone(),
            next_transfer_id: self.engine.next_id(),
        }
    }

    fn persist(&self) -> Result<(), ImportError> {
        self.db.save_snapshot(&self.snapshot())?;
        Ok(())
    }

    /// Reload interrupted batches: in-flight transfers go back to the engine
    /// for the resume pass, and pending imports that never got an operation
    /// are run again.
    pub async fn restore(self: &Arc<Self>) -> Result<usize, ImportError> {
        let snapshot = self.db.load_snapshot()?;
        let mut resume = Vec::new();
        let mut redownload = Vec::new();
        let mut stashed: Vec<LocalArtifactRecord> = Vec::new();
        let mut missing: HashMap<String, Vec<PendingImport>> = HashMap::new();

        {
            let mut guard = self.lock();
            let state = &mut *guard;
            for mut op in snapshot.operations {
                if let Some(stash) = &op.stash {
                    stashed.extend(stash.artifacts.iter().map(|a| a.record.clone()));
                }
                if !op.status.is_terminal() && !op.jobs.is_empty() {
                    if op.jobs.iter().all(|j| j.status == TransferStatus::Success) {
                        op.status = ImportStatus::Success;
                    } else if op.jobs.iter().any(|j| j.status == TransferStatus::Error) {
                        op.status = ImportStatus::Error;
                        op.error.get_or_insert_with(|| "transfer failed before restart".into());
                    } else if op.jobs.iter().any(|j| j.status == TransferStatus::Cancelled) {
                        op.status = ImportStatus::Cancelled;
                    }
                }
                if !op.status.is_terminal() {
                    if op.jobs.is_empty() {
                        op.status = ImportStatus::Queued;
                        redownload.push(op.asset.clone());
                    } else {
                        op.status = ImportStatus::InProgress;
                        for job in op.jobs.iter().filter(|j| !j.status.is_terminal()) {
                            state.job_index.insert(job.id, op.asset.clone());
                            resume.push(job.clone());
                        }
                    }
                }
                let batch = state.batches.entry(op.batch_id.clone()).or_default();
                batch.members.push(op.asset.clone());
                batch.sealed = true;
                state.operations.insert(op.asset.clone(), op);
            }

            for p in snapshot.pending {
                if !state.operations.contains_key(&p.asset) {
                    let batch = state.batches.entry(p.batch_id.clone()).or_default();
                    batch.sealed = false;
                    missing.entry(p.batch_id.clone()).or_default().push(p.clone());
                }
                state.pending.push(p);
            }
        }

        // The index pruned these on load: their files were in a stash.
        let reinstated = self.index.reinstate(&stashed)?;
        if reinstated > 0 {
            info!(records = reinstated, "reinstated records of stashed files");
        }

        let restored = resume.len();
        self.engine.restore(resume, snapshot.next_transfer_id);
        info!(
            transfers = restored,
            redownload = redownload.len(),
            pending_batches = missing.len(),
            "restored import state"
        );

        for asset in redownload {
            self.download(asset).await;
        }
        for (_, pending) in missing {
            self.run_batch(pending).await?;
        }
        self.persist()?;
        Ok(restored)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Folder name for an asset, with path separators and reserved characters
/// replaced.
fn sanitize_folder_name(name: &str, asset: &AssetIdentifier) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        asset.source_asset_id.clone()
    } else {
        cleaned.to_string()
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn is_companion(path: &Path, suffix: &str) -> bool {
    path.to_str().is_some_and(|s| s.ends_with(suffix) && s.len() > suffix.len())
}

/// `a.png.meta` -> `a.png`; primaries are returned unchanged.
fn primary_of(path: &Path, suffix: &str) -> PathBuf {
    match path.to_str() {
        Some(s) if is_companion(path, suffix) => PathBuf::from(&s[..s.len() - suffix.len()]),
        _ => path.to_path_buf(),
    }
}

/// `live` with the trailing `rel` components removed.
fn strip_relative(live: &Path, rel: &Path) -> Option<PathBuf> {
    if !live.ends_with(rel) {
        return None;
    }
    let mut root = live.to_path_buf();
    for _ in rel.components() {
        if !root.pop() {
            return None;
        }
    }
    Some(root)
}

fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Files worth downloading: valid relative paths not matched by an ignore
/// pattern, minus companions whose primary is absent.
fn select_files(files: Vec<RemoteFile>, ignore: &[String], suffix: &str) -> Vec<RemoteFile> {
    let kept: Vec<RemoteFile> = files
        .into_iter()
        .filter(|f| {
            if !is_safe_relative(&f.path) {
                warn!(path = %f.path, "skipping file with unsafe path");
                return false;
            }
            !ignore.iter().any(|pattern| glob_match::glob_match(pattern, &f.path))
        })
        .collect();

    let paths: HashSet<String> = kept.iter().map(|f| f.path.clone()).collect();
    kept.into_iter()
        .filter(|f| {
            let Some(primary) = f.path.strip_suffix(suffix).filter(|p| !p.is_empty()) else {
                return true;
            };
            let folder = format!("{}/", primary);
            let present = paths.contains(primary) || paths.iter().any(|p| p.starts_with(&folder));
            if !present {
                debug!(path = %f.path, "dropping orphan companion file");
            }
            present
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> RemoteFile {
        RemoteFile {
            path: path.into(),
            size: 1,
        }
    }

    fn paths(files: &[RemoteFile]) -> Vec<&str> {
        files.iter().map(|f| f.path.as_str()).collect()
    }

    #[test]
    fn test_select_files_drops_ignored_and_orphans() {
        let ignore = crate::config::ImportConfig::default().ignore_patterns;
        let files = vec![
            file("chair.fbx"),
            file("chair.fbx.meta"),
            file("textures.meta"),
            file("textures/wood.png"),
            file("ghost.png.meta"),
            file("textures/.DS_Store"),
            file("textures/Thumbs.db"),
            file("../escape.txt"),
        ];
        let selected = select_files(files, &ignore, ".meta");
        assert_eq!(
            paths(&selected),
            vec!["chair.fbx", "chair.fbx.meta", "textures.meta", "textures/wood.png"]
        );
    }

    #[test]
    fn test_companion_helpers() {
        assert!(is_companion(Path::new("a/b.png.meta"), ".meta"));
        assert!(!is_companion(Path::new(".meta"), ".meta"));
        assert_eq!(primary_of(Path::new("a/b.png.meta"), ".meta"), PathBuf::from("a/b.png"));
        assert_eq!(primary_of(Path::new("a/b.png"), ".meta"), PathBuf::from("a/b.png"));
        assert_eq!(with_suffix(Path::new("Assets/Pkg"), ".meta"), PathBuf::from("Assets/Pkg.meta"));
    }

    #[test]
    fn test_strip_relative() {
        assert_eq!(
            strip_relative(Path::new("/p/Assets/Chair/tex/a.png"), Path::new("tex/a.png")),
            Some(PathBuf::from("/p/Assets/Chair"))
        );
        assert_eq!(strip_relative(Path::new("/p/x.png"), Path::new("y.png")), None);
    }

    #[test]
    fn test_sanitize_folder_name() {
        let asset = AssetIdentifier::new("o", "p", "chair", "1");
        assert_eq!(sanitize_folder_name("Office: Chair/Desk", &asset), "Office_ Chair_Desk");
        assert_eq!(sanitize_folder_name("  ..  ", &asset), "chair");
    }
}
