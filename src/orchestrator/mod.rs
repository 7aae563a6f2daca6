//! Orchestration facade: the only entry point the HTTP layer uses.
//!
//! Sequences workspace synchronization (startup, explicit refresh) and
//! build+stream (compile) over one shared workspace. Every operation that
//! touches the workspace holds a single admission gate; the state machine in
//! `state` records what the holder is doing.
//!
//! Admission policy:
//! - `synchronize` waits for the gate, so a refresh queues behind a build
//! - `compile` rejects with `Busy` by default, or waits when configured
//! - an artifact stream keeps the gate until the caller drops it
//!
//! The gated part of a sync or build runs in its own task that owns the gate
//! guard and makes the closing state transition. A caller that goes away
//! mid-operation (client disconnect) leaves the work to finish on its own.

pub mod artifact;
pub mod executor;
pub mod state;

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

pub use artifact::{ArtifactStream, CompileOutcome, GuardedReader, ARTIFACT_CONTENT_TYPE};
pub use executor::BuildInvoker;
pub use state::{WorkspaceState, WorkspaceStatus};

use crate::config::{CompileAdmission, ServiceConfig};
use crate::error::{OrchestratorError, Result};
use crate::models::{BuildOutcome, BuildRequest, RepositoryCoordinate, SyncOutcome, WarmupReport};
use crate::source::SnapshotFetcher;
use crate::workspace::WorkspaceSynchronizer;

/// Serializes synchronization and builds over the shared workspace.
#[derive(Clone)]
pub struct Orchestrator {
    /// Shared state protected by RwLock so health checks never wait on a build
    status: Arc<RwLock<WorkspaceStatus>>,

    /// Admission gate; held for the full duration of a sync or build+stream
    gate: Arc<Mutex<()>>,

    coordinate: RepositoryCoordinate,
    synchronizer: Arc<WorkspaceSynchronizer>,
    invoker: Arc<BuildInvoker>,
    admission: CompileAdmission,
    warmup_on_start: bool,
}

impl Orchestrator {
    pub fn new(
        coordinate: RepositoryCoordinate,
        synchronizer: WorkspaceSynchronizer,
        invoker: BuildInvoker,
        admission: CompileAdmission,
    ) -> Self {
        Orchestrator {
            status: Arc::new(RwLock::new(WorkspaceStatus::default())),
            gate: Arc::new(Mutex::new(())),
            coordinate,
            synchronizer: Arc::new(synchronizer),
            invoker: Arc::new(invoker),
            admission,
            warmup_on_start: true,
        }
    }

    /// Wire the pipeline from configuration and a snapshot source.
    pub fn from_config(config: &ServiceConfig, fetcher: Arc<dyn SnapshotFetcher>) -> Self {
        let mut orchestrator = Orchestrator::new(
            config.coordinate(),
            WorkspaceSynchronizer::from_config(config, fetcher),
            BuildInvoker::from_config(config),
            config.compile_admission,
        );
        orchestrator.warmup_on_start = config.warmup_on_start;
        orchestrator
    }

    pub fn with_warmup_on_start(mut self, enabled: bool) -> Self {
        self.warmup_on_start = enabled;
        self
    }

    pub fn coordinate(&self) -> &RepositoryCoordinate {
        &self.coordinate
    }

    pub async fn state(&self) -> WorkspaceState {
        self.status.read().await.state
    }

    pub async fn status_snapshot(&self) -> WorkspaceStatus {
        self.status.read().await.clone()
    }

    async fn transition(&self, next: WorkspaceState) -> Result<()> {
        let mut status = self.status.write().await;
        status
            .transition_to(next)
            .map_err(OrchestratorError::InvalidTransition)?;
        log::debug!("[Orchestrator] Workspace -> {}", next);
        Ok(())
    }

    /// Replace the workspace with the current branch tip.
    ///
    /// Waits for any running build (including an artifact still streaming).
    pub async fn synchronize(&self) -> Result<SyncOutcome> {
        let gate = self.gate.clone().lock_owned().await;
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.run_sync().await;
            drop(gate);
            result
        })
        .await
        .map_err(|e| OrchestratorError::TaskFailed(format!("sync task: {}", e)))?
    }

    /// Gated body of `synchronize`. Caller holds the gate.
    async fn run_sync(&self) -> Result<SyncOutcome> {
        self.transition(WorkspaceState::Synchronizing).await?;

        match self.synchronizer.sync(&self.coordinate).await {
            Ok(outcome) => {
                let mut status = self.status.write().await;
                status.record_sync_success(outcome.timestamp.clone());
                status
                    .transition_to(WorkspaceState::Ready)
                    .map_err(OrchestratorError::InvalidTransition)?;
                log::info!("[Orchestrator] {}", outcome.message);
                Ok(outcome)
            }
            Err(e) => {
                log::error!("[Orchestrator] Workspace sync failed: {}", e);
                let mut status = self.status.write().await;
                status.record_sync_failure(e.to_string());
                status
                    .transition_to(WorkspaceState::Failed)
                    .map_err(OrchestratorError::InvalidTransition)?;
                Err(e.into())
            }
        }
    }

    async fn admit(&self) -> Result<OwnedMutexGuard<()>> {
        match self.admission {
            CompileAdmission::Reject => self
                .gate
                .clone()
                .try_lock_owned()
                .map_err(|_| OrchestratorError::Busy),
            CompileAdmission::Wait => Ok(self.gate.clone().lock_owned().await),
        }
    }

    /// Build `request` and return the artifact stream, or a warm-up report.
    pub async fn compile(&self, request: BuildRequest) -> Result<CompileOutcome> {
        let gate = self.admit().await?;

        let current = self.state().await;
        if current != WorkspaceState::Ready {
            log::warn!(
                "[Orchestrator] Rejecting compile {} while workspace is {}",
                request.correlation_id,
                current
            );
            return Err(OrchestratorError::WorkspaceNotReady {
                state: current.to_string(),
            });
        }

        let this = self.clone();
        let job = request.clone();
        let (result, gate) = tokio::spawn(async move {
            let result = this.run_build(&job).await;
            (result, gate)
        })
        .await
        .map_err(|e| OrchestratorError::TaskFailed(format!("build task: {}", e)))?;
        let outcome = result?;

        if request.is_warmup {
            log::info!("[Orchestrator] Warm-up build finished in {:.1}s", outcome.duration.as_secs_f64());
            return Ok(CompileOutcome::Warmup(WarmupReport::completed()));
        }

        let stream =
            ArtifactStream::open(&outcome.artifact_path, request.artifact_filename(), gate).await?;
        Ok(CompileOutcome::Artifact(stream))
    }

    /// Gated body of `compile`: Ready -> Building -> Ready whatever the outcome.
    async fn run_build(&self, request: &BuildRequest) -> Result<BuildOutcome> {
        self.transition(WorkspaceState::Building).await?;
        let result = self.invoker.build(request).await;

        let mut status = self.status.write().await;
        status.record_build(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        status
            .transition_to(WorkspaceState::Ready)
            .map_err(OrchestratorError::InvalidTransition)?;
        result.map_err(OrchestratorError::from)
    }

    /// Compile the fixed warm-up program to populate toolchain caches.
    pub async fn warm_up(&self) -> Result<WarmupReport> {
        match self.compile(BuildRequest::warmup()).await? {
            CompileOutcome::Warmup(report) => Ok(report),
            // compile() only streams non-warm-up requests
            CompileOutcome::Artifact(_) => Ok(WarmupReport::completed()),
        }
    }

    /// Startup sequence: sync, then one warm-up build when enabled.
    ///
    /// A warm-up failure is logged but does not fail startup; the workspace
    /// is still `Ready` and real compiles may succeed.
    pub async fn initialize(&self) -> Result<SyncOutcome> {
        log::info!("[Orchestrator] Initializing workspace for {}", self.coordinate);
        let outcome = self.synchronize().await?;

        if self.warmup_on_start {
            match self.warm_up().await {
                Ok(report) => log::info!("[Orchestrator] {}", report.message),
                Err(e) => log::warn!("[Orchestrator] Warm-up failed: {}", e),
            }
        }
        Ok(outcome)
    }
}
