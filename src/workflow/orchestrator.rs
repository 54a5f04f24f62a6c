//! # Workflow Orchestrator
//!
//! Drives the provisioning stages strictly in order, retries recoverable
//! stage failures with backoff, and tears down what it can when a run
//! aborts.

use std::path::PathBuf;

use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::artifacts::{ArtifactStore, FsArtifactStore};
use crate::cluster::capi::CapiProvisioner;
use crate::cluster::kind::KindControlPlane;
use crate::cluster::{ControlPlane, Provisioner};
use crate::config::WorkflowConfig;
use crate::constants;
use crate::export::{ClusterExport, LiveClusterExport};
use crate::gitops::repo::GithubRepoManager;
use crate::gitops::{GitOpsController, RepoManager};
use crate::kube_util::ShutdownRx;

use super::{
    ClusterHandle, ClusterRole, RetryConfig, Stage, WorkflowContext, WorkflowError,
    WorkflowFailure, WorkflowReport,
};

/// What a failed run may have left behind, tracked for best-effort
/// teardown.
#[derive(Debug, Default)]
struct TeardownState {
    /// Kubeconfig of the ephemeral control plane while it exists.
    ephemeral_kubeconfig: Option<PathBuf>,
    /// Target creation was attempted; provider objects may exist.
    target_attempted: bool,
    /// Management moved onto the target; it must not be torn down.
    pivoted: bool,
}

/// Drives one provisioning run from `Init` to `Done`.
pub struct Orchestrator {
    config: WorkflowConfig,
    control_plane: Box<dyn ControlPlane>,
    provisioner: Box<dyn Provisioner>,
    repo_manager: Box<dyn RepoManager>,
    exporter: Box<dyn ClusterExport>,
    artifact_store: Box<dyn ArtifactStore>,
    cancel: ShutdownRx,
    retry: RetryConfig,
    workdir: Option<TempDir>,
    kept_workdir: Option<PathBuf>,
    teardown: TeardownState,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds an orchestrator wired to the production components.
    pub fn new(config: WorkflowConfig, cancel: ShutdownRx) -> Self {
        let control_plane = Box::new(KindControlPlane::new(cancel.clone()));
        let provisioner = Box::new(CapiProvisioner::new(cancel.clone()));
        let repo_manager = Box::new(GithubRepoManager::new(
            config.github_token.clone(),
            cancel.clone(),
        ));
        Self::with_components(
            config,
            control_plane,
            provisioner,
            repo_manager,
            Box::new(LiveClusterExport),
            Box::new(FsArtifactStore),
            cancel,
        )
    }

    /// Builds an orchestrator from explicit components. Tests substitute
    /// instrumented fakes here.
    pub fn with_components(
        config: WorkflowConfig,
        control_plane: Box<dyn ControlPlane>,
        provisioner: Box<dyn Provisioner>,
        repo_manager: Box<dyn RepoManager>,
        exporter: Box<dyn ClusterExport>,
        artifact_store: Box<dyn ArtifactStore>,
        cancel: ShutdownRx,
    ) -> Self {
        Self {
            config,
            control_plane,
            provisioner,
            repo_manager,
            exporter,
            artifact_store,
            cancel,
            retry: RetryConfig::default(),
            workdir: None,
            kept_workdir: None,
            teardown: TeardownState::default(),
        }
    }

    /// Overrides the stage retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Runs the pipeline to completion. On failure, performs best-effort
    /// teardown of what the run created and reports what is left for the
    /// operator.
    pub async fn run(mut self) -> Result<WorkflowReport, WorkflowFailure> {
        match self.execute().await {
            Ok(report) => Ok(report),
            Err((stage, error)) => {
                error!(stage = %stage, error = %error, "❌ workflow aborted");
                let manual_cleanup = self.teardown_after_abort().await;
                for item in &manual_cleanup {
                    warn!("manual cleanup required: {item}");
                }
                Err(WorkflowFailure {
                    stage,
                    error,
                    manual_cleanup,
                })
            }
        }
    }

    #[allow(
        clippy::too_many_lines,
        reason = "one linear stage sequence reads best uninterrupted"
    )]
    async fn execute(&mut self) -> Result<WorkflowReport, (Stage, WorkflowError)> {
        stage_banner(Stage::Init);
        self.config.validate().map_err(fail_at(Stage::Init))?;
        self.control_plane
            .preflight()
            .await
            .map_err(fail_at(Stage::Init))?;
        self.provisioner
            .preflight()
            .await
            .map_err(fail_at(Stage::Init))?;
        let workdir = tempfile::Builder::new()
            .prefix(constants::WORKDIR_PREFIX)
            .tempdir()
            .map_err(|error| (Stage::Init, WorkflowError::Workdir(error)))?;
        let mut ctx = WorkflowContext {
            workdir: workdir.path().to_path_buf(),
            cluster_name: self.config.cluster_name.clone(),
            controller: None,
            credentials: self.config.credentials.clone(),
            private_repo: self.config.private_repo,
            high_availability: self.config.high_availability,
            ephemeral: None,
            target: None,
            repo_dir: workdir.path().join(&self.config.cluster_name),
            final_dir: self.config.artifact_root.join(&self.config.cluster_name),
            clone_url: None,
        };
        self.workdir = Some(workdir);
        info!(
            workdir = %ctx.workdir.display(),
            cluster = %ctx.cluster_name,
            provider = ctx.credentials.provider_name(),
            "✅ workflow initialized"
        );

        ensure_not_cancelled(&self.cancel, Stage::EphemeralCreated)?;
        stage_banner(Stage::EphemeralCreated);
        let kubeconfig = self
            .control_plane
            .create_ephemeral(constants::EPHEMERAL_CLUSTER_NAME, &ctx.workdir)
            .await
            .map_err(fail_at(Stage::EphemeralCreated))?;
        self.teardown.ephemeral_kubeconfig = Some(kubeconfig.clone());
        let ephemeral = ClusterHandle {
            role: ClusterRole::Ephemeral,
            kubeconfig,
        };
        ctx.ephemeral = Some(ephemeral.clone());

        ensure_not_cancelled(&self.cancel, Stage::TargetClusterCreated)?;
        stage_banner(Stage::TargetClusterCreated);
        self.teardown.target_attempted = true;
        let target_kubeconfig = with_stage_retry(
            Stage::TargetClusterCreated,
            self.retry,
            &self.cancel,
            || {
                self.provisioner.create_target(
                    &ephemeral.kubeconfig,
                    &ctx.cluster_name,
                    &ctx.workdir,
                    &ctx.credentials,
                    ctx.high_availability,
                )
            },
        )
        .await
        .map_err(fail_at(Stage::TargetClusterCreated))?;
        let target = ClusterHandle {
            role: ClusterRole::Target,
            kubeconfig: target_kubeconfig,
        };
        ctx.target = Some(target.clone());

        ensure_not_cancelled(&self.cancel, Stage::RepoCreated)?;
        stage_banner(Stage::RepoCreated);
        // The variant is fixed before anything remote is created. An
        // unknown selector aborts with no side effects.
        let controller = GitOpsController::resolve(&self.config.gitops_controller)
            .map_err(fail_at(Stage::RepoCreated))?;
        ctx.controller = Some(controller);
        let clone_url = with_stage_retry(Stage::RepoCreated, self.retry, &self.cancel, || {
            self.repo_manager
                .create_remote(&ctx.cluster_name, ctx.private_repo)
        })
        .await
        .map_err(fail_at(Stage::RepoCreated))?;
        ctx.clone_url = Some(clone_url.clone());

        ensure_not_cancelled(&self.cancel, Stage::RepoSkeletonPopulated)?;
        stage_banner(Stage::RepoSkeletonPopulated);
        with_stage_retry(
            Stage::RepoSkeletonPopulated,
            self.retry,
            &self.cancel,
            || {
                self.repo_manager.build_skeleton(
                    &ctx.repo_dir,
                    controller,
                    &ctx.cluster_name,
                    &clone_url,
                    &ctx.workdir,
                    ctx.private_repo,
                )
            },
        )
        .await
        .map_err(fail_at(Stage::RepoSkeletonPopulated))?;

        ensure_not_cancelled(&self.cancel, Stage::StateExported)?;
        stage_banner(Stage::StateExported);
        let export_dir = ctx.repo_dir.join(constants::EXPORT_DIR_RELATIVE);
        let exported = with_stage_retry(Stage::StateExported, self.retry, &self.cancel, || {
            self.exporter
                .export_cluster_scoped(&target.kubeconfig, &export_dir)
        })
        .await
        .map_err(fail_at(Stage::StateExported))?;
        info!(
            exported,
            dir = %export_dir.display(),
            "cluster state captured in repository"
        );

        ensure_not_cancelled(&self.cancel, Stage::PushedToRemote)?;
        stage_banner(Stage::PushedToRemote);
        // Never retried; a second init-and-commit on the same checkout
        // does not converge.
        self.repo_manager
            .init_and_push(&ctx.repo_dir, &clone_url)
            .await
            .map_err(fail_at(Stage::PushedToRemote))?;

        ensure_not_cancelled(&self.cancel, Stage::ControllerBootstrapped)?;
        stage_banner(Stage::ControllerBootstrapped);
        with_stage_retry(
            Stage::ControllerBootstrapped,
            self.retry,
            &self.cancel,
            || {
                self.repo_manager.bootstrap_controller(
                    &target.kubeconfig,
                    controller,
                    &ctx.repo_dir,
                    &clone_url,
                    ctx.private_repo,
                )
            },
        )
        .await
        .map_err(fail_at(Stage::ControllerBootstrapped))?;

        ensure_not_cancelled(&self.cancel, Stage::Pivoted)?;
        stage_banner(Stage::Pivoted);
        // Never retried. A failed move leaves management state split
        // across both control planes; driving it again could double-own
        // infrastructure.
        self.provisioner
            .pivot(
                &ephemeral.kubeconfig,
                &target.kubeconfig,
                ctx.credentials.provider_tag(),
                &ctx.credentials,
            )
            .await
            .map_err(fail_at(Stage::Pivoted))?;
        self.teardown.pivoted = true;

        ensure_not_cancelled(&self.cancel, Stage::EphemeralDestroyed)?;
        stage_banner(Stage::EphemeralDestroyed);
        if let Some(handle) = ctx.ephemeral.take() {
            self.control_plane
                .delete_ephemeral(constants::EPHEMERAL_CLUSTER_NAME, &handle.kubeconfig)
                .await
                .map_err(fail_at(Stage::EphemeralDestroyed))?;
        }
        self.teardown.ephemeral_kubeconfig = None;

        ensure_not_cancelled(&self.cancel, Stage::ArtifactsRelocated)?;
        stage_banner(Stage::ArtifactsRelocated);
        let Some(workdir) = self.workdir.take() else {
            return Err((
                Stage::ArtifactsRelocated,
                WorkflowError::Workdir(std::io::Error::other(
                    "working directory already released",
                )),
            ));
        };
        // From here the directory is no longer auto-removed; if the move
        // fails, the abort teardown removes it instead.
        let kept = workdir.keep();
        self.kept_workdir = Some(kept.clone());
        self.artifact_store
            .relocate(&kept, &ctx.final_dir)
            .map_err(fail_at(Stage::ArtifactsRelocated))?;
        self.kept_workdir = None;

        ensure_not_cancelled(&self.cancel, Stage::Pruned)?;
        stage_banner(Stage::Pruned);
        self.artifact_store
            .prune(&ctx.final_dir, &constants::ARTIFACT_DENYLIST)
            .map_err(fail_at(Stage::Pruned))?;

        stage_banner(Stage::Done);
        info!(
            cluster = %ctx.cluster_name,
            artifacts = %ctx.final_dir.display(),
            repository = %clone_url,
            "✅ provisioning workflow complete"
        );
        Ok(WorkflowReport {
            cluster_name: ctx.cluster_name,
            artifact_dir: ctx.final_dir,
            clone_url,
        })
    }

    /// Best-effort teardown after an abort. Returns what could not be
    /// removed automatically.
    async fn teardown_after_abort(&mut self) -> Vec<String> {
        let mut manual = Vec::new();
        let cluster_name = self.config.cluster_name.clone();

        if let Some(ephemeral_kubeconfig) = self.teardown.ephemeral_kubeconfig.clone() {
            if self.teardown.target_attempted && !self.teardown.pivoted {
                info!(cluster = %cluster_name, "🔄 tearing down partially created target cluster");
                if let Err(error) = self
                    .provisioner
                    .delete_target(&ephemeral_kubeconfig, &cluster_name)
                    .await
                {
                    warn!(error = %error, "❌ target cluster teardown failed");
                    manual.push(format!(
                        "target cluster '{cluster_name}' may still exist at the infrastructure provider"
                    ));
                }
            }
            info!("🔄 tearing down ephemeral control plane");
            if let Err(error) = self
                .control_plane
                .delete_ephemeral(constants::EPHEMERAL_CLUSTER_NAME, &ephemeral_kubeconfig)
                .await
            {
                warn!(error = %error, "❌ ephemeral control plane teardown failed");
                manual.push(format!(
                    "kind cluster '{name}' may still exist (kind delete cluster --name {name})",
                    name = constants::EPHEMERAL_CLUSTER_NAME,
                ));
            }
        }
        if self.teardown.pivoted {
            manual.push(format!(
                "target cluster '{cluster_name}' is self-managing and was left running"
            ));
        }
        if let Some(workdir) = self.workdir.take() {
            if let Err(error) = workdir.close() {
                warn!(error = %error, "failed to remove working directory");
                manual.push("the temporary working directory was left behind".to_owned());
            }
        }
        if let Some(kept) = self.kept_workdir.take() {
            if let Err(error) = std::fs::remove_dir_all(&kept) {
                warn!(
                    error = %error,
                    path = %kept.display(),
                    "failed to remove working directory"
                );
                manual.push(format!(
                    "working directory {} was left behind",
                    kept.display()
                ));
            }
        }
        manual
    }
}

fn stage_banner(stage: Stage) {
    info!(
        "🔄 [stage {}/{}] {}",
        stage.number(),
        Stage::ALL.len(),
        stage.as_str()
    );
}

fn ensure_not_cancelled(cancel: &ShutdownRx, stage: Stage) -> Result<(), (Stage, WorkflowError)> {
    if *cancel.borrow() {
        return Err((stage, WorkflowError::Cancelled));
    }
    Ok(())
}

fn fail_at<E>(stage: Stage) -> impl FnOnce(E) -> (Stage, WorkflowError)
where
    E: Into<WorkflowError>,
{
    move |error| (stage, error.into())
}

/// Runs `op`, retrying recoverable failures with doubling backoff until
/// the attempt budget is spent. Terminal failures return immediately.
async fn with_stage_retry<T, E, F, Fut>(
    stage: Stage,
    retry: RetryConfig,
    cancel: &ShutdownRx,
    mut op: F,
) -> Result<T, WorkflowError>
where
    E: Into<WorkflowError>,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut cancel = cancel.clone();
    let mut attempt = 1u32;
    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error.into(),
        };
        if !error.is_recoverable() || attempt >= retry.max_attempts {
            return Err(error);
        }
        let delay = retry.delay_for(attempt);
        warn!(
            stage = %stage,
            attempt,
            max_attempts = retry.max_attempts,
            delay_secs = delay.as_secs(),
            error = %error,
            "🔄 recoverable stage failure, retrying"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            changed = cancel.changed() => {
                if changed.is_ok() && *cancel.borrow() {
                    return Err(WorkflowError::Cancelled);
                }
                if changed.is_err() {
                    // Sender gone; fall back to a plain sleep.
                    tokio::time::sleep(delay).await;
                }
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use tokio::sync::watch;

    use crate::cluster::ProvisionError;
    use crate::config::ConfigError;
    use crate::kube_util::WaitError;

    use super::*;

    fn recoverable_error() -> WorkflowError {
        WorkflowError::Provision(ProvisionError::Wait(WaitError::TimedOut {
            what: "machines Running".to_owned(),
            after_secs: 1,
        }))
    }

    #[tokio::test]
    async fn test_with_stage_retry_retries_until_success() {
        let (_tx, rx) = watch::channel(false);
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let attempts = Cell::new(0u32);
        let result = with_stage_retry(Stage::TargetClusterCreated, retry, &rx, || {
            attempts.set(attempts.get() + 1);
            let attempt = attempts.get();
            async move {
                if attempt < 3 {
                    Err(recoverable_error())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.get(), 3);
    }

    #[tokio::test]
    async fn test_with_stage_retry_gives_up_after_budget() {
        let (_tx, rx) = watch::channel(false);
        let retry = RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        };
        let attempts = Cell::new(0u32);
        let result: Result<(), WorkflowError> =
            with_stage_retry(Stage::StateExported, retry, &rx, || {
                attempts.set(attempts.get() + 1);
                async { Err(recoverable_error()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.get(), 2);
    }

    #[tokio::test]
    async fn test_with_stage_retry_stops_on_terminal_error() {
        let (_tx, rx) = watch::channel(false);
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let attempts = Cell::new(0u32);
        let result: Result<(), WorkflowError> =
            with_stage_retry(Stage::RepoCreated, retry, &rx, || {
                attempts.set(attempts.get() + 1);
                async { Err(WorkflowError::Config(ConfigError::MissingGithubToken)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.get(), 1);
    }
}
