//! # Provisioning Workflow
//!
//! Stage model, shared context, and error taxonomy for the end-to-end
//! provisioning run. The [`orchestrator`] drives the stages in order and
//! owns retry, abort, and teardown decisions.

pub mod orchestrator;

use std::path::PathBuf;
use std::time::Duration;

use crate::artifacts::ArtifactError;
use crate::cluster::{ControlPlaneError, ProvisionError};
use crate::config::credentials::ProviderCredentials;
use crate::config::ConfigError;
use crate::constants;
use crate::export::ExportError;
use crate::gitops::{GitOpsController, RepoError};

pub use orchestrator::Orchestrator;

/// Stages of the provisioning pipeline.
///
/// A run advances through [`Stage::ALL`] strictly in order. Any failure
/// transitions to [`Stage::Aborted`] instead of the next stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Configuration validated, tooling checked, working directory created.
    Init,
    /// The ephemeral bootstrap control plane is up and reachable.
    EphemeralCreated,
    /// The target cluster exists and its nodes are Ready.
    TargetClusterCreated,
    /// The remote repository exists and the controller variant is fixed.
    RepoCreated,
    /// The local repository skeleton is written.
    RepoSkeletonPopulated,
    /// Sanitized cluster state is written into the repository.
    StateExported,
    /// The initial commit is pushed to the remote.
    PushedToRemote,
    /// The GitOps controller runs on the target and points at the remote.
    ControllerBootstrapped,
    /// Cluster lifecycle management moved onto the target cluster.
    Pivoted,
    /// The ephemeral control plane is gone.
    EphemeralDestroyed,
    /// The working directory moved to its permanent location.
    ArtifactsRelocated,
    /// Build intermediates removed from the relocated directory.
    Pruned,
    /// The run finished.
    Done,
    /// Terminal failure state, reachable from every non-terminal stage.
    Aborted,
}

impl Stage {
    /// The pipeline stages in execution order. Excludes [`Stage::Aborted`].
    pub const ALL: [Self; 13] = [
        Self::Init,
        Self::EphemeralCreated,
        Self::TargetClusterCreated,
        Self::RepoCreated,
        Self::RepoSkeletonPopulated,
        Self::StateExported,
        Self::PushedToRemote,
        Self::ControllerBootstrapped,
        Self::Pivoted,
        Self::EphemeralDestroyed,
        Self::ArtifactsRelocated,
        Self::Pruned,
        Self::Done,
    ];

    /// Stage name as it appears in logs and failure reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::EphemeralCreated => "EphemeralCreated",
            Self::TargetClusterCreated => "TargetClusterCreated",
            Self::RepoCreated => "RepoCreated",
            Self::RepoSkeletonPopulated => "RepoSkeletonPopulated",
            Self::StateExported => "StateExported",
            Self::PushedToRemote => "PushedToRemote",
            Self::ControllerBootstrapped => "ControllerBootstrapped",
            Self::Pivoted => "Pivoted",
            Self::EphemeralDestroyed => "EphemeralDestroyed",
            Self::ArtifactsRelocated => "ArtifactsRelocated",
            Self::Pruned => "Pruned",
            Self::Done => "Done",
            Self::Aborted => "Aborted",
        }
    }

    /// One-based position within [`Stage::ALL`], `0` for [`Stage::Aborted`].
    pub fn number(self) -> usize {
        Self::ALL
            .iter()
            .position(|stage| *stage == self)
            .map_or(0, |index| index + 1)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the pivot a cluster handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    /// The short-lived kind bootstrap cluster.
    Ephemeral,
    /// The provisioned cluster that outlives the run.
    Target,
}

impl std::fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ephemeral => "ephemeral",
            Self::Target => "target",
        })
    }
}

/// Access to one live cluster created during the run.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    /// Role of the cluster behind this handle.
    pub role: ClusterRole,
    /// Path of the kubeconfig inside the working directory.
    pub kubeconfig: PathBuf,
}

/// Mutable state threaded through the stages of one run.
///
/// Constructed once during `Init` and passed explicitly; no stage reads
/// shared state from anywhere else.
#[derive(Debug)]
pub struct WorkflowContext {
    /// Per-run scratch directory. Relocated on success, removed otherwise.
    pub workdir: PathBuf,
    /// Name of the target cluster and the generated repository.
    pub cluster_name: String,
    /// Controller variant. Resolved at `RepoCreated`, `None` before that.
    pub controller: Option<GitOpsController>,
    /// Infrastructure provider credential material.
    pub credentials: ProviderCredentials,
    /// Whether the generated repository is private.
    pub private_repo: bool,
    /// Whether the target cluster uses the highly available topology.
    pub high_availability: bool,
    /// Handle of the ephemeral control plane while it exists.
    pub ephemeral: Option<ClusterHandle>,
    /// Handle of the target cluster once its kubeconfig is obtainable.
    pub target: Option<ClusterHandle>,
    /// Checkout of the generated repository inside the working directory.
    pub repo_dir: PathBuf,
    /// Permanent artifact directory the working directory relocates to.
    pub final_dir: PathBuf,
    /// HTTPS clone URL of the remote repository once created.
    pub clone_url: Option<String>,
}

/// Any error a workflow stage can report.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Configuration rejected before or during `Init`.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Ephemeral control plane operation failed.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    /// Target cluster provisioning or pivot failed.
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Repository creation, skeleton, push, or bootstrap failed.
    #[error(transparent)]
    Repo(#[from] RepoError),

    /// Cluster state export failed.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// Artifact relocation or pruning failed.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// The working directory could not be created.
    #[error("failed to prepare working directory: {0}")]
    Workdir(#[source] std::io::Error),

    /// A shutdown signal arrived between stages.
    #[error("workflow cancelled by shutdown signal")]
    Cancelled,
}

impl WorkflowError {
    /// Whether the failed stage may be retried in place. Terminal errors
    /// move the run to `Aborted` immediately.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ControlPlane(err) => err.is_recoverable(),
            Self::Provision(err) => err.is_recoverable(),
            Self::Repo(err) => err.is_recoverable(),
            Self::Export(err) => err.is_recoverable(),
            Self::Artifact(err) => err.is_recoverable(),
            Self::Config(_) | Self::Workdir(_) | Self::Cancelled => false,
        }
    }
}

/// Summary of a completed run.
#[derive(Debug)]
pub struct WorkflowReport {
    /// Name of the provisioned cluster.
    pub cluster_name: String,
    /// Where the run artifacts now live.
    pub artifact_dir: PathBuf,
    /// HTTPS clone URL of the generated repository.
    pub clone_url: String,
}

/// Terminal failure of a run, including what the operator must clean up
/// by hand when automated teardown was incomplete.
#[derive(Debug, thiserror::Error)]
#[error("workflow aborted during {stage}: {error}")]
pub struct WorkflowFailure {
    /// Stage that was executing when the run aborted.
    pub stage: Stage,
    /// The error that caused the abort.
    #[source]
    pub error: WorkflowError,
    /// Resources automated teardown could not remove.
    pub manual_cleanup: Vec<String>,
}

/// Retry policy for recoverable stage failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Attempts per stage before a recoverable failure becomes fatal.
    pub max_attempts: u32,
    /// Delay before the second attempt. Doubles per further attempt.
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: constants::STAGE_RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(constants::STAGE_RETRY_BASE_DELAY_SECS),
        }
    }
}

impl RetryConfig {
    /// Delay to sleep after failed attempt number `attempt` (one-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << doublings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_numbering_follows_pipeline_order() {
        assert_eq!(Stage::Init.number(), 1);
        assert_eq!(Stage::RepoCreated.number(), 4);
        assert_eq!(Stage::Done.number(), 13);
        assert_eq!(Stage::Aborted.number(), 0);
        for window in Stage::ALL.windows(2) {
            assert!(window[0].number() < window[1].number());
        }
    }

    #[test]
    fn test_retry_delay_doubles_per_attempt() {
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        };
        assert_eq!(retry.delay_for(1), Duration::from_secs(5));
        assert_eq!(retry.delay_for(2), Duration::from_secs(10));
        assert_eq!(retry.delay_for(3), Duration::from_secs(20));
    }

    #[test]
    fn test_cancellation_is_terminal() {
        assert!(!WorkflowError::Cancelled.is_recoverable());
    }
}
