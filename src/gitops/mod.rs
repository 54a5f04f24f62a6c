//! # GitOps Repository Management
//!
//! Creation of the remote repository, the committed skeleton the GitOps
//! controller reconciles from, the initial push, and the controller
//! bootstrap on the target cluster.

pub mod bootstrap;
pub mod repo;
pub mod skeleton;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;

use crate::config::ConfigError;
use crate::constants;
use crate::kube_util::{KubeUtilError, WaitError};

/// The supported GitOps controller variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitOpsController {
    /// ArgoCD, reconciling an Application pointing at the repository.
    ArgoCd,
    /// FluxCD, reconciling a GitRepository plus Kustomization pair.
    FluxCd,
}

impl GitOpsController {
    /// Resolves a selector string to a variant. Anything other than the
    /// two supported selectors is a configuration error.
    pub fn resolve(selector: &str) -> Result<Self, ConfigError> {
        match selector {
            "argocd" => Ok(Self::ArgoCd),
            "fluxcd" => Ok(Self::FluxCd),
            other => Err(ConfigError::UnknownController {
                value: other.to_owned(),
            }),
        }
    }

    /// Namespace the controller is installed into.
    pub fn namespace(self) -> &'static str {
        match self {
            Self::ArgoCd => "argocd",
            Self::FluxCd => "flux-system",
        }
    }

    /// Pinned install manifest URL.
    pub fn install_url(self) -> &'static str {
        match self {
            Self::ArgoCd => constants::ARGOCD_INSTALL_URL,
            Self::FluxCd => constants::FLUX_INSTALL_URL,
        }
    }

    /// File name of the raw install manifest in the working directory.
    pub fn install_file(self) -> &'static str {
        match self {
            Self::ArgoCd => "argocd-install.yaml",
            Self::FluxCd => "flux-install.yaml",
        }
    }

    /// Directory name of the split install manifest in the working
    /// directory.
    pub fn install_output_dir(self) -> &'static str {
        match self {
            Self::ArgoCd => "argocd-install-output",
            Self::FluxCd => "fluxcd-install-output",
        }
    }

    /// Deployments that must be Available before the controller is
    /// considered bootstrapped.
    pub fn deployments(self) -> &'static [&'static str] {
        match self {
            Self::ArgoCd => &[
                "argocd-applicationset-controller",
                "argocd-dex-server",
                "argocd-notifications-controller",
                "argocd-redis",
                "argocd-repo-server",
                "argocd-server",
            ],
            Self::FluxCd => &[
                "helm-controller",
                "kustomize-controller",
                "notification-controller",
                "source-controller",
            ],
        }
    }

    /// CRD that must be established before the pointer objects apply.
    pub fn pointer_crd(self) -> &'static str {
        match self {
            Self::ArgoCd => "applications.argoproj.io",
            Self::FluxCd => "gitrepositories.source.toolkit.fluxcd.io",
        }
    }
}

impl fmt::Display for GitOpsController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ArgoCd => "argocd",
            Self::FluxCd => "fluxcd",
        })
    }
}

/// Errors from repository creation, population, push, and bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// The remote repository already exists for this account.
    #[error("repository '{name}' already exists for this account")]
    AlreadyExists {
        /// The colliding repository name.
        name: String,
    },

    /// A GitHub API call failed.
    #[error("GitHub API error: {0}")]
    GitHub(#[from] octocrab::Error),

    /// The GitHub response is missing an expected field.
    #[error("GitHub response missing field '{field}'")]
    MalformedResponse {
        /// The missing field.
        field: &'static str,
    },

    /// A local git operation failed.
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// Downloading a pinned install manifest failed.
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        /// The manifest URL.
        url: String,
        /// Underlying HTTP failure.
        #[source]
        source: reqwest::Error,
    },

    /// Talking to the target cluster failed.
    #[error(transparent)]
    Kube(#[from] KubeUtilError),

    /// A bounded wait failed.
    #[error(transparent)]
    Wait(#[from] WaitError),

    /// A filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepoError {
    /// Whether a later attempt of the same stage may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::GitHub(_) | Self::Fetch { .. } => true,
            Self::Wait(wait) => wait.is_recoverable(),
            Self::Kube(KubeUtilError::Api(_)) => true,
            _ => false,
        }
    }
}

/// Repository lifecycle as seen by the workflow orchestrator.
#[async_trait]
pub trait RepoManager: Send + Sync {
    /// Creates the remote repository and returns its HTTPS clone URL.
    async fn create_remote(&self, name: &str, private: bool) -> Result<String, RepoError>;

    /// Populates the local repository skeleton under `repo_dir`, fetching
    /// the controller install manifest and recording the transient copies
    /// in `workdir`.
    async fn build_skeleton(
        &self,
        repo_dir: &Path,
        controller: GitOpsController,
        cluster_name: &str,
        clone_url: &str,
        workdir: &Path,
        private: bool,
    ) -> Result<(), RepoError>;

    /// Initializes `repo_dir` as a git repository, commits everything, and
    /// pushes to the remote.
    async fn init_and_push(&self, repo_dir: &Path, clone_url: &str) -> Result<(), RepoError>;

    /// Installs the chosen controller on the target cluster, waits for it,
    /// and applies the pointer objects that bind it to the repository.
    async fn bootstrap_controller(
        &self,
        target_kubeconfig: &Path,
        controller: GitOpsController,
        repo_dir: &Path,
        clone_url: &str,
        private: bool,
    ) -> Result<(), RepoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_selectors() {
        assert_eq!(GitOpsController::resolve("argocd").unwrap(), GitOpsController::ArgoCd);
        assert_eq!(GitOpsController::resolve("fluxcd").unwrap(), GitOpsController::FluxCd);
    }

    #[test]
    fn test_resolve_rejects_unknown_selector() {
        let err = GitOpsController::resolve("jenkins").unwrap_err();
        assert!(err.to_string().contains("jenkins"));
    }

    #[test]
    fn test_variant_names_match_selectors() {
        assert_eq!(GitOpsController::ArgoCd.to_string(), "argocd");
        assert_eq!(GitOpsController::FluxCd.to_string(), "fluxcd");
    }

    #[test]
    fn test_install_artifacts_are_denylisted() {
        for controller in [GitOpsController::ArgoCd, GitOpsController::FluxCd] {
            assert!(constants::ARTIFACT_DENYLIST.contains(&controller.install_file()));
            assert!(constants::ARTIFACT_DENYLIST.contains(&controller.install_output_dir()));
        }
    }
}
