//! # Workflow Configuration
//!
//! CLI-derived settings for a provisioning run, validated before any stage
//! executes. Provider credential material lives in [`credentials`].

pub mod credentials;

use std::path::PathBuf;

use regex::Regex;

use crate::constants;
use credentials::{CredentialError, ProviderCredentials, SecretString};

/// Errors raised while assembling or validating the workflow configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Cluster name does not satisfy the RFC 1123 label rules enforced by
    /// kind, CAPI, and GitHub repository naming.
    #[error(
        "invalid cluster name '{name}': must be a lowercase RFC 1123 label \
         (lowercase alphanumeric or '-', starting and ending alphanumeric, max 63 characters)"
    )]
    InvalidClusterName {
        /// The rejected name.
        name: String,
    },

    /// No GitHub token was supplied on the command line or via environment.
    #[error("no GitHub token provided: pass --github-token or set GITHUB_TOKEN")]
    MissingGithubToken,

    /// The GitOps controller selector does not name a supported variant.
    #[error("unknown gitops controller '{value}': supported values are 'argocd' and 'fluxcd'")]
    UnknownController {
        /// The rejected selector.
        value: String,
    },

    /// Provider credential construction failed.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// `$HOME` is unset, so no artifact directory can be derived.
    #[error("cannot determine artifact directory: HOME is not set")]
    HomeDirUnavailable,

    /// A validation regex failed to compile.
    #[error("failed to compile validation regex: {0}")]
    Regex(#[from] regex::Error),
}

/// Validated settings for one provisioning run.
#[derive(Debug)]
pub struct WorkflowConfig {
    /// Name of the target cluster, the generated repository, and the
    /// relocated artifact directory.
    pub cluster_name: String,
    /// GitHub API token used for repository creation and push.
    pub github_token: SecretString,
    /// Raw GitOps controller selector. Resolved to a variant when the
    /// repository is created.
    pub gitops_controller: String,
    /// Whether the generated repository is created private.
    pub private_repo: bool,
    /// Whether the target cluster uses the highly available topology.
    pub high_availability: bool,
    /// Infrastructure provider credential material.
    pub credentials: ProviderCredentials,
    /// Directory under which run artifacts are relocated on success.
    pub artifact_root: PathBuf,
}

impl WorkflowConfig {
    /// Validates the configuration before the workflow starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_cluster_name(&self.cluster_name)?;
        if self.github_token.is_empty() {
            return Err(ConfigError::MissingGithubToken);
        }
        Ok(())
    }
}

/// Validates a cluster name as a lowercase RFC 1123 label.
pub fn validate_cluster_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.len() > 63 {
        return Err(ConfigError::InvalidClusterName {
            name: name.to_owned(),
        });
    }
    let pattern = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")?;
    if !pattern.is_match(name) {
        return Err(ConfigError::InvalidClusterName {
            name: name.to_owned(),
        });
    }
    Ok(())
}

/// Default artifact root, `$HOME/.mkpctl`.
pub fn default_artifact_root() -> Result<PathBuf, ConfigError> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(constants::ARTIFACT_ROOT_DIR))
        .ok_or(ConfigError::HomeDirUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_cluster_name_accepts_rfc1123_labels() {
        for name in ["demo", "my-cluster", "c1", "a"] {
            assert!(validate_cluster_name(name).is_ok(), "rejected {name}");
        }
    }

    #[test]
    fn test_validate_cluster_name_rejects_invalid_labels() {
        for name in ["", "Demo", "my_cluster", "-demo", "demo-", "a b"] {
            assert!(validate_cluster_name(name).is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn test_validate_cluster_name_rejects_overlong_labels() {
        let name = "a".repeat(64);
        assert!(validate_cluster_name(&name).is_err());
    }
}
