//! # Cluster Lifecycle
//!
//! The two cluster-shaped collaborators of the provisioning workflow:
//!
//! 1. An ephemeral kind control plane that temporarily hosts the Cluster API
//!    controllers ([`kind`]).
//! 2. A CAPI-driven provisioner that creates the real target cluster and
//!    later pivots management onto it ([`capi`]).
//!
//! Both sit behind traits so the workflow orchestrator can be exercised
//! against in-memory implementations.

pub mod capi;
pub mod kind;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::config::credentials::ProviderCredentials;
use crate::kube_util::{KubeUtilError, WaitError};

/// Errors from external command invocations.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The binary could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The command exited with a non-zero status.
    #[error("{program} {args} failed ({status}): {stderr}")]
    Failed {
        /// Program that failed.
        program: String,
        /// Space-joined arguments.
        args: String,
        /// Exit status display.
        status: String,
        /// Captured stderr.
        stderr: String,
    },

    /// The command did not finish within its time budget.
    #[error("{program} {args} timed out after {timeout_secs}s")]
    TimedOut {
        /// Program that timed out.
        program: String,
        /// Space-joined arguments.
        args: String,
        /// Budget that was exceeded.
        timeout_secs: u64,
    },

    /// Reading from or writing to the child process failed.
    #[error("io error driving {program}: {source}")]
    Io {
        /// Program being driven.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the ephemeral control plane.
///
/// Every variant aborts the workflow; a broken bootstrap environment is
/// never retried.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    /// A required binary is not on PATH.
    #[error("required binary '{binary}' not found on PATH")]
    MissingBinary {
        /// The missing binary.
        binary: &'static str,
    },

    /// A kind cluster with the requested name already exists.
    #[error(
        "ephemeral cluster '{name}' already exists: remove it with \
         'kind delete cluster --name {name}' and re-run"
    )]
    AlreadyExists {
        /// The colliding cluster name.
        name: String,
    },

    /// An external command failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Talking to the cluster failed.
    #[error(transparent)]
    Kube(#[from] KubeUtilError),

    /// A bounded wait failed.
    #[error(transparent)]
    Wait(#[from] WaitError),

    /// A filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlPlaneError {
    /// Ephemeral control plane failures always abort the workflow.
    pub fn is_recoverable(&self) -> bool {
        false
    }
}

/// Errors from target cluster provisioning and the management pivot.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// A required binary is not on PATH.
    #[error("required binary '{binary}' not found on PATH")]
    MissingBinary {
        /// The missing binary.
        binary: &'static str,
    },

    /// The provider tag does not name a known CAPI provider.
    #[error("unknown provider tag '{tag}': expected 'capz' or 'capd'")]
    UnknownProviderTag {
        /// The rejected tag.
        tag: String,
    },

    /// The target kubeconfig secret lacks the expected data key.
    #[error("kubeconfig secret '{secret}' has no 'value' key")]
    MalformedKubeconfigSecret {
        /// Name of the malformed secret.
        secret: String,
    },

    /// Downloading a pinned manifest failed.
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        /// The manifest URL.
        url: String,
        /// Underlying HTTP failure.
        #[source]
        source: reqwest::Error,
    },

    /// The pivot sequence failed. Never retried: a half-moved management
    /// state must be inspected, not re-driven.
    #[error("pivot to target cluster failed: {0}")]
    Pivot(#[source] Box<ProvisionError>),

    /// An external command failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Talking to a cluster failed.
    #[error(transparent)]
    Kube(#[from] KubeUtilError),

    /// A bounded wait failed.
    #[error(transparent)]
    Wait(#[from] WaitError),

    /// A filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Whether a later attempt of the same stage may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Wait(wait) => wait.is_recoverable(),
            Self::Kube(KubeUtilError::Api(_)) | Self::Fetch { .. } => true,
            _ => false,
        }
    }
}

/// Lifecycle of the ephemeral bootstrap control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Verifies the external tooling this control plane depends on.
    async fn preflight(&self) -> Result<(), ControlPlaneError> {
        Ok(())
    }

    /// Creates the ephemeral cluster and returns the path of its
    /// kubeconfig inside `workdir`.
    async fn create_ephemeral(
        &self,
        name: &str,
        workdir: &Path,
    ) -> Result<PathBuf, ControlPlaneError>;

    /// Deletes the ephemeral cluster and its kubeconfig file. A missing
    /// kubeconfig file is not an error.
    async fn delete_ephemeral(&self, name: &str, kubeconfig: &Path)
        -> Result<(), ControlPlaneError>;
}

/// CAPI-driven provisioning of the target cluster.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Verifies the external tooling this provisioner depends on.
    async fn preflight(&self) -> Result<(), ProvisionError> {
        Ok(())
    }

    /// Provisions the target cluster from the ephemeral control plane and
    /// returns the path of the target kubeconfig inside `workdir`.
    async fn create_target(
        &self,
        ephemeral_kubeconfig: &Path,
        name: &str,
        workdir: &Path,
        credentials: &ProviderCredentials,
        high_availability: bool,
    ) -> Result<PathBuf, ProvisionError>;

    /// Moves CAPI management from the ephemeral control plane onto the
    /// target cluster and verifies the target self-manages afterwards.
    async fn pivot(
        &self,
        ephemeral_kubeconfig: &Path,
        target_kubeconfig: &Path,
        provider_tag: &str,
        credentials: &ProviderCredentials,
    ) -> Result<(), ProvisionError>;

    /// Best-effort removal of a partially created target cluster. Used
    /// during abort cleanup while the ephemeral control plane still owns
    /// the cluster objects.
    async fn delete_target(
        &self,
        ephemeral_kubeconfig: &Path,
        name: &str,
    ) -> Result<(), ProvisionError>;
}

fn joined_args(args: &[&str]) -> String {
    args.join(" ")
}

/// Runs a command to completion, capturing stdout. Optional stdin data is
/// piped in before waiting.
pub(crate) async fn run_command_captured(
    program: &str,
    args: &[&str],
    envs: &[(String, String)],
    stdin_data: Option<&str>,
    timeout: Duration,
) -> Result<String, CommandError> {
    debug!(program, args = %joined_args(args), "running command");
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        program: program.to_owned(),
        source,
    })?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(data.as_bytes())
                .await
                .map_err(|source| CommandError::Io {
                    program: program.to_owned(),
                    source,
                })?;
        }
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| CommandError::TimedOut {
            program: program.to_owned(),
            args: joined_args(args),
            timeout_secs: timeout.as_secs(),
        })?
        .map_err(|source| CommandError::Io {
            program: program.to_owned(),
            source,
        })?;

    if !output.status.success() {
        return Err(CommandError::Failed {
            program: program.to_owned(),
            args: joined_args(args),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs a command to completion, forwarding each stdout line to the log.
/// Stderr is collected and reported on failure.
pub(crate) async fn run_command_streaming(
    program: &str,
    args: &[&str],
    envs: &[(String, String)],
    timeout: Duration,
) -> Result<(), CommandError> {
    debug!(program, args = %joined_args(args), "running command");
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        program: program.to_owned(),
        source,
    })?;

    let stdout_task = child.stdout.take().map(|stdout| {
        let program = program.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(command = %program, "{line}");
            }
        })
    });
    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut collected = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("{line}");
                collected.push(line);
            }
            collected
        })
    });

    let status = tokio::time::timeout(timeout, child.wait())
        .await
        .map_err(|_| CommandError::TimedOut {
            program: program.to_owned(),
            args: joined_args(args),
            timeout_secs: timeout.as_secs(),
        })?
        .map_err(|source| CommandError::Io {
            program: program.to_owned(),
            source,
        })?;

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    let stderr_lines = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };

    if !status.success() {
        return Err(CommandError::Failed {
            program: program.to_owned(),
            args: joined_args(args),
            status: status.to_string(),
            stderr: stderr_lines.join("\n"),
        });
    }
    Ok(())
}
