//! # Ephemeral kind Control Plane
//!
//! Creates and destroys the short-lived kind cluster that hosts the CAPI
//! controllers during bootstrap. The docker socket is mounted into the
//! node so the CAPD provider can manage sibling containers when the
//! docker infrastructure provider is selected.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{run_command_captured, ControlPlane, ControlPlaneError};
use crate::constants;
use crate::kube_util::{self, PollSettings, ShutdownRx};

/// Node configuration piped to `kind create cluster` on stdin.
const KIND_CLUSTER_CONFIG: &str = r"kind: Cluster
apiVersion: kind.x-k8s.io/v1alpha4
nodes:
  - role: control-plane
    extraMounts:
      - hostPath: /var/run/docker.sock
        containerPath: /var/run/docker.sock
";

const KIND_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// kind-backed implementation of [`ControlPlane`].
#[derive(Debug)]
pub struct KindControlPlane {
    cancel: ShutdownRx,
}

impl KindControlPlane {
    /// Builds a control plane that honors the given shutdown signal while
    /// waiting for readiness.
    pub fn new(cancel: ShutdownRx) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl ControlPlane for KindControlPlane {
    async fn preflight(&self) -> Result<(), ControlPlaneError> {
        for binary in ["kind", "docker"] {
            which::which(binary).map_err(|_| ControlPlaneError::MissingBinary { binary })?;
        }
        // A present binary is not enough; kind needs the daemon up.
        run_command_captured(
            "docker",
            &["info", "--format", "{{.ServerVersion}}"],
            &[],
            None,
            KIND_QUERY_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn create_ephemeral(
        &self,
        name: &str,
        workdir: &Path,
    ) -> Result<PathBuf, ControlPlaneError> {
        let existing =
            run_command_captured("kind", &["get", "clusters"], &[], None, KIND_QUERY_TIMEOUT)
                .await?;
        if existing.lines().any(|line| line.trim() == name) {
            return Err(ControlPlaneError::AlreadyExists {
                name: name.to_owned(),
            });
        }

        info!(cluster = name, "🔄 creating ephemeral kind cluster");
        run_command_captured(
            "kind",
            &["create", "cluster", "--name", name, "--config", "-"],
            &[],
            Some(KIND_CLUSTER_CONFIG),
            Duration::from_secs(constants::COMMAND_TIMEOUT_SECS),
        )
        .await?;

        let kubeconfig = workdir.join(constants::EPHEMERAL_KUBECONFIG_FILE);
        let kubeconfig_arg = kubeconfig.to_string_lossy().into_owned();
        run_command_captured(
            "kind",
            &[
                "export",
                "kubeconfig",
                "--name",
                name,
                "--kubeconfig",
                &kubeconfig_arg,
            ],
            &[],
            None,
            KIND_QUERY_TIMEOUT,
        )
        .await?;

        let client = kube_util::create_client(&kubeconfig).await?;
        let nodes = kube_util::wait_for_nodes_ready(
            &client,
            1,
            PollSettings::bounded(constants::NODE_READY_TIMEOUT_SECS),
            &self.cancel,
        )
        .await?;
        info!(
            cluster = name,
            nodes,
            kubeconfig = %kubeconfig.display(),
            "✅ ephemeral control plane ready"
        );
        Ok(kubeconfig)
    }

    async fn delete_ephemeral(
        &self,
        name: &str,
        kubeconfig: &Path,
    ) -> Result<(), ControlPlaneError> {
        info!(cluster = name, "🔄 deleting ephemeral kind cluster");
        run_command_captured(
            "kind",
            &["delete", "cluster", "--name", name],
            &[],
            None,
            Duration::from_secs(constants::COMMAND_TIMEOUT_SECS),
        )
        .await?;
        if kubeconfig.exists() {
            std::fs::remove_file(kubeconfig)?;
        }
        info!(cluster = name, "✅ ephemeral control plane deleted");
        Ok(())
    }
}
