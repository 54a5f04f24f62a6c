//! # Cluster API Provisioner
//!
//! Drives clusterctl against the ephemeral control plane to create the
//! target cluster, installs the default CNI, and performs the management
//! pivot that makes the target cluster own its own CAPI objects.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use super::{run_command_captured, run_command_streaming, Provisioner, ProvisionError};
use crate::config::credentials::ProviderCredentials;
use crate::constants;
use crate::fetch::fetch_manifest;
use crate::kube_util::{self, KubeUtilError, PollSettings, ShutdownRx};

const CLUSTERCTL: &str = "clusterctl";
const CAPI_NAMESPACE: &str = "default";
const CLUSTERS_CRD: &str = "clusters.cluster.x-k8s.io";
const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

fn capi_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind {
            group: "cluster.x-k8s.io".to_owned(),
            version: "v1beta1".to_owned(),
            kind: kind.to_owned(),
        },
        plural,
    )
}

fn clusters_api(client: &Client) -> Api<DynamicObject> {
    Api::namespaced_with(
        client.clone(),
        CAPI_NAMESPACE,
        &capi_resource("Cluster", "clusters"),
    )
}

fn machines_api(client: &Client) -> Api<DynamicObject> {
    Api::namespaced_with(
        client.clone(),
        CAPI_NAMESPACE,
        &capi_resource("Machine", "machines"),
    )
}

/// Maps a provider tag to the infrastructure name clusterctl expects.
fn infrastructure_for_tag(tag: &str) -> Result<&'static str, ProvisionError> {
    match tag {
        "capz" => Ok("azure"),
        "capd" => Ok("docker"),
        _ => Err(ProvisionError::UnknownProviderTag {
            tag: tag.to_owned(),
        }),
    }
}

fn machine_phase(machine: &DynamicObject) -> Option<&str> {
    machine.data.get("status")?.get("phase")?.as_str()
}

/// True when a CAPI cluster object reports ready infrastructure, either
/// through the summary boolean or the InfrastructureReady condition.
fn cluster_infrastructure_ready(cluster: &DynamicObject) -> bool {
    let status = cluster.data.get("status");
    let summary = status
        .and_then(|s| s.get("infrastructureReady"))
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let condition = status
        .and_then(|s| s.get("conditions"))
        .and_then(serde_json::Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(serde_json::Value::as_str) == Some("InfrastructureReady")
                    && c.get("status").and_then(serde_json::Value::as_str) == Some("True")
            })
        });
    summary || condition
}

/// clusterctl-backed implementation of [`Provisioner`].
#[derive(Debug)]
pub struct CapiProvisioner {
    cancel: ShutdownRx,
}

impl CapiProvisioner {
    /// Builds a provisioner that honors the given shutdown signal while
    /// waiting for cluster readiness.
    pub fn new(cancel: ShutdownRx) -> Self {
        Self { cancel }
    }

    async fn clusterctl_streaming(
        &self,
        args: &[&str],
        envs: &[(String, String)],
    ) -> Result<(), ProvisionError> {
        run_command_streaming(
            CLUSTERCTL,
            args,
            envs,
            Duration::from_secs(constants::COMMAND_TIMEOUT_SECS),
        )
        .await
        .map_err(Into::into)
    }

    async fn clusterctl_captured(
        &self,
        args: &[&str],
        envs: &[(String, String)],
    ) -> Result<String, ProvisionError> {
        run_command_captured(
            CLUSTERCTL,
            args,
            envs,
            None,
            Duration::from_secs(constants::COMMAND_TIMEOUT_SECS),
        )
        .await
        .map_err(Into::into)
    }

    /// Waits until every machine of the cluster reports the Running phase.
    async fn wait_for_machines_running(
        &self,
        client: &Client,
        cluster: &str,
        expected: u32,
    ) -> Result<(), ProvisionError> {
        let api = machines_api(client);
        let selector = format!("{CLUSTER_NAME_LABEL}={cluster}");
        let what = format!("all machines of cluster {cluster} Running");
        kube_util::poll_until(
            &what,
            PollSettings::bounded(constants::MACHINES_RUNNING_TIMEOUT_SECS),
            &self.cancel,
            || {
                let api = api.clone();
                let selector = selector.clone();
                async move {
                    match api.list(&ListParams::default().labels(&selector)).await {
                        Ok(list) => {
                            let total = list.items.len();
                            let running = list
                                .items
                                .iter()
                                .filter(|machine| machine_phase(machine) == Some("Running"))
                                .count();
                            if total >= expected as usize && total > 0 && running == total {
                                Some(())
                            } else {
                                debug!(running, total, expected, "machines not running yet");
                                None
                            }
                        }
                        Err(err) => {
                            debug!(error = %err, "machine list failed, retrying");
                            None
                        }
                    }
                }
            },
        )
        .await
        .map_err(Into::into)
    }

    /// Fetches the pinned Calico manifest, records it in the working
    /// directory, and applies it to the target cluster.
    async fn install_default_cni(
        &self,
        target: &Client,
        workdir: &Path,
    ) -> Result<(), ProvisionError> {
        info!(url = constants::CALICO_MANIFEST_URL, "🔄 installing default CNI");
        let manifest = fetch_manifest(constants::CALICO_MANIFEST_URL)
            .await
            .map_err(|source| ProvisionError::Fetch {
                url: constants::CALICO_MANIFEST_URL.to_owned(),
                source,
            })?;
        std::fs::write(workdir.join("cni.yaml"), &manifest)?;
        let docs = kube_util::split_manifest(&manifest)?;
        kube_util::write_split_docs(&workdir.join("cni-output"), &docs)?;
        let applied = kube_util::apply_manifest(target, &manifest, Some("kube-system")).await?;
        info!(documents = applied, "✅ CNI manifest applied");
        Ok(())
    }

    /// Flips `spec.paused` on every cluster object in the management
    /// namespace. Returns how many clusters were patched.
    async fn set_clusters_paused(
        &self,
        client: &Client,
        paused: bool,
    ) -> Result<usize, ProvisionError> {
        let api = clusters_api(client);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(KubeUtilError::Api)?;
        for cluster in &list.items {
            let name = cluster.name_any();
            let patch = serde_json::json!({ "spec": { "paused": paused } });
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(KubeUtilError::Api)?;
            debug!(cluster = %name, paused, "cluster reconciliation toggled");
        }
        Ok(list.items.len())
    }

    /// Confirms the moved cluster objects exist on the target and report
    /// ready infrastructure.
    async fn verify_pivot(&self, target: &Client) -> Result<(), ProvisionError> {
        let api = clusters_api(target);
        kube_util::poll_until(
            "moved cluster self-managing on target",
            PollSettings::bounded(constants::PIVOT_VERIFY_TIMEOUT_SECS),
            &self.cancel,
            || {
                let api = api.clone();
                async move {
                    match api.list(&ListParams::default()).await {
                        Ok(list) => {
                            let total = list.items.len();
                            let ready = list
                                .items
                                .iter()
                                .filter(|c| cluster_infrastructure_ready(c))
                                .count();
                            if total > 0 && ready == total {
                                Some(())
                            } else {
                                debug!(ready, total, "moved clusters not ready yet");
                                None
                            }
                        }
                        Err(err) => {
                            debug!(error = %err, "cluster list failed, retrying");
                            None
                        }
                    }
                }
            },
        )
        .await
        .map_err(Into::into)
    }

    async fn pivot_inner(
        &self,
        ephemeral_kubeconfig: &Path,
        target_kubeconfig: &Path,
        provider_tag: &str,
        credentials: &ProviderCredentials,
    ) -> Result<(), ProvisionError> {
        let infrastructure = infrastructure_for_tag(provider_tag)?;
        let envs = credentials.clusterctl_env();
        let ephemeral_arg = ephemeral_kubeconfig.to_string_lossy().into_owned();
        let target_arg = target_kubeconfig.to_string_lossy().into_owned();

        info!(
            provider_tag,
            "🔄 installing Cluster API controllers on the target cluster"
        );
        self.clusterctl_streaming(
            &[
                "init",
                "--kubeconfig",
                &target_arg,
                "--infrastructure",
                infrastructure,
            ],
            &envs,
        )
        .await?;

        let target = kube_util::create_client(target_kubeconfig).await?;
        let deployment_wait =
            PollSettings::bounded(constants::DEPLOYMENT_AVAILABLE_TIMEOUT_SECS);
        kube_util::wait_for_deployment_available(
            &target,
            "capi-system",
            "capi-controller-manager",
            deployment_wait,
            &self.cancel,
        )
        .await?;
        kube_util::wait_for_deployment_available(
            &target,
            &format!("{provider_tag}-system"),
            &format!("{provider_tag}-controller-manager"),
            deployment_wait,
            &self.cancel,
        )
        .await?;

        let ephemeral = kube_util::create_client(ephemeral_kubeconfig).await?;
        let paused = self.set_clusters_paused(&ephemeral, true).await?;
        info!(clusters = paused, "🔄 paused reconciliation, moving management objects");

        self.clusterctl_streaming(
            &[
                "move",
                "--kubeconfig",
                &ephemeral_arg,
                "--to-kubeconfig",
                &target_arg,
            ],
            &envs,
        )
        .await?;

        self.verify_pivot(&target).await?;
        let resumed = self.set_clusters_paused(&target, false).await?;
        info!(clusters = resumed, "✅ management pivot complete, target is self-managing");
        Ok(())
    }
}

#[async_trait]
impl Provisioner for CapiProvisioner {
    async fn preflight(&self) -> Result<(), ProvisionError> {
        which::which(CLUSTERCTL)
            .map_err(|_| ProvisionError::MissingBinary { binary: CLUSTERCTL })?;
        Ok(())
    }

    async fn create_target(
        &self,
        ephemeral_kubeconfig: &Path,
        name: &str,
        workdir: &Path,
        credentials: &ProviderCredentials,
        high_availability: bool,
    ) -> Result<PathBuf, ProvisionError> {
        let envs = credentials.clusterctl_env();
        let infrastructure = credentials.infrastructure();
        let ephemeral_arg = ephemeral_kubeconfig.to_string_lossy().into_owned();

        info!(
            cluster = name,
            provider = infrastructure,
            "🔄 initializing Cluster API on the ephemeral control plane"
        );
        self.clusterctl_streaming(
            &[
                "init",
                "--kubeconfig",
                &ephemeral_arg,
                "--infrastructure",
                infrastructure,
            ],
            &envs,
        )
        .await?;

        let ephemeral = kube_util::create_client(ephemeral_kubeconfig).await?;
        kube_util::wait_for_crd_established(
            &ephemeral,
            CLUSTERS_CRD,
            PollSettings::bounded(constants::CRD_ESTABLISHED_TIMEOUT_SECS),
            &self.cancel,
        )
        .await?;

        let (control_planes, workers) = if high_availability {
            (
                constants::HA_CONTROL_PLANE_COUNT,
                constants::HA_WORKER_COUNT,
            )
        } else {
            (
                constants::SINGLE_CONTROL_PLANE_COUNT,
                constants::SINGLE_WORKER_COUNT,
            )
        };
        let control_plane_count = control_planes.to_string();
        let worker_count = workers.to_string();

        info!(
            cluster = name,
            control_planes, workers, "🔄 generating target cluster declaration"
        );
        let manifest = self
            .clusterctl_captured(
                &[
                    "generate",
                    "cluster",
                    name,
                    "--kubeconfig",
                    &ephemeral_arg,
                    "--infrastructure",
                    infrastructure,
                    "--kubernetes-version",
                    constants::KUBERNETES_VERSION,
                    "--control-plane-machine-count",
                    &control_plane_count,
                    "--worker-machine-count",
                    &worker_count,
                ],
                &envs,
            )
            .await?;

        std::fs::write(workdir.join("install-cluster.yaml"), &manifest)?;
        let docs = kube_util::split_manifest(&manifest)?;
        kube_util::write_split_docs(&workdir.join("capi-install-yamls-output"), &docs)?;

        info!(cluster = name, "🔄 applying target cluster declaration");
        kube_util::apply_manifest(&ephemeral, &manifest, Some(CAPI_NAMESPACE)).await?;

        let secret_name = format!("{name}-kubeconfig");
        let secret = kube_util::wait_for_secret(
            &ephemeral,
            CAPI_NAMESPACE,
            &secret_name,
            PollSettings::bounded(constants::TARGET_KUBECONFIG_TIMEOUT_SECS),
            &self.cancel,
        )
        .await?;
        let kubeconfig_bytes = kube_util::secret_key_bytes(&secret, "value").ok_or(
            ProvisionError::MalformedKubeconfigSecret {
                secret: secret_name,
            },
        )?;
        let target_kubeconfig = workdir.join(format!("{name}.kubeconfig"));
        std::fs::write(&target_kubeconfig, kubeconfig_bytes)?;
        info!(
            kubeconfig = %target_kubeconfig.display(),
            "✅ target cluster kubeconfig written"
        );

        self.wait_for_machines_running(&ephemeral, name, control_planes + workers)
            .await?;

        let target = kube_util::create_client(&target_kubeconfig).await?;
        kube_util::wait_for_api_server(
            &target,
            PollSettings::bounded(constants::NODE_READY_TIMEOUT_SECS),
            &self.cancel,
        )
        .await?;
        self.install_default_cni(&target, workdir).await?;
        let expected_nodes = (control_planes + workers) as usize;
        let nodes = kube_util::wait_for_nodes_ready(
            &target,
            expected_nodes,
            PollSettings::bounded(constants::NODE_READY_TIMEOUT_SECS),
            &self.cancel,
        )
        .await?;
        info!(cluster = name, nodes, "✅ target cluster provisioned");
        Ok(target_kubeconfig)
    }

    async fn pivot(
        &self,
        ephemeral_kubeconfig: &Path,
        target_kubeconfig: &Path,
        provider_tag: &str,
        credentials: &ProviderCredentials,
    ) -> Result<(), ProvisionError> {
        self.pivot_inner(
            ephemeral_kubeconfig,
            target_kubeconfig,
            provider_tag,
            credentials,
        )
        .await
        .map_err(|err| match err {
            ProvisionError::UnknownProviderTag { .. } => err,
            other => ProvisionError::Pivot(Box::new(other)),
        })
    }

    async fn delete_target(
        &self,
        ephemeral_kubeconfig: &Path,
        name: &str,
    ) -> Result<(), ProvisionError> {
        let client = kube_util::create_client(ephemeral_kubeconfig).await?;
        let api = clusters_api(&client);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => {
                info!(cluster = name, "target cluster object already absent");
                return Ok(());
            }
            Err(err) => return Err(KubeUtilError::Api(err).into()),
        }
        let what = format!("cluster {name} deletion");
        kube_util::poll_until(
            &what,
            PollSettings::bounded(constants::NODE_READY_TIMEOUT_SECS),
            &self.cancel,
            || {
                let api = api.clone();
                let name = name.to_owned();
                async move {
                    match api.get_opt(&name).await {
                        Ok(None) => Some(()),
                        Ok(Some(_)) => None,
                        Err(err) => {
                            debug!(error = %err, "cluster fetch failed, retrying");
                            None
                        }
                    }
                }
            },
        )
        .await?;
        info!(cluster = name, "✅ target cluster deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_status(status: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: kube::core::ObjectMeta {
                name: Some("demo".to_owned()),
                ..Default::default()
            },
            data: serde_json::json!({ "status": status }),
        }
    }

    #[test]
    fn test_infrastructure_for_tag() {
        assert_eq!(infrastructure_for_tag("capz").unwrap(), "azure");
        assert_eq!(infrastructure_for_tag("capd").unwrap(), "docker");
        assert!(infrastructure_for_tag("capo").is_err());
    }

    #[test]
    fn test_cluster_infrastructure_ready_summary_boolean() {
        let cluster = cluster_with_status(serde_json::json!({ "infrastructureReady": true }));
        assert!(cluster_infrastructure_ready(&cluster));
    }

    #[test]
    fn test_cluster_infrastructure_ready_condition() {
        let cluster = cluster_with_status(serde_json::json!({
            "conditions": [
                { "type": "InfrastructureReady", "status": "True" }
            ]
        }));
        assert!(cluster_infrastructure_ready(&cluster));
    }

    #[test]
    fn test_cluster_infrastructure_not_ready() {
        let cluster = cluster_with_status(serde_json::json!({
            "infrastructureReady": false,
            "conditions": [
                { "type": "InfrastructureReady", "status": "False" }
            ]
        }));
        assert!(!cluster_infrastructure_ready(&cluster));
    }

    #[test]
    fn test_machine_phase_reads_status() {
        let machine = cluster_with_status(serde_json::json!({ "phase": "Running" }));
        assert_eq!(machine_phase(&machine), Some("Running"));
        assert_eq!(machine_phase(&cluster_with_status(serde_json::json!({}))), None);
    }
}
