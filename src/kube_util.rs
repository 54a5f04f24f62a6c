//! # Kubernetes Utilities
//!
//! Shared plumbing for talking to the ephemeral and target clusters:
//! kubeconfig-based client construction, bounded polling with cancellation,
//! readiness waits, and server-side apply of multi-document manifests.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, Config, ResourceExt};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::debug;

use crate::constants;

/// Field manager recorded by server-side apply operations.
pub const APPLY_FIELD_MANAGER: &str = "mkpctl";

/// Receiver half of the workflow shutdown signal. Flips to `true` once
/// when the process is asked to stop.
pub type ShutdownRx = watch::Receiver<bool>;

/// Errors from client construction and manifest application.
#[derive(Debug, thiserror::Error)]
pub enum KubeUtilError {
    /// The kubeconfig file could not be read or parsed.
    #[error("failed to load kubeconfig {path}: {source}")]
    Kubeconfig {
        /// Path of the offending kubeconfig.
        path: PathBuf,
        /// Underlying parse or IO failure.
        #[source]
        source: kube::config::KubeconfigError,
    },

    /// A client could not be built from the loaded config.
    #[error("failed to build Kubernetes client: {0}")]
    Client(#[source] kube::Error),

    /// An API request failed.
    #[error("Kubernetes API request failed: {0}")]
    Api(#[from] kube::Error),

    /// A manifest document is missing required fields.
    #[error("manifest document {index} is invalid: {reason}")]
    Manifest {
        /// Zero-based document index within the manifest stream.
        index: usize,
        /// What is missing or malformed.
        reason: String,
    },

    /// YAML parsing failed.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON conversion failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from bounded waits.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The condition did not hold before the deadline.
    #[error("timed out after {after_secs}s waiting for {what}")]
    TimedOut {
        /// Description of the awaited condition.
        what: String,
        /// The deadline that expired.
        after_secs: u64,
    },

    /// The workflow was cancelled while waiting.
    #[error("cancelled while waiting for {what}")]
    Cancelled {
        /// Description of the awaited condition.
        what: String,
    },
}

impl WaitError {
    /// Timeouts may succeed on a later attempt; cancellation never does.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Deadline and interval shape of one bounded wait.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Total time budget for the wait.
    pub deadline: Duration,
    /// First interval between checks.
    pub initial_interval: Duration,
    /// Ceiling for the exponentially growing interval.
    pub max_interval: Duration,
}

impl PollSettings {
    /// Standard settings: the given deadline with the default interval ramp.
    pub fn bounded(deadline_secs: u64) -> Self {
        Self {
            deadline: Duration::from_secs(deadline_secs),
            initial_interval: Duration::from_secs(constants::POLL_INITIAL_INTERVAL_SECS),
            max_interval: Duration::from_secs(constants::POLL_MAX_INTERVAL_SECS),
        }
    }
}

/// Builds a client from a kubeconfig file path.
pub async fn create_client(kubeconfig_path: &Path) -> Result<Client, KubeUtilError> {
    let kubeconfig =
        Kubeconfig::read_from(kubeconfig_path).map_err(|source| KubeUtilError::Kubeconfig {
            path: kubeconfig_path.to_path_buf(),
            source,
        })?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|source| KubeUtilError::Kubeconfig {
            path: kubeconfig_path.to_path_buf(),
            source,
        })?;
    Client::try_from(config).map_err(KubeUtilError::Client)
}

/// Polls `check` until it yields a value, the deadline expires, or the
/// shutdown signal fires. The interval between checks doubles up to the
/// configured ceiling.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    settings: PollSettings,
    cancel: &ShutdownRx,
    mut check: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let start = Instant::now();
    let mut interval = settings.initial_interval;
    let mut cancel = cancel.clone();
    loop {
        if *cancel.borrow() {
            return Err(WaitError::Cancelled {
                what: what.to_owned(),
            });
        }
        if let Some(value) = check().await {
            return Ok(value);
        }
        if start.elapsed() >= settings.deadline {
            return Err(WaitError::TimedOut {
                what: what.to_owned(),
                after_secs: settings.deadline.as_secs(),
            });
        }
        debug!(
            wait = what,
            interval_secs = interval.as_secs(),
            "⏳ condition not met yet"
        );
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            changed = cancel.changed() => {
                if changed.is_ok() && *cancel.borrow() {
                    return Err(WaitError::Cancelled { what: what.to_owned() });
                }
                if changed.is_err() {
                    // Sender gone; fall back to plain interval sleeps.
                    tokio::time::sleep(interval).await;
                }
            }
        }
        interval = (interval * 2).min(settings.max_interval);
    }
}

/// Waits until at least `min_nodes` nodes exist and every node is Ready.
/// Returns the node count.
pub async fn wait_for_nodes_ready(
    client: &Client,
    min_nodes: usize,
    settings: PollSettings,
    cancel: &ShutdownRx,
) -> Result<usize, WaitError> {
    let nodes: Api<Node> = Api::all(client.clone());
    poll_until("all nodes Ready", settings, cancel, || {
        let nodes = nodes.clone();
        async move {
            match nodes.list(&ListParams::default()).await {
                Ok(list) => {
                    let total = list.items.len();
                    let ready = list.items.iter().filter(|n| node_is_ready(n)).count();
                    if total >= min_nodes && total > 0 && ready == total {
                        Some(total)
                    } else {
                        debug!(ready, total, min_nodes, "nodes not ready");
                        None
                    }
                }
                Err(err) => {
                    debug!(error = %err, "node list failed, retrying");
                    None
                }
            }
        }
    })
    .await
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Waits until a deployment reports the Available condition or at least
/// one ready replica.
pub async fn wait_for_deployment_available(
    client: &Client,
    namespace: &str,
    name: &str,
    settings: PollSettings,
    cancel: &ShutdownRx,
) -> Result<(), WaitError> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let what = format!("deployment {namespace}/{name} Available");
    poll_until(&what, settings, cancel, || {
        let api = api.clone();
        let name = name.to_owned();
        async move {
            match api.get_opt(&name).await {
                Ok(Some(deployment)) => deployment_is_available(&deployment).then_some(()),
                Ok(None) => None,
                Err(err) => {
                    debug!(error = %err, deployment = %name, "deployment fetch failed, retrying");
                    None
                }
            }
        }
    })
    .await
}

fn deployment_is_available(deployment: &Deployment) -> bool {
    deployment.status.as_ref().is_some_and(|status| {
        let condition_met = status.conditions.as_ref().is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Available" && c.status == "True")
        });
        condition_met || status.ready_replicas.unwrap_or(0) >= 1
    })
}

/// Waits until a CRD reports the Established condition.
pub async fn wait_for_crd_established(
    client: &Client,
    name: &str,
    settings: PollSettings,
    cancel: &ShutdownRx,
) -> Result<(), WaitError> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let what = format!("CRD {name} Established");
    poll_until(&what, settings, cancel, || {
        let api = api.clone();
        let name = name.to_owned();
        async move {
            match api.get_opt(&name).await {
                Ok(Some(crd)) => crd
                    .status
                    .as_ref()
                    .and_then(|status| status.conditions.as_ref())
                    .is_some_and(|conditions| {
                        conditions
                            .iter()
                            .any(|c| c.type_ == "Established" && c.status == "True")
                    })
                    .then_some(()),
                Ok(None) => None,
                Err(err) => {
                    debug!(error = %err, crd = %name, "crd fetch failed, retrying");
                    None
                }
            }
        }
    })
    .await
}

/// Waits until a secret exists and returns it.
pub async fn wait_for_secret(
    client: &Client,
    namespace: &str,
    name: &str,
    settings: PollSettings,
    cancel: &ShutdownRx,
) -> Result<Secret, WaitError> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let what = format!("secret {namespace}/{name}");
    poll_until(&what, settings, cancel, || {
        let api = api.clone();
        let name = name.to_owned();
        async move {
            match api.get_opt(&name).await {
                Ok(secret) => secret,
                Err(err) => {
                    debug!(error = %err, secret = %name, "secret fetch failed, retrying");
                    None
                }
            }
        }
    })
    .await
}

/// Waits until the API server answers a version request.
pub async fn wait_for_api_server(
    client: &Client,
    settings: PollSettings,
    cancel: &ShutdownRx,
) -> Result<(), WaitError> {
    poll_until("API server availability", settings, cancel, || {
        let client = client.clone();
        async move {
            match client.apiserver_version().await {
                Ok(version) => {
                    debug!(git_version = %version.git_version, "API server answered");
                    Some(())
                }
                Err(err) => {
                    debug!(error = %err, "API server not reachable yet");
                    None
                }
            }
        }
    })
    .await
}

/// Decoded value of one secret data key.
pub fn secret_key_bytes(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret.data.as_ref()?.get(key).map(|value| value.0.clone())
}

/// Cluster-scoped kinds that must not be routed through a namespace.
static CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "CertificateSigningRequest",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
];

/// Derives the REST plural for a kind.
pub fn pluralize_kind(kind: &str) -> String {
    let irregular: &[(&str, &str)] = &[
        ("Endpoints", "endpoints"),
        ("NetworkPolicy", "networkpolicies"),
        ("PodSecurityPolicy", "podsecuritypolicies"),
    ];
    if let Some((_, plural)) = irregular.iter().find(|(k, _)| *k == kind) {
        return (*plural).to_owned();
    }
    let lower = kind.to_lowercase();
    if let Some(stem) = lower.strip_suffix('y') {
        if !stem.is_empty() && !stem.ends_with(|c: char| "aeiou".contains(c)) {
            return format!("{stem}ies");
        }
    }
    if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") || lower.ends_with("sh")
    {
        return format!("{lower}es");
    }
    format!("{lower}s")
}

fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_owned(), version.to_owned()),
        None => (String::new(), api_version.to_owned()),
    }
}

/// Applies every document of a multi-document YAML manifest with
/// server-side apply. Namespaced objects without an explicit namespace
/// land in `default_namespace` (or `default`). Returns the number of
/// applied documents.
pub async fn apply_manifest(
    client: &Client,
    manifest: &str,
    default_namespace: Option<&str>,
) -> Result<usize, KubeUtilError> {
    // The YAML parser is not Send, so every document is parsed before the
    // first apply await.
    let mut documents = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(manifest).enumerate() {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        documents.push((index, serde_json::to_value(&value)?));
    }

    let mut applied = 0;
    for (index, json) in documents {
        let Some(api_version) = json
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
        else {
            return Err(KubeUtilError::Manifest {
                index,
                reason: "missing apiVersion".into(),
            });
        };
        let Some(kind) = json.get("kind").and_then(|v| v.as_str()).map(str::to_owned) else {
            return Err(KubeUtilError::Manifest {
                index,
                reason: "missing kind".into(),
            });
        };
        let object: DynamicObject = serde_json::from_value(json)?;
        let name = object.name_any();
        if name.is_empty() {
            return Err(KubeUtilError::Manifest {
                index,
                reason: format!("{kind} document has no metadata.name"),
            });
        }

        let (group, version) = parse_api_version(&api_version);
        let gvk = GroupVersionKind {
            group,
            version,
            kind: kind.clone(),
        };
        let resource = ApiResource::from_gvk_with_plural(&gvk, &pluralize_kind(&kind));
        let api: Api<DynamicObject> = if CLUSTER_SCOPED_KINDS.contains(&kind.as_str()) {
            Api::all_with(client.clone(), &resource)
        } else {
            let namespace = object
                .metadata
                .namespace
                .clone()
                .or_else(|| default_namespace.map(str::to_owned))
                .unwrap_or_else(|| "default".to_owned());
            Api::namespaced_with(client.clone(), &namespace, &resource)
        };

        let params = PatchParams::apply(APPLY_FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(&object)).await?;
        debug!(kind = %kind, name = %name, "applied manifest document");
        applied += 1;
    }
    Ok(applied)
}

/// One document extracted from a multi-document manifest.
#[derive(Debug, Clone)]
pub struct ManifestDoc {
    /// Kind of the object.
    pub kind: String,
    /// Name of the object.
    pub name: String,
    /// The document re-serialized on its own.
    pub yaml: String,
}

/// Splits a multi-document manifest into its named documents.
pub fn split_manifest(manifest: &str) -> Result<Vec<ManifestDoc>, KubeUtilError> {
    let mut docs = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(manifest).enumerate() {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| KubeUtilError::Manifest {
                index,
                reason: "missing kind".into(),
            })?
            .to_owned();
        let name = value
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| KubeUtilError::Manifest {
                index,
                reason: format!("{kind} document has no metadata.name"),
            })?
            .to_owned();
        let yaml = serde_yaml::to_string(&value)?;
        docs.push(ManifestDoc { kind, name, yaml });
    }
    Ok(docs)
}

/// File name a split document is written under.
pub fn split_doc_file_name(doc: &ManifestDoc) -> String {
    format!(
        "{}-{}.yaml",
        doc.kind.to_lowercase(),
        doc.name.replace([':', '/'], "-")
    )
}

/// Writes each document to `<dir>/<kind>-<name>.yaml`.
pub fn write_split_docs(dir: &Path, docs: &[ManifestDoc]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    for doc in docs {
        std::fs::write(dir.join(split_doc_file_name(doc)), &doc.yaml)?;
    }
    Ok(())
}

/// Ensures a namespace exists via server-side apply.
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<(), KubeUtilError> {
    let api: Api<Namespace> = Api::all(client.clone());
    let namespace: Namespace = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name },
    }))?;
    let params = PatchParams::apply(APPLY_FIELD_MANAGER).force();
    api.patch(name, &params, &Patch::Apply(&namespace)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};

    #[test]
    fn test_pluralize_kind_regular_forms() {
        assert_eq!(pluralize_kind("Deployment"), "deployments");
        assert_eq!(pluralize_kind("Node"), "nodes");
        assert_eq!(pluralize_kind("Ingress"), "ingresses");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
    }

    #[test]
    fn test_pluralize_kind_y_suffix() {
        assert_eq!(pluralize_kind("GitRepository"), "gitrepositories");
        assert_eq!(pluralize_kind("NetworkPolicy"), "networkpolicies");
    }

    #[test]
    fn test_pluralize_kind_irregular() {
        assert_eq!(pluralize_kind("Endpoints"), "endpoints");
    }

    #[test]
    fn test_parse_api_version_core_and_grouped() {
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_owned()));
        assert_eq!(
            parse_api_version("apps/v1"),
            ("apps".to_owned(), "v1".to_owned())
        );
        assert_eq!(
            parse_api_version("cluster.x-k8s.io/v1beta1"),
            ("cluster.x-k8s.io".to_owned(), "v1beta1".to_owned())
        );
    }

    #[test]
    fn test_cluster_scoped_kinds_cover_applied_manifests() {
        for kind in ["Namespace", "Node", "ClusterRole", "CustomResourceDefinition"] {
            assert!(CLUSTER_SCOPED_KINDS.contains(&kind));
        }
        assert!(!CLUSTER_SCOPED_KINDS.contains(&"Deployment"));
    }

    fn node_with_ready(status: &str) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_owned(),
                    status: status.to_owned(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_node_is_ready_requires_true_condition() {
        assert!(node_is_ready(&node_with_ready("True")));
        assert!(!node_is_ready(&node_with_ready("False")));
        assert!(!node_is_ready(&Node::default()));
    }

    #[test]
    fn test_split_manifest_names_each_document() {
        let manifest = "\
apiVersion: v1
kind: Namespace
metadata:
  name: argocd
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: argocd-server
  namespace: argocd
---
";
        let docs = split_manifest(manifest).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].kind, "Namespace");
        assert_eq!(docs[0].name, "argocd");
        assert_eq!(docs[1].kind, "Deployment");
        assert_eq!(docs[1].name, "argocd-server");
        assert!(docs[1].yaml.contains("argocd-server"));
    }

    #[test]
    fn test_split_manifest_rejects_unnamed_document() {
        let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n";
        assert!(split_manifest(manifest).is_err());
    }

    #[test]
    fn test_write_split_docs_sanitizes_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let docs = vec![ManifestDoc {
            kind: "Node".to_owned(),
            name: "worker:1".to_owned(),
            yaml: "kind: Node\n".to_owned(),
        }];
        write_split_docs(dir.path(), &docs).unwrap();
        assert!(dir.path().join("node-worker-1.yaml").is_file());
    }

    // The apply and wait futures run inside Send-boxed trait futures, so
    // they must not hold the YAML parser or other non-Send state across an
    // await. Compile-time check only.
    #[allow(dead_code, reason = "type-level assertion, never called")]
    fn assert_apply_futures_are_send(client: &Client, cancel: &ShutdownRx) {
        fn is_send<T: Send>(_: T) {}
        is_send(apply_manifest(client, "kind: Namespace", None));
        is_send(ensure_namespace(client, "argocd"));
        is_send(wait_for_api_server(client, PollSettings::bounded(1), cancel));
    }
}
