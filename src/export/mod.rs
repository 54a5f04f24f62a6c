//! # Cluster State Export
//!
//! Reads cluster-scoped objects from a live cluster, strips the
//! server-populated fields that would make the manifests non-portable,
//! and writes one YAML file per object.
//!
//! Reading goes through the [`ClusterReader`] capability so the sanitize
//! and layout logic can be exercised against in-memory object sets.

use std::path::Path;

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use kube::Client;
use tracing::{debug, info, warn};

use crate::kube_util::{self, KubeUtilError};

/// Marker for the internal (non-servable) API version of a kind.
pub const INTERNAL_API_VERSION: &str = "__internal";

/// One kind included in the export, with the versions it is known under.
/// The first non-internal version is the one used on the wire.
#[derive(Debug, Clone, Copy)]
pub struct ExportedKind {
    /// API group. Empty for the core group.
    pub group: &'static str,
    /// Object kind.
    pub kind: &'static str,
    /// REST plural.
    pub plural: &'static str,
    /// Known versions, internal marker included.
    pub versions: &'static [&'static str],
}

/// The cluster-scoped kinds captured by an export.
pub const EXPORTED_KINDS: &[ExportedKind] = &[ExportedKind {
    group: "",
    kind: "Node",
    plural: "nodes",
    versions: &[INTERNAL_API_VERSION, "v1"],
}];

/// Errors from the export pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Client construction or plumbing failed.
    #[error(transparent)]
    Kube(#[from] KubeUtilError),

    /// Listing a kind failed. Nothing was written for that kind.
    #[error("listing {kind} failed: {source}")]
    List {
        /// Kind being listed.
        kind: String,
        /// Underlying API failure.
        #[source]
        source: kube::Error,
    },

    /// Re-reading a single object failed.
    #[error("fetching {kind} '{name}' failed: {source}")]
    Get {
        /// Kind of the object.
        kind: String,
        /// Name of the object.
        name: String,
        /// Underlying API failure.
        #[source]
        source: kube::Error,
    },

    /// A kind has no non-internal version to serialize under.
    #[error("no servable API version registered for kind {kind}")]
    NoServedVersion {
        /// The offending kind.
        kind: String,
    },

    /// Some objects exported, others failed. The export directory holds
    /// every object that succeeded.
    #[error("export wrote {written} object(s) but {failed} failed: {details}")]
    Partial {
        /// Objects written successfully.
        written: usize,
        /// Objects that failed.
        failed: usize,
        /// Per-object failure summary.
        details: String,
    },

    /// YAML serialization failed.
    #[error("yaml serialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExportError {
    /// Whether a later attempt of the export may succeed. A partial export
    /// is retried whole; rewriting already exported files is harmless.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::List { .. }
                | Self::Get { .. }
                | Self::Partial { .. }
                | Self::Kube(KubeUtilError::Api(_))
        )
    }
}

/// Read access to the objects of one cluster.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Lists all objects of a kind.
    async fn list(&self, kind: &ExportedKind) -> Result<Vec<DynamicObject>, ExportError>;

    /// Fetches one object by name.
    async fn get(&self, kind: &ExportedKind, name: &str) -> Result<DynamicObject, ExportError>;
}

fn served_version(kind: &ExportedKind) -> Result<&'static str, ExportError> {
    kind.versions
        .iter()
        .copied()
        .find(|version| *version != INTERNAL_API_VERSION)
        .ok_or_else(|| ExportError::NoServedVersion {
            kind: kind.kind.to_owned(),
        })
}

fn api_resource(kind: &ExportedKind) -> Result<ApiResource, ExportError> {
    let version = served_version(kind)?;
    Ok(ApiResource::from_gvk_with_plural(
        &GroupVersionKind {
            group: kind.group.to_owned(),
            version: version.to_owned(),
            kind: kind.kind.to_owned(),
        },
        kind.plural,
    ))
}

/// Fills in apiVersion and kind when the server returned an object with
/// empty type information, picking the first non-internal version.
pub fn ensure_type_info(
    object: &mut DynamicObject,
    kind: &ExportedKind,
) -> Result<(), ExportError> {
    let missing = object
        .types
        .as_ref()
        .map_or(true, |t| t.api_version.is_empty() || t.kind.is_empty());
    if missing {
        let version = served_version(kind)?;
        let api_version = if kind.group.is_empty() {
            version.to_owned()
        } else {
            format!("{}/{version}", kind.group)
        };
        object.types = Some(TypeMeta {
            api_version,
            kind: kind.kind.to_owned(),
        });
    }
    Ok(())
}

/// Strips server-populated bookkeeping so the manifest round-trips into a
/// fresh cluster: resource version, UID, annotations, creation timestamp,
/// managed fields, finalizers, owner references, and generation. An
/// existing `status` is replaced by an explicit empty mapping.
pub fn sanitize_exported(object: &mut DynamicObject) {
    let meta = &mut object.metadata;
    meta.annotations = None;
    meta.creation_timestamp = None;
    meta.finalizers = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.owner_references = None;
    meta.resource_version = None;
    meta.uid = None;

    if let Some(map) = object.data.as_object_mut() {
        if map.contains_key("status") {
            map.insert(
                "status".to_owned(),
                serde_json::Value::Object(serde_json::Map::new()),
            );
        }
    }
}

/// Replaces the characters that are legal in object names but not in
/// file names. Colons become hyphens.
pub fn sanitize_object_name(name: &str) -> String {
    name.replace(':', "-")
}

/// File name for one exported object: `<kind>-<sanitized-name>.yaml`.
pub fn manifest_file_name(kind: &ExportedKind, name: &str) -> String {
    format!(
        "{}-{}.yaml",
        kind.kind.to_lowercase(),
        sanitize_object_name(name)
    )
}

async fn export_object(
    reader: &dyn ClusterReader,
    kind: &ExportedKind,
    name: &str,
    output_dir: &Path,
) -> Result<(), ExportError> {
    let mut object = reader.get(kind, name).await?;
    ensure_type_info(&mut object, kind)?;
    sanitize_exported(&mut object);
    let yaml = serde_yaml::to_string(&object)?;
    let path = output_dir.join(manifest_file_name(kind, name));
    std::fs::write(&path, yaml)?;
    debug!(file = %path.display(), "wrote sanitized manifest");
    Ok(())
}

/// Exports every registered kind through the given reader into
/// `output_dir`, one file per object.
///
/// Objects listed without a name are skipped. A failure on one object
/// does not stop the rest; all failures are accumulated and reported
/// together as [`ExportError::Partial`]. Returns the number of files
/// written when every object succeeded.
pub async fn export_with_reader(
    reader: &dyn ClusterReader,
    output_dir: &Path,
) -> Result<usize, ExportError> {
    std::fs::create_dir_all(output_dir)?;
    let mut written = 0usize;
    let mut failures: Vec<(String, String)> = Vec::new();

    for kind in EXPORTED_KINDS {
        let listed = reader.list(kind).await?;
        info!(
            kind = kind.kind,
            objects = listed.len(),
            "exporting cluster-scoped objects"
        );
        for item in listed {
            let Some(name) = item.metadata.name.clone().filter(|n| !n.is_empty()) else {
                debug!(kind = kind.kind, "skipping listed object without a name");
                continue;
            };
            match export_object(reader, kind, &name, output_dir).await {
                Ok(()) => written += 1,
                Err(err) => {
                    warn!(
                        kind = kind.kind,
                        object = %name,
                        error = %err,
                        "❌ object export failed"
                    );
                    failures.push((name, err.to_string()));
                }
            }
        }
    }

    if failures.is_empty() {
        Ok(written)
    } else {
        let details = failures
            .iter()
            .map(|(name, err)| format!("{name}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ExportError::Partial {
            written,
            failed: failures.len(),
            details,
        })
    }
}

/// Live-cluster [`ClusterReader`] over the dynamic API.
#[derive(Clone)]
pub struct KubeReader {
    client: Client,
}

impl KubeReader {
    /// Wraps an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl std::fmt::Debug for KubeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeReader").finish_non_exhaustive()
    }
}

#[async_trait]
impl ClusterReader for KubeReader {
    async fn list(&self, kind: &ExportedKind) -> Result<Vec<DynamicObject>, ExportError> {
        let resource = api_resource(kind)?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|source| ExportError::List {
                kind: kind.kind.to_owned(),
                source,
            })?;
        Ok(list.items)
    }

    async fn get(&self, kind: &ExportedKind, name: &str) -> Result<DynamicObject, ExportError> {
        let resource = api_resource(kind)?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        api.get(name).await.map_err(|source| ExportError::Get {
            kind: kind.kind.to_owned(),
            name: name.to_owned(),
            source,
        })
    }
}

/// The export step as seen by the workflow orchestrator.
#[async_trait]
pub trait ClusterExport: Send + Sync {
    /// Exports the cluster-scoped state of the cluster behind `kubeconfig`
    /// into `output_dir`. Returns the number of files written.
    async fn export_cluster_scoped(
        &self,
        kubeconfig: &Path,
        output_dir: &Path,
    ) -> Result<usize, ExportError>;
}

/// Production [`ClusterExport`] that builds a client per invocation.
#[derive(Debug)]
pub struct LiveClusterExport;

#[async_trait]
impl ClusterExport for LiveClusterExport {
    async fn export_cluster_scoped(
        &self,
        kubeconfig: &Path,
        output_dir: &Path,
    ) -> Result<usize, ExportError> {
        let client = kube_util::create_client(kubeconfig).await?;
        let reader = KubeReader::new(client);
        let written = export_with_reader(&reader, output_dir).await?;
        info!(
            objects = written,
            dir = %output_dir.display(),
            "✅ cluster state exported"
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_KIND: &ExportedKind = &EXPORTED_KINDS[0];

    #[test]
    fn test_sanitize_object_name_maps_colons() {
        assert_eq!(sanitize_object_name("worker:1"), "worker-1");
        assert_eq!(sanitize_object_name("plain"), "plain");
    }

    #[test]
    fn test_manifest_file_name() {
        assert_eq!(manifest_file_name(NODE_KIND, "worker:1"), "node-worker-1.yaml");
        assert_eq!(manifest_file_name(NODE_KIND, "cp-0"), "node-cp-0.yaml");
    }

    #[test]
    fn test_served_version_skips_internal() {
        assert_eq!(served_version(NODE_KIND).unwrap(), "v1");
    }

    #[test]
    fn test_served_version_fails_without_candidates() {
        let internal_only = ExportedKind {
            group: "",
            kind: "Phantom",
            plural: "phantoms",
            versions: &[INTERNAL_API_VERSION],
        };
        assert!(served_version(&internal_only).is_err());
    }

    #[test]
    fn test_ensure_type_info_fills_missing_types() {
        let mut object = DynamicObject {
            types: None,
            metadata: kube::core::ObjectMeta::default(),
            data: serde_json::json!({}),
        };
        ensure_type_info(&mut object, NODE_KIND).unwrap();
        let types = object.types.unwrap();
        assert_eq!(types.api_version, "v1");
        assert_eq!(types.kind, "Node");
    }

    #[test]
    fn test_ensure_type_info_keeps_existing_types() {
        let mut object = DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".to_owned(),
                kind: "Node".to_owned(),
            }),
            metadata: kube::core::ObjectMeta::default(),
            data: serde_json::json!({}),
        };
        ensure_type_info(&mut object, NODE_KIND).unwrap();
        assert_eq!(object.types.unwrap().api_version, "v1");
    }
}
