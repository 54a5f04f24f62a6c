//! # Cluster State Export Tests
//!
//! Exercises the sanitizing exporter against an in-memory cluster reader.
//!
//! These tests verify:
//! - Server bookkeeping fields are stripped from exported manifests
//! - An existing status is replaced by an explicit empty mapping
//! - Object names with colons map to safe file names
//! - Export output is deterministic across runs
//! - Per-object failures accumulate into a partial-export error

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, OwnerReference, Time};
use kube::core::{DynamicObject, ErrorResponse, ObjectMeta, TypeMeta};

use kube_provisioner::export::{export_with_reader, ClusterReader, ExportError, ExportedKind};

struct FakeReader {
    objects: Vec<DynamicObject>,
    fail_get_for: Vec<String>,
}

#[async_trait]
impl ClusterReader for FakeReader {
    async fn list(&self, _kind: &ExportedKind) -> Result<Vec<DynamicObject>, ExportError> {
        Ok(self.objects.clone())
    }

    async fn get(&self, kind: &ExportedKind, name: &str) -> Result<DynamicObject, ExportError> {
        let api_error = |code: u16, reason: &str| kube::Error::Api(ErrorResponse {
            status: "Failure".to_owned(),
            message: "injected".to_owned(),
            reason: reason.to_owned(),
            code,
        });
        if self.fail_get_for.iter().any(|n| n == name) {
            return Err(ExportError::Get {
                kind: kind.kind.to_owned(),
                name: name.to_owned(),
                source: api_error(500, "InternalError"),
            });
        }
        self.objects
            .iter()
            .find(|object| object.metadata.name.as_deref() == Some(name))
            .cloned()
            .ok_or_else(|| ExportError::Get {
                kind: kind.kind.to_owned(),
                name: name.to_owned(),
                source: api_error(404, "NotFound"),
            })
    }
}

/// A node the way the API server hands it back: full of bookkeeping the
/// export must not carry into a fresh cluster.
fn live_node(name: &str) -> DynamicObject {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        "node.alpha.kubernetes.io/ttl".to_owned(),
        "0".to_owned(),
    );
    DynamicObject {
        types: Some(TypeMeta {
            api_version: "v1".to_owned(),
            kind: "Node".to_owned(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            uid: Some("8f9c2f6e-0b0e-4df1-9c25-1f2a3b4c5d6e".to_owned()),
            resource_version: Some("4242".to_owned()),
            generation: Some(3),
            creation_timestamp: Some(Time("2024-05-01T12:00:00Z".parse().unwrap())),
            annotations: Some(annotations),
            finalizers: Some(vec!["example.com/guard".to_owned()]),
            managed_fields: Some(vec![ManagedFieldsEntry {
                manager: Some("kubelet".to_owned()),
                ..Default::default()
            }]),
            owner_references: Some(vec![OwnerReference {
                api_version: "cluster.x-k8s.io/v1beta1".to_owned(),
                kind: "Machine".to_owned(),
                name: format!("{name}-machine"),
                uid: "0d7f2a4b-6c8e-4f10-b223-9e8d7c6b5a40".to_owned(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        },
        data: serde_json::json!({
            "spec": {
                "podCIDR": "10.244.0.0/24",
                "providerID": "kind://docker/dev/dev-control-plane",
            },
            "status": {
                "addresses": [{ "address": "172.18.0.2", "type": "InternalIP" }],
                "nodeInfo": { "kubeletVersion": "v1.30.0" },
            },
        }),
    }
}

fn nameless_node() -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta {
            api_version: "v1".to_owned(),
            kind: "Node".to_owned(),
        }),
        metadata: ObjectMeta::default(),
        data: serde_json::json!({ "spec": {} }),
    }
}

#[tokio::test]
async fn test_export_strips_server_bookkeeping() {
    let reader = FakeReader {
        objects: vec![live_node("dev-control-plane")],
        fail_get_for: Vec::new(),
    };
    let dir = tempfile::tempdir().unwrap();

    let written = export_with_reader(&reader, dir.path()).await.unwrap();
    assert_eq!(written, 1);

    let yaml = std::fs::read_to_string(dir.path().join("node-dev-control-plane.yaml")).unwrap();
    assert!(yaml.contains("apiVersion: v1"));
    assert!(yaml.contains("kind: Node"));
    assert!(yaml.contains("name: dev-control-plane"));
    assert!(yaml.contains("podCIDR"));
    for stripped in [
        "uid:",
        "resourceVersion:",
        "generation:",
        "annotations:",
        "finalizers:",
        "managedFields:",
        "ownerReferences:",
        "creationTimestamp:",
    ] {
        assert!(!yaml.contains(stripped), "exported manifest still carries {stripped}");
    }
}

#[tokio::test]
async fn test_export_replaces_status_with_empty_mapping() {
    let mut without_status = live_node("worker-0");
    without_status
        .data
        .as_object_mut()
        .unwrap()
        .remove("status");
    let reader = FakeReader {
        objects: vec![live_node("cp-0"), without_status],
        fail_get_for: Vec::new(),
    };
    let dir = tempfile::tempdir().unwrap();

    export_with_reader(&reader, dir.path()).await.unwrap();

    let with_status: serde_yaml::Value = serde_yaml::from_str(
        &std::fs::read_to_string(dir.path().join("node-cp-0.yaml")).unwrap(),
    )
    .unwrap();
    let status = with_status.get("status").unwrap();
    assert_eq!(status, &serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));

    let stays_absent: serde_yaml::Value = serde_yaml::from_str(
        &std::fs::read_to_string(dir.path().join("node-worker-0.yaml")).unwrap(),
    )
    .unwrap();
    assert!(stays_absent.get("status").is_none());
}

#[tokio::test]
async fn test_export_maps_colon_names_to_file_names() {
    let reader = FakeReader {
        objects: vec![live_node("worker:1")],
        fail_get_for: Vec::new(),
    };
    let dir = tempfile::tempdir().unwrap();

    let written = export_with_reader(&reader, dir.path()).await.unwrap();
    assert_eq!(written, 1);
    assert!(dir.path().join("node-worker-1.yaml").is_file());
}

#[tokio::test]
async fn test_export_is_deterministic() {
    let reader = FakeReader {
        objects: vec![live_node("cp-0"), live_node("worker-0")],
        fail_get_for: Vec::new(),
    };
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();

    export_with_reader(&reader, first.path()).await.unwrap();
    export_with_reader(&reader, second.path()).await.unwrap();

    for file in ["node-cp-0.yaml", "node-worker-0.yaml"] {
        let a = std::fs::read(first.path().join(file)).unwrap();
        let b = std::fs::read(second.path().join(file)).unwrap();
        assert_eq!(a, b, "{file} differs between runs");
    }
}

#[tokio::test]
async fn test_export_skips_nameless_objects() {
    let reader = FakeReader {
        objects: vec![live_node("cp-0"), nameless_node()],
        fail_get_for: Vec::new(),
    };
    let dir = tempfile::tempdir().unwrap();

    let written = export_with_reader(&reader, dir.path()).await.unwrap();
    assert_eq!(written, 1);
    let files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(files, 1);
}

#[tokio::test]
async fn test_export_accumulates_per_object_failures() {
    let reader = FakeReader {
        objects: vec![live_node("cp-0"), live_node("worker-0"), live_node("worker-1")],
        fail_get_for: vec!["worker-0".to_owned()],
    };
    let dir = tempfile::tempdir().unwrap();

    let error = export_with_reader(&reader, dir.path()).await.unwrap_err();
    match error {
        ExportError::Partial {
            written,
            failed,
            details,
        } => {
            assert_eq!(written, 2);
            assert_eq!(failed, 1);
            assert!(details.contains("worker-0"));
        }
        other => panic!("expected partial export, got {other}"),
    }
    assert!(dir.path().join("node-cp-0.yaml").is_file());
    assert!(dir.path().join("node-worker-1.yaml").is_file());
    assert!(!dir.path().join("node-worker-0.yaml").exists());
}

#[tokio::test]
async fn test_export_of_empty_cluster_writes_nothing() {
    let reader = FakeReader {
        objects: Vec::new(),
        fail_get_for: Vec::new(),
    };
    let dir = tempfile::tempdir().unwrap();

    let written = export_with_reader(&reader, dir.path()).await.unwrap();
    assert_eq!(written, 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
