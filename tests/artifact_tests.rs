//! # Artifact Relocation Tests
//!
//! Exercises the filesystem artifact store against real directories.
//!
//! These tests verify:
//! - Relocation moves the working tree intact, creating parents as needed
//! - An already existing destination is refused without touching the source
//! - Pruning removes exactly the denylisted entries and tolerates absences

use std::path::Path;

use kube_provisioner::artifacts::{ArtifactError, ArtifactStore, FsArtifactStore};
use kube_provisioner::constants;

fn populate_workdir(workdir: &Path) {
    std::fs::create_dir_all(workdir.join("demo/core/cluster")).unwrap();
    std::fs::write(
        workdir.join("demo/core/cluster/node-cp-0.yaml"),
        "kind: Node\n",
    )
    .unwrap();
    std::fs::write(workdir.join("demo.kubeconfig"), "kind: Config\n").unwrap();
    std::fs::write(
        workdir.join(constants::EPHEMERAL_KUBECONFIG_FILE),
        "kind: Config\n",
    )
    .unwrap();
}

#[test]
fn test_relocate_moves_working_tree() {
    let workdir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    populate_workdir(workdir.path());
    let destination = root.path().join("demo");

    FsArtifactStore
        .relocate(workdir.path(), &destination)
        .unwrap();

    assert!(destination.join("demo/core/cluster/node-cp-0.yaml").is_file());
    assert!(destination.join("demo.kubeconfig").is_file());
    assert!(!workdir.path().exists());
}

#[test]
fn test_relocate_creates_missing_parents() {
    let workdir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    populate_workdir(workdir.path());
    let destination = root.path().join("deep/nested/demo");

    FsArtifactStore
        .relocate(workdir.path(), &destination)
        .unwrap();

    assert!(destination.join("demo.kubeconfig").is_file());
}

#[test]
fn test_relocate_refuses_existing_destination() {
    let workdir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    populate_workdir(workdir.path());
    let destination = root.path().join("demo");
    std::fs::create_dir_all(&destination).unwrap();
    std::fs::write(destination.join("precious.txt"), "keep me\n").unwrap();

    let error = FsArtifactStore
        .relocate(workdir.path(), &destination)
        .unwrap_err();

    assert!(matches!(error, ArtifactError::DestinationExists { .. }));
    // Neither side was touched.
    assert!(destination.join("precious.txt").is_file());
    assert!(workdir.path().join("demo.kubeconfig").is_file());
}

#[test]
fn test_prune_removes_exactly_denylisted_entries() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("argocd-install.yaml"), "kind: List\n").unwrap();
    std::fs::write(
        dir.path().join(constants::EPHEMERAL_KUBECONFIG_FILE),
        "kind: Config\n",
    )
    .unwrap();
    std::fs::create_dir_all(dir.path().join("argocd-install-output")).unwrap();
    std::fs::write(
        dir.path().join("argocd-install-output/0-deployment.yaml"),
        "kind: Deployment\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("demo.kubeconfig"), "kind: Config\n").unwrap();
    std::fs::create_dir_all(dir.path().join("demo/core/cluster")).unwrap();

    FsArtifactStore
        .prune(dir.path(), &constants::ARTIFACT_DENYLIST)
        .unwrap();

    assert!(!dir.path().join("argocd-install.yaml").exists());
    assert!(!dir.path().join("argocd-install-output").exists());
    assert!(!dir.path().join(constants::EPHEMERAL_KUBECONFIG_FILE).exists());
    // Deliverables survive.
    assert!(dir.path().join("demo.kubeconfig").is_file());
    assert!(dir.path().join("demo/core/cluster").is_dir());
}

#[test]
fn test_prune_tolerates_missing_entries() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("demo.kubeconfig"), "kind: Config\n").unwrap();

    FsArtifactStore
        .prune(dir.path(), &constants::ARTIFACT_DENYLIST)
        .unwrap();

    assert!(dir.path().join("demo.kubeconfig").is_file());
}
