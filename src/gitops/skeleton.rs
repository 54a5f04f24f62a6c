//! # Repository Skeleton
//!
//! Lays out the directory tree the GitOps controller reconciles from:
//!
//! ```text
//! bootstrap/base/              controller install, one file per document
//! bootstrap/overlays/default/  namespace plus kustomization over base
//! components/                  pointer objects binding controller to repo
//! core/cluster/                sanitized cluster state (filled by export)
//! tenants/                     empty, reserved for workload configuration
//! ```

use std::path::Path;

use tracing::info;

use super::{GitOpsController, RepoError};
use crate::fetch::fetch_manifest;
use crate::kube_util::{self, ManifestDoc};

const OVERLAY_KUSTOMIZATION: &str = "\
apiVersion: kustomize.config.k8s.io/v1beta1
kind: Kustomization
resources:
  - namespace.yaml
  - ../../base
";

fn render_namespace(namespace: &str) -> String {
    format!(
        "\
apiVersion: v1
kind: Namespace
metadata:
  name: {namespace}
"
    )
}

fn render_base_kustomization(docs: &[ManifestDoc]) -> String {
    let mut files: Vec<String> = docs.iter().map(kube_util::split_doc_file_name).collect();
    files.sort();
    files.dedup();
    let mut out = String::from(
        "\
apiVersion: kustomize.config.k8s.io/v1beta1
kind: Kustomization
resources:
",
    );
    for file in &files {
        out.push_str("  - ");
        out.push_str(file);
        out.push('\n');
    }
    out
}

fn render_argocd_application(cluster_name: &str, repo_url: &str) -> String {
    format!(
        "\
apiVersion: argoproj.io/v1alpha1
kind: Application
metadata:
  name: {cluster_name}-cluster
  namespace: argocd
spec:
  project: default
  source:
    repoURL: {repo_url}
    targetRevision: main
    path: core
    directory:
      recurse: true
  destination:
    server: https://kubernetes.default.svc
  syncPolicy:
    automated:
      prune: true
      selfHeal: true
    syncOptions:
      - CreateNamespace=true
"
    )
}

fn render_flux_sync(cluster_name: &str, repo_url: &str, private: bool) -> String {
    let mut git_repository = format!(
        "\
apiVersion: source.toolkit.fluxcd.io/v1
kind: GitRepository
metadata:
  name: {cluster_name}
  namespace: flux-system
spec:
  interval: 1m
  url: {repo_url}
  ref:
    branch: main
"
    );
    if private {
        git_repository.push_str("  secretRef:\n    name: repo-credentials\n");
    }
    format!(
        "\
{git_repository}---
apiVersion: kustomize.toolkit.fluxcd.io/v1
kind: Kustomization
metadata:
  name: {cluster_name}-core
  namespace: flux-system
spec:
  interval: 5m
  path: ./core
  prune: true
  sourceRef:
    kind: GitRepository
    name: {cluster_name}
"
    )
}

/// Builds the repository skeleton and records the transient controller
/// install artifacts in the working directory.
pub async fn build(
    repo_dir: &Path,
    controller: GitOpsController,
    cluster_name: &str,
    clone_url: &str,
    workdir: &Path,
    private: bool,
) -> Result<(), RepoError> {
    info!(
        repo = %repo_dir.display(),
        controller = %controller,
        "🔄 building repository skeleton"
    );
    let base_dir = repo_dir.join("bootstrap/base");
    let overlay_dir = repo_dir.join("bootstrap/overlays/default");
    let components_dir = repo_dir.join("components");
    let core_cluster_dir = repo_dir.join("core/cluster");
    let tenants_dir = repo_dir.join("tenants");
    for dir in [
        &base_dir,
        &overlay_dir,
        &components_dir,
        &core_cluster_dir,
        &tenants_dir,
    ] {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(core_cluster_dir.join(".gitkeep"), "")?;
    std::fs::write(tenants_dir.join(".gitkeep"), "")?;

    let url = controller.install_url();
    let install = fetch_manifest(url)
        .await
        .map_err(|source| RepoError::Fetch {
            url: url.to_owned(),
            source,
        })?;
    std::fs::write(workdir.join(controller.install_file()), &install)?;
    let docs = kube_util::split_manifest(&install)?;
    kube_util::write_split_docs(&workdir.join(controller.install_output_dir()), &docs)?;
    kube_util::write_split_docs(&base_dir, &docs)?;
    std::fs::write(
        base_dir.join("kustomization.yaml"),
        render_base_kustomization(&docs),
    )?;

    std::fs::write(
        overlay_dir.join("namespace.yaml"),
        render_namespace(controller.namespace()),
    )?;
    std::fs::write(overlay_dir.join("kustomization.yaml"), OVERLAY_KUSTOMIZATION)?;

    match controller {
        GitOpsController::ArgoCd => std::fs::write(
            components_dir.join("app-of-apps.yaml"),
            render_argocd_application(cluster_name, clone_url),
        )?,
        GitOpsController::FluxCd => std::fs::write(
            components_dir.join("flux-sync.yaml"),
            render_flux_sync(cluster_name, clone_url, private),
        )?,
    }

    info!(documents = docs.len(), "✅ repository skeleton populated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_base_kustomization_sorts_and_dedups() {
        let docs = vec![
            ManifestDoc {
                kind: "Deployment".into(),
                name: "b-server".into(),
                yaml: String::new(),
            },
            ManifestDoc {
                kind: "ConfigMap".into(),
                name: "a-config".into(),
                yaml: String::new(),
            },
            ManifestDoc {
                kind: "ConfigMap".into(),
                name: "a-config".into(),
                yaml: String::new(),
            },
        ];
        let rendered = render_base_kustomization(&docs);
        let configmap = rendered.find("configmap-a-config.yaml").unwrap();
        let deployment = rendered.find("deployment-b-server.yaml").unwrap();
        assert!(configmap < deployment);
        assert_eq!(rendered.matches("configmap-a-config.yaml").count(), 1);
    }

    #[test]
    fn test_render_argocd_application_points_at_core() {
        let rendered =
            render_argocd_application("demo", "https://github.com/acme/demo.git");
        assert!(rendered.contains("name: demo-cluster"));
        assert!(rendered.contains("repoURL: https://github.com/acme/demo.git"));
        assert!(rendered.contains("path: core"));
    }

    #[test]
    fn test_render_flux_sync_secret_ref_only_when_private() {
        let public = render_flux_sync("demo", "https://github.com/acme/demo.git", false);
        assert!(!public.contains("secretRef"));
        let private = render_flux_sync("demo", "https://github.com/acme/demo.git", true);
        assert!(private.contains("secretRef"));
        assert!(private.contains("name: repo-credentials"));
    }

    #[test]
    fn test_render_flux_sync_contains_both_documents() {
        let rendered = render_flux_sync("demo", "https://github.com/acme/demo.git", false);
        assert!(rendered.contains("kind: GitRepository"));
        assert!(rendered.contains("kind: Kustomization"));
        assert!(rendered.contains("path: ./core"));
    }
}
