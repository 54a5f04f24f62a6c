//! # Controller Bootstrap
//!
//! Installs the chosen GitOps controller on the target cluster from the
//! committed skeleton, waits for it to come up, and applies the pointer
//! objects that make it reconcile the repository from then on.

use std::path::{Path, PathBuf};

use kube::Client;
use tracing::info;

use super::{GitOpsController, RepoError};
use crate::constants;
use crate::kube_util::{self, PollSettings, ShutdownRx};

fn sorted_yaml_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "yaml")
                && path
                    .file_name()
                    .is_some_and(|name| name != "kustomization.yaml")
        })
        .collect();
    files.sort();
    Ok(files)
}

fn render_repo_secret(controller: GitOpsController, clone_url: &str, token: &str) -> String {
    match controller {
        GitOpsController::ArgoCd => format!(
            "\
apiVersion: v1
kind: Secret
metadata:
  name: repo-credentials
  namespace: argocd
  labels:
    argocd.argoproj.io/secret-type: repository
stringData:
  type: git
  url: {clone_url}
  username: git
  password: {token}
"
        ),
        GitOpsController::FluxCd => format!(
            "\
apiVersion: v1
kind: Secret
metadata:
  name: repo-credentials
  namespace: flux-system
stringData:
  username: git
  password: {token}
"
        ),
    }
}

/// Installs and wires up the GitOps controller on the target cluster.
///
/// `repo_token` is only supplied for private repositories; it becomes the
/// in-cluster credential the controller pulls with.
pub async fn bootstrap_controller(
    client: &Client,
    cancel: &ShutdownRx,
    controller: GitOpsController,
    repo_dir: &Path,
    clone_url: &str,
    repo_token: Option<&str>,
) -> Result<(), RepoError> {
    let namespace = controller.namespace();
    info!(controller = %controller, namespace, "🔄 bootstrapping GitOps controller");
    kube_util::ensure_namespace(client, namespace).await?;

    let base_dir = repo_dir.join("bootstrap/base");
    for path in sorted_yaml_files(&base_dir)? {
        let manifest = std::fs::read_to_string(&path)?;
        kube_util::apply_manifest(client, &manifest, Some(namespace)).await?;
    }

    let deployment_wait = PollSettings::bounded(constants::DEPLOYMENT_AVAILABLE_TIMEOUT_SECS);
    for deployment in controller.deployments() {
        kube_util::wait_for_deployment_available(
            client,
            namespace,
            deployment,
            deployment_wait,
            cancel,
        )
        .await?;
    }
    kube_util::wait_for_crd_established(
        client,
        controller.pointer_crd(),
        PollSettings::bounded(constants::CRD_ESTABLISHED_TIMEOUT_SECS),
        cancel,
    )
    .await?;

    if let Some(token) = repo_token {
        let secret = render_repo_secret(controller, clone_url, token);
        kube_util::apply_manifest(client, &secret, Some(namespace)).await?;
        info!("✅ repository credentials secret applied");
    }

    let components_dir = repo_dir.join("components");
    for path in sorted_yaml_files(&components_dir)? {
        let manifest = std::fs::read_to_string(&path)?;
        kube_util::apply_manifest(client, &manifest, Some(namespace)).await?;
    }

    info!(controller = %controller, "✅ GitOps controller bootstrapped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_repo_secret_argocd_labels_repository() {
        let secret = render_repo_secret(
            GitOpsController::ArgoCd,
            "https://github.com/acme/demo.git",
            "tok",
        );
        assert!(secret.contains("argocd.argoproj.io/secret-type: repository"));
        assert!(secret.contains("url: https://github.com/acme/demo.git"));
        assert!(secret.contains("password: tok"));
    }

    #[test]
    fn test_render_repo_secret_fluxcd_basic_auth() {
        let secret = render_repo_secret(
            GitOpsController::FluxCd,
            "https://github.com/acme/demo.git",
            "tok",
        );
        assert!(secret.contains("namespace: flux-system"));
        assert!(secret.contains("username: git"));
        assert!(secret.contains("password: tok"));
    }

    #[test]
    fn test_sorted_yaml_files_skips_kustomization() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.yaml"), "b").unwrap();
        std::fs::write(dir.path().join("a.yaml"), "a").unwrap();
        std::fs::write(dir.path().join("kustomization.yaml"), "k").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "n").unwrap();
        let files = sorted_yaml_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["a.yaml", "b.yaml"]);
    }
}
