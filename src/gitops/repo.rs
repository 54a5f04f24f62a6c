//! # GitHub Repository Backend
//!
//! Remote creation through the GitHub REST API and the initial
//! commit-and-push of the generated skeleton over HTTPS with token
//! authentication.

use std::path::Path;

use async_trait::async_trait;
use git2::{Cred, IndexAddOption, PushOptions, RemoteCallbacks, Repository, RepositoryInitOptions};
use octocrab::Octocrab;
use tracing::info;

use super::{bootstrap, skeleton, GitOpsController, RepoError, RepoManager};
use crate::config::credentials::SecretString;
use crate::constants;
use crate::kube_util::{self, ShutdownRx};

/// GitHub-backed implementation of [`RepoManager`].
pub struct GithubRepoManager {
    token: SecretString,
    cancel: ShutdownRx,
}

impl GithubRepoManager {
    /// Builds a manager that authenticates with the given token.
    pub fn new(token: SecretString, cancel: ShutdownRx) -> Self {
        Self { token, cancel }
    }

    fn push_to_remote(&self, repo: &Repository, clone_url: &str) -> Result<(), RepoError> {
        let mut remote = repo.remote("origin", clone_url)?;
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(|_url, username_from_url, _allowed| {
            Cred::userpass_plaintext(username_from_url.unwrap_or("git"), self.token.expose())
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        remote.push(&["refs/heads/main:refs/heads/main"], Some(&mut options))?;
        Ok(())
    }
}

impl std::fmt::Debug for GithubRepoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubRepoManager").finish_non_exhaustive()
    }
}

#[async_trait]
impl RepoManager for GithubRepoManager {
    async fn create_remote(&self, name: &str, private: bool) -> Result<String, RepoError> {
        info!(repository = name, private, "🔄 creating remote repository");
        let octocrab = Octocrab::builder()
            .personal_token(self.token.expose().to_owned())
            .build()?;
        let body = serde_json::json!({
            "name": name,
            "private": private,
            "auto_init": false,
            "description": "Cluster configuration managed by mkpctl",
        });
        let response: serde_json::Value = match octocrab.post("/user/repos", Some(&body)).await {
            Ok(value) => value,
            Err(octocrab::Error::GitHub { source, .. }) if source.status_code.as_u16() == 422 => {
                return Err(RepoError::AlreadyExists {
                    name: name.to_owned(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        let clone_url = response
            .get("clone_url")
            .and_then(|value| value.as_str())
            .ok_or(RepoError::MalformedResponse {
                field: "clone_url",
            })?
            .to_owned();
        info!(repository = name, url = %clone_url, "✅ remote repository created");
        Ok(clone_url)
    }

    async fn build_skeleton(
        &self,
        repo_dir: &Path,
        controller: GitOpsController,
        cluster_name: &str,
        clone_url: &str,
        workdir: &Path,
        private: bool,
    ) -> Result<(), RepoError> {
        skeleton::build(repo_dir, controller, cluster_name, clone_url, workdir, private).await
    }

    async fn init_and_push(&self, repo_dir: &Path, clone_url: &str) -> Result<(), RepoError> {
        info!(repo = %repo_dir.display(), "🔄 committing and pushing repository");
        let repo = Repository::init_opts(
            repo_dir,
            RepositoryInitOptions::new().initial_head("main"),
        )?;
        let mut index = repo.index()?;
        index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let signature = repo
            .signature()
            .or_else(|_| git2::Signature::now("mkpctl", "mkpctl@microscaler.io"))?;
        repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            constants::COMMIT_MESSAGE,
            &tree,
            &[],
        )?;
        self.push_to_remote(&repo, clone_url)?;
        info!(url = clone_url, "✅ repository pushed");
        Ok(())
    }

    async fn bootstrap_controller(
        &self,
        target_kubeconfig: &Path,
        controller: GitOpsController,
        repo_dir: &Path,
        clone_url: &str,
        private: bool,
    ) -> Result<(), RepoError> {
        let client = kube_util::create_client(target_kubeconfig).await?;
        let token = private.then(|| self.token.expose());
        bootstrap::bootstrap_controller(
            &client,
            &self.cancel,
            controller,
            repo_dir,
            clone_url,
            token,
        )
        .await
    }
}
