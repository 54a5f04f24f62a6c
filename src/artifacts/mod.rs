//! # Run Artifacts
//!
//! Moves the working directory to its permanent home after a successful
//! run and strips the build intermediates that are not deliverables.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Errors from artifact relocation and pruning.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// The destination directory already exists. Never overwritten; a
    /// previous run's artifacts must be moved aside first.
    #[error("artifact destination {path} already exists, refusing to overwrite")]
    DestinationExists {
        /// The occupied destination.
        path: PathBuf,
    },

    /// A filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory traversal failed.
    #[error("directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

impl ArtifactError {
    /// Artifact failures always abort the workflow.
    pub fn is_recoverable(&self) -> bool {
        false
    }
}

/// Artifact handling as seen by the workflow orchestrator.
pub trait ArtifactStore: Send + Sync {
    /// Moves the working directory to `destination`. Fails when the
    /// destination already exists.
    fn relocate(&self, workdir: &Path, destination: &Path) -> Result<(), ArtifactError>;

    /// Removes every denylisted entry from `destination`. Entries that do
    /// not exist are skipped.
    fn prune(&self, destination: &Path, denylist: &[&str]) -> Result<(), ArtifactError>;
}

/// Filesystem-backed [`ArtifactStore`].
#[derive(Debug)]
pub struct FsArtifactStore;

impl ArtifactStore for FsArtifactStore {
    fn relocate(&self, workdir: &Path, destination: &Path) -> Result<(), ArtifactError> {
        if destination.exists() {
            return Err(ArtifactError::DestinationExists {
                path: destination.to_path_buf(),
            });
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::rename(workdir, destination) {
            Ok(()) => {}
            Err(err) => {
                // Rename fails across filesystems; tmpfs to home is common.
                debug!(error = %err, "rename failed, copying instead");
                relocate_via_copy(workdir, destination)?;
            }
        }
        info!(
            from = %workdir.display(),
            to = %destination.display(),
            "✅ artifacts relocated"
        );
        Ok(())
    }

    fn prune(&self, destination: &Path, denylist: &[&str]) -> Result<(), ArtifactError> {
        let mut removed = 0usize;
        for entry in denylist {
            let path = destination.join(entry);
            match std::fs::symlink_metadata(&path) {
                Ok(metadata) if metadata.is_dir() => {
                    std::fs::remove_dir_all(&path)?;
                    debug!(path = %path.display(), "pruned directory");
                    removed += 1;
                }
                Ok(_) => {
                    std::fs::remove_file(&path)?;
                    debug!(path = %path.display(), "pruned file");
                    removed += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        info!(
            dir = %destination.display(),
            removed,
            "✅ build intermediates pruned"
        );
        Ok(())
    }
}

/// Cross-filesystem fallback for [`ArtifactStore::relocate`]: copy the
/// tree, then remove the source.
fn relocate_via_copy(workdir: &Path, destination: &Path) -> Result<(), ArtifactError> {
    copy_tree(workdir, destination)?;
    std::fs::remove_dir_all(workdir)?;
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), ArtifactError> {
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            warn!(path = %entry.path().display(), "skipping symlink during relocation");
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_tree_preserves_layout() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let dst_root = dst.path().join("copied");
        std::fs::create_dir_all(src.path().join("core/cluster")).unwrap();
        std::fs::write(src.path().join("core/cluster/node-a.yaml"), "kind: Node\n").unwrap();
        std::fs::write(src.path().join("kind.kubeconfig"), "apiVersion: v1\n").unwrap();

        copy_tree(src.path(), &dst_root).unwrap();

        assert!(dst_root.join("core/cluster/node-a.yaml").is_file());
        assert_eq!(
            std::fs::read_to_string(dst_root.join("kind.kubeconfig")).unwrap(),
            "apiVersion: v1\n"
        );
    }

    #[test]
    fn test_relocate_via_copy_moves_tree_and_removes_source() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("work");
        let dst = root.path().join("final");
        std::fs::create_dir_all(src.join("core/cluster")).unwrap();
        std::fs::write(src.join("core/cluster/node-a.yaml"), "kind: Node\n").unwrap();
        std::fs::write(src.join("dev.kubeconfig"), "apiVersion: v1\n").unwrap();

        relocate_via_copy(&src, &dst).unwrap();

        assert!(dst.join("core/cluster/node-a.yaml").is_file());
        assert_eq!(
            std::fs::read_to_string(dst.join("dev.kubeconfig")).unwrap(),
            "apiVersion: v1\n"
        );
        assert!(!src.exists());
    }
}
