//! # Constants
//!
//! Fixed names, defaults, and timing values shared across the provisioning
//! workflow, the exporter, and the CLI.

/// Name of the ephemeral kind cluster that temporarily hosts the CAPI
/// controllers until the pivot hands management over to the target cluster.
pub const EPHEMERAL_CLUSTER_NAME: &str = "mkp-bootstrapper";

/// File name (relative to the working directory) of the ephemeral cluster
/// kubeconfig.
pub const EPHEMERAL_KUBECONFIG_FILE: &str = "kind.kubeconfig";

/// Prefix for the per-run temporary working directory.
pub const WORKDIR_PREFIX: &str = "mkp";

/// Directory under `$HOME` that receives relocated run artifacts.
pub const ARTIFACT_ROOT_DIR: &str = ".mkpctl";

/// Path of the sanitized cluster state inside the generated repository.
pub const EXPORT_DIR_RELATIVE: &str = "core/cluster";

/// Message used for the initial commit of the generated repository.
pub const COMMIT_MESSAGE: &str = "exporting existing YAML";

/// Working-directory entries that are build intermediates rather than
/// deliverables. They are removed from the relocated artifact directory
/// after the run completes.
pub const ARTIFACT_DENYLIST: [&str; 9] = [
    "argocd-install-output",
    "capi-install-yamls-output",
    "cni-output",
    "fluxcd-install-output",
    "argocd-install.yaml",
    "flux-install.yaml",
    "cni.yaml",
    "install-cluster.yaml",
    "kind.kubeconfig",
];

/// Default GitOps controller variant selector.
pub const DEFAULT_GITOPS_CONTROLLER: &str = "argocd";

/// Kubernetes version requested from clusterctl when generating the target
/// cluster declaration. Kept in lockstep with the `k8s-openapi` feature.
pub const KUBERNETES_VERSION: &str = "v1.30.3";

/// Control plane and worker counts for highly available topologies.
pub const HA_CONTROL_PLANE_COUNT: u32 = 3;
/// Worker count paired with [`HA_CONTROL_PLANE_COUNT`].
pub const HA_WORKER_COUNT: u32 = 3;
/// Control plane count for single-node development topologies.
pub const SINGLE_CONTROL_PLANE_COUNT: u32 = 1;
/// Worker count paired with [`SINGLE_CONTROL_PLANE_COUNT`].
pub const SINGLE_WORKER_COUNT: u32 = 1;

/// Default Azure region for target clusters.
pub const DEFAULT_AZURE_REGION: &str = "westus2";
/// Default Azure VM size for control plane and worker machines.
pub const DEFAULT_AZURE_MACHINE_TYPE: &str = "Standard_D2s_v3";
/// Default Azure resource group that holds the target cluster.
pub const DEFAULT_AZURE_RESOURCE_GROUP: &str = "mkp-cluster";
/// Default Azure SSH key name injected into cluster machines.
pub const DEFAULT_AZURE_SSH_KEY: &str = "default";

/// Pinned Calico manifest applied as the default CNI on target clusters.
pub const CALICO_MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/projectcalico/calico/v3.28.1/manifests/calico.yaml";

/// Pinned ArgoCD install manifest.
pub const ARGOCD_INSTALL_URL: &str =
    "https://raw.githubusercontent.com/argoproj/argo-cd/v2.11.7/manifests/install.yaml";

/// Pinned FluxCD install manifest.
pub const FLUX_INSTALL_URL: &str =
    "https://github.com/fluxcd/flux2/releases/download/v2.3.0/install.yaml";

/// Upper bound for a single external command invocation (clusterctl, kind).
pub const COMMAND_TIMEOUT_SECS: u64 = 1800;

/// Deadline for all nodes of a cluster to report Ready.
pub const NODE_READY_TIMEOUT_SECS: u64 = 600;

/// Deadline for the target cluster kubeconfig secret to appear on the
/// ephemeral control plane.
pub const TARGET_KUBECONFIG_TIMEOUT_SECS: u64 = 1800;

/// Deadline for all CAPI machines of the target cluster to reach Running.
pub const MACHINES_RUNNING_TIMEOUT_SECS: u64 = 1800;

/// Deadline for a controller deployment to become Available.
pub const DEPLOYMENT_AVAILABLE_TIMEOUT_SECS: u64 = 600;

/// Deadline for a CRD to be established after an install.
pub const CRD_ESTABLISHED_TIMEOUT_SECS: u64 = 300;

/// Deadline for the post-pivot verification on the target cluster.
pub const PIVOT_VERIFY_TIMEOUT_SECS: u64 = 600;

/// First polling interval of a bounded wait.
pub const POLL_INITIAL_INTERVAL_SECS: u64 = 2;

/// Ceiling for the exponentially growing polling interval.
pub const POLL_MAX_INTERVAL_SECS: u64 = 30;

/// Attempts per workflow stage before a recoverable failure becomes fatal.
pub const STAGE_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Base delay between stage retries. Doubles per attempt.
pub const STAGE_RETRY_BASE_DELAY_SECS: u64 = 5;
