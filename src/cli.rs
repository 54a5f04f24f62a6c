//! # mkpctl CLI
//!
//! Command-line interface for the cluster provisioner.
//!
//! ## Usage
//!
//! ```bash
//! # Provision an Azure cluster with an ArgoCD-managed repository
//! mkpctl create-cluster azure \
//!     --cluster-name prod-west \
//!     --client-id <app-id> --client-secret <secret> \
//!     --tenant-id <tenant> --subscription-id <subscription>
//!
//! # Provision a local docker cluster reconciled by FluxCD
//! mkpctl create-cluster docker --cluster-name dev --gitops-controller fluxcd
//!
//! # Export sanitized cluster-scoped state from any cluster
//! mkpctl export-cluster --kubeconfig ~/.kube/config --target-dir ./state
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::config::credentials::{AzureCredentials, ProviderCredentials, SecretString};
use crate::config::{self, ConfigError, WorkflowConfig};
use crate::constants;
use crate::export::{ClusterExport, LiveClusterExport};
use crate::kube_util::ShutdownRx;
use crate::workflow::Orchestrator;

/// Provisions CAPI-managed Kubernetes clusters with a GitOps repository
#[derive(Debug, Parser)]
#[command(name = "mkpctl")]
#[command(about = "Kubernetes cluster provisioner", long_about = None, version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision a target cluster and its GitOps repository
    #[command(subcommand)]
    CreateCluster(CreateClusterCommand),
    /// Export sanitized cluster-scoped state from a live cluster
    ExportCluster(ExportClusterArgs),
}

#[derive(Debug, Subcommand)]
enum CreateClusterCommand {
    /// Provision on Azure through the CAPZ provider
    Azure(AzureArgs),
    /// Provision on the local Docker daemon through the CAPD provider
    Docker(DockerArgs),
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Name for the target cluster and the generated repository
    #[arg(long)]
    cluster_name: String,

    /// GitHub personal access token. Read from GITHUB_TOKEN when omitted
    #[arg(long)]
    github_token: Option<String>,

    /// GitOps controller installed on the target cluster (argocd or fluxcd)
    #[arg(long, default_value = constants::DEFAULT_GITOPS_CONTROLLER)]
    gitops_controller: String,

    /// Create the generated repository as private
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    private_repo: bool,
}

#[derive(Debug, Args)]
struct AzureArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Azure service principal application id
    #[arg(long)]
    client_id: String,

    /// Azure service principal secret
    #[arg(long)]
    client_secret: String,

    /// Azure tenant id
    #[arg(long)]
    tenant_id: String,

    /// Azure subscription id
    #[arg(long)]
    subscription_id: String,

    /// Azure region for the target cluster
    #[arg(long, default_value = constants::DEFAULT_AZURE_REGION)]
    region: String,

    /// VM size for control plane machines
    #[arg(long, default_value = constants::DEFAULT_AZURE_MACHINE_TYPE)]
    control_plane_machine_type: String,

    /// VM size for worker machines
    #[arg(long, default_value = constants::DEFAULT_AZURE_MACHINE_TYPE)]
    node_machine_type: String,

    /// Name of the SSH key injected into cluster machines
    #[arg(long, default_value = constants::DEFAULT_AZURE_SSH_KEY)]
    ssh_key_name: String,

    /// Resource group that holds the target cluster
    #[arg(long, default_value = constants::DEFAULT_AZURE_RESOURCE_GROUP)]
    resource_group: String,

    /// Provision a highly available control plane
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    high_availability: bool,
}

#[derive(Debug, Args)]
struct DockerArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Provision a highly available control plane
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    high_availability: bool,
}

#[derive(Debug, Args)]
struct ExportClusterArgs {
    /// Kubeconfig of the cluster to export
    #[arg(long)]
    kubeconfig: PathBuf,

    /// Directory the sanitized YAML files are written to
    #[arg(long)]
    target_dir: PathBuf,
}

/// Parses the command line and runs the selected command.
pub async fn run(cancel: ShutdownRx) -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::CreateCluster(provider) => create_cluster(provider, cancel).await,
        Commands::ExportCluster(args) => export_cluster(args).await,
    }
}

async fn create_cluster(command: CreateClusterCommand, cancel: ShutdownRx) -> Result<()> {
    let config = match command {
        CreateClusterCommand::Azure(args) => azure_config(args)?,
        CreateClusterCommand::Docker(args) => docker_config(args)?,
    };
    let report = Orchestrator::new(config, cancel).run().await?;
    println!(
        "✅ cluster '{}' is provisioned and self-managing",
        report.cluster_name
    );
    println!("   repository: {}", report.clone_url);
    println!("   artifacts:  {}", report.artifact_dir.display());
    Ok(())
}

async fn export_cluster(args: ExportClusterArgs) -> Result<()> {
    let written = LiveClusterExport
        .export_cluster_scoped(&args.kubeconfig, &args.target_dir)
        .await
        .with_context(|| {
            format!(
                "failed to export cluster state from {}",
                args.kubeconfig.display()
            )
        })?;
    println!(
        "✅ exported {written} object(s) to {}",
        args.target_dir.display()
    );
    Ok(())
}

/// Resolves the GitHub token from the flag or the GITHUB_TOKEN variable.
fn github_token(common: &CommonArgs) -> Result<SecretString, ConfigError> {
    if let Some(token) = common.github_token.as_deref() {
        if !token.is_empty() {
            return Ok(SecretString::new(token));
        }
    }
    std::env::var("GITHUB_TOKEN")
        .ok()
        .filter(|token| !token.is_empty())
        .map(SecretString::new)
        .ok_or(ConfigError::MissingGithubToken)
}

fn azure_config(args: AzureArgs) -> Result<WorkflowConfig, ConfigError> {
    let github_token = github_token(&args.common)?;
    let credentials = AzureCredentials::new(
        args.region,
        args.client_id,
        SecretString::new(args.client_secret),
        args.tenant_id,
        args.subscription_id,
        args.control_plane_machine_type,
        args.node_machine_type,
        args.ssh_key_name,
        args.resource_group,
    )?;
    let config = WorkflowConfig {
        cluster_name: args.common.cluster_name,
        github_token,
        gitops_controller: args.common.gitops_controller,
        private_repo: args.common.private_repo,
        high_availability: args.high_availability,
        credentials: ProviderCredentials::Azure(credentials),
        artifact_root: config::default_artifact_root()?,
    };
    config.validate()?;
    Ok(config)
}

fn docker_config(args: DockerArgs) -> Result<WorkflowConfig, ConfigError> {
    let github_token = github_token(&args.common)?;
    let config = WorkflowConfig {
        cluster_name: args.common.cluster_name,
        github_token,
        gitops_controller: args.common.gitops_controller,
        private_repo: args.common.private_repo,
        high_availability: args.high_availability,
        credentials: ProviderCredentials::Docker,
        artifact_root: config::default_artifact_root()?,
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_docker_create_cluster() {
        let cli = Cli::try_parse_from([
            "mkpctl",
            "create-cluster",
            "docker",
            "--cluster-name",
            "dev",
            "--github-token",
            "tok",
            "--gitops-controller",
            "fluxcd",
        ])
        .unwrap();
        let Commands::CreateCluster(CreateClusterCommand::Docker(args)) = cli.command else {
            panic!("parsed into the wrong command");
        };
        assert_eq!(args.common.cluster_name, "dev");
        assert_eq!(args.common.gitops_controller, "fluxcd");
        assert!(args.common.private_repo);
        assert!(!args.high_availability);
    }

    #[test]
    fn test_cli_azure_defaults() {
        let cli = Cli::try_parse_from([
            "mkpctl",
            "create-cluster",
            "azure",
            "--cluster-name",
            "prod",
            "--client-id",
            "id",
            "--client-secret",
            "secret",
            "--tenant-id",
            "tenant",
            "--subscription-id",
            "sub",
        ])
        .unwrap();
        let Commands::CreateCluster(CreateClusterCommand::Azure(args)) = cli.command else {
            panic!("parsed into the wrong command");
        };
        assert_eq!(args.region, constants::DEFAULT_AZURE_REGION);
        assert_eq!(args.resource_group, constants::DEFAULT_AZURE_RESOURCE_GROUP);
        assert!(args.high_availability);
    }

    #[test]
    fn test_cli_requires_azure_credentials() {
        let result = Cli::try_parse_from([
            "mkpctl",
            "create-cluster",
            "azure",
            "--cluster-name",
            "prod",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parses_export_cluster() {
        let cli = Cli::try_parse_from([
            "mkpctl",
            "export-cluster",
            "--kubeconfig",
            "/tmp/kc",
            "--target-dir",
            "/tmp/out",
        ])
        .unwrap();
        let Commands::ExportCluster(args) = cli.command else {
            panic!("parsed into the wrong command");
        };
        assert_eq!(args.kubeconfig, PathBuf::from("/tmp/kc"));
        assert_eq!(args.target_dir, PathBuf::from("/tmp/out"));
    }
}
