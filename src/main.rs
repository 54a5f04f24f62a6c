//! # mkpctl
//!
//! Provisions a CAPI-managed Kubernetes cluster from an ephemeral kind
//! control plane, generates a GitOps repository seeded with the cluster's
//! sanitized state, and pivots management onto the new cluster so it
//! manages itself.

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure rustls crypto provider FIRST, before any other operations
    // Required for rustls 0.23+ when no default provider is set via features
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mkpctl=info,kube_provisioner=info".into()),
        )
        .init();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, stopping after the current stage");
            let _ = shutdown_tx.send(true);
        }
    });

    kube_provisioner::cli::run(shutdown_rx).await
}
