//! # Kube Provisioner
//!
//! Provisions production Kubernetes clusters through Cluster API and wires
//! them to a GitOps controller, end to end:
//!
//! 1. **Ephemeral control plane** - A local kind cluster hosts the CAPI
//!    controllers just long enough to create the target cluster
//! 2. **Target cluster** - clusterctl generates and applies the cluster
//!    declaration (Azure through CAPZ, or local docker through CAPD)
//! 3. **GitOps repository** - A GitHub repository is created and populated
//!    with the controller install, a bootstrap skeleton, and the target
//!    cluster's sanitized state
//! 4. **Controller bootstrap** - ArgoCD or FluxCD is installed on the
//!    target and pointed at the repository
//! 5. **Pivot** - CAPI management moves onto the target cluster, the
//!    ephemeral cluster is destroyed, and run artifacts are relocated
//!
//! The [`workflow::Orchestrator`] drives these stages strictly in order;
//! the `mkpctl` binary is a thin CLI over it.

pub mod artifacts;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod export;
pub mod fetch;
pub mod gitops;
pub mod kube_util;
pub mod workflow;
