//! # Provider Credentials
//!
//! Typed credential material for the supported infrastructure providers.
//!
//! Credentials are validated when they are constructed, so a missing field
//! surfaces as a configuration error before any cluster is created rather
//! than as a failed clusterctl invocation halfway through a run. Secret
//! values are wrapped so they are wiped from memory on drop and never
//! appear in debug output.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors produced while constructing provider credentials.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// A required Azure credential field was empty.
    #[error("missing required Azure credential field '{field}'")]
    MissingAzureField {
        /// Name of the empty field.
        field: &'static str,
    },
}

/// A secret string that is zeroed on drop and redacted in debug output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    /// Wraps a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value for use at an API boundary.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true when no value is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

/// Service principal and placement settings for Azure target clusters.
///
/// Field values map one-to-one onto the `AZURE_*` environment variables
/// consumed by clusterctl and the CAPZ provider.
#[derive(Clone)]
pub struct AzureCredentials {
    region: String,
    client_id: String,
    client_secret: SecretString,
    tenant_id: String,
    subscription_id: String,
    control_plane_machine_type: String,
    node_machine_type: String,
    ssh_key_name: String,
    resource_group: String,
}

impl AzureCredentials {
    /// Builds a validated Azure credential set.
    ///
    /// Every field must be non-empty. Defaults for region, machine types,
    /// SSH key, and resource group are filled in by the CLI layer before
    /// this constructor runs.
    #[allow(clippy::too_many_arguments, reason = "one field per CLI flag")]
    pub fn new(
        region: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
        tenant_id: impl Into<String>,
        subscription_id: impl Into<String>,
        control_plane_machine_type: impl Into<String>,
        node_machine_type: impl Into<String>,
        ssh_key_name: impl Into<String>,
        resource_group: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let creds = Self {
            region: region.into(),
            client_id: client_id.into(),
            client_secret,
            tenant_id: tenant_id.into(),
            subscription_id: subscription_id.into(),
            control_plane_machine_type: control_plane_machine_type.into(),
            node_machine_type: node_machine_type.into(),
            ssh_key_name: ssh_key_name.into(),
            resource_group: resource_group.into(),
        };

        let required: [(&'static str, bool); 9] = [
            ("region", creds.region.is_empty()),
            ("client-id", creds.client_id.is_empty()),
            ("client-secret", creds.client_secret.is_empty()),
            ("tenant-id", creds.tenant_id.is_empty()),
            ("subscription-id", creds.subscription_id.is_empty()),
            (
                "control-plane-machine-type",
                creds.control_plane_machine_type.is_empty(),
            ),
            ("node-machine-type", creds.node_machine_type.is_empty()),
            ("ssh-key-name", creds.ssh_key_name.is_empty()),
            ("resource-group", creds.resource_group.is_empty()),
        ];
        for (field, empty) in required {
            if empty {
                return Err(CredentialError::MissingAzureField { field });
            }
        }
        Ok(creds)
    }

    /// Environment variables handed to clusterctl invocations.
    fn clusterctl_env(&self) -> Vec<(String, String)> {
        vec![
            ("AZURE_LOCATION".into(), self.region.clone()),
            ("AZURE_CLIENT_ID".into(), self.client_id.clone()),
            (
                "AZURE_CLIENT_SECRET".into(),
                self.client_secret.expose().to_owned(),
            ),
            ("AZURE_TENANT_ID".into(), self.tenant_id.clone()),
            ("AZURE_SUBSCRIPTION_ID".into(), self.subscription_id.clone()),
            (
                "AZURE_CONTROL_PLANE_MACHINE_TYPE".into(),
                self.control_plane_machine_type.clone(),
            ),
            (
                "AZURE_NODE_MACHINE_TYPE".into(),
                self.node_machine_type.clone(),
            ),
            ("AZURE_SSH_KEY".into(), self.ssh_key_name.clone()),
            ("AZURE_RESOURCE_GROUP".into(), self.resource_group.clone()),
        ]
    }
}

impl fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("region", &self.region)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret)
            .field("tenant_id", &self.tenant_id)
            .field("subscription_id", &self.subscription_id)
            .field(
                "control_plane_machine_type",
                &self.control_plane_machine_type,
            )
            .field("node_machine_type", &self.node_machine_type)
            .field("ssh_key_name", &self.ssh_key_name)
            .field("resource_group", &self.resource_group)
            .finish()
    }
}

/// Credential material for one infrastructure provider.
///
/// Exactly one variant exists per supported provider. The docker provider
/// drives local CAPD clusters and needs no credential material.
#[derive(Debug, Clone)]
pub enum ProviderCredentials {
    /// Azure service principal credentials for CAPZ.
    Azure(AzureCredentials),
    /// Local docker provider (CAPD). Carries no secrets.
    Docker,
}

impl ProviderCredentials {
    /// Human-readable provider name used in logs.
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Azure(_) => "azure",
            Self::Docker => "docker",
        }
    }

    /// Infrastructure provider name passed to `clusterctl init`.
    pub fn infrastructure(&self) -> &'static str {
        match self {
            Self::Azure(_) => "azure",
            Self::Docker => "docker",
        }
    }

    /// Short provider tag naming the controller namespace and deployment
    /// (`capz-system/capz-controller-manager`, `capd-system/...`).
    pub fn provider_tag(&self) -> &'static str {
        match self {
            Self::Azure(_) => "capz",
            Self::Docker => "capd",
        }
    }

    /// Environment variables required by clusterctl for this provider.
    pub fn clusterctl_env(&self) -> Vec<(String, String)> {
        match self {
            Self::Azure(azure) => azure.clusterctl_env(),
            Self::Docker => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_azure(values: [&str; 9]) -> Result<AzureCredentials, CredentialError> {
        AzureCredentials::new(
            values[0],
            values[1],
            SecretString::new(values[2]),
            values[3],
            values[4],
            values[5],
            values[6],
            values[7],
            values[8],
        )
    }

    fn azure_fixture(client_id: &str) -> Result<AzureCredentials, CredentialError> {
        build_azure([
            "westus2",
            client_id,
            "s3cret",
            "tenant-1",
            "sub-1",
            "Standard_D2s_v3",
            "Standard_D2s_v3",
            "default",
            "mkp-cluster",
        ])
    }

    #[test]
    fn test_azure_credentials_name_each_missing_field() {
        let fields = [
            "region",
            "client-id",
            "client-secret",
            "tenant-id",
            "subscription-id",
            "control-plane-machine-type",
            "node-machine-type",
            "ssh-key-name",
            "resource-group",
        ];
        let filled = [
            "westus2",
            "client-1",
            "s3cret",
            "tenant-1",
            "sub-1",
            "Standard_D2s_v3",
            "Standard_D2s_v3",
            "default",
            "mkp-cluster",
        ];
        for (index, field) in fields.iter().enumerate() {
            let mut values = filled;
            values[index] = "";
            let err = build_azure(values).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("missing required Azure credential field '{field}'"),
            );
        }
    }

    #[test]
    fn test_azure_env_covers_all_keys() {
        let creds = ProviderCredentials::Azure(azure_fixture("client-1").unwrap());
        let env = creds.clusterctl_env();
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        for expected in [
            "AZURE_LOCATION",
            "AZURE_CLIENT_ID",
            "AZURE_CLIENT_SECRET",
            "AZURE_TENANT_ID",
            "AZURE_SUBSCRIPTION_ID",
            "AZURE_CONTROL_PLANE_MACHINE_TYPE",
            "AZURE_NODE_MACHINE_TYPE",
            "AZURE_SSH_KEY",
            "AZURE_RESOURCE_GROUP",
        ] {
            assert!(keys.contains(&expected), "missing env key {expected}");
        }
    }

    #[test]
    fn test_docker_env_is_empty() {
        assert!(ProviderCredentials::Docker.clusterctl_env().is_empty());
    }

    #[test]
    fn test_secret_string_debug_is_redacted() {
        let secret = SecretString::new("hunter2");
        assert_eq!(format!("{secret:?}"), "SecretString(***)");
    }

    #[test]
    fn test_provider_tags() {
        let azure = ProviderCredentials::Azure(azure_fixture("client-1").unwrap());
        assert_eq!(azure.provider_tag(), "capz");
        assert_eq!(ProviderCredentials::Docker.provider_tag(), "capd");
    }
}
