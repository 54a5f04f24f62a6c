//! HTTP retrieval of pinned install manifests (CNI, GitOps controllers).

use tracing::debug;

/// Fetches a manifest over HTTPS, failing on non-success status codes.
pub async fn fetch_manifest(url: &str) -> Result<String, reqwest::Error> {
    debug!(url, "fetching manifest");
    let response = reqwest::get(url).await?.error_for_status()?;
    let body = response.text().await?;
    debug!(url, bytes = body.len(), "manifest fetched");
    Ok(body)
}
