//! Kubeconfig rendering and client construction
//!
//! The orchestrator renders a kubeconfig against the generated certs both
//! for the user (written under the profile directory) and for its own
//! API clients (parsed back in-memory, never written to a temp file).

use std::path::Path;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::certs::AuthOptions;
use crate::{Error, Result};

/// Render a kubeconfig YAML for a cluster endpoint using the generated
/// certificate paths.
pub fn render(cluster_name: &str, server_url: &str, auth: &AuthOptions) -> String {
    format!(
        r#"apiVersion: v1
clusters:
- cluster:
    certificate-authority: {ca}
    server: {server}
  name: {name}
contexts:
- context:
    cluster: {name}
    user: {name}
  name: {name}
current-context: {name}
kind: Config
preferences: {{}}
users:
- name: {name}
  user:
    client-certificate: {cert}
    client-key: {key}
"#,
        ca = auth.ca_cert_path().display(),
        server = server_url,
        name = cluster_name,
        cert = auth.client_cert_path().display(),
        key = auth.client_key_path().display(),
    )
}

/// Build a kube client for a cluster endpoint from the generated certs.
pub async fn client(cluster_name: &str, server_url: &str, auth: &AuthOptions) -> Result<Client> {
    let yaml = render(cluster_name, server_url, auth);
    let kubeconfig: Kubeconfig = serde_yaml::from_str(&yaml)
        .map_err(|e| Error::serialization(format!("kubeconfig: {}", e)))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(format!("loading kubeconfig: {}", e)))?;
    Client::try_from(config).map_err(Error::Kube)
}

/// Write the kubeconfig under the profile directory and return its path.
pub async fn write(
    profile_dir: &Path,
    cluster_name: &str,
    server_url: &str,
    auth: &AuthOptions,
) -> Result<std::path::PathBuf> {
    let path = profile_dir.join("kubeconfig");
    tokio::fs::create_dir_all(profile_dir).await?;
    tokio::fs::write(&path, render(cluster_name, server_url, auth)).await?;
    Ok(path)
}

/// Whether a written kubeconfig still references the given endpoint.
pub async fn references_endpoint(path: &Path, server_url: &str) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content.contains(server_url),
        Err(_) => false,
    }
}
