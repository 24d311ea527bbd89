//! Addon configuration
//!
//! Addons are toggled per profile in `ClusterConfig.addons`; the actual
//! manifests and enable/disable hooks live outside this crate. This module
//! only validates names and persists the flags through the store.

use std::collections::BTreeMap;

use crate::store::Store;
use crate::{Error, Result};

/// Addons a profile can toggle.
pub const KNOWN_ADDONS: [&str; 8] = [
    "dashboard",
    "default-storageclass",
    "efk",
    "ingress",
    "metrics-server",
    "registry",
    "storage-provisioner",
    "storage-provisioner-gluster",
];

/// Addons enabled for a fresh profile.
pub const DEFAULT_ADDONS: [&str; 2] = ["default-storageclass", "storage-provisioner"];

/// The default addon map for new cluster configs.
pub fn default_addons() -> BTreeMap<String, bool> {
    KNOWN_ADDONS
        .iter()
        .map(|name| (name.to_string(), DEFAULT_ADDONS.contains(name)))
        .collect()
}

/// Validate an addon name against the known set.
pub fn validate(name: &str) -> Result<()> {
    if KNOWN_ADDONS.contains(&name) {
        Ok(())
    } else {
        Err(Error::usage(format!(
            "unknown addon \"{}\"; choose one of: {}",
            name,
            KNOWN_ADDONS.join(", ")
        )))
    }
}

/// Enable or disable an addon on a profile and persist the change.
pub async fn set(store: &Store, profile: &str, addon: &str, enabled: bool) -> Result<()> {
    validate(addon)?;
    let mut cc = store.load(profile).await?;
    cc.addons.insert(addon.to_string(), enabled);
    store.save(&cc).await
}

/// The effective addon map of a profile (defaults overlaid with the
/// profile's choices).
pub async fn list(store: &Store, profile: &str) -> Result<BTreeMap<String, bool>> {
    let cc = store.load(profile).await?;
    let mut addons = default_addons();
    for (name, enabled) in cc.addons {
        addons.insert(name, enabled);
    }
    Ok(addons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_verify_components, ClusterConfig, KubernetesConfig, Node};
    use crate::driver::DriverTag;

    fn sample(name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            driver: DriverTag::Docker,
            nodes: vec![Node {
                name: String::new(),
                ip: String::new(),
                port: 8443,
                kubernetes_version: "v1.18.0".to_string(),
                control_plane: true,
                worker: true,
            }],
            kubernetes_config: KubernetesConfig {
                kubernetes_version: "v1.18.0".to_string(),
                ..Default::default()
            },
            addons: default_addons(),
            verify_components: default_verify_components(),
            memory_mb: 2048,
            cpus: 2,
            disk_mb: 20000,
            mount: false,
            mount_string: String::new(),
            http_proxy_env: Vec::new(),
        }
    }

    #[test]
    fn defaults_enable_storage_addons_only() {
        let addons = default_addons();
        assert_eq!(addons.get("storage-provisioner"), Some(&true));
        assert_eq!(addons.get("default-storageclass"), Some(&true));
        assert_eq!(addons.get("dashboard"), Some(&false));
    }

    /// Story: `addons enable ingress` persists through the store and is
    /// visible on the next list.
    #[tokio::test]
    async fn toggling_persists_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.save(&sample("t1")).await.unwrap();

        set(&store, "t1", "ingress", true).await.unwrap();
        let addons = list(&store, "t1").await.unwrap();
        assert_eq!(addons.get("ingress"), Some(&true));

        set(&store, "t1", "ingress", false).await.unwrap();
        let addons = list(&store, "t1").await.unwrap();
        assert_eq!(addons.get("ingress"), Some(&false));
    }

    #[tokio::test]
    async fn unknown_addon_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        match set(&store, "t1", "warp-drive", true).await {
            Err(Error::Usage { message }) => assert!(message.contains("warp-drive")),
            other => panic!("expected Usage error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn toggling_on_missing_profile_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        assert!(matches!(
            set(&store, "ghost", "ingress", true).await,
            Err(Error::NotFound { .. })
        ));
    }
}
