//! Cross-module lifecycle tests
//!
//! These run without docker or a network: machines come from the fake
//! driver, commands from the scripted runner, and download paths are
//! exercised against a pre-seeded cache.

use std::collections::BTreeMap;

use minikube::addons;
use minikube::config::{default_verify_components, ClusterConfig, KubernetesConfig, Node};
use minikube::constants;
use minikube::driver::DriverTag;
use minikube::node::{ClusterStatus, Orchestrator};
use minikube::store::Store;
use minikube::util;

fn sample_config(name: &str) -> ClusterConfig {
    ClusterConfig {
        name: name.to_string(),
        driver: DriverTag::Docker,
        nodes: vec![Node {
            name: String::new(),
            ip: String::new(),
            port: constants::DEFAULT_API_SERVER_PORT,
            kubernetes_version: "v1.18.0".to_string(),
            control_plane: true,
            worker: true,
        }],
        kubernetes_config: KubernetesConfig {
            kubernetes_version: "v1.18.0".to_string(),
            container_runtime: "docker".to_string(),
            service_cidr: constants::DEFAULT_SERVICE_CIDR.to_string(),
            node_port: constants::DEFAULT_API_SERVER_PORT,
            ..Default::default()
        },
        addons: addons::default_addons(),
        verify_components: default_verify_components(),
        memory_mb: 2048,
        cpus: 2,
        disk_mb: 20000,
        mount: false,
        mount_string: String::new(),
        http_proxy_env: Vec::new(),
    }
}

/// Seed every artifact download_artifacts would fetch, so the cache layer
/// short-circuits instead of hitting the network.
async fn seed_cache(home: &std::path::Path, version: &str) {
    for name in constants::KUBE_BINARIES {
        let path = constants::cached_binary_path(home, "linux", version, name);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"#!binary").await.unwrap();
    }
    let semver = util::parse_kubernetes_version(version).unwrap();
    for image in constants::kubeadm_images("", &semver) {
        let path = constants::cached_image_path(home, &image);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"tarball").await.unwrap();
    }
}

/// Download-only: after the artifact pass, kube binaries sit under
/// cache/<os>/<version>/ and each kubeadm image sits under cache/images/
/// with `:` replaced by `_` — and no machine or profile host exists.
#[tokio::test]
async fn download_only_populates_cache_layout() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    let orchestrator = Orchestrator::new(store.clone());

    seed_cache(dir.path(), "v1.18.0").await;
    let cc = sample_config("d1");
    orchestrator.download_artifacts(&cc).await.unwrap();

    for name in ["kubelet", "kubeadm", "kubectl"] {
        assert!(
            constants::cached_binary_path(dir.path(), "linux", "v1.18.0", name).exists(),
            "{} missing from cache",
            name
        );
    }
    assert!(constants::cached_image_path(dir.path(), "k8s.gcr.io/kube-scheduler:v1.18.0").exists());

    // No machine was created.
    assert!(!store.exists_host("d1").await);
}

/// The same artifact pass works across multiple versions side by side.
#[tokio::test]
async fn download_only_supports_multiple_versions() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(Store::new(dir.path()));

    for version in ["v1.14.0", "v1.18.0", "v1.19.0"] {
        seed_cache(dir.path(), version).await;
        let mut cc = sample_config("d1");
        cc.kubernetes_config.kubernetes_version = version.to_string();
        cc.nodes[0].kubernetes_version = version.to_string();
        orchestrator.download_artifacts(&cc).await.unwrap();

        assert!(constants::cached_binary_path(dir.path(), "linux", version, "kubeadm").exists());
        assert!(constants::cached_binary_path(dir.path(), "linux", version, "kubelet").exists());
    }
}

/// Profile lifecycle: save, list, addon toggle, delete twice, status 7.
#[tokio::test]
async fn profile_lifecycle_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    let orchestrator = Orchestrator::new(store.clone());

    let cc = sample_config("t1");
    store.save(&cc).await.unwrap();
    assert_eq!(store.list().await.unwrap(), vec!["t1"]);

    addons::set(&store, "t1", "ingress", true).await.unwrap();
    let loaded = store.load("t1").await.unwrap();
    assert_eq!(loaded.addons.get("ingress"), Some(&true));

    // Delete is idempotent: both calls succeed, the second reports that
    // nothing existed.
    assert!(orchestrator.delete("t1").await.unwrap());
    assert!(!orchestrator.delete("t1").await.unwrap());

    // Status after delete surfaces NotFound (exit 7 at the CLI).
    assert!(matches!(
        orchestrator.status("t1").await,
        Err(minikube::Error::NotFound { .. })
    ));
}

/// Every persisted config parses and validates after each operation.
#[tokio::test]
async fn persisted_configs_always_validate() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());

    let mut cc = sample_config("t1");
    store.save(&cc).await.unwrap();
    store.load("t1").await.unwrap().validate().unwrap();

    cc.memory_mb = 8192;
    cc.kubernetes_config.kubernetes_version = "v1.19.0".to_string();
    cc.nodes[0].kubernetes_version = "v1.19.0".to_string();
    store.save(&cc).await.unwrap();
    store.load("t1").await.unwrap().validate().unwrap();

    // An invalid config is rejected at save time, leaving the good one.
    cc.nodes[0].control_plane = false;
    assert!(store.save(&cc).await.is_err());
    assert_eq!(
        store.load("t1").await.unwrap().kubernetes_config.kubernetes_version,
        "v1.19.0"
    );
}

/// Status JSON marshals and unmarshals to the same value.
#[test]
fn status_json_round_trip() {
    let status = ClusterStatus {
        name: "t1".to_string(),
        host: "Running".to_string(),
        kubelet: "Running".to_string(),
        api_server: "Running".to_string(),
        kubeconfig: "Configured".to_string(),
    };
    let json = serde_json::to_string(&status).unwrap();
    let back: ClusterStatus = serde_json::from_str(&json).unwrap();
    assert_eq!(status, back);
    assert_eq!(back.exit_code(), 0);
}

/// Boundary cases from the version and CIDR contract.
#[test]
fn version_and_cidr_boundaries() {
    assert!(util::parse_kubernetes_version("v1.15.2").is_ok());
    assert!(util::parse_kubernetes_version("1.15.2").is_ok());
    assert!(util::parse_kubernetes_version("v1").is_err());

    assert!(util::validate_cidr("10.96.0.0/12").is_ok());
    assert!(util::validate_cidr("10.96.0.0/33").is_err());

    let mut addons: BTreeMap<String, bool> = BTreeMap::new();
    addons.insert("ingress".to_string(), true);
    let mut cc = sample_config("boundaries");
    cc.addons = addons;
    cc.validate().unwrap();
}
