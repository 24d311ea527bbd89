//! Persistent profile and machine store
//!
//! Cluster configs live under `<home>/profiles/<name>/config.json` and host
//! records under `<home>/machines/<name>/config.json`. Writers hold a
//! per-process mutex plus the cross-process `machine_client.lock`, and every
//! write is atomic (tmp file, fsync, rename) so readers never observe a
//! partially written config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::lock::FileLock;
use crate::machine::Host;
use crate::{constants, Error, Result};

/// How long a writer waits for the cross-process store lock.
const STORE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Serializes writers within this process; the file lock covers other
/// processes.
static PROCESS_LOCK: Mutex<()> = Mutex::const_new(());

/// Filesystem-backed store rooted at the minikube home directory.
#[derive(Debug, Clone)]
pub struct Store {
    base: PathBuf,
}

impl Store {
    /// A store rooted at an explicit directory (tests use tempdirs).
    pub fn new(base: impl Into<PathBuf>) -> Store {
        Store { base: base.into() }
    }

    /// The store for the active minikube home.
    pub fn default_store() -> Store {
        Store::new(constants::minikube_home())
    }

    /// Root directory of this store.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of the cross-process store/cert lock file.
    pub fn machine_client_lock(&self) -> PathBuf {
        self.base.join("machine_client.lock")
    }

    /// Path of the per-cluster mutation lock.
    pub fn cluster_lock_path(&self, name: &str) -> PathBuf {
        self.base.join("locks").join(format!("{}.lock", name))
    }

    /// Certificates directory shared by all clusters on this workstation.
    pub fn certs_dir(&self) -> PathBuf {
        self.base.join("certs")
    }

    fn profile_config(&self, name: &str) -> PathBuf {
        self.base.join("profiles").join(name).join("config.json")
    }

    fn machine_config(&self, name: &str) -> PathBuf {
        self.base.join("machines").join(name).join("config.json")
    }

    /// Load a cluster config by name.
    pub async fn load(&self, name: &str) -> Result<ClusterConfig> {
        let cc: ClusterConfig = match read_json(&self.profile_config(name)).await? {
            Some(cc) => cc,
            None => return Err(Error::profile_not_found(name)),
        };
        cc.validate()?;
        Ok(cc)
    }

    /// Persist a cluster config atomically.
    ///
    /// Concurrent saves to the same name serialize; the file on disk always
    /// reflects one full write.
    pub async fn save(&self, cc: &ClusterConfig) -> Result<()> {
        cc.validate()?;
        let _proc = PROCESS_LOCK.lock().await;
        let _lock = FileLock::acquire(&self.machine_client_lock(), STORE_LOCK_TIMEOUT).await?;
        write_json_atomic(&self.profile_config(&cc.name), cc).await
    }

    /// List profile names that have a config on disk.
    pub async fn list(&self) -> Result<Vec<String>> {
        let profiles = self.base.join("profiles");
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&profiles).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().join("config.json").exists() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a profile directory. Missing profiles are a success.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let _proc = PROCESS_LOCK.lock().await;
        let _lock = FileLock::acquire(&self.machine_client_lock(), STORE_LOCK_TIMEOUT).await?;
        remove_dir_idempotent(&self.base.join("profiles").join(name)).await
    }

    /// Whether a host record exists for a machine name.
    pub async fn exists_host(&self, name: &str) -> bool {
        self.machine_config(name).exists()
    }

    /// Load a host record by machine name.
    pub async fn load_host(&self, name: &str) -> Result<Host> {
        match read_json(&self.machine_config(name)).await? {
            Some(h) => Ok(h),
            None => Err(Error::machine_not_found(name)),
        }
    }

    /// Persist a host record atomically under the store locks.
    pub async fn save_host(&self, host: &Host) -> Result<()> {
        let _proc = PROCESS_LOCK.lock().await;
        let _lock = FileLock::acquire(&self.machine_client_lock(), STORE_LOCK_TIMEOUT).await?;
        write_json_atomic(&self.machine_config(&host.name), host).await
    }

    /// Delete a host record. Missing machines are a success.
    pub async fn remove_host(&self, name: &str) -> Result<()> {
        let _proc = PROCESS_LOCK.lock().await;
        let _lock = FileLock::acquire(&self.machine_client_lock(), STORE_LOCK_TIMEOUT).await?;
        remove_dir_idempotent(&self.base.join("machines").join(name)).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_slice(&bytes).map_err(|e| {
        Error::serialization(format!("{}: {}", path.display(), e))
    })?;
    Ok(Some(value))
}

/// Write JSON via `<path>.tmp` + fsync + rename so a crash mid-write never
/// leaves a truncated config behind.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::serialization(e.to_string()))?;

    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), bytes = bytes.len(), "saved");
    Ok(())
}

async fn remove_dir_idempotent(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_verify_components, KubernetesConfig, Node};
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
                container_runtime: "docker".to_string(),
                service_cidr: "10.96.0.0/12".to_string(),
                node_port: 8443,
                ..Default::default()
            },
            addons: Default::default(),
            verify_components: default_verify_components(),
            memory_mb: 2048,
            cpus: 2,
            disk_mb: 20000,
            mount: false,
            mount_string: String::new(),
            http_proxy_env: Vec::new(),
        }
    }

    /// Story: `start` persists the profile, later commands load it back
    /// unchanged.
    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let cc = sample("t1");
        store.save(&cc).await.unwrap();
        let loaded = store.load("t1").await.unwrap();
        assert_eq!(cc, loaded);
    }

    #[tokio::test]
    async fn load_of_missing_profile_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        match store.load("ghost").await {
            Err(Error::NotFound { .. }) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|c| c.name)),
        }
    }

    /// Story: `delete; delete` must both succeed, including on a profile
    /// that never existed.
    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        store.save(&sample("t1")).await.unwrap();
        store.remove("t1").await.unwrap();
        store.remove("t1").await.unwrap();
        store.remove("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_sorted_profile_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        assert!(store.list().await.unwrap().is_empty());
        store.save(&sample("zeta")).await.unwrap();
        store.save(&sample("alpha")).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["alpha", "zeta"]);
    }

    /// Story: a corrupt config on disk is a clear serialization error, not
    /// a panic or a silently defaulted profile.
    #[tokio::test]
    async fn corrupt_profile_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let path = dir.path().join("profiles").join("bad").join("config.json");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        match store.load("bad").await {
            Err(Error::Serialization { .. }) => {}
            other => panic!("expected Serialization error, got {:?}", other.map(|c| c.name)),
        }
    }

    /// Story: concurrent saves to the same profile serialize; the winner's
    /// bytes are what's on disk, never an interleaving.
    #[tokio::test]
    async fn concurrent_saves_leave_one_full_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let mut a = sample("race");
        a.cpus = 2;
        let mut b = sample("race");
        b.cpus = 8;

        let (ra, rb) = tokio::join!(store.save(&a), store.save(&b));
        ra.unwrap();
        rb.unwrap();

        let loaded = store.load("race").await.unwrap();
        assert!(loaded.cpus == 2 || loaded.cpus == 8);
    }

    #[tokio::test]
    async fn host_records_round_trip_and_remove_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let host = Host::new("t1", "docker");
        assert!(!store.exists_host("t1").await);
        store.save_host(&host).await.unwrap();
        assert!(store.exists_host("t1").await);

        let loaded = store.load_host("t1").await.unwrap();
        assert_eq!(loaded.name, "t1");
        assert_eq!(loaded.driver_name, "docker");

        store.remove_host("t1").await.unwrap();
        store.remove_host("t1").await.unwrap();
        assert!(!store.exists_host("t1").await);
    }
}
