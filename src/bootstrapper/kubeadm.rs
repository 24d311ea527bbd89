//! Kubeadm bootstrapper
//!
//! Drives `kubeadm` inside the guest through the command runner. The
//! central decision is init-versus-restart: a guest that already carries a
//! kubeadm config gets the cheaper phased restart, and [`needs_reset`]
//! short-circuits even that when the running cluster already matches the
//! requested one. A failed path falls back to a full `reset` followed by
//! exactly one `init` retry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use semver::Version;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assets::Asset;
use crate::config::{ClusterConfig, Node};
use crate::cruntime::{self, ContainerState, ListOptions, Runtime};
use crate::driver::MachineState;
use crate::k8s::{ApiserverProbe, ClusterView, HttpApiserverProbe, KubeClusterView, APPS_BY_LAYER};
use crate::kverify::Verifier;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::runner::{Command, CommandRunner};
use crate::store::Store;
use crate::{constants, kubeconfig, util, Error, Result};

use super::{extraargs, templates, Bootstrapper, LogOptions};

/// Kubeconfigs kubeadm writes; a stale apiserver endpoint in any of them
/// makes init/restart fail, so they are cleared first.
const STALE_CONFIGS: [&str; 4] = [
    "/etc/kubernetes/admin.conf",
    "/etc/kubernetes/kubelet.conf",
    "/etc/kubernetes/controller-manager.conf",
    "/etc/kubernetes/scheduler.conf",
];

/// Preflight checks suppressed on every init.
const SKIP_PREFLIGHTS: [&str; 9] = [
    "DirAvailable--etc-kubernetes-manifests",
    "DirAvailable--data-minikube",
    "DirAvailable--var-lib-minikube",
    "FileAvailable--etc-kubernetes-manifests-kube-scheduler.yaml",
    "FileAvailable--etc-kubernetes-manifests-kube-apiserver.yaml",
    "FileAvailable--etc-kubernetes-manifests-kube-controller-manager.yaml",
    "FileAvailable--etc-kubernetes-manifests-etcd.yaml",
    "Port-10250",
    "Swap",
];

/// How long the phased restart waits for the apiserver and system pods.
const RESTART_WAIT: Duration = Duration::from_secs(180);

/// Bootstrapper using the kubeadm toolchain.
pub struct KubeadmBootstrapper {
    runner: Arc<dyn CommandRunner>,
    store: Store,
    probe: Arc<dyn ApiserverProbe>,
    // Cached lazily per cluster; discarded when the cluster is reset.
    view: Mutex<Option<Arc<dyn ClusterView>>>,
    injected_view: Option<Arc<dyn ClusterView>>,
}

impl KubeadmBootstrapper {
    /// A bootstrapper over a guest runner.
    pub fn new(runner: Arc<dyn CommandRunner>, store: Store) -> KubeadmBootstrapper {
        KubeadmBootstrapper {
            runner,
            store,
            probe: Arc::new(HttpApiserverProbe),
            view: Mutex::new(None),
            injected_view: None,
        }
    }

    /// A bootstrapper with substituted probe and cluster view (tests).
    pub fn with_capabilities(
        runner: Arc<dyn CommandRunner>,
        store: Store,
        probe: Arc<dyn ApiserverProbe>,
        view: Arc<dyn ClusterView>,
    ) -> KubeadmBootstrapper {
        KubeadmBootstrapper {
            runner,
            store,
            probe,
            view: Mutex::new(None),
            injected_view: Some(view),
        }
    }

    /// The apiserver probe capability, for the verifier and orchestrator.
    pub fn probe(&self) -> Arc<dyn ApiserverProbe> {
        self.probe.clone()
    }

    /// Lazily build (and cache) the cluster API view.
    async fn view(&self, cc: &ClusterConfig) -> Result<Arc<dyn ClusterView>> {
        if let Some(view) = &self.injected_view {
            return Ok(view.clone());
        }
        let mut cached = self.view.lock().await;
        if let Some(view) = cached.as_ref() {
            return Ok(view.clone());
        }

        let cp = cc.primary()?;
        let auth = crate::certs::AuthOptions::new(self.store.certs_dir(), cc.machine_name(cp));
        let url = format!("https://{}:{}", cp.ip, cp.port);
        let client = kubeconfig::client(&cc.name, &url, &auth).await?;
        let view: Arc<dyn ClusterView> = Arc::new(KubeClusterView::new(client));
        *cached = Some(view.clone());
        Ok(view)
    }

    /// Drop the cached view; the next use reconnects.
    async fn invalidate_view(&self) {
        *self.view.lock().await = None;
    }

    fn runtime(&self, cc: &ClusterConfig) -> Result<Box<dyn Runtime>> {
        let socket = if cc.kubernetes_config.cri_socket.is_empty() {
            None
        } else {
            Some(cc.kubernetes_config.cri_socket.clone())
        };
        cruntime::new_runtime(
            &cc.kubernetes_config.container_runtime,
            self.runner.clone(),
            socket,
        )
    }

    fn version(cc: &ClusterConfig) -> Result<Version> {
        util::parse_kubernetes_version(&cc.kubernetes_config.kubernetes_version)
    }

    /// `sudo env PATH=<bindir>:$PATH <kubeadm>` — kubeadm's own health
    /// checks assume its binaries are in PATH.
    fn base_cmd(cc: &ClusterConfig) -> String {
        let kubeadm = constants::guest_bin_path("kubeadm", &cc.kubernetes_config.kubernetes_version);
        let bindir = kubeadm.rsplit_once('/').map(|(d, _)| d).unwrap_or("/usr/bin");
        format!("sudo env PATH={}:$PATH {}", bindir, kubeadm)
    }

    fn kubectl_cmd(cc: &ClusterConfig) -> String {
        let kubectl = constants::guest_bin_path("kubectl", &cc.kubernetes_config.kubernetes_version);
        format!(
            "sudo {} --kubeconfig=/etc/kubernetes/admin.conf",
            kubectl
        )
    }

    /// The preflight errors suppressed for this cluster.
    fn ignore_preflight(cc: &ClusterConfig) -> Vec<String> {
        let mut list: Vec<String> = SKIP_PREFLIGHTS.iter().map(|s| s.to_string()).collect();
        list.push("SystemVerification".to_string());
        if cc.driver.is_kic() {
            list.push("FileContent--proc-sys-net-bridge-bridge-nf-call-iptables".to_string());
        }
        if cc.kubernetes_config.container_runtime != "docker" {
            // No dockershim socket to inspect.
            list.push("CRI".to_string());
        }
        list
    }

    /// Delete any kubeadm kubeconfig that references a different
    /// apiserver endpoint than the one we are about to configure.
    async fn clear_stale_configs(&self, cc: &ClusterConfig) -> Result<()> {
        let cp = cc.primary()?;
        let endpoint = format!("https://{}:{}", cp.ip, cp.port);
        for conf in STALE_CONFIGS {
            self.runner
                .run_cmd(Command::shell(format!(
                    "sudo /bin/bash -c \"grep -qF {} {} || rm -f {}\"",
                    endpoint, conf, conf
                )))
                .await?;
        }
        Ok(())
    }

    /// Unpause anything a previous run left paused; kubeadm cannot talk
    /// to a paused kubelet or apiserver container.
    async fn unpause_lingering(&self, cc: &ClusterConfig) {
        let runtime = match self.runtime(cc) {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "runtime unavailable for unpause check");
                return;
            }
        };
        match runtime
            .list_containers(ListOptions {
                state: ContainerState::Paused,
                namespaces: vec!["kube-system".to_string()],
            })
            .await
        {
            Ok(ids) if !ids.is_empty() => {
                info!(count = ids.len(), "unpausing lingering containers");
                if let Err(e) = runtime.unpause_containers(&ids).await {
                    warn!(error = %e, "unpause failed");
                }
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "paused-container query failed"),
        }
    }

    /// Whether a previous run left a kubeadm config on the guest.
    async fn existing_config(&self) -> bool {
        self.runner
            .run_cmd(Command::shell(format!(
                "sudo test -f {}",
                constants::KUBEADM_YAML_PATH
            )))
            .await
            .is_ok()
    }

    /// Run `kubeadm init` and the post-init tasks.
    async fn init(&self, cc: &ClusterConfig) -> Result<()> {
        let conf = constants::KUBEADM_YAML_PATH;

        self.clear_stale_configs(cc).await?;
        self.runner
            .run_cmd(Command::shell(format!("sudo cp {}.new {}", conf, conf)))
            .await?;

        let extra_flags = extraargs::kubeadm_cli_flags(&cc.kubernetes_config.extra_options);
        let ignore = Self::ignore_preflight(cc).join(",");
        let mut cmd = format!("{} init --config {}", Self::base_cmd(cc), conf);
        if !extra_flags.is_empty() {
            cmd.push(' ');
            cmd.push_str(&extra_flags);
        }
        cmd.push_str(&format!(" --ignore-preflight-errors={}", ignore));

        info!(cluster = %cc.name, "running kubeadm init");
        self.runner
            .run_cmd(Command::shell(cmd))
            .await
            .map_err(|e| Error::KubeadmInit {
                message: format!("run: {}", e),
            })?;

        self.post_init(cc).await;

        if cc.driver.is_kic() && cc.kubernetes_config.container_runtime != "docker" {
            self.apply_kic_overlay(cc).await?;
        }

        Ok(())
    }

    /// Post-init trio, run in parallel with a join-all boundary. A failure
    /// here must not mask a successful init, so each task only warns.
    async fn post_init(&self, cc: &ClusterConfig) {
        let view = match self.view(cc).await {
            Ok(view) => view,
            Err(e) => {
                warn!(error = %e, "no cluster view; skipping rbac and labels");
                return;
            }
        };

        let rbac = async {
            view.elevate_rbac()
                .await
                .map_err(|e| warn!(error = %e, "rbac elevation failed"))
        };
        let labels = async {
            match tokio::time::timeout(Duration::from_secs(5), view.label_nodes(&node_labels(cc)))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "node labeling failed"),
                Err(_) => warn!("node labeling timed out"),
            }
        };
        let limits = async {
            if let Err(e) = self.adjust_resource_limits().await {
                warn!(error = %e, "resource limit adjustment failed");
            }
        };

        let (_, _, _) = tokio::join!(rbac, labels, limits);
    }

    /// Bump file-handle limits for the control-plane processes.
    async fn adjust_resource_limits(&self) -> Result<()> {
        self.runner
            .run_cmd(Command::shell(
                "sudo /bin/bash -c \"pgrep kube-apiserver | xargs -r -n1 prlimit --nofile=1048576:1048576 --pid\"",
            ))
            .await?;
        Ok(())
    }

    /// Apply the kindnet overlay for container drivers running a
    /// non-docker runtime; cri-o additionally needs a daemon restart to
    /// pick up the new CNI config.
    async fn apply_kic_overlay(&self, cc: &ClusterConfig) -> Result<()> {
        let manifest = templates::kindnet_manifest("10.244.0.0/16")?;
        let asset = Asset::from_bytes(
            manifest.into_bytes(),
            constants::GUEST_EPHEMERAL_DIR,
            "kindnet.yaml",
            "0644",
        );
        self.runner.copy_file(&asset).await?;

        self.runner
            .run_cmd(Command::shell(format!(
                "{} apply -f {}/kindnet.yaml",
                Self::kubectl_cmd(cc),
                constants::GUEST_EPHEMERAL_DIR
            )))
            .await?;

        if cc.kubernetes_config.container_runtime == "cri-o" {
            self.runtime(cc)?.enable().await?;
        }
        Ok(())
    }

    /// Whether the running cluster diverges from the requested config and
    /// must go through the kubeadm phases again.
    ///
    /// Returns false only when the rendered config is unchanged, the
    /// apiserver is healthy and at the right version, every expected app
    /// runs, and the node reports no pressure — the hot path for `start`
    /// on an already-healthy cluster.
    pub async fn needs_reset(&self, cc: &ClusterConfig, view: &Arc<dyn ClusterView>) -> bool {
        let conf = constants::KUBEADM_YAML_PATH;

        if self
            .runner
            .run_cmd(Command::shell(format!("sudo diff -u {} {}.new", conf, conf)))
            .await
            .is_err()
        {
            info!("kubeadm config has changed");
            return true;
        }

        let cp = match cc.primary() {
            Ok(cp) => cp,
            Err(_) => return true,
        };
        match self.probe.apiserver_status(&cp.ip, cp.port).await {
            Ok(MachineState::Running) => {}
            _ => {
                info!("apiserver is not running");
                return true;
            }
        }

        for (name, label, value) in APPS_BY_LAYER {
            match view.pods_running(label, value).await {
                Ok(true) => {}
                _ => {
                    info!(app = name, "expected app is not running");
                    return true;
                }
            }
        }

        match view.apiserver_version().await {
            Ok(version) => {
                let requested = cc
                    .kubernetes_config
                    .kubernetes_version
                    .trim_start_matches('v');
                if version.trim_start_matches('v') != requested {
                    info!(running = %version, requested, "apiserver version differs");
                    return true;
                }
            }
            Err(_) => return true,
        }

        let machine = cc.machine_name(cp);
        match view.node_pressures(&machine).await {
            Ok(pressures) if pressures.is_empty() => {}
            _ => {
                info!("node reports resource pressure");
                return true;
            }
        }

        false
    }

    /// Legacy etcd data lived under /data/minikube; newer kubeadm expects
    /// it under the persistent dir.
    async fn create_compat_symlinks(&self) -> Result<()> {
        self.runner
            .run_cmd(Command::shell(format!(
                "sudo /bin/bash -c \"test -d /data/minikube && ln -sfn /data/minikube {}/etcd || true\"",
                constants::GUEST_PERSISTENT_DIR
            )))
            .await?;
        Ok(())
    }

    /// Re-run the kubeadm phases against an existing cluster.
    async fn restart_cluster(&self, cc: &ClusterConfig) -> Result<()> {
        self.create_compat_symlinks().await?;

        if let Ok(view) = self.view(cc).await {
            if !self.needs_reset(cc, &view).await {
                info!(cluster = %cc.name, "cluster is already running and healthy");
                return Ok(());
            }
        }

        let conf = constants::KUBEADM_YAML_PATH;
        self.clear_stale_configs(cc).await?;
        self.runner
            .run_cmd(Command::shell(format!("sudo cp {}.new {}", conf, conf)))
            .await?;

        let version = Self::version(cc)?;
        let (prefix, control_plane) = if version.minor >= 13 {
            ("init phase", "control-plane")
        } else {
            ("alpha phase", "controlplane")
        };

        let phases = [
            "certs all".to_string(),
            "kubeconfig all".to_string(),
            format!("{} all", control_plane),
            "etcd local".to_string(),
        ];

        // One at a time so a failure is attributable to its phase.
        for phase in &phases {
            let cmd = format!("{} {} {} --config {}", Self::base_cmd(cc), prefix, phase, conf);
            self.runner
                .run_cmd(Command::shell(cmd))
                .await
                .map_err(|e| Error::KubeadmPhase {
                    phase: phase.clone(),
                    message: e.to_string(),
                })?;
        }

        self.wait_for_apiserver(cc, RESTART_WAIT).await?;
        self.wait_for_system_pods(cc, RESTART_WAIT).await?;

        // Addon install races with old-pod shutdown during upgrades.
        let addon_cmd = format!("{} {} addon all --config {}", Self::base_cmd(cc), prefix, conf);
        retry_with_backoff(&RetryConfig::kubeadm_addon(), "kubeadm addon phase", || {
            self.runner.run_cmd(Command::shell(addon_cmd.clone()))
        })
        .await
        .map_err(|e| Error::KubeadmPhase {
            phase: "addon all".to_string(),
            message: e.to_string(),
        })?;

        self.adjust_resource_limits().await.ok();
        Ok(())
    }

    async fn wait_for_apiserver(&self, cc: &ClusterConfig, timeout: Duration) -> Result<()> {
        let cp = cc.primary()?;
        let deadline = Instant::now() + timeout;
        loop {
            let process_up = self
                .runner
                .run_cmd(Command::shell("sudo pgrep kube-apiserver"))
                .await
                .is_ok();
            if process_up
                && self.probe.apiserver_status(&cp.ip, cp.port).await? == MachineState::Running
            {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(Error::VerifyFailed {
                    gate: "apiserver healthz".to_string(),
                    message: format!("not healthy within {:?}", timeout),
                });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn wait_for_system_pods(&self, cc: &ClusterConfig, timeout: Duration) -> Result<()> {
        let view = self.view(cc).await?;
        let deadline = Instant::now() + timeout;
        loop {
            if view.system_pods_running().await.unwrap_or(false) {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(Error::VerifyFailed {
                    gate: "system-pods".to_string(),
                    message: format!("not running within {:?}", timeout),
                });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Whether a guest file's content differs from `content`.
    async fn guest_file_differs(&self, path: &str, content: &[u8]) -> bool {
        use sha2::Digest;
        let local = hex::encode(sha2::Sha256::digest(content));
        match self
            .runner
            .run_cmd(Command::shell(format!("sudo sha256sum {} 2>/dev/null", path)))
            .await
        {
            Ok(rr) => rr
                .stdout_str()
                .split_whitespace()
                .next()
                .map(|h| h != local)
                .unwrap_or(true),
            Err(_) => true,
        }
    }
}

/// Node labels recording which minikube produced this node and when. The
/// timestamp swaps `:`/`-` for `_` because label values may not contain
/// them.
fn node_labels(cc: &ClusterConfig) -> BTreeMap<String, String> {
    let updated = Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        .replace([':', '-'], "_");
    let mut labels = BTreeMap::new();
    labels.insert(
        "minikube.k8s.io/version".to_string(),
        format!("v{}", env!("CARGO_PKG_VERSION")),
    );
    labels.insert(
        "minikube.k8s.io/commit".to_string(),
        option_env!("COMMIT").unwrap_or("unknown").to_string(),
    );
    labels.insert("minikube.k8s.io/name".to_string(), cc.name.clone());
    labels.insert("minikube.k8s.io/updated_at".to_string(), updated);
    labels
}

#[async_trait]
impl Bootstrapper for KubeadmBootstrapper {
    async fn update_cluster(&self, cc: &ClusterConfig) -> Result<()> {
        let runtime = self.runtime(cc)?;
        if let Err(e) = runtime
            .preload(self.store.base(), &cc.kubernetes_config.kubernetes_version)
            .await
        {
            warn!(error = %e, "preload failed, falling back to image pulls");
        }

        // Whatever the image cache holds saves kubeadm a pull; only the
        // docker runtime can side-load raw tarballs this way.
        if runtime.name() == "docker" {
            let version = Self::version(cc)?;
            let images =
                constants::kubeadm_images(&cc.kubernetes_config.image_repository, &version);
            if let Err(e) =
                crate::download::load_cached_images(self.runner.as_ref(), self.store.base(), &images)
                    .await
            {
                warn!(error = %e, "loading cached images failed, kubeadm will pull");
            }
        }

        self.update_node(cc, cc.primary()?).await
    }

    async fn update_node(&self, cc: &ClusterConfig, node: &Node) -> Result<()> {
        let runtime = self.runtime(cc)?;
        let version = &cc.kubernetes_config.kubernetes_version;

        let kubeadm_cfg = templates::kubeadm_config(cc, node, &runtime.socket_path())?;
        let dropin = templates::kubelet_dropin(cc, runtime.name(), &runtime.kubelet_options())?;
        let service = templates::kubelet_service(cc)?;

        let kubelet_changed = self
            .guest_file_differs(constants::KUBELET_SYSTEMD_CONF_FILE, dropin.as_bytes())
            .await;

        let mut files = vec![
            Asset::from_bytes(
                kubeadm_cfg.into_bytes(),
                constants::GUEST_EPHEMERAL_DIR,
                "kubeadm.yaml.new",
                "0640",
            ),
            split_asset(constants::KUBELET_SYSTEMD_CONF_FILE, dropin.into_bytes(), "0644"),
            split_asset(constants::KUBELET_SERVICE_FILE, service.into_bytes(), "0644"),
        ];

        if cc.kubernetes_config.enable_default_cni {
            files.push(split_asset(
                constants::DEFAULT_CNI_CONFIG_PATH,
                templates::DEFAULT_CNI_CONFIG.as_bytes().to_vec(),
                "0644",
            ));
        }

        // Guests without systemd get the sysv wrapper instead.
        let has_systemd = self
            .runner
            .run_cmd(Command::shell("command -v systemctl"))
            .await
            .is_ok();
        if !has_systemd {
            let shim = templates::kubelet_sysv_shim(cc, &runtime.kubelet_options())?;
            files.push(split_asset("/etc/init.d/kubelet", shim.into_bytes(), "0755"));
        }

        // Binaries for this version, from the local cache.
        let bin_dir = format!("{}/binaries/{}", constants::GUEST_PERSISTENT_DIR, version);
        for name in constants::KUBE_BINARIES {
            let cached =
                constants::cached_binary_path(self.store.base(), "linux", version, name);
            if cached.exists() {
                files.push(Asset::from_file(&cached, bin_dir.as_str(), name, "0755").await?);
            } else {
                debug!(binary = name, "not cached; expecting it on the guest already");
            }
        }

        let dirs: BTreeSet<String> = files.iter().map(|f| f.target_dir().to_string()).collect();
        self.runner
            .run_cmd(Command::shell(format!(
                "sudo mkdir -p {}",
                dirs.into_iter().collect::<Vec<_>>().join(" ")
            )))
            .await?;

        for file in &files {
            self.runner.copy_file(file).await?;
        }

        if has_systemd {
            if kubelet_changed {
                self.runner
                    .run_cmd(Command::shell(
                        "sudo systemctl daemon-reload && sudo systemctl restart kubelet",
                    ))
                    .await?;
            } else {
                self.runner
                    .run_cmd(Command::shell(
                        "sudo systemctl daemon-reload && sudo systemctl start kubelet",
                    ))
                    .await?;
            }
        } else {
            self.runner
                .run_cmd(Command::shell("sudo /etc/init.d/kubelet restart"))
                .await?;
        }
        Ok(())
    }

    async fn start_cluster(&self, cc: &ClusterConfig) -> Result<()> {
        self.unpause_lingering(cc).await;

        if self.existing_config().await {
            match self.restart_cluster(cc).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "restart failed; wiping and initializing from scratch");
                    self.delete_cluster(cc).await?;
                    return self.init(cc).await;
                }
            }
        }

        match self.init(cc).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A failed init never retries as init; the only retry is
                // the full delete → init sequence, exactly once.
                warn!(error = %e, "init failed; resetting and retrying once");
                self.delete_cluster(cc).await?;
                self.init(cc).await
            }
        }
    }

    async fn wait_for_node(
        &self,
        cc: &ClusterConfig,
        node: &Node,
        timeout: Duration,
    ) -> Result<()> {
        let view = self.view(cc).await?;
        let verifier = Verifier::new(self.runner.clone(), self.probe.clone(), view, timeout);
        verifier.wait_for_node(cc, node).await
    }

    async fn join_cluster(&self, cc: &ClusterConfig, node: &Node, join_cmd: &str) -> Result<()> {
        let ignore = Self::ignore_preflight(cc).join(",");
        let cmd = format!(
            "sudo {} --node-name={} --ignore-preflight-errors={}",
            join_cmd.trim(),
            cc.machine_name(node),
            ignore
        );
        self.runner.run_cmd(Command::shell(cmd)).await?;
        Ok(())
    }

    async fn generate_token(&self, cc: &ClusterConfig) -> Result<String> {
        let rr = self
            .runner
            .run_cmd(Command::shell(format!(
                "{} token create --print-join-command --ttl=0",
                Self::base_cmd(cc)
            )))
            .await?;
        let joined = rr
            .stdout_str()
            .lines()
            .find(|l| l.contains("kubeadm join"))
            .map(|l| l.trim().to_string())
            .ok_or_else(|| Error::config("no join command in kubeadm output"))?;
        Ok(joined)
    }

    async fn delete_cluster(&self, cc: &ClusterConfig) -> Result<()> {
        let cmd = format!("{} reset --force", Self::base_cmd(cc));
        self.runner
            .run_cmd(Command::shell(cmd))
            .await
            .map_err(|e| Error::KubeadmReset {
                message: e.to_string(),
            })?;
        self.invalidate_view().await;
        Ok(())
    }

    async fn setup_certs(&self, cc: &ClusterConfig) -> Result<()> {
        let cp = cc.primary()?;
        let auth = crate::certs::AuthOptions::new(self.store.certs_dir(), cc.machine_name(cp));

        for (src, name) in [
            (auth.ca_cert_path(), "ca.crt"),
            (auth.client_cert_path(), "client.crt"),
            (auth.client_key_path(), "client.key"),
        ] {
            let asset = Asset::from_file(&src, constants::GUEST_CERTS_DIR, name, "0644").await?;
            self.runner.copy_file(&asset).await?;
        }
        Ok(())
    }

    fn log_commands(&self, opts: &LogOptions) -> BTreeMap<String, String> {
        let mut kubelet = String::from("journalctl -u kubelet");
        if opts.lines > 0 {
            kubelet.push_str(&format!(" -n {}", opts.lines));
        }
        if opts.follow {
            kubelet.push_str(" -f");
        }

        let mut dmesg =
            String::from("sudo dmesg -PH -L=never --level warn,err,crit,alert,emerg");
        if opts.follow {
            dmesg.push_str(" --follow");
        }
        if opts.lines > 0 {
            dmesg.push_str(&format!(" | tail -n {}", opts.lines));
        }

        let mut cmds = BTreeMap::new();
        cmds.insert("kubelet".to_string(), kubelet);
        cmds.insert("dmesg".to_string(), dmesg);
        cmds
    }

    async fn kubelet_status(&self) -> Result<MachineState> {
        let rr = self
            .runner
            .run_cmd(Command::shell("sudo systemctl is-active kubelet"))
            .await;
        let text = match &rr {
            Ok(rr) => rr.stdout_str().trim().to_string(),
            Err(crate::runner::RunError::CommandFailed { result }) => {
                result.stdout_str().trim().to_string()
            }
            Err(_) => return Ok(MachineState::Error),
        };
        Ok(match text.as_str() {
            "active" => MachineState::Running,
            "inactive" => MachineState::Stopped,
            "activating" => MachineState::Starting,
            _ => MachineState::Error,
        })
    }

    async fn apiserver_status(&self, ip: &str, port: u16) -> Result<MachineState> {
        self.probe.apiserver_status(ip, port).await
    }
}

/// Build an asset from a full guest path plus content.
fn split_asset(path: &str, content: Vec<u8>, perms: &str) -> Asset {
    let (dir, name) = path.rsplit_once('/').unwrap_or(("/", path));
    let dir = if dir.is_empty() { "/" } else { dir };
    Asset::from_bytes(content, dir, name, perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_verify_components, KubernetesConfig};
    use crate::driver::DriverTag;
    use crate::k8s::{MockApiserverProbe, MockClusterView};
    use crate::runner::FakeRunner;

    fn sample_cc() -> ClusterConfig {
        ClusterConfig {
            name: "t1".to_string(),
            driver: DriverTag::Docker,
            nodes: vec![Node {
                name: String::new(),
                ip: "192.168.49.2".to_string(),
                port: 8443,
                kubernetes_version: "v1.18.0".to_string(),
                control_plane: true,
                worker: true,
            }],
            kubernetes_config: KubernetesConfig {
                kubernetes_version: "v1.18.0".to_string(),
                container_runtime: "docker".to_string(),
                service_cidr: "10.96.0.0/12".to_string(),
                node_ip: "192.168.49.2".to_string(),
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

    fn healthy_view() -> MockClusterView {
        let mut view = MockClusterView::new();
        view.expect_pods_running().returning(|_, _| Ok(true));
        view.expect_apiserver_version()
            .returning(|| Ok("v1.18.0".to_string()));
        view.expect_node_pressures().returning(|_| Ok(vec![]));
        view.expect_system_pods_running().returning(|| Ok(true));
        view.expect_elevate_rbac().returning(|| Ok(()));
        view.expect_label_nodes().returning(|_| Ok(()));
        view
    }

    fn healthy_probe() -> MockApiserverProbe {
        let mut probe = MockApiserverProbe::new();
        probe
            .expect_apiserver_status()
            .returning(|_, _| Ok(MachineState::Running));
        probe
    }

    fn bootstrapper(
        runner: Arc<FakeRunner>,
        view: MockClusterView,
        probe: MockApiserverProbe,
    ) -> (tempfile::TempDir, KubeadmBootstrapper) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let b = KubeadmBootstrapper::with_capabilities(
            runner,
            store,
            Arc::new(probe),
            Arc::new(view),
        );
        (dir, b)
    }

    /// Story: `start` on a fresh guest (no kubeadm.yaml) runs init, with
    /// the preflight ignore list and the rendered config.
    #[tokio::test]
    async fn fresh_guest_runs_kubeadm_init() {
        let runner = Arc::new(FakeRunner::new());
        // No existing config on the guest.
        runner.stub_failure("test -f /var/tmp/minikube/kubeadm.yaml", "", 1);

        let (_dir, b) = bootstrapper(runner.clone(), healthy_view(), healthy_probe());
        let cc = sample_cc();
        b.start_cluster(&cc).await.unwrap();

        assert!(runner.ran("kubeadm init --config /var/tmp/minikube/kubeadm.yaml"));
        assert!(runner.ran("--ignore-preflight-errors="));
        assert!(runner.ran("Swap"));
        // Config staged from the .new rendering first.
        assert!(runner.ran("cp /var/tmp/minikube/kubeadm.yaml.new /var/tmp/minikube/kubeadm.yaml"));
    }

    /// Story: idempotent restart. A healthy cluster with an unchanged
    /// config must run no kubeadm command at all.
    #[tokio::test]
    async fn healthy_restart_runs_no_kubeadm_commands() {
        let runner = Arc::new(FakeRunner::new());
        // Existing config present, diff clean (default stub exit 0).

        let (_dir, b) = bootstrapper(runner.clone(), healthy_view(), healthy_probe());
        let cc = sample_cc();
        b.start_cluster(&cc).await.unwrap();

        for cmd in runner.commands() {
            assert!(
                !cmd.contains("kubeadm init") && !cmd.contains("kubeadm.*phase"),
                "unexpected kubeadm command: {}",
                cmd
            );
        }
        assert!(!runner.ran("init phase"));
        assert!(!runner.ran("kubeadm init "));
    }

    /// Story: a changed config forces the phased restart, with the four
    /// phases in order and one at a time.
    #[tokio::test]
    async fn changed_config_runs_phases_in_order() {
        let runner = Arc::new(FakeRunner::new());
        runner.stub_failure("diff -u", "config differs", 1);

        let (_dir, b) = bootstrapper(runner.clone(), healthy_view(), healthy_probe());
        runner.stub("pgrep kube-apiserver", "1234\n");
        let cc = sample_cc();
        b.start_cluster(&cc).await.unwrap();

        let cmds = runner.commands();
        let phase_order: Vec<usize> = [
            "init phase certs all",
            "init phase kubeconfig all",
            "init phase control-plane all",
            "init phase etcd local",
            "init phase addon all",
        ]
        .iter()
        .map(|p| cmds.iter().position(|c| c.contains(p)).unwrap_or(usize::MAX))
        .collect();

        for pair in phase_order.windows(2) {
            assert!(pair[0] < pair[1], "phases out of order: {:?}", cmds);
        }
    }

    /// Story: versions before 1.13 use the `alpha phase` / `controlplane`
    /// spellings.
    #[tokio::test]
    async fn old_versions_use_alpha_phase_spelling() {
        let runner = Arc::new(FakeRunner::new());
        runner.stub_failure("diff -u", "config differs", 1);
        runner.stub("pgrep kube-apiserver", "1234\n");

        let mut view = MockClusterView::new();
        view.expect_pods_running().returning(|_, _| Ok(true));
        view.expect_apiserver_version()
            .returning(|| Ok("v1.12.3".to_string()));
        view.expect_node_pressures().returning(|_| Ok(vec![]));
        view.expect_system_pods_running().returning(|| Ok(true));

        let (_dir, b) = bootstrapper(runner.clone(), view, healthy_probe());
        let mut cc = sample_cc();
        cc.kubernetes_config.kubernetes_version = "v1.12.3".to_string();
        cc.nodes[0].kubernetes_version = "v1.12.3".to_string();
        b.start_cluster(&cc).await.unwrap();

        assert!(runner.ran("alpha phase certs all"));
        assert!(runner.ran("alpha phase controlplane all"));
        assert!(!runner.ran("init phase"));
    }

    /// Story: a failed init retries exactly once, as delete → init, never
    /// as a bare init rerun.
    #[tokio::test]
    async fn failed_init_resets_then_retries_once() {
        let runner = Arc::new(FakeRunner::new());
        runner.stub_failure("test -f /var/tmp/minikube/kubeadm.yaml", "", 1);
        runner.stub_failure("kubeadm init --config", "preflight failure", 1);

        let (_dir, b) = bootstrapper(runner.clone(), healthy_view(), healthy_probe());
        let cc = sample_cc();
        let err = b.start_cluster(&cc).await.unwrap_err();
        assert!(matches!(err, Error::KubeadmInit { .. }));

        let cmds = runner.commands();
        let inits = cmds.iter().filter(|c| c.contains("kubeadm init --config")).count();
        let resets = cmds.iter().filter(|c| c.contains("reset --force")).count();
        assert_eq!(inits, 2, "init must run exactly twice: {:?}", cmds);
        assert_eq!(resets, 1, "reset must run exactly once: {:?}", cmds);

        // The reset happens between the two init attempts.
        let first_init = cmds.iter().position(|c| c.contains("kubeadm init")).unwrap();
        let reset = cmds.iter().position(|c| c.contains("reset --force")).unwrap();
        assert!(first_init < reset);
    }

    /// Story: update_node renders the config to kubeadm.yaml.new and
    /// installs the kubelet units, then starts the kubelet.
    #[tokio::test]
    async fn update_node_stages_config_and_kubelet() {
        let runner = Arc::new(FakeRunner::new());
        runner.stub("command -v systemctl", "/usr/bin/systemctl\n");

        let (_dir, b) = bootstrapper(runner.clone(), healthy_view(), healthy_probe());
        let cc = sample_cc();
        b.update_node(&cc, &cc.nodes[0]).await.unwrap();

        let copied = runner.copied_paths();
        assert!(copied.contains(&"/var/tmp/minikube/kubeadm.yaml.new".to_string()));
        assert!(copied
            .contains(&"/etc/systemd/system/kubelet.service.d/10-kubeadm.conf".to_string()));
        assert!(copied.contains(&"/lib/systemd/system/kubelet.service".to_string()));
        assert!(runner.ran("mkdir -p"));
        assert!(runner.ran("systemctl daemon-reload"));

        let config = runner
            .copied_content("/var/tmp/minikube/kubeadm.yaml.new")
            .unwrap();
        let config = String::from_utf8(config).unwrap();
        assert!(config.contains("advertiseAddress: 192.168.49.2"));
    }

    /// Story: stale kubeconfigs referencing a different endpoint are
    /// cleared before init so kubeadm doesn't trip over them.
    #[tokio::test]
    async fn init_clears_stale_configs_first() {
        let runner = Arc::new(FakeRunner::new());
        runner.stub_failure("test -f /var/tmp/minikube/kubeadm.yaml", "", 1);

        let (_dir, b) = bootstrapper(runner.clone(), healthy_view(), healthy_probe());
        let cc = sample_cc();
        b.start_cluster(&cc).await.unwrap();

        assert!(runner.ran("grep -qF https://192.168.49.2:8443 /etc/kubernetes/admin.conf"));
        assert!(runner.ran("/etc/kubernetes/kubelet.conf"));
        assert!(runner.ran("/etc/kubernetes/controller-manager.conf"));
        assert!(runner.ran("/etc/kubernetes/scheduler.conf"));
    }

    /// Story: setup_certs materializes the shared CA and client pair in
    /// the guest certs directory.
    #[tokio::test]
    async fn setup_certs_copies_the_shared_pair() {
        let runner = Arc::new(FakeRunner::new());
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let certs_dir = store.certs_dir();
        std::fs::create_dir_all(&certs_dir).unwrap();
        for name in ["ca.pem", "cert.pem", "key.pem"] {
            std::fs::write(certs_dir.join(name), "PEM").unwrap();
        }

        let b = KubeadmBootstrapper::with_capabilities(
            runner.clone(),
            store,
            Arc::new(healthy_probe()),
            Arc::new(healthy_view()),
        );
        b.setup_certs(&sample_cc()).await.unwrap();

        let copied = runner.copied_paths();
        assert!(copied.contains(&"/var/lib/minikube/certs/ca.crt".to_string()));
        assert!(copied.contains(&"/var/lib/minikube/certs/client.crt".to_string()));
        assert!(copied.contains(&"/var/lib/minikube/certs/client.key".to_string()));
    }

    #[tokio::test]
    async fn generate_token_extracts_join_command() {
        let runner = Arc::new(FakeRunner::new());
        runner.stub(
            "token create --print-join-command",
            "kubeadm join 192.168.49.2:8443 --token abc.def --discovery-token-ca-cert-hash sha256:123\n",
        );

        let (_dir, b) = bootstrapper(runner.clone(), healthy_view(), healthy_probe());
        let cc = sample_cc();
        let join = b.generate_token(&cc).await.unwrap();
        assert!(join.starts_with("kubeadm join 192.168.49.2:8443"));
    }

    #[tokio::test]
    async fn kubelet_status_maps_systemctl_output() {
        let runner = Arc::new(FakeRunner::new());
        runner.stub("is-active kubelet", "active\n");

        let (_dir, b) = bootstrapper(runner.clone(), healthy_view(), healthy_probe());
        assert_eq!(b.kubelet_status().await.unwrap(), MachineState::Running);
    }

    #[test]
    fn log_commands_respect_options() {
        let runner = Arc::new(FakeRunner::new());
        let (_dir, b) = bootstrapper(runner, MockClusterView::new(), MockApiserverProbe::new());

        let cmds = b.log_commands(&LogOptions { lines: 50, follow: true });
        assert_eq!(
            cmds.get("kubelet").unwrap(),
            "journalctl -u kubelet -n 50 -f"
        );
        assert!(cmds.get("dmesg").unwrap().contains("--follow"));
    }

    #[test]
    fn node_label_timestamps_have_no_forbidden_chars() {
        let labels = node_labels(&sample_cc());
        let updated = labels.get("minikube.k8s.io/updated_at").unwrap();
        assert!(!updated.contains(':'));
        assert!(!updated.contains('-'));
        assert_eq!(labels.get("minikube.k8s.io/name").unwrap(), "t1");
    }
}
