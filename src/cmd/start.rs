//! `minikube start`

use std::time::Duration;

use clap::Args;
use tracing::info;

use minikube::addons::default_addons;
use minikube::config::{
    default_verify_components, ClusterConfig, ExtraOption, KubernetesConfig, Node,
};
use minikube::driver::DriverTag;
use minikube::node::{Orchestrator, DEFAULT_START_TIMEOUT};
use minikube::store::Store;
use minikube::{constants, Error, Result};

/// Arguments for `start`.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Driver to use (docker, podman, ssh, none).
    #[arg(long)]
    pub driver: Option<String>,

    /// Kubernetes version to deploy, e.g. v1.18.0.
    #[arg(long)]
    pub kubernetes_version: Option<String>,

    /// Memory allocated to the guest, in MB.
    #[arg(long)]
    pub memory: Option<u32>,

    /// CPUs allocated to the guest.
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Disk allocated to the guest, in MB.
    #[arg(long)]
    pub disk_size: Option<u32>,

    /// Container runtime: docker, containerd or cri-o.
    #[arg(long)]
    pub container_runtime: Option<String>,

    /// Only download binaries and images; create no machine.
    #[arg(long)]
    pub download_only: bool,

    /// Proceed despite safety checks.
    #[arg(long)]
    pub force: bool,

    /// Extra component config, component.key=value. Repeatable.
    #[arg(long = "extra-config")]
    pub extra_config: Vec<String>,

    /// Wall-clock budget for the whole start, in seconds.
    #[arg(long, default_value_t = DEFAULT_START_TIMEOUT.as_secs())]
    pub wait_timeout: u64,
}

/// Load the existing profile or build a fresh config, then overlay flags.
async fn effective_config(store: &Store, profile: &str, args: &StartArgs) -> Result<ClusterConfig> {
    let mut cc = match store.load(profile).await {
        Ok(cc) => cc,
        Err(Error::NotFound { .. }) => fresh_config(profile),
        Err(e) => return Err(e),
    };

    if let Some(driver) = &args.driver {
        cc.driver = driver.parse::<DriverTag>()?;
    }
    if let Some(version) = &args.kubernetes_version {
        cc.kubernetes_config.kubernetes_version = version.clone();
        for node in &mut cc.nodes {
            node.kubernetes_version = version.clone();
        }
    }
    if let Some(memory) = args.memory {
        cc.memory_mb = memory;
    }
    if let Some(cpus) = args.cpus {
        cc.cpus = cpus;
    }
    if let Some(disk) = args.disk_size {
        cc.disk_mb = disk;
    }
    if let Some(runtime) = &args.container_runtime {
        cc.kubernetes_config.container_runtime = runtime.clone();
    }
    for entry in &args.extra_config {
        let opt: ExtraOption = entry.parse()?;
        cc.kubernetes_config.extra_options.retain(|o| {
            !(o.component == opt.component && o.key == opt.key)
        });
        cc.kubernetes_config.extra_options.push(opt);
    }

    cc.validate()?;
    Ok(cc)
}

fn fresh_config(profile: &str) -> ClusterConfig {
    ClusterConfig {
        name: profile.to_string(),
        driver: DriverTag::Docker,
        nodes: vec![Node {
            name: String::new(),
            ip: String::new(),
            port: constants::DEFAULT_API_SERVER_PORT,
            kubernetes_version: constants::DEFAULT_KUBERNETES_VERSION.to_string(),
            control_plane: true,
            worker: true,
        }],
        kubernetes_config: KubernetesConfig {
            kubernetes_version: constants::DEFAULT_KUBERNETES_VERSION.to_string(),
            container_runtime: "docker".to_string(),
            service_cidr: constants::DEFAULT_SERVICE_CIDR.to_string(),
            node_port: constants::DEFAULT_API_SERVER_PORT,
            ..Default::default()
        },
        addons: default_addons(),
        verify_components: default_verify_components(),
        memory_mb: 2048,
        cpus: 2,
        disk_mb: 20000,
        mount: false,
        mount_string: String::new(),
        http_proxy_env: proxy_env(),
    }
}

/// HTTP(S)_PROXY and NO_PROXY from the invoking shell, propagated into
/// the guest.
fn proxy_env() -> Vec<String> {
    ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"]
        .iter()
        .filter_map(|name| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| format!("{}={}", name, v))
        })
        .collect()
}

/// Run `start`; returns the process exit code.
pub async fn run(profile: &str, args: StartArgs) -> Result<i32> {
    let store = Store::default_store();
    let orchestrator = Orchestrator::new(store.clone());
    let cc = effective_config(&store, profile, &args).await?;

    if args.download_only {
        orchestrator.download_artifacts(&cc).await?;
        // Persist the profile so later runs reuse the same settings.
        store.save(&cc).await?;
        info!(cluster = %cc.name, "download complete");
        return Ok(0);
    }

    let timeout = Duration::from_secs(args.wait_timeout);
    let started = tokio::select! {
        result = orchestrator.start(cc, timeout) => result?,
        _ = tokio::signal::ctrl_c() => return Err(Error::Cancelled),
    };

    println!(
        "Done! kubectl is now configured to use \"{}\" ({} driver)",
        started.name, started.driver
    );
    Ok(0)
}
