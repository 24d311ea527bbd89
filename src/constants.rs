//! Paths, ports and image names shared across components.

use std::path::{Path, PathBuf};

use semver::Version;

/// Environment variable overriding the minikube home directory.
pub const MINIKUBE_HOME_ENV: &str = "MINIKUBE_HOME";

/// Default profile name used when `-p` is not given.
pub const DEFAULT_PROFILE: &str = "minikube";

/// Default apiserver port.
pub const DEFAULT_API_SERVER_PORT: u16 = 8443;

/// Default service CIDR handed to kubeadm.
pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";

/// Default Kubernetes version installed when none is requested.
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.18.0";

/// Port the docker daemon inside the guest listens on (mutual TLS).
pub const DOCKER_DAEMON_PORT: u16 = 2376;

/// Persistent directory inside the guest for binaries and etcd data.
pub const GUEST_PERSISTENT_DIR: &str = "/var/lib/minikube";

/// Ephemeral directory inside the guest for rendered configs.
pub const GUEST_EPHEMERAL_DIR: &str = "/var/tmp/minikube";

/// Certificates directory inside the guest.
pub const GUEST_CERTS_DIR: &str = "/var/lib/minikube/certs";

/// Path of the rendered kubeadm config inside the guest.
pub const KUBEADM_YAML_PATH: &str = "/var/tmp/minikube/kubeadm.yaml";

/// Kubelet systemd service unit path inside the guest.
pub const KUBELET_SERVICE_FILE: &str = "/lib/systemd/system/kubelet.service";

/// Kubelet systemd drop-in path inside the guest.
pub const KUBELET_SYSTEMD_CONF_FILE: &str =
    "/etc/systemd/system/kubelet.service.d/10-kubeadm.conf";

/// Default CNI config path inside the guest.
pub const DEFAULT_CNI_CONFIG_PATH: &str = "/etc/cni/net.d/k8s.conf";

/// Binaries transferred into the guest for each Kubernetes version.
pub const KUBE_BINARIES: [&str; 3] = ["kubeadm", "kubelet", "kubectl"];

/// CNI overlay image applied for container-based drivers, created by kind.
pub const KINDNET_IMAGE: &str = "kindest/kindnetd:0.5.4";

/// The minikube home directory.
///
/// `MINIKUBE_HOME` wins when set, otherwise `~/.minikube`.
pub fn minikube_home() -> PathBuf {
    if let Ok(home) = std::env::var(MINIKUBE_HOME_ENV) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".minikube")
}

/// Guest path of a cached binary for a version.
pub fn guest_bin_path(name: &str, version: &str) -> String {
    format!("{}/binaries/{}/{}", GUEST_PERSISTENT_DIR, version, name)
}

/// Local cache path of a downloaded binary.
pub fn cached_binary_path(home: &Path, os: &str, version: &str, name: &str) -> PathBuf {
    home.join("cache").join(os).join(version).join(name)
}

/// Local cache path of an image tarball; `:` is replaced by `_` so image
/// references stay valid filenames.
pub fn cached_image_path(home: &Path, image: &str) -> PathBuf {
    home.join("cache")
        .join("images")
        .join(image.replace(':', "_"))
}

/// Local path of the preloaded-images tarball for a Kubernetes version.
pub fn preload_tarball_path(home: &Path, version: &str) -> PathBuf {
    home.join("cache")
        .join("preloaded-tarball")
        .join(format!("preloaded-images-k8s-{}.tar.lz4", version))
}

/// etcd image tag matching a Kubernetes minor version.
fn etcd_tag(version: &Version) -> &'static str {
    match version.minor {
        0..=11 => "3.2.18",
        12..=13 => "3.2.24",
        14..=15 => "3.3.10",
        16 => "3.3.15-0",
        17 => "3.4.3-0",
        _ => "3.4.3-0",
    }
}

/// DNS image for a Kubernetes minor version (kube-dns before 1.12, coredns
/// after).
fn dns_image(repo: &str, version: &Version) -> String {
    if version.minor >= 12 {
        let tag = match version.minor {
            12 => "1.2.2",
            13 => "1.2.6",
            14..=15 => "1.3.1",
            16 => "1.6.2",
            17 => "1.6.5",
            _ => "1.6.7",
        };
        format!("{}/coredns:{}", repo, tag)
    } else {
        format!("{}/k8s-dns-kube-dns-amd64:1.14.13", repo)
    }
}

/// Images kubeadm pulls for a version, used to populate the image cache.
pub fn kubeadm_images(image_repository: &str, version: &Version) -> Vec<String> {
    let repo = if image_repository.is_empty() {
        "k8s.gcr.io"
    } else {
        image_repository
    };
    let v = format!("v{}", version);
    let mut images = vec![
        format!("{}/kube-apiserver:{}", repo, v),
        format!("{}/kube-controller-manager:{}", repo, v),
        format!("{}/kube-scheduler:{}", repo, v),
        format!("{}/kube-proxy:{}", repo, v),
        format!("{}/etcd:{}", repo, etcd_tag(version)),
        format!("{}/pause:3.1", repo),
    ];
    images.push(dns_image(repo, version));
    images
}

/// Download URL for a Kubernetes release binary.
pub fn binary_download_url(os: &str, arch: &str, version: &str, name: &str) -> String {
    format!(
        "https://dl.k8s.io/release/{}/bin/{}/{}/{}",
        version, os, arch, name
    )
}
