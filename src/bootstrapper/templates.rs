//! Rendered guest assets: kubeadm configs, kubelet units, CNI manifests
//!
//! Templates are selected by the kubeadm config API version the target
//! Kubernetes release understands: v1alpha1 up to 1.11, v1alpha3 for
//! 1.12/1.13, v1beta1 from 1.14. Rendering is deterministic — option maps
//! are ordered and nothing stamps a timestamp — so identical inputs give
//! byte-identical output and restart can diff configs meaningfully.

use minijinja::{context, Environment, UndefinedBehavior};
use semver::Version;

use crate::config::{ClusterConfig, Node};
use crate::{constants, util, Error, Result};

use super::extraargs::{component_args, kubeadm_extra_flags, parse_feature_gates, ComponentArgs};

/// Kubeadm config for v1.14+.
const KUBEADM_V1BETA1: &str = r#"apiVersion: kubeadm.k8s.io/v1beta1
kind: InitConfiguration
localAPIEndpoint:
  advertiseAddress: {{ advertise_address }}
  bindPort: {{ api_server_port }}
bootstrapTokens:
  - groups:
      - system:bootstrappers:kubeadm:default-node-token
    ttl: 24h0m0s
    usages:
      - signing
      - authentication
nodeRegistration:
  criSocket: {{ cri_socket }}
  name: "{{ node_name }}"
  taints: []
---
apiVersion: kubeadm.k8s.io/v1beta1
kind: ClusterConfiguration
{%- if image_repository %}
imageRepository: {{ image_repository }}
{%- endif %}
apiServer:
  certSANs: ["127.0.0.1", "localhost", "{{ advertise_address }}"]
{%- for component in components %}
{{ component.name }}:
  extraArgs:
{%- for option in component.options %}
    {{ option.key }}: "{{ option.value }}"
{%- endfor %}
{%- endfor %}
{%- if feature_gates %}
featureGates:
{%- for gate in feature_gates %}
  {{ gate.key }}: {{ gate.value }}
{%- endfor %}
{%- endif %}
certificatesDir: {{ cert_dir }}
clusterName: kubernetes
controlPlaneEndpoint: localhost:{{ api_server_port }}
dns:
  type: CoreDNS
etcd:
  local:
    dataDir: {{ etcd_data_dir }}
kubernetesVersion: {{ kubernetes_version }}
networking:
  dnsDomain: cluster.local
  podSubnet: ""
  serviceSubnet: {{ service_cidr }}
"#;

/// Kubeadm config for 1.12 and 1.13.
const KUBEADM_V1ALPHA3: &str = r#"apiVersion: kubeadm.k8s.io/v1alpha3
kind: InitConfiguration
apiEndpoint:
  advertiseAddress: {{ advertise_address }}
  bindPort: {{ api_server_port }}
bootstrapTokens:
  - groups:
      - system:bootstrappers:kubeadm:default-node-token
    ttl: 24h0m0s
    usages:
      - signing
      - authentication
nodeRegistration:
  criSocket: {{ cri_socket }}
  name: {{ node_name }}
  taints: []
---
apiVersion: kubeadm.k8s.io/v1alpha3
kind: ClusterConfiguration
{%- if image_repository %}
imageRepository: {{ image_repository }}
{%- endif %}
apiServerCertSANs: ["127.0.0.1", "localhost", "{{ advertise_address }}"]
{%- for component in components %}
{{ component.name }}:
{%- for option in component.options %}
  {{ option.key }}: "{{ option.value }}"
{%- endfor %}
{%- endfor %}
{%- if feature_gates %}
featureGates:
{%- for gate in feature_gates %}
  {{ gate.key }}: {{ gate.value }}
{%- endfor %}
{%- endif %}
certificatesDir: {{ cert_dir }}
clusterName: kubernetes
controlPlaneEndpoint: localhost:{{ api_server_port }}
etcd:
  local:
    dataDir: {{ etcd_data_dir }}
kubernetesVersion: {{ kubernetes_version }}
networking:
  dnsDomain: cluster.local
  podSubnet: ""
  serviceSubnet: {{ service_cidr }}
"#;

/// Kubeadm config for 1.11 and older.
const KUBEADM_V1ALPHA1: &str = r#"apiVersion: kubeadm.k8s.io/v1alpha1
kind: MasterConfiguration
api:
  advertiseAddress: {{ advertise_address }}
  bindPort: {{ api_server_port }}
  controlPlaneEndpoint: localhost
kubernetesVersion: {{ kubernetes_version }}
certificatesDir: {{ cert_dir }}
networking:
  serviceSubnet: {{ service_cidr }}
etcd:
  dataDir: {{ etcd_data_dir }}
nodeName: {{ node_name }}
{%- if cri_socket %}
criSocket: {{ cri_socket }}
{%- endif %}
{%- if image_repository %}
imageRepository: {{ image_repository }}
{%- endif %}
{%- if no_taint_master %}
noTaintMaster: true
{%- endif %}
{%- for component in components %}
{{ component.name }}:
{%- for option in component.options %}
  {{ option.key }}: "{{ option.value }}"
{%- endfor %}
{%- endfor %}
"#;

/// Kubelet systemd drop-in with the full flag set.
const KUBELET_DROPIN: &str = r#"[Unit]
Wants={{ container_runtime_unit }}

[Service]
ExecStart=
ExecStart={{ kubelet_path }}{% if extra_options %} {{ extra_options }}{% endif %}

[Install]
"#;

/// Kubelet service unit.
const KUBELET_SERVICE: &str = r#"[Unit]
Description=kubelet: The Kubernetes Node Agent
Documentation=http://kubernetes.io/docs/

[Service]
ExecStart={{ kubelet_path }}
Restart=always
StartLimitInterval=0
RestartSec=10

[Install]
WantedBy=multi-user.target
"#;

/// Init-shim wrapper for guests without systemd: runs the kubelet under
/// nohup and records its pid so stop can find it.
const KUBELET_SYSV_SHIM: &str = r#"#!/bin/bash
# openrc/sysv wrapper for guests without systemd
PIDFILE=/var/run/kubelet.pid
BINARY={{ kubelet_path }}

case "$1" in
  start)
    nohup ${BINARY}{% if extra_options %} {{ extra_options }}{% endif %} >/var/log/kubelet.log 2>&1 &
    echo $! > ${PIDFILE}
    ;;
  stop)
    [ -f ${PIDFILE} ] && kill "$(cat ${PIDFILE})" && rm -f ${PIDFILE}
    ;;
  restart)
    $0 stop
    $0 start
    ;;
  *)
    echo "usage: $0 {start|stop|restart}"
    exit 1
    ;;
esac
"#;

/// Pod-network overlay for KIC drivers, derived from kind's kindnet.
const KINDNET_MANIFEST: &str = r#"apiVersion: v1
kind: ServiceAccount
metadata:
  name: kindnet
  namespace: kube-system
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: kindnet
rules:
  - apiGroups: [""]
    resources: ["nodes"]
    verbs: ["list", "watch", "patch"]
  - apiGroups: [""]
    resources: ["configmaps"]
    verbs: ["get"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: kindnet
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: kindnet
subjects:
  - kind: ServiceAccount
    name: kindnet
    namespace: kube-system
---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: kindnet
  namespace: kube-system
  labels:
    app: kindnet
    k8s-app: kindnet
spec:
  selector:
    matchLabels:
      app: kindnet
  template:
    metadata:
      labels:
        app: kindnet
        k8s-app: kindnet
    spec:
      hostNetwork: true
      serviceAccountName: kindnet
      tolerations:
        - operator: Exists
          effect: NoSchedule
      containers:
        - name: kindnet-cni
          image: {{ image }}
          env:
            - name: HOST_IP
              valueFrom:
                fieldRef:
                  fieldPath: status.hostIP
            - name: POD_IP
              valueFrom:
                fieldRef:
                  fieldPath: status.podIP
            - name: POD_SUBNET
              value: {{ pod_subnet }}
          volumeMounts:
            - name: cni-cfg
              mountPath: /etc/cni/net.d
            - name: xtables-lock
              mountPath: /run/xtables.lock
              readOnly: false
          resources:
            requests:
              cpu: "100m"
              memory: "50Mi"
            limits:
              cpu: "100m"
              memory: "50Mi"
          securityContext:
            privileged: false
            capabilities:
              add: ["NET_RAW", "NET_ADMIN"]
      volumes:
        - name: cni-cfg
          hostPath:
            path: /etc/cni/net.d
        - name: xtables-lock
          hostPath:
            path: /run/xtables.lock
            type: FileOrCreate
"#;

/// Fallback bridge CNI config so the kubelet can start pods before any
/// network addon is applied.
pub const DEFAULT_CNI_CONFIG: &str = r#"{
  "cniVersion": "0.3.0",
  "name": "rkt.kubernetes.io",
  "type": "bridge",
  "bridge": "mybridge",
  "mtu": 1460,
  "addIf": "true",
  "isGateway": true,
  "ipMasq": true,
  "ipam": {
    "type": "host-local",
    "subnet": "10.1.0.0/16",
    "gateway": "10.1.0.1",
    "routes": [
      {
        "dst": "0.0.0.0/0"
      }
    ]
  }
}
"#;

fn engine() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

fn render(template: &str, ctx: minijinja::value::Value) -> Result<String> {
    engine()
        .render_str(template, ctx)
        .map_err(|e| Error::config(format!("rendering template: {}", e)))
}

/// Inputs shared by the kubeadm config templates.
struct KubeadmContext<'a> {
    version: &'a Version,
    cc: &'a ClusterConfig,
    node: &'a Node,
    cri_socket: String,
}

/// Render the kubeadm config for a node, selecting the template by the
/// config API version the release understands.
pub fn kubeadm_config(
    cc: &ClusterConfig,
    node: &Node,
    cri_socket: &str,
) -> Result<String> {
    let version = util::parse_kubernetes_version(&cc.kubernetes_config.kubernetes_version)?;
    let ctx = KubeadmContext {
        version: &version,
        cc,
        node,
        cri_socket: cri_socket.to_string(),
    };

    if version.minor >= 14 {
        render_kubeadm(&ctx, KUBEADM_V1BETA1, ConfigStyle::Beta)
    } else if version.minor >= 12 {
        render_kubeadm(&ctx, KUBEADM_V1ALPHA3, ConfigStyle::Alpha)
    } else {
        render_kubeadm(&ctx, KUBEADM_V1ALPHA1, ConfigStyle::Alpha)
    }
}

/// How component extra-args blocks are named in the target template.
#[derive(Clone, Copy, PartialEq)]
enum ConfigStyle {
    /// v1beta1: `apiServer:` block with nested `extraArgs:`.
    Beta,
    /// v1alpha1/v1alpha3: `apiServerExtraArgs:` flat maps.
    Alpha,
}

fn render_kubeadm(ctx: &KubeadmContext<'_>, template: &str, style: ConfigStyle) -> Result<String> {
    let k8s = &ctx.cc.kubernetes_config;
    let (kubeadm_gates, component_gates) = parse_feature_gates(&k8s.feature_gates)?;

    let components: Vec<ComponentArgs> = component_args(
        &k8s.extra_options,
        &component_gates,
        style == ConfigStyle::Beta,
    );

    // Gates kubeadm consumes directly (e.g. CoreDNS) render as a
    // featureGates map; ordering comes from the BTreeMap.
    let feature_gates: Vec<super::extraargs::KeyValue> = kubeadm_gates
        .into_iter()
        .map(|(key, enabled)| super::extraargs::KeyValue {
            key,
            value: enabled.to_string(),
        })
        .collect();

    let node_name = if ctx.node.name.is_empty() {
        ctx.cc.name.clone()
    } else {
        ctx.cc.machine_name(ctx.node)
    };

    let advertise = if k8s.node_ip.is_empty() {
        ctx.node.ip.clone()
    } else {
        k8s.node_ip.clone()
    };

    let service_cidr = if k8s.service_cidr.is_empty() {
        constants::DEFAULT_SERVICE_CIDR.to_string()
    } else {
        k8s.service_cidr.clone()
    };

    render(
        template,
        context! {
            advertise_address => advertise,
            api_server_port => k8s.node_port,
            cri_socket => ctx.cri_socket,
            node_name => node_name,
            image_repository => k8s.image_repository,
            cert_dir => constants::GUEST_CERTS_DIR,
            etcd_data_dir => format!("{}/etcd", constants::GUEST_PERSISTENT_DIR),
            kubernetes_version => format!("v{}", ctx.version),
            service_cidr => service_cidr,
            components => components,
            feature_gates => feature_gates,
            // Untainting the master stopped working with 1.12+, so only
            // the legacy template consumes this.
            no_taint_master => ctx.version.minor >= 10,
        },
    )
}

/// Render the kubelet systemd drop-in with runtime and user flags merged.
pub fn kubelet_dropin(
    cc: &ClusterConfig,
    runtime_name: &str,
    runtime_options: &std::collections::BTreeMap<String, String>,
) -> Result<String> {
    let k8s = &cc.kubernetes_config;
    let mut options = runtime_options.clone();

    for opt in &k8s.extra_options {
        if opt.component == "kubelet" {
            options.insert(opt.key.clone(), opt.value.clone());
        }
    }
    if !k8s.network_plugin.is_empty() {
        options.insert("network-plugin".to_string(), k8s.network_plugin.clone());
    }
    let (_, component_gates) = parse_feature_gates(&k8s.feature_gates)?;
    if !component_gates.is_empty() {
        options.insert("feature-gates".to_string(), component_gates);
    }

    let unit = match runtime_name {
        "docker" => "docker.socket",
        "containerd" => "containerd.service",
        _ => "crio.service",
    };

    render(
        KUBELET_DROPIN,
        context! {
            container_runtime_unit => unit,
            kubelet_path => constants::guest_bin_path("kubelet", &k8s.kubernetes_version),
            extra_options => kubeadm_extra_flags(&options),
        },
    )
}

/// Render the kubelet service unit.
pub fn kubelet_service(cc: &ClusterConfig) -> Result<String> {
    render(
        KUBELET_SERVICE,
        context! {
            kubelet_path => constants::guest_bin_path(
                "kubelet",
                &cc.kubernetes_config.kubernetes_version,
            ),
        },
    )
}

/// Render the sysv shim for guests without systemd.
pub fn kubelet_sysv_shim(
    cc: &ClusterConfig,
    options: &std::collections::BTreeMap<String, String>,
) -> Result<String> {
    render(
        KUBELET_SYSV_SHIM,
        context! {
            kubelet_path => constants::guest_bin_path(
                "kubelet",
                &cc.kubernetes_config.kubernetes_version,
            ),
            extra_options => kubeadm_extra_flags(options),
        },
    )
}

/// Render the kindnet CNI overlay manifest.
pub fn kindnet_manifest(pod_subnet: &str) -> Result<String> {
    render(
        KINDNET_MANIFEST,
        context! {
            image => constants::KINDNET_IMAGE,
            pod_subnet => pod_subnet,
        },
    )
}
