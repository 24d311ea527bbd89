//! Extra-config and feature-gate plumbing
//!
//! `--extra-config=component.key=value` entries are routed to the right
//! component block of the kubeadm config, merged with feature gates, and
//! converted to ordered flag strings for the kubelet and kubeadm CLIs.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::ExtraOption;
use crate::{Error, Result};

/// Feature gates kubeadm itself understands; everything else is passed to
/// the components as a `feature-gates` flag.
const KUBEADM_FEATURE_GATES: [&str; 1] = ["CoreDNS"];

/// Components that receive extra-args blocks in the kubeadm config.
const CONFIG_COMPONENTS: [&str; 3] = ["apiserver", "controller-manager", "scheduler"];

/// One rendered key/value option, ordered for deterministic output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyValue {
    /// Flag name without dashes.
    pub key: String,
    /// Flag value.
    pub value: String,
}

/// Extra args for one component block of the kubeadm config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentArgs {
    /// Block name in the target template dialect.
    pub name: String,
    /// Ordered options.
    pub options: Vec<KeyValue>,
}

/// Split a "Gate=bool,Gate2=bool" string into the gates kubeadm consumes
/// directly and the string passed to components via `feature-gates`.
pub fn parse_feature_gates(gates: &str) -> Result<(BTreeMap<String, bool>, String)> {
    let mut kubeadm_gates = BTreeMap::new();
    let mut component_gates = Vec::new();

    for entry in gates.split(',').filter(|e| !e.is_empty()) {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| Error::config(format!("invalid feature gate \"{}\"", entry)))?;
        let enabled: bool = value
            .parse()
            .map_err(|_| Error::config(format!("invalid feature gate value \"{}\"", entry)))?;

        if KUBEADM_FEATURE_GATES.contains(&name) {
            kubeadm_gates.insert(name.to_string(), enabled);
        } else {
            component_gates.push(format!("{}={}", name, enabled));
        }
    }

    Ok((kubeadm_gates, component_gates.join(",")))
}

/// Map a CLI component tag to its block name in the config template.
fn block_name(component: &str, beta_style: bool) -> String {
    if beta_style {
        match component {
            "apiserver" => "apiServer".to_string(),
            "controller-manager" => "controllerManager".to_string(),
            "scheduler" => "scheduler".to_string(),
            other => other.to_string(),
        }
    } else {
        match component {
            "apiserver" => "apiServerExtraArgs".to_string(),
            "controller-manager" => "controllerManagerExtraArgs".to_string(),
            "scheduler" => "schedulerExtraArgs".to_string(),
            other => format!("{}ExtraArgs", other),
        }
    }
}

/// Build the per-component extra-args blocks for the kubeadm config.
///
/// Component feature gates are appended to every block so all three
/// control-plane components agree on them.
pub fn component_args(
    extra: &[ExtraOption],
    component_gates: &str,
    beta_style: bool,
) -> Vec<ComponentArgs> {
    let mut blocks = Vec::new();
    for component in CONFIG_COMPONENTS {
        let mut options: BTreeMap<String, String> = BTreeMap::new();
        for opt in extra {
            if opt.component == component {
                options.insert(opt.key.clone(), opt.value.clone());
            }
        }
        if !component_gates.is_empty() {
            options.insert("feature-gates".to_string(), component_gates.to_string());
        }
        if options.is_empty() {
            continue;
        }
        blocks.push(ComponentArgs {
            name: block_name(component, beta_style),
            options: options
                .into_iter()
                .map(|(key, value)| KeyValue { key, value })
                .collect(),
        });
    }
    blocks
}

/// Convert an option map to an ordered `--key=value` flag string.
pub fn kubeadm_extra_flags(options: &BTreeMap<String, String>) -> String {
    options
        .iter()
        .map(|(k, v)| format!("--{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Flags applied to the `kubeadm init` command line itself
/// (component tag "kubeadm").
pub fn kubeadm_cli_flags(extra: &[ExtraOption]) -> String {
    let options: BTreeMap<String, String> = extra
        .iter()
        .filter(|o| o.component == "kubeadm")
        .map(|o| (o.key.clone(), o.value.clone()))
        .collect();
    kubeadm_extra_flags(&options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(component: &str, key: &str, value: &str) -> ExtraOption {
        ExtraOption {
            component: component.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn feature_gates_split_between_kubeadm_and_components() {
        let (kubeadm, components) =
            parse_feature_gates("CoreDNS=true,ServerSideApply=true").unwrap();
        assert_eq!(kubeadm.get("CoreDNS"), Some(&true));
        assert_eq!(components, "ServerSideApply=true");

        let (kubeadm, components) = parse_feature_gates("").unwrap();
        assert!(kubeadm.is_empty());
        assert!(components.is_empty());

        assert!(parse_feature_gates("NoEquals").is_err());
        assert!(parse_feature_gates("Gate=maybe").is_err());
    }

    #[test]
    fn component_blocks_use_the_template_dialect() {
        let extra = vec![opt("apiserver", "v", "4"), opt("controller-manager", "v", "2")];

        let beta = component_args(&extra, "", true);
        assert_eq!(beta[0].name, "apiServer");
        assert_eq!(beta[1].name, "controllerManager");

        let alpha = component_args(&extra, "", false);
        assert_eq!(alpha[0].name, "apiServerExtraArgs");
        assert_eq!(alpha[1].name, "controllerManagerExtraArgs");
    }

    #[test]
    fn gates_are_appended_to_every_block() {
        let blocks = component_args(&[], "ServerSideApply=true", true);
        assert_eq!(blocks.len(), 3);
        for block in &blocks {
            assert!(block
                .options
                .iter()
                .any(|o| o.key == "feature-gates" && o.value == "ServerSideApply=true"));
        }
    }

    #[test]
    fn no_options_means_no_blocks() {
        assert!(component_args(&[], "", true).is_empty());
    }

    #[test]
    fn flag_strings_are_ordered() {
        let mut options = BTreeMap::new();
        options.insert("zeta".to_string(), "1".to_string());
        options.insert("alpha".to_string(), "2".to_string());
        assert_eq!(kubeadm_extra_flags(&options), "--alpha=2 --zeta=1");
    }

    #[test]
    fn kubeadm_cli_flags_only_take_kubeadm_options() {
        let extra = vec![
            opt("kubeadm", "ignore-preflight-errors", "all"),
            opt("kubelet", "v", "2"),
        ];
        assert_eq!(kubeadm_cli_flags(&extra), "--ignore-preflight-errors=all");
    }
}
