//! Small shared helpers: version parsing, CIDR validation, shell quoting.

use semver::Version;

use crate::{Error, Result};

/// Parse a Kubernetes version string, with or without the `v` prefix.
///
/// "v1.15.2" and "1.15.2" are accepted; "v1" is rejected (a full
/// major.minor.patch is required so kubeadm templates can be selected).
pub fn parse_kubernetes_version(version: &str) -> Result<Version> {
    let trimmed = version.strip_prefix('v').unwrap_or(version);
    Version::parse(trimmed)
        .map_err(|e| Error::config(format!("invalid kubernetes version \"{}\": {}", version, e)))
}

/// Validate an IPv4 CIDR like "10.96.0.0/12".
pub fn validate_cidr(cidr: &str) -> Result<()> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::config(format!("invalid CIDR \"{}\": missing prefix", cidr)))?;
    addr.parse::<std::net::Ipv4Addr>()
        .map_err(|e| Error::config(format!("invalid CIDR \"{}\": {}", cidr, e)))?;
    let bits: u8 = prefix
        .parse()
        .map_err(|_| Error::config(format!("invalid CIDR \"{}\": bad prefix", cidr)))?;
    if bits > 32 {
        return Err(Error::config(format!(
            "invalid CIDR \"{}\": prefix {} out of range",
            cidr, bits
        )));
    }
    Ok(())
}

/// Quote a single argument for inclusion in a remote shell command line.
///
/// Arguments containing only safe characters pass through unchanged;
/// everything else is single-quoted with embedded quotes escaped.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Join argv into a remote shell command line, quoting each argument.
pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_v_prefixed_and_bare_versions() {
        assert_eq!(parse_kubernetes_version("v1.15.2").unwrap().minor, 15);
        assert_eq!(parse_kubernetes_version("1.15.2").unwrap().minor, 15);
    }

    #[test]
    fn rejects_partial_versions() {
        assert!(parse_kubernetes_version("v1").is_err());
        assert!(parse_kubernetes_version("latest").is_err());
    }

    #[test]
    fn accepts_valid_cidrs_and_rejects_bad_prefixes() {
        assert!(validate_cidr("10.96.0.0/12").is_ok());
        assert!(validate_cidr("10.96.0.0/33").is_err());
        assert!(validate_cidr("10.96.0.0").is_err());
        assert!(validate_cidr("not-an-ip/8").is_err());
    }

    #[test]
    fn quoting_leaves_safe_args_alone() {
        assert_eq!(shell_quote("--config=/var/tmp/minikube/kubeadm.yaml"), "--config=/var/tmp/minikube/kubeadm.yaml");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn join_builds_a_runnable_line() {
        let args = vec!["echo".to_string(), "hello world".to_string()];
        assert_eq!(shell_join(&args), "echo 'hello world'");
    }
}
