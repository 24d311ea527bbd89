//! Error types for cluster lifecycle operations
//!
//! Errors are structured with fields to aid debugging: the step that failed,
//! the cluster or machine involved, and the underlying cause. The CLI maps
//! each kind to a stable exit code in [`Error::exit_code`].

use thiserror::Error;

use crate::runner::RunError;

/// Node resource-pressure categories reported by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureKind {
    /// DiskPressure condition is True
    Disk,
    /// MemoryPressure condition is True
    Memory,
    /// PIDPressure condition is True
    Pid,
    /// NetworkUnavailable condition is True
    Network,
}

impl std::fmt::Display for PressureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PressureKind::Disk => write!(f, "disk"),
            PressureKind::Memory => write!(f, "memory"),
            PressureKind::Pid => write!(f, "pid"),
            PressureKind::Network => write!(f, "network"),
        }
    }
}

/// Main error type for minikube operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// CLI invoked with an invalid shape (bad flag combination, bad argument)
    #[error("usage: {message}")]
    Usage {
        /// Description of what's wrong with the invocation
        message: String,
    },

    /// ClusterConfig invalid or corrupt on disk
    #[error("config error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// The requested driver tag is not in the registry
    #[error("driver \"{name}\" is not supported")]
    DriverNotSupported {
        /// The unknown driver tag
        name: String,
    },

    /// The driver exists but its precreate check failed
    #[error("driver \"{name}\" is not usable: {message}")]
    DriverUnavailable {
        /// Driver tag
        name: String,
        /// Why the driver cannot be used
        message: String,
    },

    /// The driver returned an error creating the guest
    #[error("creating machine \"{machine}\": {message}")]
    MachineCreateFailed {
        /// Machine name
        machine: String,
        /// The create step that failed and why
        message: String,
    },

    /// The guest did not reach the expected state within the deadline
    #[error("machine \"{machine}\" did not reach state {want} within {}s", timeout.as_secs())]
    MachineStateTimeout {
        /// Machine name
        machine: String,
        /// State we were waiting for
        want: String,
        /// How long we waited
        timeout: std::time::Duration,
    },

    /// A remote process exited non-zero, or its transport failed
    #[error(transparent)]
    CommandFailed(#[from] RunError),

    /// Certificate generation or cert-lock acquisition failed
    #[error("bootstrapping certificates: {message}")]
    CertBootstrap {
        /// What went wrong
        message: String,
    },

    /// `kubeadm init` failed
    #[error("kubeadm init: {message}")]
    KubeadmInit {
        /// Captured failure detail
        message: String,
    },

    /// `kubeadm reset` failed
    #[error("kubeadm reset: {message}")]
    KubeadmReset {
        /// Captured failure detail
        message: String,
    },

    /// An individual `kubeadm init phase` command failed during restart
    #[error("kubeadm phase \"{phase}\": {message}")]
    KubeadmPhase {
        /// The phase that failed (e.g. "certs all")
        phase: String,
        /// Captured failure detail
        message: String,
    },

    /// A verifier gate did not pass before its deadline
    #[error("verifying {gate}: {message}")]
    VerifyFailed {
        /// The gate that failed (e.g. "apiserver-health")
        gate: String,
        /// Cause description
        message: String,
    },

    /// The primary node reports a resource-pressure condition
    #[error("node \"{node}\" has {kind} pressure")]
    NodePressure {
        /// Pressure category
        kind: PressureKind,
        /// Node name reporting the condition
        node: String,
    },

    /// Operation aborted via cancellation token
    #[error("cancelled")]
    Cancelled,

    /// Cluster, host or node does not exist
    #[error("{kind} \"{name}\" does not exist")]
    NotFound {
        /// What is missing ("profile", "machine", "node")
        kind: String,
        /// The missing name
        name: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// What failed to (de)serialize
        message: String,
    },

    /// Advisory file-lock acquisition failed
    #[error("lock {path}: {message}")]
    Lock {
        /// Lock file path
        path: String,
        /// Why acquisition failed
        message: String,
    },
}

impl Error {
    /// Create a usage error
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage { message: msg.into() }
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config { message: msg.into() }
    }

    /// Create a not-found error for a profile
    pub fn profile_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "profile".to_string(),
            name: name.into(),
        }
    }

    /// Create a not-found error for a machine
    pub fn machine_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "machine".to_string(),
            name: name.into(),
        }
    }

    /// Create a cert-bootstrap error
    pub fn cert_bootstrap(msg: impl Into<String>) -> Self {
        Self::CertBootstrap { message: msg.into() }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization { message: msg.into() }
    }

    /// Stable exit code for the CLI boundary.
    ///
    /// 64 for usage errors (EX_USAGE), 85 for an unknown driver tag, 78 for
    /// invalid configuration (EX_CONFIG), 69 for an unusable driver
    /// (EX_UNAVAILABLE), 7 for missing clusters, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage { .. } => 64,
            Error::Config { .. } | Error::Serialization { .. } => 78,
            Error::DriverNotSupported { .. } => 85,
            Error::DriverUnavailable { .. } => 69,
            Error::NotFound { .. } => 7,
            _ => 1,
        }
    }

    /// Whether rerunning the same operation may succeed.
    ///
    /// Usage and config errors require the user to change something;
    /// machine, transport and verification failures may clear on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Usage { .. }
                | Error::Config { .. }
                | Error::DriverNotSupported { .. }
                | Error::Serialization { .. }
                | Error::Cancelled
        )
    }

    /// The last lines of remote stderr when a failed command is the root
    /// cause, for the CLI's human-readable rendering.
    pub fn remote_stderr_tail(&self, lines: usize) -> Option<String> {
        match self {
            Error::CommandFailed(RunError::CommandFailed { result }) => {
                let stderr = result.stderr_str();
                let tail: Vec<&str> = stderr.lines().rev().take(lines).collect();
                if tail.is_empty() {
                    None
                } else {
                    Some(tail.into_iter().rev().collect::<Vec<_>>().join("\n"))
                }
            }
            _ => None,
        }
    }
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: the CLI maps error kinds to stable exit codes so scripts can
    /// branch on them. An unknown driver tag must exit 85 and name the tag.
    #[test]
    fn unknown_driver_exits_85_and_names_the_tag() {
        let err = Error::DriverNotSupported {
            name: "parallels".to_string(),
        };
        assert_eq!(err.exit_code(), 85);
        assert!(err.to_string().contains("parallels"));
    }

    /// Story: `status` on a deleted cluster exits 7 so callers can
    /// distinguish "down" from "broken".
    #[test]
    fn missing_profile_exits_7() {
        let err = Error::profile_not_found("t1");
        assert_eq!(err.exit_code(), 7);
        assert!(err.to_string().contains("\"t1\" does not exist"));
    }

    #[test]
    fn usage_errors_exit_64() {
        assert_eq!(Error::usage("too many arguments").exit_code(), 64);
    }

    /// Story: node-pressure errors carry the pressure kind so the CLI can
    /// suggest the right flag (--disk for disk pressure on VM drivers).
    #[test]
    fn node_pressure_names_kind_and_node() {
        let err = Error::NodePressure {
            kind: PressureKind::Disk,
            node: "t1".to_string(),
        };
        assert!(err.to_string().contains("disk pressure"));
        assert!(err.to_string().contains("t1"));
        assert!(err.is_retryable());
    }

    #[test]
    fn config_errors_are_not_retryable() {
        assert!(!Error::config("bad cidr").is_retryable());
        assert!(!Error::usage("bad flag").is_retryable());
        assert!(Error::cert_bootstrap("lock timeout").is_retryable());
    }
}
