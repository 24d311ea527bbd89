//! minikube - local Kubernetes cluster provisioning via kubeadm
//!
//! A `start` drives one pipeline: machine acquisition through a driver,
//! certificate bootstrap, container runtime preparation, kubeadm
//! init-or-restart, and component verification. Every step is an
//! idempotent unit, so a failed or repeated `start` resumes rather than
//! recreates.
//!
//! # Modules
//!
//! - [`config`] - declarative cluster configuration (the profile root)
//! - [`store`] - profile/host persistence with concurrent-access discipline
//! - [`runner`] - command and file-transfer transports into the guest
//! - [`driver`] - machine acquisition (docker/podman containers, ssh, none)
//! - [`certs`] - CA, client and per-machine server certificates
//! - [`cruntime`] - container runtime management inside the guest
//! - [`bootstrapper`] - kubeadm rendering, init-vs-restart, phased repair
//! - [`kverify`] - component health gates and node-condition checks
//! - [`node`] - the top-level start/stop/delete/status orchestration
//! - [`download`] - binary and image caches
//! - [`addons`] - per-profile addon toggles
//! - [`machine`] - host records and the machine create sequence
//! - [`k8s`] - narrow Kubernetes API capabilities
//! - [`error`] - error kinds and their exit codes

pub mod addons;
pub mod assets;
pub mod bootstrapper;
pub mod certs;
pub mod config;
pub mod constants;
pub mod cruntime;
pub mod download;
pub mod driver;
pub mod error;
pub mod k8s;
pub mod kubeconfig;
pub mod kverify;
pub mod lock;
pub mod machine;
pub mod node;
pub mod retry;
pub mod runner;
pub mod store;
pub mod util;

pub use error::{Error, Result};
