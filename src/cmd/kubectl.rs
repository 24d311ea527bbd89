//! `minikube kubectl` — run the kubectl matching the cluster version

use clap::Args;

use minikube::runner::{Command, CommandRunner, ExecRunner, RunError};
use minikube::store::Store;
use minikube::{constants, Result};

/// Arguments for `kubectl`.
#[derive(Args, Debug)]
pub struct KubectlArgs {
    /// Arguments passed through to kubectl.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Run `kubectl`; the child's exit code is inherited.
pub async fn run(profile: &str, args: KubectlArgs) -> Result<i32> {
    let store = Store::default_store();
    let cc = store.load(profile).await?;
    let version = &cc.kubernetes_config.kubernetes_version;

    // Use the cached kubectl for the cluster's version; fall back to
    // whatever is on PATH.
    let cached = constants::cached_binary_path(store.base(), "linux", version, "kubectl");
    let kubectl = if cached.exists() {
        cached.display().to_string()
    } else {
        "kubectl".to_string()
    };

    let kubeconfig = store
        .base()
        .join("profiles")
        .join(profile)
        .join("kubeconfig");

    let mut argv = vec![
        kubectl,
        format!("--kubeconfig={}", kubeconfig.display()),
    ];
    argv.extend(args.args);

    let runner = ExecRunner::new();
    let command = Command::new(argv)
        .tee_stdout(Box::new(tokio::io::stdout()))
        .tee_stderr(Box::new(tokio::io::stderr()));

    match runner.run_cmd(command).await {
        Ok(_) => Ok(0),
        Err(RunError::CommandFailed { result }) => Ok(result.exit_code),
        Err(e) => Err(e.into()),
    }
}
