//! `minikube ssh`

use clap::Args;

use minikube::config::ClusterConfig;
use minikube::driver::Registry;
use minikube::node::Orchestrator;
use minikube::runner::{Command, RunError};
use minikube::store::Store;
use minikube::{Error, Result};

/// Arguments for `ssh`.
#[derive(Args, Debug)]
pub struct SshArgs {
    /// Node to target; defaults to the primary.
    #[arg(long, default_value = "")]
    pub node: String,

    /// Command to execute on the guest; a shell when omitted.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

/// Run `ssh`; the remote exit code is inherited.
pub async fn run(profile: &str, args: SshArgs) -> Result<i32> {
    let store = Store::default_store();
    let orchestrator = Orchestrator::new(store.clone());
    let cc = store.load(profile).await?;
    let node = cc.node(&args.node)?.clone();
    let machine_name = cc.machine_name(&node);

    if !store.exists_host(&machine_name).await {
        return Err(Error::machine_not_found(machine_name));
    }

    let runner = guest_runner(&orchestrator, &cc, &machine_name, &node.ip).await?;

    let command = if args.command.is_empty() {
        // No TTY plumbing here; an interactive shell degrades to a login
        // banner plus whatever stdin provides.
        Command::new(["/bin/bash", "-l"])
    } else {
        Command::new(args.command.clone())
    };
    let command = command
        .tee_stdout(Box::new(tokio::io::stdout()))
        .tee_stderr(Box::new(tokio::io::stderr()));

    match runner.run_cmd(command).await {
        Ok(_) => Ok(0),
        Err(RunError::CommandFailed { result }) => Ok(result.exit_code),
        Err(e) => Err(e.into()),
    }
}

async fn guest_runner(
    orchestrator: &Orchestrator,
    cc: &ClusterConfig,
    machine_name: &str,
    node_ip: &str,
) -> Result<std::sync::Arc<dyn minikube::runner::CommandRunner>> {
    let registry = Registry::standard();
    let config = minikube::driver::MachineConfig {
        name: machine_name.to_string(),
        apiserver_port: cc.kubernetes_config.node_port,
        oci_binary: if cc.driver == minikube::driver::DriverTag::Podman {
            "podman".to_string()
        } else {
            "docker".to_string()
        },
        ssh_host: node_ip.to_string(),
        ssh_key: orchestrator
            .store()
            .base()
            .join("machines")
            .join(machine_name)
            .join("id_rsa"),
        ..Default::default()
    };
    let driver = registry.create(cc.driver, config)?;
    driver.runner().await
}
