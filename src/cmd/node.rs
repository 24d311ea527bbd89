//! `minikube node add|delete|list|start|stop`

use clap::Subcommand;

use minikube::config::Node;
use minikube::driver::{MachineConfig, Registry};
use minikube::machine;
use minikube::node::Orchestrator;
use minikube::store::Store;
use minikube::{Error, Result};

/// Node subcommands.
#[derive(Subcommand, Debug)]
pub enum NodeCommand {
    /// Add a worker node to the cluster config.
    Add,
    /// Remove a node and its machine.
    Delete {
        /// Node name, e.g. m02.
        name: String,
    },
    /// List nodes of the cluster.
    List,
    /// Start a stopped node's machine.
    Start {
        /// Node name.
        name: String,
    },
    /// Stop a node's machine.
    Stop {
        /// Node name.
        name: String,
    },
}

/// Run a node subcommand.
pub async fn run(profile: &str, command: NodeCommand) -> Result<i32> {
    let store = Store::default_store();
    let orchestrator = Orchestrator::new(store.clone());

    match command {
        NodeCommand::Add => {
            let mut cc = store.load(profile).await?;
            let name = format!("m{:02}", cc.nodes.len() + 1);
            cc.nodes.push(Node {
                name: name.clone(),
                ip: String::new(),
                port: 0,
                kubernetes_version: cc.kubernetes_config.kubernetes_version.clone(),
                control_plane: false,
                worker: true,
            });
            store.save(&cc).await?;
            println!("Added node {}; run `minikube start -p {}` to bring it up", name, profile);
        }
        NodeCommand::Delete { name } => {
            let mut cc = store.load(profile).await?;
            let node = cc.node(&name)?.clone();
            if node.control_plane {
                return Err(Error::usage(
                    "cannot delete the control-plane node; use `minikube delete`",
                ));
            }
            let machine_name = cc.machine_name(&node);
            let driver = driver_for(&orchestrator, &cc, &machine_name, &node.ip)?;
            machine::delete_host(&store, driver.as_ref(), &machine_name).await?;

            cc.nodes.retain(|n| n.name != name);
            store.save(&cc).await?;
            println!("Node {} deleted.", name);
        }
        NodeCommand::List => {
            let cc = store.load(profile).await?;
            for node in &cc.nodes {
                let role = if node.control_plane { "control-plane" } else { "worker" };
                println!("{}\t{}\t{}", cc.machine_name(node), role, node.ip);
            }
        }
        NodeCommand::Start { name } => {
            let cc = store.load(profile).await?;
            let node = cc.node(&name)?.clone();
            let machine_name = cc.machine_name(&node);
            let driver = driver_for(&orchestrator, &cc, &machine_name, &node.ip)?;
            machine::start_host(driver.as_ref(), &machine_name).await?;
            println!("Node {} started.", name);
        }
        NodeCommand::Stop { name } => {
            let cc = store.load(profile).await?;
            let node = cc.node(&name)?.clone();
            let machine_name = cc.machine_name(&node);
            let driver = driver_for(&orchestrator, &cc, &machine_name, &node.ip)?;
            machine::stop_host(driver.as_ref(), &machine_name).await?;
            println!("Node {} stopped.", name);
        }
    }
    Ok(0)
}

fn driver_for(
    orchestrator: &Orchestrator,
    cc: &minikube::config::ClusterConfig,
    machine_name: &str,
    node_ip: &str,
) -> Result<std::sync::Arc<dyn minikube::driver::Driver>> {
    let registry = Registry::standard();
    registry.create(
        cc.driver,
        MachineConfig {
            name: machine_name.to_string(),
            cpus: cc.cpus,
            memory_mb: cc.memory_mb,
            disk_mb: cc.disk_mb,
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
        },
    )
}
