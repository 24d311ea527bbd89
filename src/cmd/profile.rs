//! `minikube profile list`

use clap::Subcommand;
use serde::Serialize;

use minikube::store::Store;
use minikube::{Error, Result};

/// Profile subcommands.
#[derive(Subcommand, Debug)]
pub enum ProfileCommand {
    /// List profiles on this machine.
    List {
        /// Output format: text or json.
        #[arg(long, default_value = "text")]
        output: String,
    },
}

#[derive(Serialize)]
struct ProfileEntry {
    name: String,
    driver: String,
    kubernetes_version: String,
    node_count: usize,
}

/// Run a profile subcommand.
pub async fn run(command: ProfileCommand) -> Result<i32> {
    match command {
        ProfileCommand::List { output } => list(&output).await,
    }
}

async fn list(output: &str) -> Result<i32> {
    let store = Store::default_store();
    let mut entries = Vec::new();

    for name in store.list().await? {
        match store.load(&name).await {
            Ok(cc) => entries.push(ProfileEntry {
                name: cc.name.clone(),
                driver: cc.driver.to_string(),
                kubernetes_version: cc.kubernetes_config.kubernetes_version.clone(),
                node_count: cc.nodes.len(),
            }),
            Err(e) => {
                eprintln!("profile {}: {}", name, e);
            }
        }
    }

    match output {
        "json" => {
            let json = serde_json::to_string_pretty(&entries)
                .map_err(|e| Error::serialization(e.to_string()))?;
            println!("{}", json);
        }
        "text" => {
            for entry in &entries {
                println!(
                    "{}\t{}\t{}\t{} node(s)",
                    entry.name, entry.driver, entry.kubernetes_version, entry.node_count
                );
            }
        }
        other => {
            return Err(Error::usage(format!(
                "invalid output format \"{}\": expected text or json",
                other
            )))
        }
    }
    Ok(0)
}
