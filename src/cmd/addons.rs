//! `minikube addons enable|disable|list`

use clap::Subcommand;

use minikube::addons;
use minikube::store::Store;
use minikube::Result;

/// Addon subcommands.
#[derive(Subcommand, Debug)]
pub enum AddonsCommand {
    /// Enable an addon on the profile.
    Enable {
        /// Addon name.
        name: String,
    },
    /// Disable an addon on the profile.
    Disable {
        /// Addon name.
        name: String,
    },
    /// List addons and their state.
    List,
}

/// Run an addons subcommand.
pub async fn run(profile: &str, command: AddonsCommand) -> Result<i32> {
    let store = Store::default_store();
    match command {
        AddonsCommand::Enable { name } => {
            addons::set(&store, profile, &name, true).await?;
            println!("The '{}' addon is enabled", name);
        }
        AddonsCommand::Disable { name } => {
            addons::set(&store, profile, &name, false).await?;
            println!("The '{}' addon is disabled", name);
        }
        AddonsCommand::List => {
            for (name, enabled) in addons::list(&store, profile).await? {
                let marker = if enabled { "enabled" } else { "disabled" };
                println!("- {}: {}", name, marker);
            }
        }
    }
    Ok(0)
}
