//! `minikube delete`

use clap::Args;

use minikube::node::Orchestrator;
use minikube::store::Store;
use minikube::Result;

/// Arguments for `delete`.
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Delete every profile on this machine.
    #[arg(long)]
    pub all: bool,
}

/// Run `delete`; exit 0 in every case (delete is idempotent).
pub async fn run(profile: &str, args: DeleteArgs) -> Result<i32> {
    let store = Store::default_store();
    let orchestrator = Orchestrator::new(store.clone());

    let targets = if args.all {
        store.list().await?
    } else {
        vec![profile.to_string()]
    };

    for name in targets {
        let existed = orchestrator.delete(&name).await?;
        if existed {
            println!("Deleted \"{}\" cluster.", name);
        } else {
            println!("\"{}\" profile does not exist", name);
        }
    }

    // The shell may still point at a daemon that no longer exists;
    // remind the user how to restore it.
    if std::env::var("MINIKUBE_EXISTING_DOCKER_HOST").is_ok() {
        println!("Restore your shell with: export DOCKER_HOST=$MINIKUBE_EXISTING_DOCKER_HOST");
    }
    Ok(0)
}
