//! `minikube stop`

use minikube::node::Orchestrator;
use minikube::store::Store;
use minikube::Result;

/// Run `stop`; returns the process exit code.
pub async fn run(profile: &str) -> Result<i32> {
    let orchestrator = Orchestrator::new(Store::default_store());
    orchestrator.stop(profile).await?;
    println!("\"{}\" stopped.", profile);
    Ok(0)
}
