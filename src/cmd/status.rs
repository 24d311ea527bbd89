//! `minikube status`

use clap::Args;

use minikube::node::Orchestrator;
use minikube::store::Store;
use minikube::{Error, Result};

/// Arguments for `status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Output format: text or json.
    #[arg(long, default_value = "text")]
    pub output: String,
}

/// Run `status`; exit 0 running, 2 paused, 7 down or missing.
pub async fn run(profile: &str, args: StatusArgs) -> Result<i32> {
    let orchestrator = Orchestrator::new(Store::default_store());

    let status = match orchestrator.status(profile).await {
        Ok(status) => status,
        Err(Error::NotFound { .. }) => {
            // Per contract: missing clusters report through the exit code,
            // with a Nonexistent host in the output.
            let status = minikube::node::ClusterStatus {
                name: profile.to_string(),
                host: "Nonexistent".to_string(),
                kubelet: "Nonexistent".to_string(),
                api_server: "Nonexistent".to_string(),
                kubeconfig: "Nonexistent".to_string(),
            };
            print_status(&status, &args.output)?;
            return Ok(7);
        }
        Err(e) => return Err(e),
    };

    print_status(&status, &args.output)?;
    Ok(status.exit_code())
}

fn print_status(status: &minikube::node::ClusterStatus, output: &str) -> Result<()> {
    match output {
        "json" => {
            let json = serde_json::to_string(status)
                .map_err(|e| Error::serialization(e.to_string()))?;
            println!("{}", json);
        }
        "text" => {
            println!("{}", status.name);
            println!("Host: {}", status.host);
            println!("Kubelet: {}", status.kubelet);
            println!("APIServer: {}", status.api_server);
            println!("Kubeconfig: {}", status.kubeconfig);
        }
        other => {
            return Err(Error::usage(format!(
                "invalid output format \"{}\": expected text or json",
                other
            )))
        }
    }
    Ok(())
}
