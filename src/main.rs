//! minikube - local Kubernetes cluster manager

mod cmd;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use minikube::{constants, Result};

/// minikube provisions and manages local Kubernetes clusters.
#[derive(Parser, Debug)]
#[command(name = "minikube", version, about, long_about = None)]
struct Cli {
    /// Profile (cluster) name.
    #[arg(short = 'p', long, global = true, default_value = constants::DEFAULT_PROFILE)]
    profile: String,

    /// Also log to stderr (logs go to stderr by default; kept for
    /// compatibility).
    #[arg(long, global = true)]
    alsologtostderr: bool,

    /// Log verbosity: 0 info, 1 debug, 2+ trace.
    #[arg(short = 'v', global = true, default_value_t = 0)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or start a local Kubernetes cluster.
    Start(cmd::start::StartArgs),

    /// Stop the cluster, leaving state on disk.
    Stop,

    /// Delete the cluster: machines, host records and profile.
    Delete(cmd::delete::DeleteArgs),

    /// Show the status of the cluster components.
    Status(cmd::status::StatusArgs),

    /// Run a command on the guest (or open a shell).
    Ssh(cmd::ssh::SshArgs),

    /// Invoke the kubectl matching the cluster version.
    Kubectl(cmd::kubectl::KubectlArgs),

    /// Profile operations.
    #[command(subcommand)]
    Profile(cmd::profile::ProfileCommand),

    /// Enable, disable or list addons.
    #[command(subcommand)]
    Addons(cmd::addons::AddonsCommand),

    /// Multi-node operations.
    #[command(subcommand)]
    Node(cmd::node::NodeCommand),
}

/// Lines of remote stderr echoed when a guest command was the root cause.
const STDERR_TAIL_LINES: usize = 10;

#[tokio::main]
async fn main() {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    let cli = Cli::parse();

    let default_level = match cli.verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("minikube={},warn", default_level))),
        )
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            if let Some(tail) = e.remote_stderr_tail(STDERR_TAIL_LINES) {
                eprintln!("\nRemote stderr:\n{}", tail);
            }
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let profile = cli.profile.clone();
    match cli.command {
        Commands::Start(args) => cmd::start::run(&profile, args).await,
        Commands::Stop => cmd::stop::run(&profile).await,
        Commands::Delete(args) => cmd::delete::run(&profile, args).await,
        Commands::Status(args) => cmd::status::run(&profile, args).await,
        Commands::Ssh(args) => cmd::ssh::run(&profile, args).await,
        Commands::Kubectl(args) => cmd::kubectl::run(&profile, args).await,
        Commands::Profile(command) => cmd::profile::run(command).await,
        Commands::Addons(command) => cmd::addons::run(&profile, command).await,
        Commands::Node(command) => cmd::node::run(&profile, command).await,
    }
}
