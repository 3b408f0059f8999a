use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use podcni::config::{DEFAULT_BIN_DIR, DEFAULT_NET_DIR};
use podcni::types::NetworkResult;
use podcni::{PluginManager, PodNetwork};

/// Add or remove CNI networks from a pod network namespace
#[derive(Parser)]
#[command(name = "podcni-ctl")]
struct Cli {
    /// CNI config directory
    #[arg(long, env = "CONF_PATH", default_value = DEFAULT_NET_DIR)]
    conf_dir: PathBuf,

    /// CNI plugin binary directory
    #[arg(long, env = "BIN_PATH", default_value = DEFAULT_BIN_DIR)]
    bin_dir: PathBuf,

    /// Comma-separated list of CNI network names (optional)
    #[arg(long, value_delimiter = ',', value_name = "NAME")]
    networks: Vec<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Attach the pod to its networks
    Add(PodArgs),
    /// Detach the pod from its networks
    Del(PodArgs),
    /// Report current addressing for the pod's interfaces
    Status(PodArgs),
}

#[derive(Args)]
struct PodArgs {
    pod_namespace: String,
    pod_name: String,
    pod_id: String,
    netns: String,
}

impl PodArgs {
    fn into_pod_network(self, networks: Vec<String>) -> PodNetwork {
        PodNetwork {
            namespace: self.pod_namespace,
            name: self.pod_name,
            id: self.pod_id,
            netns: self.netns,
            networks,
            port_mappings: Vec::new(),
        }
    }
}

/// One line per sandbox-side IP; host-side interfaces are not printed.
fn print_sandbox_results(results: &[NetworkResult]) {
    for result in results {
        for ip in &result.ips {
            let details = ip
                .interface
                .and_then(|i| result.interfaces.get(i))
                .filter(|intf| intf.sandbox.is_some())
                .map(|intf| format!(" ({} {})", intf.name, intf.mac.as_deref().unwrap_or("")))
                .unwrap_or_default();
            println!("IP: {}{}", ip.address, details);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(Level::INFO)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let cli = Cli::parse();
    let plugin = PluginManager::init(None, Some(cli.conf_dir), vec![cli.bin_dir])?;

    match cli.command {
        Cmd::Add(args) => {
            let pod = args.into_pod_network(cli.networks);
            let results = plugin.set_up_pod(&pod).await?;
            print_sandbox_results(&results);
        }
        Cmd::Status(args) => {
            let pod = args.into_pod_network(cli.networks);
            let results = plugin.pod_network_status(&pod).await?;
            print_sandbox_results(&results);
        }
        Cmd::Del(args) => {
            let pod = args.into_pod_network(cli.networks);
            plugin.tear_down_pod(&pod).await?;
        }
    }

    Ok(())
}
