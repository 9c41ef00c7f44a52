//! Run a linear router network with sender/receiver pairs at the ends.
//!
//! The smallest useful session: N interior routers in a chain, senders
//! attached to the first router, receivers to the last, one shared
//! address. Writes a summary.json into the session root when the run
//! completes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use skein_net::events::Completion;
use skein_net::network::{InitOutcome, Network, NetworkConfig};
use skein_net::topology::interior_name;

#[derive(Parser, Debug)]
#[command(name = "linear-run", about = "Linear router network test run")]
struct Args {
    /// Number of interior routers in the chain.
    #[arg(long, default_value_t = 3)]
    routers: usize,

    /// Sender/receiver pairs to attach to the chain's ends.
    #[arg(long, default_value_t = 1)]
    pairs: usize,

    /// Directory that receives configs, logs, results, and events.
    #[arg(long, default_value = "skein_session")]
    session_root: PathBuf,

    /// Router install root (contains sbin/skrouterd).
    #[arg(long)]
    router_root: PathBuf,

    /// Runtime root providing the router's libraries and python modules.
    /// Defaults to the router root.
    #[arg(long)]
    runtime_root: Option<PathBuf>,

    /// Path to the sender/receiver client executable.
    #[arg(long)]
    client_executable: PathBuf,

    /// Address the pairs exchange messages on.
    #[arg(long, default_value = "closest/linear_test")]
    address: String,

    /// Seconds to let the routers settle before clients start.
    #[arg(long, default_value_t = 10)]
    stabilization_secs: u64,

    /// Seconds between completion polls.
    #[arg(long, default_value_t = 5)]
    poll_secs: u64,

    /// Write all config files and exit without launching anything.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.routers == 0 {
        bail!("need at least one router");
    }

    let config = NetworkConfig {
        stabilization: Duration::from_secs(args.stabilization_secs),
        poll_interval: Duration::from_secs(args.poll_secs),
        dry_run: args.dry_run,
        client_executable: args.client_executable.clone(),
        ..NetworkConfig::default()
    };
    let mut net = Network::new("linear", &args.session_root, config);
    let runtime_root = args.runtime_root.as_ref().unwrap_or(&args.router_root);
    net.register_version("latest", &args.router_root, runtime_root)
        .context("registering router version")?;

    net.build_linear(args.routers, None)?;
    let first = interior_name(0);
    let last = interior_name(args.routers - 1);
    for _ in 0..args.pairs {
        let sender = net.add_sender(&first)?;
        let receiver = net.add_receiver(&last)?;
        net.add_client_address(&sender, &args.address)?;
        net.add_client_address(&receiver, &args.address)?;
    }

    if net.init()? == InitOutcome::DryRun {
        println!("configs written to {}", net.paths().config.display());
        return Ok(());
    }
    if !net.is_connected() {
        bail!("topology is not connected");
    }

    net.run().await?;
    let verdict = net.run_to_completion().await?;
    info!(?verdict, "run finished");

    let summary = serde_json::json!({
        "network": net.name(),
        "routers": args.routers,
        "pairs": args.pairs,
        "address": args.address,
        "verdict": match verdict {
            Completion::AllDone => "all_done",
            Completion::Stalled => "stalled",
        },
        "console_ports": net
            .console_ports()
            .into_iter()
            .map(|(name, port)| serde_json::json!({ "router": name, "port": port }))
            .collect::<Vec<_>>(),
    });
    let summary_path = args.session_root.join("summary.json");
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)
        .context("writing summary")?;
    println!("summary written to {}", summary_path.display());

    if verdict == Completion::Stalled {
        bail!("run stalled before all receivers finished");
    }
    Ok(())
}
