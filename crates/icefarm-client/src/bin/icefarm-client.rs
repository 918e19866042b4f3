//! Client CLI entry point: a thin wrapper over `icefarm_client` for manual
//! fleet use and smoke-testing (spec.md §2 lists the client as one of the
//! three processes). CLI shape follows the teacher's `vaultbackup`
//! (`#[derive(Parser)]` + `Subcommand`, `anyhow::Result` at `main`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use icefarm_client::{BaseClient, PulseCountClient};

#[derive(Debug, Parser)]
#[clap(name = "icefarm-client")]
#[clap(about = "iCEFARM client: reserve devices and run pulse-count evaluations.", long_about = None)]
struct Cli {
    /// Base URL of the control HTTP API.
    #[clap(long, default_value = "http://127.0.0.1:8000")]
    control_url: String,

    /// Identity this client registers reservations under.
    #[clap(long)]
    client_id: String,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print how many devices are currently unreserved.
    Available,
    /// Reserve `amount` devices of kind `pulsecount`, submit each given
    /// bitstream file to every reserved device, print the pulse counts, and
    /// release the reservation on exit.
    #[clap(arg_required_else_help = true)]
    Evaluate {
        /// Number of devices to reserve.
        #[clap(long, default_value_t = 1)]
        amount: usize,
        /// Bitstream files to submit, one evaluation each.
        #[clap(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let client = BaseClient::new(&cli.control_url, cli.client_id).context("building base client")?;

    match cli.command {
        Commands::Available => {
            let amount = client.available().context("querying available devices")?;
            println!("{amount} devices available");
        }
        Commands::Evaluate { amount, files } => run_evaluate(&client, amount, &files)?,
    }
    Ok(())
}

fn run_evaluate(client: &Arc<BaseClient>, amount: usize, files: &[PathBuf]) -> Result<()> {
    let pulsecount = PulseCountClient::reserve(client, amount).context("reserving pulsecount devices")?;
    log::info!(target: "icefarm_client", "reserved {:?}", pulsecount.serials());

    let mut payloads = Vec::with_capacity(files.len());
    for path in files {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        payloads.push(bytes);
    }

    let results = pulsecount.evaluate_many(payloads).context("running evaluations")?;
    for result in results {
        println!("{}\t{}\t{}", result.serial, result.evaluation_id, result.pulses);
    }
    Ok(())
}
