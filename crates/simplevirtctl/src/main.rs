//! `simplevirtctl` — simple virtual machine manager for Linux (QEMU/KVM),
//! controller side.
//!
//! Exit codes: 0 on success, 1 when the daemon reports a failure, 2 on
//! connection or protocol errors.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod client;

use client::{Client, Outcome};

#[derive(Parser)]
#[command(
    name = "simplevirtctl",
    about = "Simple virtual machine manager for Linux (QEMU/KVM) - Controller",
    version
)]
struct Cli {
    /// Unix socket to connect
    #[arg(short = 's', long, default_value = "/run/simplevirtd.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Starts a virtual machine, if not running
    Start { name: String },

    /// Shutdown a virtual machine, if running
    Shutdown { name: String },

    /// Reset a virtual machine, if running
    Reset { name: String },

    /// List status of a virtual machine, or of all available virtual machines
    Status { name: Option<String> },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("simplevirtctl: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut client = Client::connect(&cli.socket).await?;

    let outcome = match &cli.command {
        Commands::Start { name } => client.start_vm(name).await?,
        Commands::Shutdown { name } => client.shutdown_vm(name).await?,
        Commands::Reset { name } => client.reset_vm(name).await?,
        Commands::Status { name } => return status(&mut client, name.as_deref()).await,
    };

    Ok(match outcome {
        Outcome::Success(()) => ExitCode::SUCCESS,
        Outcome::Failure(message) => {
            eprintln!("simplevirtctl: {message}");
            ExitCode::from(1)
        }
    })
}

/// Print `name: status` for one VM or all of them, names padded to the
/// longest.
async fn status(client: &mut Client, name: Option<&str>) -> anyhow::Result<ExitCode> {
    let names = match client.list_vms().await? {
        Outcome::Success(names) => names,
        Outcome::Failure(message) => {
            eprintln!("simplevirtctl: {message}");
            return Ok(ExitCode::from(1));
        }
    };

    let names = match name {
        Some(name) => vec![name.to_string()],
        None => names,
    };

    let width = names.iter().map(String::len).max().unwrap_or(0);

    for name in &names {
        match client.vm_status(name).await? {
            Outcome::Success(status) => println!("{name:<width$}: {status}"),
            Outcome::Failure(message) => {
                eprintln!("simplevirtctl: {message}");
                return Ok(ExitCode::from(1));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
