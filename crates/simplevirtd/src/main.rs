//! `simplevirtd` — simple virtual machine manager for Linux (QEMU/KVM),
//! daemon side.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

mod config;
mod error;
mod instance;
mod logging;
mod netdev;
mod nic;
mod qemu;
mod qmp;
mod server;
mod supervisor;

#[derive(Parser)]
#[command(
    name = "simplevirtd",
    about = "Simple virtual machine manager for Linux (QEMU/KVM) - Daemon",
    version
)]
struct Cli {
    /// Directory with configuration files
    #[arg(short = 'c', long, default_value = "/etc/simplevirt")]
    configdir: PathBuf,

    /// Directory to store QEMU runtime files
    #[arg(short = 'm', long, default_value = "/run/simplevirt")]
    runtimedir: PathBuf,

    /// Unix socket to listen
    #[arg(short = 's', long, default_value = "/run/simplevirtd.sock")]
    socket: PathBuf,

    /// Use syslog for logging instead of standard error output
    #[arg(long)]
    syslog: bool,

    /// Log level for non-syslog logging (CRITICAL, ERROR, WARNING, NOTICE)
    #[arg(short = 'l', long, default_value = "WARNING")]
    loglevel: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.loglevel, cli.syslog)?;

    info!("starting simplevirtd {}", env!("CARGO_PKG_VERSION"));

    if !nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("simplevirtd should be run as root");
    }

    if !cli.runtimedir.exists() {
        std::fs::create_dir_all(&cli.runtimedir)
            .with_context(|| format!("failed to create {}", cli.runtimedir.display()))?;
        std::fs::set_permissions(&cli.runtimedir, std::fs::Permissions::from_mode(0o777))
            .with_context(|| format!("failed to chmod {}", cli.runtimedir.display()))?;
    }

    server::serve(cli.configdir, cli.runtimedir, cli.socket).await
}
