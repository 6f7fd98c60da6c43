//! tether-echo-kernel - reference kernel for tether.

use std::path::PathBuf;

use clap::Parser;
use tether_core::ConnectionInfo;
use tether_kernel::{EchoKernel, install_sigint_handler, write_kernel_spec};

#[derive(Parser)]
#[command(name = "tether-echo-kernel")]
#[command(about = "Kernel that echoes submitted code back")]
#[command(version)]
struct Cli {
    /// Connection file naming the ports to bind
    #[arg(short = 'f', long = "connection-file", required_unless_present = "install")]
    connection_file: Option<PathBuf>,

    /// Install a kernel spec for this binary under DIR and exit
    #[arg(long, value_name = "DIR")]
    install: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    // Stdout belongs to whoever launched us.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let format_error = |err: tether_core::Error| anyhow::anyhow!("{}", err.with_hint());

    if let Some(dir) = cli.install {
        let exe = std::env::current_exe()?;
        let spec_dir = write_kernel_spec(&dir, &exe).map_err(format_error)?;
        println!("Installed echo-kernel in {}", spec_dir.display());
        return Ok(());
    }

    let Some(connection_file) = cli.connection_file else {
        anyhow::bail!("--connection-file is required");
    };

    let info = ConnectionInfo::load(&connection_file).map_err(format_error)?;
    install_sigint_handler().map_err(format_error)?;
    EchoKernel::bind(&info)
        .and_then(EchoKernel::run)
        .map_err(format_error)?;

    Ok(())
}
