//! Tether CLI - run code from a file through a kernel session.

mod colors;
mod kernels;
mod output;
mod run;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tether_core::Config;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Run code from a file through a Jupyter-style kernel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed kernels
    Kernels,

    /// Evaluate a file, or part of it, in a kernel
    Run {
        /// Path to the source file
        file: String,

        /// Kernel name, or path to a connection file to attach to
        #[arg(short, long)]
        kernel: String,

        /// Only run lines A through B (1-based, inclusive)
        #[arg(long, value_name = "A:B")]
        lines: Option<String>,

        /// Evaluate an expression instead of file contents
        #[arg(long, conflicts_with = "lines")]
        expr: Option<String>,

        /// Give up if the execution has not finished after this long
        #[arg(long, default_value = "30000")]
        timeout_ms: u64,

        /// How often to poll the kernel
        #[arg(long)]
        poll_ms: Option<u64>,

        /// Copy image and PDF outputs into DIR instead of discarding them
        #[arg(long, value_name = "DIR")]
        keep_artifacts: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Helper to format tether-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(tether_err) = err.downcast_ref::<tether_core::Error>() {
            anyhow::anyhow!("{}", tether_err.with_hint())
        } else {
            err
        }
    };

    let mut config = Config::from_env();

    match cli.command {
        Commands::Kernels => kernels::execute(&config),

        Commands::Run {
            file,
            kernel,
            lines,
            expr,
            timeout_ms,
            poll_ms,
            keep_artifacts,
        } => {
            if let Some(ms) = poll_ms {
                config.poll_interval = Duration::from_millis(ms.max(1));
            }
            let target = match (lines, expr) {
                (_, Some(expr)) => run::Target::Expression(expr),
                (Some(lines), None) => run::Target::Lines(run::parse_lines(&lines)?),
                (None, None) => run::Target::File,
            };
            let options = run::RunOptions {
                target,
                timeout: Duration::from_millis(timeout_ms),
                keep_artifacts,
            };
            run::execute(&file, &kernel, options, config)
            .await
            .map_err(format_error)?;
        }
    }

    Ok(())
}
