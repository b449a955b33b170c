use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use irctl_kernel::{InstrumentConfig, KernelBuilder};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "irctld", version, about = "Infrared camera control server")]
struct Cli {
    /// Property file describing the instrument. Built-in defaults when absent.
    #[arg(long, env = "IRCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the configured client listen address.
    #[arg(long, env = "IRCTL_LISTEN")]
    listen: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_filter))
        .compact()
        .init();

    let mut config = match &cli.config {
        Some(path) => InstrumentConfig::load(path).await?,
        None => {
            warn!("no --config given, using built-in defaults");
            InstrumentConfig::default()
        }
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let kernel = KernelBuilder::new(config).start().await?;
    let listener = kernel.bind().await?;
    let server = tokio::spawn({
        let kernel = kernel.clone();
        async move { kernel.serve(listener).await }
    });

    let requested = kernel.shutdown_token();
    tokio::select! {
        signalled = signal::ctrl_c() => match signalled {
            Ok(()) => info!("shutdown signal received"),
            Err(signal_error) => {
                error!(%signal_error, "cannot listen for ctrl-c, waiting for a shutdown command");
                requested.cancelled().await;
            }
        },
        _ = requested.cancelled() => info!("shutdown requested by a client command"),
    }
    kernel.shutdown().await;
    server.await??;
    if let Some(level) = kernel.requested_reboot() {
        warn!(%level, "exiting for a reboot, the supervisor restarts the daemon or the host");
    }
    info!("irctld stopped");
    Ok(())
}
