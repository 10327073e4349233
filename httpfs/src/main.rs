use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use httpfs::config::Args;
use httpfs::logging::init_logging;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.quiet);

    let config = args.to_config()?;
    let mut mount = httpfs::mount(&args.endpoint, &args.mountpoint, config)
        .await
        .with_context(|| format!("failed to mount {}", args.endpoint))?;

    tokio::select! {
        _ = shutdown_signal() => info!("received termination signal, unmounting"),
        _ = mount.closed() => info!("fuse session ended"),
    }

    // exits non-zero when the mountpoint could not be released
    mount.unmount().await?;
    Ok(())
}
