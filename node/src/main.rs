//! # murmur Gossip Node
//!
//! Entry point for the `murmur-node` binary. Parses CLI arguments,
//! initializes diagnostic logging, binds the UDP endpoint, and runs the
//! node until SIGINT/SIGTERM.
//!
//! Exit codes: 0 on clean shutdown; non-zero when the configuration is
//! rejected or the socket cannot be bound. Nothing else is fatal — a
//! running node absorbs malformed traffic and send failures and stays
//! in service.

mod cli;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;

use murmur_protocol::clock::Clock;
use murmur_protocol::network::{LogMode, NodeRuntime};

use cli::NodeCli;
use logging::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = NodeCli::parse();

    let log_filter = format!(
        "murmur_node={level},murmur_protocol={level}",
        level = cli.log_level
    );
    logging::init_logging(&log_filter, LogFormat::from_str_lossy(&cli.log_format));

    let cfg = cli.to_config().context("invalid configuration")?;
    let bind_addr = cfg.bind_addr();

    let node = NodeRuntime::bind(cfg, LogMode::Dir(cli.log_dir.clone()), Clock::system())
        .await
        .with_context(|| format!("failed to bind UDP socket on {bind_addr}"))?;

    tracing::info!(
        addr = %node.local_addr(),
        node_id = %node.node_id(),
        log = ?node.log_handle().path(),
        "murmur-node started"
    );

    // SIGINT/SIGTERM flips the run flag; the loop finishes its in-flight
    // handler, emits node_shutdown, and flushes the log.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    node.run(shutdown_rx).await;
    Ok(())
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
