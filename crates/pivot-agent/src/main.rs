//! pivot agent binary entry point.
//!
//! Exit code 0 means the proxy asked us to leave; anything else is a
//! connect, TLS, or transport failure.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use pivot_agent::cli::Cli;
use pivot_agent::handler::{handle_session, AgentContext};
use pivot_core::constants::CONNECT_TIMEOUT;
use pivot_core::transport::{client_endpoint, transport_lost};
use pivot_core::{Error, Result};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = pivot_core::init_logging(cli.verbose, cli.log_file.as_deref(), cli.log_format.into()) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if cli.ignore_cert {
        warn!("certificate validation disabled");
    }

    if let Err(e) = run(cli).await {
        error!(error = %e, "agent failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let server_name = cli.server_name()?;

    let addr = tokio::net::lookup_host(&cli.connect)
        .await?
        .next()
        .ok_or_else(|| Error::Transport {
            message: format!("could not resolve {}", cli.connect),
        })?;

    let endpoint = client_endpoint(cli.ignore_cert)?;
    let connecting = endpoint
        .connect(addr, &server_name)
        .map_err(|e| Error::Transport {
            message: format!("failed to initiate connection: {e}"),
        })?;

    let connection = timeout(CONNECT_TIMEOUT, connecting)
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(transport_lost)?;
    info!(proxy = %addr, "connected to proxy");

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let ctx = Arc::new(AgentContext::new(shutdown_tx));

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("close requested by proxy, exiting");
                connection.close(0u32.into(), b"close");
                return Ok(());
            }
            session = connection.accept_bi() => match session {
                Ok((send, recv)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_session(recv, send, ctx).await {
                            debug!(error = %e, "session ended with error");
                        }
                    });
                }
                Err(e) => return Err(transport_lost(e)),
            },
        }
    }
}
