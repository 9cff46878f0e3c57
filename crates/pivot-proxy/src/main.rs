//! pivot proxy binary entry point.

use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info, warn};

use pivot_core::protocol::{read_envelope, write_envelope, Envelope};
use pivot_core::transport::{server_endpoint, transport_lost};
use pivot_proxy::broker::Broker;
use pivot_proxy::cli::Cli;
use pivot_proxy::forward::run_remote_forward;
use pivot_proxy::netstack::NetStack;
use pivot_proxy::pool::ConnPool;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = pivot_core::init_logging(cli.verbose, cli.log_file.as_deref(), cli.log_format.into()) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        error!(error = %e, "proxy failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> pivot_core::Result<()> {
    let identity = cli.identity()?;
    let forwards = cli.remote_forwards()?;

    let netstack = NetStack::spawn(cli.stack_config()).await?;
    info!(
        tun = netstack.name(),
        mtu = netstack.mtu(),
        "userland stack ready"
    );

    let endpoint = server_endpoint(cli.listen, identity)?;
    info!(addr = %cli.listen, "listening for agents");

    while let Some(incoming) = endpoint.accept().await {
        let connection = match incoming.await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "agent handshake failed");
                continue;
            }
        };
        info!(remote = %connection.remote_address(), "agent connected");

        tokio::spawn(log_agent_info(connection.clone()));

        // A fresh pool per agent; installing it closes the previous one,
        // resetting whatever the old agent left queued.
        let pool = Arc::new(ConnPool::new());
        netstack.install_pool(Arc::clone(&pool));

        // Reverse forwards ride the same transport, one listener session
        // each, re-established on every agent.
        for forward in &forwards {
            let connection = connection.clone();
            let forward = forward.clone();
            tokio::spawn(async move {
                if let Err(e) = run_remote_forward(connection, forward).await {
                    warn!(error = %e, "remote forward failed");
                }
            });
        }

        let broker = Broker::new(
            connection,
            pool,
            netstack.udp_reply_tx(),
            netstack.tun_inject_tx(),
        );
        tokio::spawn(broker.run());
    }

    Ok(())
}

/// Ask a newly attached agent who it is, for the operator's benefit.
async fn log_agent_info(connection: quinn::Connection) {
    let result = async {
        let (mut send, mut recv) = connection.open_bi().await.map_err(transport_lost)?;
        write_envelope(&mut send, &Envelope::InfoRequest).await?;
        read_envelope(&mut recv).await
    }
    .await;

    match result {
        Ok(Envelope::InfoReply(reply)) => {
            info!(agent = %reply.name, interfaces = reply.interfaces.len(), "agent identified");
            for iface in &reply.interfaces {
                debug!(
                    name = %iface.name,
                    addrs = ?iface.addrs,
                    mac = %iface.mac,
                    mtu = iface.mtu,
                    "agent interface"
                );
            }
        }
        Ok(other) => warn!(tag = other.tag(), "unexpected reply to info request"),
        Err(e) => debug!(error = %e, "agent info exchange failed"),
    }
}
