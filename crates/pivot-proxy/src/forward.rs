//! Reverse forwarding driven from the proxy side.
//!
//! The mirror image of the tun-connection path: the proxy asks the agent
//! to open a listener on its own interfaces and consumes the stream of
//! accepted-socket notifications on that session. Each notification is
//! answered with a sock-attach session of its own, spliced into a
//! proxy-local target, so external clients of the agent land here.

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use pivot_core::protocol::{
    read_envelope, write_envelope, Envelope, ListenerCloseRequest, ListenerRequest,
    ListenerSockRequest,
};
use pivot_core::relay::relay_split;
use pivot_core::transport::transport_lost;
use pivot_core::{Error, Result};

/// One reverse forward: listen on `bind` at the agent, splice every
/// accepted connection to `target` on this side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteForward {
    pub bind: String,
    pub target: String,
}

impl RemoteForward {
    /// Parse a `BIND/TARGET` spec, e.g. `0.0.0.0:2222/127.0.0.1:8080`.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || Error::InvalidForwardSpec {
            message: format!("{spec:?} is not BIND/TARGET"),
        };

        let (bind, target) = spec.split_once('/').ok_or_else(invalid)?;
        if !is_host_port(bind) || !is_host_port(target) {
            return Err(invalid());
        }

        Ok(Self {
            bind: bind.to_string(),
            target: target.to_string(),
        })
    }
}

fn is_host_port(s: &str) -> bool {
    matches!(s.rsplit_once(':'), Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok())
}

/// Open the remote listener and serve its accept stream until the
/// listener ends or the transport dies.
///
/// Runs on its own listener session: the bind responses stream in here,
/// while each accepted socket gets a separate attach session.
pub async fn run_remote_forward(connection: quinn::Connection, forward: RemoteForward) -> Result<()> {
    let (mut send, mut recv) = connection.open_bi().await.map_err(transport_lost)?;

    write_envelope(
        &mut send,
        &Envelope::ListenerRequest(ListenerRequest {
            network: "tcp".to_string(),
            address: forward.bind.clone(),
        }),
    )
    .await?;

    let response = match read_envelope(&mut recv).await? {
        Envelope::ListenerResponse(response) => response,
        other => {
            return Err(Error::Protocol {
                message: format!("expected listener response, got 0x{:02X}", other.tag()),
            });
        }
    };
    if response.err {
        return Err(Error::ListenerOpen {
            message: response.err_string,
        });
    }

    info!(
        listener_id = response.listener_id,
        bind = %forward.bind,
        to = %forward.target,
        "remote listener bound"
    );

    loop {
        let bind = match read_envelope(&mut recv).await? {
            Envelope::ListenerBindResponse(bind) => bind,
            other => {
                return Err(Error::Protocol {
                    message: format!("expected bind response, got 0x{:02X}", other.tag()),
                });
            }
        };

        if bind.err {
            debug!(
                listener_id = response.listener_id,
                reason = %bind.err_string,
                "remote listener ended"
            );
            return Ok(());
        }

        let connection = connection.clone();
        let target = forward.target.clone();
        tokio::spawn(async move {
            if let Err(e) = attach_sock(connection, bind.sock_id, &target).await {
                warn!(sock_id = bind.sock_id, error = %e, "sock attach failed");
            }
        });
    }
}

/// Claim one parked socket on a fresh session and splice it into the
/// local target.
async fn attach_sock(connection: quinn::Connection, sock_id: i32, target: &str) -> Result<()> {
    let (mut send, mut recv) = connection.open_bi().await.map_err(transport_lost)?;

    write_envelope(
        &mut send,
        &Envelope::ListenerSockRequest(ListenerSockRequest { sock_id }),
    )
    .await?;

    match read_envelope(&mut recv).await? {
        Envelope::ListenerSockResponse(response) if !response.err => {}
        Envelope::ListenerSockResponse(_) => return Err(Error::UnknownSock(sock_id)),
        other => {
            return Err(Error::Protocol {
                message: format!("expected sock response, got 0x{:02X}", other.tag()),
            });
        }
    }

    let local = TcpStream::connect(target).await?;
    debug!(sock_id, to = target, "reverse connection bridged");
    let (local_read, local_write) = local.into_split();
    relay_split(recv, send, local_read, local_write).await;
    Ok(())
}

/// Close a remote listener previously opened by [`run_remote_forward`].
pub async fn close_remote_listener(connection: &quinn::Connection, listener_id: i32) -> Result<()> {
    let (mut send, mut recv) = connection.open_bi().await.map_err(transport_lost)?;

    write_envelope(
        &mut send,
        &Envelope::ListenerCloseRequest(ListenerCloseRequest { listener_id }),
    )
    .await?;

    match read_envelope(&mut recv).await? {
        Envelope::ListenerCloseResponse(response) if !response.err => Ok(()),
        Envelope::ListenerCloseResponse(_) => Err(Error::UnknownListener(listener_id)),
        other => Err(Error::Protocol {
            message: format!("expected close response, got 0x{:02X}", other.tag()),
        }),
    }
}

// =============================================================================
// Tests
// =============================================================================
