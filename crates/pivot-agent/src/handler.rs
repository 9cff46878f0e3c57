//! Per-session request dispatcher.
//!
//! Every accepted session carries exactly one request envelope; the
//! listener request is the one exception, holding its session open to
//! stream accepted-socket notifications. Sessions are isolated: a failed
//! or malformed one dies alone, the agent keeps running.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use pivot_core::constants::DIAL_TIMEOUT;
use pivot_core::neterror::host_responded;
use pivot_core::protocol::{
    read_envelope, write_envelope, ConnectRequest, ConnectResponse, Envelope, Family,
    HostPingResponse, InfoReply, ListenerBindResponse, ListenerCloseResponse, ListenerRequest,
    ListenerResponse, ListenerSockResponse, Transport,
};
use pivot_core::relay::relay_split;
use pivot_core::{Error, Result};

use crate::info;
use crate::listener::ListenerRegistry;
use crate::smartping;

/// State shared by every session task.
pub struct AgentContext {
    pub registry: ListenerRegistry,
    /// Fires when the proxy asks the whole agent to exit.
    pub shutdown_tx: mpsc::Sender<()>,
}

impl AgentContext {
    pub fn new(shutdown_tx: mpsc::Sender<()>) -> Self {
        Self {
            registry: ListenerRegistry::new(),
            shutdown_tx,
        }
    }
}

/// Service one session: decode the request envelope and dispatch.
pub async fn handle_session<R, W>(mut recv: R, mut send: W, ctx: Arc<AgentContext>) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let envelope = read_envelope(&mut recv).await?;
    match envelope {
        Envelope::ConnectRequest(request) => handle_connect(request, recv, send).await,
        Envelope::HostPingRequest(request) => {
            debug!(address = %request.address, "host ping request");
            let alive = smartping::try_resolve(&request.address).await;
            write_envelope(
                &mut send,
                &Envelope::HostPingResponse(HostPingResponse { alive }),
            )
            .await
        }
        Envelope::InfoRequest => {
            write_envelope(
                &mut send,
                &Envelope::InfoReply(InfoReply {
                    name: info::agent_name(),
                    interfaces: info::interfaces(),
                }),
            )
            .await
        }
        Envelope::ListenerRequest(request) => handle_listener(request, send, ctx).await,
        Envelope::ListenerSockRequest(request) => {
            handle_sock_attach(request.sock_id, recv, send, ctx).await
        }
        Envelope::ListenerCloseRequest(request) => {
            let result = ctx.registry.close(request.listener_id);
            debug!(listener_id = request.listener_id, ok = result.is_ok(), "listener close");
            write_envelope(
                &mut send,
                &Envelope::ListenerCloseResponse(ListenerCloseResponse {
                    err: result.is_err(),
                    err_string: result.err().map(|e| e.to_string()).unwrap_or_default(),
                }),
            )
            .await
        }
        Envelope::Close => {
            let _ = ctx.shutdown_tx.try_send(());
            Ok(())
        }
        other => Err(Error::Protocol {
            message: format!("unexpected request envelope 0x{:02X}", other.tag()),
        }),
    }
}

/// Dial the requested target and, on success, splice it to the session.
async fn handle_connect<R, W>(request: ConnectRequest, recv: R, mut send: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    debug!(
        address = %request.address,
        port = request.port,
        transport = ?request.transport,
        "connect request"
    );

    let dialed = timeout(DIAL_TIMEOUT, dial(&request)).await;

    let (response, target) = match dialed {
        Err(_) => {
            // Nothing answered inside the deadline.
            (
                ConnectResponse {
                    established: false,
                    reset: false,
                },
                None,
            )
        }
        Ok(Err(e)) => {
            debug!(error = %e, "dial failed");
            (
                ConnectResponse {
                    established: false,
                    reset: host_responded(&e),
                },
                None,
            )
        }
        Ok(Ok(target)) => (
            ConnectResponse {
                established: true,
                reset: false,
            },
            Some(target),
        ),
    };

    write_envelope(&mut send, &Envelope::ConnectResponse(response)).await?;

    if let Some(target) = target {
        match target {
            Dialed::Tcp(stream) => {
                let (target_read, target_write) = stream.into_split();
                relay_split(recv, send, target_read, target_write).await;
            }
            Dialed::Udp(stream) => {
                let (target_read, target_write) = tokio::io::split(stream);
                relay_split(recv, send, target_read, target_write).await;
            }
        }
    }

    Ok(())
}

enum Dialed {
    Tcp(TcpStream),
    Udp(UdpStream),
}

async fn dial(request: &ConnectRequest) -> std::io::Result<Dialed> {
    let addr = resolve(&request.address, request.port, request.family).await?;
    match request.transport {
        Transport::Tcp => TcpStream::connect(addr).await.map(Dialed::Tcp),
        Transport::Udp => {
            let bind: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(addr).await?;
            Ok(Dialed::Udp(UdpStream { socket }))
        }
    }
}

/// Resolve and pick an address of the requested family.
async fn resolve(address: &str, port: u16, family: Family) -> std::io::Result<SocketAddr> {
    let addrs = tokio::net::lookup_host((address, port)).await?;
    addrs
        .into_iter()
        .find(|addr| match family {
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        })
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "no address of the requested family",
            )
        })
}

/// Bind the requested listener and stream every accepted socket's
/// conntrack id until the listener errors or is closed.
async fn handle_listener<W>(
    request: ListenerRequest,
    mut send: W,
    ctx: Arc<AgentContext>,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    if request.network != "tcp" {
        return write_envelope(
            &mut send,
            &Envelope::ListenerResponse(ListenerResponse {
                listener_id: 0,
                err: true,
                err_string: format!("unsupported network {:?}", request.network),
            }),
        )
        .await;
    }

    let listener = match TcpListener::bind(&request.address).await {
        Ok(listener) => listener,
        Err(e) => {
            debug!(address = %request.address, error = %e, "listener bind failed");
            return write_envelope(
                &mut send,
                &Envelope::ListenerResponse(ListenerResponse {
                    listener_id: 0,
                    err: true,
                    err_string: e.to_string(),
                }),
            )
            .await;
        }
    };

    let (listener_id, mut shutdown_rx) = ctx.registry.register();
    debug!(listener_id, address = %request.address, "listener bound");

    write_envelope(
        &mut send,
        &Envelope::ListenerResponse(ListenerResponse {
            listener_id,
            err: false,
            err_string: String::new(),
        }),
    )
    .await?;

    let stop_reason = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break "listener closed".to_string(),
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let sock_id = ctx.registry.park(listener_id, stream);
                    debug!(listener_id, sock_id, peer = %peer, "socket parked");
                    if write_envelope(
                        &mut send,
                        &Envelope::ListenerBindResponse(ListenerBindResponse {
                            sock_id,
                            err: false,
                            err_string: String::new(),
                        }),
                    )
                    .await
                    .is_err()
                    {
                        // Session gone; tear the listener down with it.
                        let _ = ctx.registry.close(listener_id);
                        return Ok(());
                    }
                }
                Err(e) => break e.to_string(),
            },
        }
    };

    let _ = write_envelope(
        &mut send,
        &Envelope::ListenerBindResponse(ListenerBindResponse {
            sock_id: 0,
            err: true,
            err_string: stop_reason,
        }),
    )
    .await;

    // Idempotent: already removed when the stop came from a close request.
    let _ = ctx.registry.close(listener_id);
    Ok(())
}

/// Claim a parked socket and splice it to the session.
async fn handle_sock_attach<R, W>(
    sock_id: i32,
    recv: R,
    mut send: W,
    ctx: Arc<AgentContext>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    match ctx.registry.claim(sock_id) {
        None => {
            warn!(sock_id, "sock attach for unknown id");
            write_envelope(
                &mut send,
                &Envelope::ListenerSockResponse(ListenerSockResponse {
                    err: true,
                    err_string: Error::UnknownSock(sock_id).to_string(),
                }),
            )
            .await
        }
        Some(stream) => {
            write_envelope(
                &mut send,
                &Envelope::ListenerSockResponse(ListenerSockResponse {
                    err: false,
                    err_string: String::new(),
                }),
            )
            .await?;

            let (stream_read, stream_write) = stream.into_split();
            relay_split(recv, send, stream_read, stream_write).await;
            Ok(())
        }
    }
}

/// Datagram socket dressed up as a byte stream so UDP dials splice through
/// the same relay: one write is one datagram, one read is one datagram.
struct UdpStream {
    socket: UdpSocket,
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// Tests
// =============================================================================
