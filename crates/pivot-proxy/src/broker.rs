//! The session orchestrator.
//!
//! One broker per attached agent: it consumes the connection pool and, for
//! every terminated flow, opens a session on the multiplexed transport and
//! drives the dial-then-relay exchange. ICMP never gets a relay session;
//! the responder is consulted directly and its replies go straight back
//! out the TUN device.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use pivot_core::constants::RELAY_BUFFER_SIZE;
use pivot_core::protocol::{
    read_envelope, write_envelope, ConnectRequest, Envelope, Family, HostPingRequest, Transport,
};
use pivot_core::relay::relay_split;
use pivot_core::transport::transport_lost;

use crate::flow::{FlowId, TcpRequest, TunConn, UdpDatagram};
use crate::icmp::{self, Pinger};
use crate::netstack::UdpReply;
use crate::pool::ConnPool;

/// Depth of each UDP conversation's datagram queue.
const UDP_FLOW_QUEUE: usize = 64;

pub struct Broker {
    connection: quinn::Connection,
    pool: Arc<ConnPool>,
    udp_reply_tx: mpsc::Sender<UdpReply>,
    tun_inject_tx: mpsc::Sender<Vec<u8>>,
    udp_flows: Arc<Mutex<HashMap<FlowId, mpsc::Sender<Vec<u8>>>>>,
}

impl Broker {
    pub fn new(
        connection: quinn::Connection,
        pool: Arc<ConnPool>,
        udp_reply_tx: mpsc::Sender<UdpReply>,
        tun_inject_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            connection,
            pool,
            udp_reply_tx,
            tun_inject_tx,
            udp_flows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consume the pool until it closes. Transport loss closes the pool,
    /// which in turn resets everything still queued.
    pub async fn run(self) {
        let watcher = {
            let connection = self.connection.clone();
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                let reason = connection.closed().await;
                debug!(error = %transport_lost(reason), "agent transport lost");
                pool.close();
            })
        };

        loop {
            let conn = match self.pool.next().await {
                Ok(conn) => conn,
                Err(_) => break,
            };

            match conn {
                TunConn::Tcp(request) => {
                    let connection = self.connection.clone();
                    tokio::spawn(async move {
                        match connection.open_bi().await {
                            Ok((send, recv)) => serve_tcp_flow(recv, send, request).await,
                            Err(e) => {
                                debug!(error = %transport_lost(e), "session open failed");
                                request.complete(true);
                            }
                        }
                    });
                }
                TunConn::Udp(datagram) => self.dispatch_udp(datagram).await,
                TunConn::Icmp(packet) => {
                    let pinger = MuxPinger {
                        connection: self.connection.clone(),
                    };
                    let inject = self.tun_inject_tx.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = icmp::respond(&packet.packet, &pinger).await {
                            let _ = inject.send(reply).await;
                        }
                    });
                }
            }
        }

        watcher.abort();
        info!("broker finished");
    }

    /// Route a datagram into its conversation, creating one on first sight
    /// of the flow.
    async fn dispatch_udp(&self, datagram: UdpDatagram) {
        let flow = datagram.flow;
        let mut flows = self.udp_flows.lock().await;

        let payload = match flows.get(&flow) {
            Some(tx) => match tx.try_send(datagram.payload) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => return, // drop, it's UDP
                Err(mpsc::error::TrySendError::Closed(payload)) => payload,
            },
            None => datagram.payload,
        };

        // Either a fresh flow or one whose conversation ended.
        flows.remove(&flow);
        self.start_udp_flow(&mut flows, flow, payload);
    }

    fn start_udp_flow(
        &self,
        flows: &mut HashMap<FlowId, mpsc::Sender<Vec<u8>>>,
        flow: FlowId,
        payload: Vec<u8>,
    ) {
        let (tx, rx) = mpsc::channel(UDP_FLOW_QUEUE);
        let _ = tx.try_send(payload);
        flows.insert(flow, tx.clone());

        let connection = self.connection.clone();
        let udp_flows = Arc::clone(&self.udp_flows);
        let reply_tx = self.udp_reply_tx.clone();

        tokio::spawn(async move {
            match connection.open_bi().await {
                Ok((send, recv)) => serve_udp_flow(recv, send, flow, rx, reply_tx).await,
                Err(e) => debug!(error = %transport_lost(e), "udp session open failed"),
            }

            let mut flows = udp_flows.lock().await;
            if flows.get(&flow).is_some_and(|cur| cur.same_channel(&tx)) {
                flows.remove(&flow);
            }
        });
    }
}

/// Dial-and-relay for one TCP flow over an open session.
pub(crate) async fn serve_tcp_flow<R, W>(mut recv: R, mut send: W, request: TcpRequest)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let flow = request.flow();

    if let Err(e) = write_envelope(&mut send, &connect_request_for(flow, Transport::Tcp)).await {
        debug!(%flow, error = %e, "connect request failed");
        request.complete(true);
        return;
    }

    let response = match read_envelope(&mut recv).await {
        Ok(Envelope::ConnectResponse(response)) => response,
        Ok(other) => {
            warn!(%flow, tag = other.tag(), "unexpected envelope, expected connect response");
            request.complete(true);
            return;
        }
        Err(e) => {
            debug!(%flow, error = %e, "session ended before connect response");
            request.complete(true);
            return;
        }
    };

    if response.established {
        debug!(%flow, "flow bridged");
        let stream = request.accept();
        let (stream_read, stream_write) = tokio::io::split(stream);
        relay_split(recv, send, stream_read, stream_write).await;
        debug!(%flow, "flow finished");
    } else {
        debug!(%flow, reset = response.reset, "dial failed");
        request.complete(response.reset);
    }
}

/// One UDP conversation: queued datagrams out, session reads back as
/// replies with the endpoints swapped.
pub(crate) async fn serve_udp_flow<R, W>(
    mut recv: R,
    mut send: W,
    flow: FlowId,
    mut datagrams: mpsc::Receiver<Vec<u8>>,
    reply_tx: mpsc::Sender<UdpReply>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Err(e) = write_envelope(&mut send, &connect_request_for(flow, Transport::Udp)).await {
        debug!(%flow, error = %e, "udp connect request failed");
        return;
    }

    match read_envelope(&mut recv).await {
        Ok(Envelope::ConnectResponse(response)) if response.established => {}
        Ok(_) => {
            debug!(%flow, "udp dial not established");
            return;
        }
        Err(e) => {
            debug!(%flow, error = %e, "udp session ended before connect response");
            return;
        }
    }

    let outbound = async {
        // One datagram per write; the agent end preserves the same framing.
        while let Some(payload) = datagrams.recv().await {
            if send.write_all(&payload).await.is_err() || send.flush().await.is_err() {
                break;
            }
        }
        let _ = send.shutdown().await;
    };

    let inbound = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            match recv.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if reply_tx
                        .send((buf[..n].to_vec(), flow.dst, flow.src))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    };

    tokio::join!(outbound, inbound);
    debug!(%flow, "udp conversation finished");
}

fn connect_request_for(flow: FlowId, transport: Transport) -> Envelope {
    let family = if flow.dst.is_ipv4() {
        Family::V4
    } else {
        Family::V6
    };
    Envelope::ConnectRequest(ConnectRequest {
        address: flow.dst.ip().to_string(),
        port: flow.dst.port(),
        transport,
        family,
    })
}

/// Smart-ping resolution over the multiplexed transport: one fresh
/// session, one HostPingRequest, one answer.
struct MuxPinger {
    connection: quinn::Connection,
}

impl Pinger for MuxPinger {
    async fn alive(&self, addr: IpAddr) -> bool {
        let Ok((mut send, mut recv)) = self.connection.open_bi().await else {
            return false;
        };

        let request = Envelope::HostPingRequest(HostPingRequest {
            address: addr.to_string(),
        });
        if write_envelope(&mut send, &request).await.is_err() {
            return false;
        }

        matches!(
            read_envelope(&mut recv).await,
            Ok(Envelope::HostPingResponse(response)) if response.alive
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
