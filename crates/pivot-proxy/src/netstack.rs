//! The userland stack host.
//!
//! Owns the TUN device and the netstack-smoltcp stack, and routes between
//! them: raw packets are pumped TUN↔stack (with ICMPv4 lifted out before
//! the stack sees it), accepted TCP flows and UDP datagrams are wrapped as
//! tun-connections and enqueued to the currently installed pool.
//!
//! Forwarder loops never wait on a consumer: they take the pool slot's
//! lock briefly, enqueue or drop, and go back to the stack.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::{Sink, SinkExt, Stream, StreamExt};
use netstack_smoltcp::StackBuilder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use pivot_core::constants::{DEFAULT_STACK_BUFFER, DEFAULT_TCP_BUFFER, DEFAULT_TUN_NAME};
use pivot_core::{Error, Result};

use crate::flow::{FlowId, IcmpPacket, TcpRequest, TunConn, UdpDatagram};
use crate::icmp;
use crate::pool::ConnPool;
use crate::tun::TunDevice;

/// A UDP reply to emit from the stack: payload, source (the dialled
/// target), destination (the TUN-side originator).
pub type UdpReply = (Vec<u8>, SocketAddr, SocketAddr);

/// Tuning for the userland stack.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub tun_name: String,
    pub tun_mtu: u16,
    /// Depth of the stack's internal packet channel.
    pub stack_buffer: usize,
    /// Per-socket TCP buffer.
    pub tcp_buffer: usize,
    pub udp_enabled: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            tun_name: DEFAULT_TUN_NAME.to_string(),
            tun_mtu: 1500,
            stack_buffer: DEFAULT_STACK_BUFFER,
            tcp_buffer: DEFAULT_TCP_BUFFER,
            udp_enabled: true,
        }
    }
}

/// The hot-swappable pool pointer shared with the forwarder loops.
///
/// Installing closes the previous pool under the lock, so no flow enqueued
/// before a swap can reach the new pool's consumer and vice versa.
#[derive(Clone, Default)]
pub struct PoolSlot {
    inner: Arc<Mutex<Option<Arc<ConnPool>>>>,
}

impl PoolSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current pool. The old pool is closed first, which drains
    /// and resets whatever it still holds.
    pub fn install(&self, pool: Arc<ConnPool>) {
        let mut slot = self.inner.lock().unwrap();
        if let Some(old) = slot.take() {
            old.close();
        }
        *slot = Some(pool);
    }

    /// Drop the current pool (closing it). Flows arriving afterwards are
    /// discarded until a new pool is installed.
    pub fn clear(&self) {
        if let Some(old) = self.inner.lock().unwrap().take() {
            old.close();
        }
    }

    /// Hand a flow to the current pool, or drop it when there is none.
    /// The stack times abandoned flows out on its own.
    pub fn enqueue(&self, conn: TunConn) {
        let slot = self.inner.lock().unwrap();
        match slot.as_ref() {
            Some(pool) if !pool.closed() => {
                if let Err(e) = pool.add(conn) {
                    debug!(error = %e, "flow lost to closing pool");
                }
            }
            _ => trace!(kind = conn.kind(), "flow dropped, no active pool"),
        }
    }
}

/// Handle over the running stack host.
pub struct NetStack {
    name: String,
    mtu: u16,
    pool: PoolSlot,
    udp_reply_tx: mpsc::Sender<UdpReply>,
    tun_inject_tx: mpsc::Sender<Vec<u8>>,
}

impl NetStack {
    /// Open the TUN device, bring the userland stack up, and spawn the
    /// pump and forwarder tasks. Failure here is fatal to the process.
    pub async fn spawn(config: StackConfig) -> Result<NetStack> {
        let tun = TunDevice::open(&config.tun_name, config.tun_mtu)?;
        let name = tun.name().to_string();
        let mtu = tun.mtu();

        // The stack's own ICMP answering stays off: the responder decides
        // what a ping learns, not the stack.
        let (stack, runner, udp_socket, tcp_listener) = StackBuilder::default()
            .stack_buffer_size(config.stack_buffer)
            .tcp_buffer_size(config.tcp_buffer)
            .enable_tcp(true)
            .enable_udp(config.udp_enabled)
            .enable_icmp(false)
            .build()
            .map_err(|e| Error::StackInit {
                message: format!("failed to build userland stack: {e}"),
            })?;

        let tcp_listener = tcp_listener.ok_or_else(|| Error::StackInit {
            message: "stack built without tcp listener".into(),
        })?;

        if let Some(runner) = runner {
            tokio::spawn(runner);
        }

        let pool = PoolSlot::new();
        let (stack_sink, stack_stream) = stack.split();
        let (tun_reader, tun_writer) = tokio::io::split(tun.into_inner());
        let (tun_inject_tx, tun_inject_rx) = mpsc::channel::<Vec<u8>>(config.stack_buffer);
        let (udp_reply_tx, udp_reply_rx) = mpsc::channel::<UdpReply>(config.stack_buffer);

        tokio::spawn(run_tcp_forwarder(tcp_listener, pool.clone()));

        if let Some(udp_socket) = udp_socket {
            let (udp_stream, udp_sink) = udp_socket.split();
            tokio::spawn(run_udp_forwarder(udp_stream, pool.clone()));
            tokio::spawn(run_udp_reply_writer(udp_reply_rx, udp_sink));
        }

        tokio::spawn(run_tun_ingress(
            tun_reader,
            stack_sink,
            pool.clone(),
            mtu,
        ));
        tokio::spawn(run_stack_egress(stack_stream, tun_inject_tx.clone()));
        tokio::spawn(run_tun_writer(tun_inject_rx, tun_writer));

        Ok(NetStack {
            name,
            mtu,
            pool,
            udp_reply_tx,
            tun_inject_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Swap in the pool for a newly attached agent.
    pub fn install_pool(&self, pool: Arc<ConnPool>) {
        self.pool.install(pool);
    }

    /// Detach the current pool.
    pub fn clear_pool(&self) {
        self.pool.clear();
    }

    /// Sender the broker uses to emit UDP replies back through the stack.
    pub fn udp_reply_tx(&self) -> mpsc::Sender<UdpReply> {
        self.udp_reply_tx.clone()
    }

    /// Sender for raw packets written straight to the TUN device
    /// (synthesized ICMP replies).
    pub fn tun_inject_tx(&self) -> mpsc::Sender<Vec<u8>> {
        self.tun_inject_tx.clone()
    }
}

async fn run_tcp_forwarder<L>(listener: L, pool: PoolSlot)
where
    L: Stream<Item = (netstack_smoltcp::TcpStream, SocketAddr, SocketAddr)>,
{
    let mut listener = Box::pin(listener);
    while let Some((stream, src, dst)) = listener.next().await {
        let flow = FlowId { src, dst };
        trace!(%flow, "tcp flow terminated");
        pool.enqueue(TunConn::Tcp(TcpRequest::new(flow, stream)));
    }
    debug!("tcp forwarder finished");
}

async fn run_udp_forwarder<S>(datagrams: S, pool: PoolSlot)
where
    S: Stream<Item = (Vec<u8>, SocketAddr, SocketAddr)>,
{
    let mut datagrams = Box::pin(datagrams);
    while let Some((payload, src, dst)) = datagrams.next().await {
        let flow = FlowId { src, dst };
        trace!(%flow, len = payload.len(), "udp datagram");
        pool.enqueue(TunConn::Udp(UdpDatagram { flow, payload }));
    }
    debug!("udp forwarder finished");
}

async fn run_udp_reply_writer<S>(mut replies: mpsc::Receiver<UdpReply>, sink: S)
where
    S: Sink<(Vec<u8>, SocketAddr, SocketAddr), Error = io::Error>,
{
    let mut sink = Box::pin(sink);
    while let Some((payload, from, to)) = replies.recv().await {
        if let Err(e) = sink.send((payload, from, to)).await {
            warn!(error = %e, "udp reply write failed");
            break;
        }
    }
}

/// TUN → stack, with ICMP lifted out before the stack sees it.
async fn run_tun_ingress<R, S>(mut reader: R, sink: S, pool: PoolSlot, mtu: u16)
where
    R: AsyncRead + Unpin,
    S: Sink<Vec<u8>, Error = io::Error>,
{
    let mut sink = Box::pin(sink);
    let mut buf = vec![0u8; mtu as usize + 4];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let packet = &buf[..n];
                if icmp::is_icmpv4(packet) {
                    pool.enqueue(TunConn::Icmp(IcmpPacket {
                        packet: packet.to_vec(),
                    }));
                } else if icmp::is_icmpv6(packet) {
                    // ICMPv6 is policy-dropped; only the v4 responder speaks.
                    trace!("icmpv6 packet dropped");
                } else if let Err(e) = sink.send(packet.to_vec()).await {
                    warn!(error = %e, "stack ingress failed");
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "tun read failed");
                break;
            }
        }
    }
}

/// Stack → TUN, funneled through the inject channel so synthesized ICMP
/// replies share one writer.
async fn run_stack_egress<S>(stream: S, tun_inject_tx: mpsc::Sender<Vec<u8>>)
where
    S: Stream<Item = io::Result<Vec<u8>>>,
{
    let mut stream = Box::pin(stream);
    while let Some(packet) = stream.next().await {
        match packet {
            Ok(packet) => {
                if tun_inject_tx.send(packet).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "stack egress error"),
        }
    }
}

async fn run_tun_writer<W>(mut packets: mpsc::Receiver<Vec<u8>>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = packets.recv().await {
        if let Err(e) = writer.write_all(&packet).await {
            warn!(error = %e, "tun write failed");
            break;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn flow(port: u16) -> FlowId {
        FlowId {
            src: "10.0.0.9:41000".parse().unwrap(),
            dst: format!("10.0.0.5:{port}").parse().unwrap(),
        }
    }

    fn tcp_conn(port: u16) -> (TunConn, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(64);
        (TunConn::Tcp(TcpRequest::new(flow(port), near)), far)
    }

    #[tokio::test]
    async fn enqueue_without_pool_drops_the_flow() {
        let slot = PoolSlot::new();
        let (conn, mut far) = tcp_conn(80);

        slot.enqueue(conn);

        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn enqueue_delivers_to_installed_pool() {
        let slot = PoolSlot::new();
        let pool = Arc::new(ConnPool::new());
        slot.install(Arc::clone(&pool));

        let (conn, _far) = tcp_conn(80);
        slot.enqueue(conn);

        assert_eq!(pool.next().await.unwrap().kind(), "tcp");
    }

    #[tokio::test]
    async fn install_closes_previous_pool_and_redirects_new_flows() {
        let slot = PoolSlot::new();

        let old = Arc::new(ConnPool::new());
        slot.install(Arc::clone(&old));
        let (queued, mut queued_far) = tcp_conn(80);
        slot.enqueue(queued);

        let new = Arc::new(ConnPool::new());
        slot.install(Arc::clone(&new));

        // Old pool closed and drained: its queued flow was reset, and its
        // consumer observes PoolClosed.
        assert!(old.closed());
        let mut buf = [0u8; 1];
        assert_eq!(queued_far.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(
            old.next().await,
            Err(pivot_core::Error::PoolClosed)
        ));

        // New flows land in the new pool only.
        let (conn, _far) = tcp_conn(443);
        slot.enqueue(conn);
        match new.next().await.unwrap() {
            TunConn::Tcp(request) => assert_eq!(request.flow().dst.port(), 443),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn clear_closes_and_discards() {
        let slot = PoolSlot::new();
        let pool = Arc::new(ConnPool::new());
        slot.install(Arc::clone(&pool));

        slot.clear();
        assert!(pool.closed());

        let (conn, mut far) = tcp_conn(80);
        slot.enqueue(conn);
        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ingress_diverts_icmp_and_forwards_the_rest() {
        let slot = PoolSlot::new();
        let pool = Arc::new(ConnPool::new());
        slot.install(Arc::clone(&pool));

        // One ICMP echo request and one minimal UDP/IPv4 packet.
        let echo = crate::icmp::tests_support::sample_echo_request();
        let mut udp_packet = echo.clone();
        udp_packet[9] = 17; // protocol: UDP

        let (tx, rx) = mpsc::channel::<Vec<u8>>(8);
        let (mut near, far) = tokio::io::duplex(4096);

        let ingress = tokio::spawn(run_tun_ingress(
            far,
            sink_from_channel(tx),
            slot.clone(),
            1500,
        ));

        // One write per packet, observed before the next goes out: the
        // duplex pipe is a byte stream and would otherwise coalesce them.
        near.write_all(&echo).await.unwrap();
        match pool.next().await.unwrap() {
            TunConn::Icmp(p) => assert_eq!(p.packet, echo),
            other => panic!("unexpected {other:?}"),
        }

        near.write_all(&udp_packet).await.unwrap();
        let mut rx = rx;
        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded, udp_packet);

        drop(near);
        ingress.await.unwrap();
    }

    fn sink_from_channel(
        tx: mpsc::Sender<Vec<u8>>,
    ) -> impl Sink<Vec<u8>, Error = io::Error> {
        futures::sink::unfold(tx, |tx, packet: Vec<u8>| async move {
            tx.send(packet)
                .await
                .map_err(|_| io::Error::other("closed"))?;
            Ok(tx)
        })
    }
}
