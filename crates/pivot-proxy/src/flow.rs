//! Terminated userland flows.
//!
//! A `TunConn` is one flow the stack handed to us: an accepted TCP stream,
//! a UDP datagram, or a raw ICMP packet. TCP flows carry a move-only
//! request handle: every handle must end in exactly one of `accept` or
//! `complete`, and dropping it unclaimed tears the flow down the same way
//! `complete(true)` does.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Any stream the relay can splice.
pub trait SpliceStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> SpliceStream for T {}

/// Boxed stream handed around by the pool and broker.
pub type BoxedStream = Box<dyn SpliceStream>;

/// Endpoint id of a terminated flow: the originating source and the
/// destination the packets were addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Move-only handle over an accepted userland TCP stream.
pub struct TcpRequest {
    flow: FlowId,
    stream: Option<BoxedStream>,
}

impl TcpRequest {
    pub fn new<S>(flow: FlowId, stream: S) -> Self
    where
        S: SpliceStream + 'static,
    {
        Self {
            flow,
            stream: Some(Box::new(stream)),
        }
    }

    pub fn flow(&self) -> FlowId {
        self.flow
    }

    /// Claim the stream for bridging. Consumes the handle.
    pub fn accept(mut self) -> BoxedStream {
        self.stream.take().expect("stream present until consumed")
    }

    /// Finish the flow without bridging it. With `reset` the stream is torn
    /// down immediately; without it the write side is drained with a
    /// graceful shutdown first.
    pub fn complete(mut self, reset: bool) {
        if let Some(mut stream) = self.stream.take() {
            if !reset {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = stream.shutdown().await;
                    });
                }
            }
        }
    }
}

impl Drop for TcpRequest {
    fn drop(&mut self) {
        if self.stream.is_some() {
            trace!(flow = %self.flow, "tcp flow dropped unclaimed");
        }
    }
}

/// One UDP datagram from the stack, with its conversation endpoints.
#[derive(Debug)]
pub struct UdpDatagram {
    pub flow: FlowId,
    pub payload: Vec<u8>,
}

/// One raw ICMP packet lifted off the TUN device before the stack saw it.
#[derive(Debug)]
pub struct IcmpPacket {
    pub packet: Vec<u8>,
}

/// A terminated flow queued for the broker.
pub enum TunConn {
    Tcp(TcpRequest),
    Udp(UdpDatagram),
    Icmp(IcmpPacket),
}

impl TunConn {
    pub fn kind(&self) -> &'static str {
        match self {
            TunConn::Tcp(_) => "tcp",
            TunConn::Udp(_) => "udp",
            TunConn::Icmp(_) => "icmp",
        }
    }

    /// Tear the flow down: RST-or-finish for TCP, drop for UDP and ICMP.
    pub fn terminate(self, reset: bool) {
        match self {
            TunConn::Tcp(request) => request.complete(reset),
            TunConn::Udp(_) | TunConn::Icmp(_) => {}
        }
    }
}

impl fmt::Debug for TunConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunConn::Tcp(request) => write!(f, "TunConn::Tcp({})", request.flow),
            TunConn::Udp(datagram) => write!(f, "TunConn::Udp({})", datagram.flow),
            TunConn::Icmp(packet) => write!(f, "TunConn::Icmp({} bytes)", packet.packet.len()),
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

    fn test_flow() -> FlowId {
        FlowId {
            src: "10.0.0.9:41000".parse().unwrap(),
            dst: "10.0.0.5:80".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn accept_hands_back_the_stream() {
        let (near, far) = tokio::io::duplex(64);
        let request = TcpRequest::new(test_flow(), near);

        let mut stream = request.accept();
        tokio::io::AsyncWriteExt::write_all(&mut stream, b"hi")
            .await
            .unwrap();

        let mut far = far;
        let mut buf = [0u8; 2];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn complete_with_reset_drops_the_stream() {
        let (near, mut far) = tokio::io::duplex(64);
        let request = TcpRequest::new(test_flow(), near);

        request.complete(true);

        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dropping_unclaimed_tears_down_like_reset() {
        let (near, mut far) = tokio::io::duplex(64);
        let request = TcpRequest::new(test_flow(), near);

        drop(request);

        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn terminate_ends_every_kind() {
        let (near, _far) = tokio::io::duplex(64);
        TunConn::Tcp(TcpRequest::new(test_flow(), near)).terminate(true);
        TunConn::Udp(UdpDatagram {
            flow: test_flow(),
            payload: vec![1, 2, 3],
        })
        .terminate(false);
        TunConn::Icmp(IcmpPacket {
            packet: vec![0x45, 0x00],
        })
        .terminate(false);
    }

    #[test]
    fn flow_id_display() {
        assert_eq!(test_flow().to_string(), "10.0.0.9:41000 -> 10.0.0.5:80");
    }
}
