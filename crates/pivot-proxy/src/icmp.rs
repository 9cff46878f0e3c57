//! ICMP policy.
//!
//! The userland stack never answers pings. Echo requests lifted off the
//! TUN device come here instead: the target's liveness is established
//! through the agent (smart ping), and only a live target produces an
//! echo reply. Dead or unreachable targets produce silence, never an
//! unreachable, so the operator's host discovery sees real topology and
//! nothing synthetic leaks.

use std::net::{IpAddr, Ipv4Addr};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Packet, Ipv4Repr};

/// Reachability probe seam. The proxy implementation asks the agent over
/// a fresh session; tests substitute canned answers.
#[allow(async_fn_in_trait)]
pub trait Pinger {
    async fn alive(&self, addr: IpAddr) -> bool;
}

/// A parsed ICMPv4 echo request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoRequest {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ident: u16,
    pub seq_no: u16,
    pub payload: Vec<u8>,
}

/// True for an IPv4 packet carrying ICMP.
pub fn is_icmpv4(packet: &[u8]) -> bool {
    packet.len() >= 20 && packet[0] >> 4 == 4 && packet[9] == 1
}

/// True for an IPv6 packet whose next header is ICMPv6.
pub fn is_icmpv6(packet: &[u8]) -> bool {
    packet.len() >= 40 && packet[0] >> 4 == 6 && packet[6] == 58
}

/// Parse an echo request out of a raw IPv4 packet. Anything else, echo
/// replies and unreachables included, yields `None`.
pub fn parse_echo_request(packet: &[u8]) -> Option<EchoRequest> {
    let ipv4 = Ipv4Packet::new_checked(packet).ok()?;
    if ipv4.next_header() != IpProtocol::Icmp {
        return None;
    }

    let icmp = Icmpv4Packet::new_checked(ipv4.payload()).ok()?;
    let repr = Icmpv4Repr::parse(&icmp, &ChecksumCapabilities::default()).ok()?;

    match repr {
        Icmpv4Repr::EchoRequest {
            ident,
            seq_no,
            data,
        } => Some(EchoRequest {
            src: ipv4.src_addr(),
            dst: ipv4.dst_addr(),
            ident,
            seq_no,
            payload: data.to_vec(),
        }),
        _ => None,
    }
}

/// Synthesize the full echo-reply packet: addresses swapped, identifier,
/// sequence and payload preserved, checksums recomputed.
pub fn build_echo_reply(request: &EchoRequest) -> Vec<u8> {
    let checksum_caps = ChecksumCapabilities::default();

    let icmp_repr = Icmpv4Repr::EchoReply {
        ident: request.ident,
        seq_no: request.seq_no,
        data: &request.payload,
    };
    let ip_repr = Ipv4Repr {
        src_addr: request.dst,
        dst_addr: request.src,
        next_header: IpProtocol::Icmp,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 64,
    };

    let mut buf = vec![0u8; ip_repr.buffer_len() + icmp_repr.buffer_len()];
    let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf[..]);
    ip_repr.emit(&mut ip_packet, &checksum_caps);
    let mut icmp_packet = Icmpv4Packet::new_unchecked(ip_packet.payload_mut());
    icmp_repr.emit(&mut icmp_packet, &checksum_caps);

    buf
}

/// The responder policy: one reply for an echo request to a live target,
/// silence for everything else.
pub async fn respond<P: Pinger>(packet: &[u8], pinger: &P) -> Option<Vec<u8>> {
    let request = parse_echo_request(packet)?;
    if pinger.alive(IpAddr::V4(request.dst)).await {
        Some(build_echo_reply(&request))
    } else {
        None
    }
}


// =============================================================================
// Tests
// =============================================================================
