//! Protocol envelope definitions.
//!
//! Every exchange on the multiplexed transport is a typed envelope:
//! one fixed tag byte, a length prefix, and a bincode payload. Tag
//! values are wire contract and must never be renumbered.

mod codec;

pub use codec::{read_envelope, write_envelope, Codec, FRAME_HEADER_LEN};

use serde::{Deserialize, Serialize};

// =============================================================================
// Tag bytes (wire contract)
// =============================================================================

pub mod tag {
    pub const CONNECT_REQUEST: u8 = 0x01;
    pub const CONNECT_RESPONSE: u8 = 0x02;
    pub const HOST_PING_REQUEST: u8 = 0x03;
    pub const HOST_PING_RESPONSE: u8 = 0x04;
    pub const INFO_REQUEST: u8 = 0x05;
    pub const INFO_REPLY: u8 = 0x06;
    pub const LISTENER_REQUEST: u8 = 0x07;
    pub const LISTENER_RESPONSE: u8 = 0x08;
    pub const LISTENER_BIND_RESPONSE: u8 = 0x09;
    pub const LISTENER_SOCK_REQUEST: u8 = 0x0A;
    pub const LISTENER_SOCK_RESPONSE: u8 = 0x0B;
    pub const LISTENER_CLOSE_REQUEST: u8 = 0x0C;
    pub const LISTENER_CLOSE_RESPONSE: u8 = 0x0D;
    pub const CLOSE: u8 = 0x0E;
}

// =============================================================================
// Payloads
// =============================================================================

/// Transport protocol requested for a dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Address family requested for a dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    V4,
    V6,
}

/// Ask the agent to dial a target and splice it to this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub address: String,
    pub port: u16,
    pub transport: Transport,
    pub family: Family,
}

/// Outcome of a dial. `reset` signals the target actively refused, so the
/// proxy side should RST the originating userland TCP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub established: bool,
    pub reset: bool,
}

/// Ask the agent whether a host is reachable from its vantage point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPingRequest {
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPingResponse {
    pub alive: bool,
}

/// One network interface on the agent host, best effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
    pub name: String,
    pub addrs: Vec<String>,
    pub mac: String,
    pub mtu: u32,
}

/// Agent identity and interface inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoReply {
    /// `<user>@<host>`, with `UNKNOWN` standing in for unresolvable parts.
    pub name: String,
    pub interfaces: Vec<NetInterface>,
}

/// Open a listener on the agent and stream accepted sockets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRequest {
    pub network: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerResponse {
    pub listener_id: i32,
    pub err: bool,
    pub err_string: String,
}

/// Streamed once per accepted socket on a listener session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerBindResponse {
    pub sock_id: i32,
    pub err: bool,
    pub err_string: String,
}

/// Claim a parked accepted socket and splice it to this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSockRequest {
    pub sock_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSockResponse {
    pub err: bool,
    pub err_string: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerCloseRequest {
    pub listener_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerCloseResponse {
    pub err: bool,
    pub err_string: String,
}

// =============================================================================
// Top-level Envelope
// =============================================================================

/// Top-level protocol envelope.
///
/// The tag byte is written by the codec, not by serde: only the payload
/// goes through bincode.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    // proxy -> agent requests
    ConnectRequest(ConnectRequest),
    HostPingRequest(HostPingRequest),
    InfoRequest,
    ListenerRequest(ListenerRequest),
    ListenerSockRequest(ListenerSockRequest),
    ListenerCloseRequest(ListenerCloseRequest),
    Close,

    // agent -> proxy responses
    ConnectResponse(ConnectResponse),
    HostPingResponse(HostPingResponse),
    InfoReply(InfoReply),
    ListenerResponse(ListenerResponse),
    ListenerBindResponse(ListenerBindResponse),
    ListenerSockResponse(ListenerSockResponse),
    ListenerCloseResponse(ListenerCloseResponse),
}

impl Envelope {
    /// Wire tag for this envelope.
    pub const fn tag(&self) -> u8 {
        match self {
            Envelope::ConnectRequest(_) => tag::CONNECT_REQUEST,
            Envelope::ConnectResponse(_) => tag::CONNECT_RESPONSE,
            Envelope::HostPingRequest(_) => tag::HOST_PING_REQUEST,
            Envelope::HostPingResponse(_) => tag::HOST_PING_RESPONSE,
            Envelope::InfoRequest => tag::INFO_REQUEST,
            Envelope::InfoReply(_) => tag::INFO_REPLY,
            Envelope::ListenerRequest(_) => tag::LISTENER_REQUEST,
            Envelope::ListenerResponse(_) => tag::LISTENER_RESPONSE,
            Envelope::ListenerBindResponse(_) => tag::LISTENER_BIND_RESPONSE,
            Envelope::ListenerSockRequest(_) => tag::LISTENER_SOCK_REQUEST,
            Envelope::ListenerSockResponse(_) => tag::LISTENER_SOCK_RESPONSE,
            Envelope::ListenerCloseRequest(_) => tag::LISTENER_CLOSE_REQUEST,
            Envelope::ListenerCloseResponse(_) => tag::LISTENER_CLOSE_RESPONSE,
            Envelope::Close => tag::CLOSE,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
