//! pivot-proxy: the TUN-facing side of the relay.
//!
//! Arbitrary IP traffic routed into the TUN device is terminated by a
//! userland network stack, queued as per-flow tun-connections, and
//! bridged over the multiplexed transport to the connected agent.

pub mod broker;
pub mod cli;
pub mod flow;
pub mod forward;
pub mod icmp;
pub mod netstack;
pub mod pool;
pub mod tun;
