//! pivot-agent: the remote side of the relay.
//!
//! Dials out to the proxy over the multiplexed transport, then services
//! one request envelope per accepted session: target dials, reachability
//! probes, host info, and reverse listeners.

pub mod cli;
pub mod handler;
pub mod info;
pub mod listener;
pub mod smartping;
