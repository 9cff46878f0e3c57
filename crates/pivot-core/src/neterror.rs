//! Classification of dial errors.
//!
//! A dial can fail because the target actively answered (RST, ICMP
//! unreachable) or because nothing answered at all. The distinction drives
//! the reset bit in `ConnectResponse`: an answered failure means the proxy
//! should RST the originating userland TCP flow instead of letting it time
//! out.

use std::io;

/// True when the error implies a live peer (or an on-path router speaking
/// for it) responded to the dial.
pub fn host_responded(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
    )
}
