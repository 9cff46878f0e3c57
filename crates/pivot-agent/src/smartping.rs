//! Host reachability probing.
//!
//! The agent has no raw-socket privileges to send real echo requests, so
//! liveness is inferred: resolve the name, then knock on a couple of
//! near-universal TCP ports. An accepted connection proves life; so does
//! an active refusal, since only a running host sends RST or an on-path
//! ICMP error. Silence proves nothing and counts as dead.

use std::net::IpAddr;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use pivot_core::constants::{SMART_PING_PORTS, SMART_PING_TIMEOUT};
use pivot_core::neterror::host_responded;

/// Resolve `address` and probe it. Returns false on any resolution
/// failure.
pub async fn try_resolve(address: &str) -> bool {
    let Ok(mut addrs) = tokio::net::lookup_host((address, 0u16)).await else {
        return false;
    };
    let Some(addr) = addrs.next() else {
        return false;
    };
    probe(addr.ip()).await
}

async fn probe(ip: IpAddr) -> bool {
    for &port in SMART_PING_PORTS {
        match timeout(SMART_PING_TIMEOUT, TcpStream::connect((ip, port))).await {
            Ok(Ok(_)) => {
                trace!(%ip, port, "probe connected");
                return true;
            }
            Ok(Err(e)) if host_responded(&e) => {
                trace!(%ip, port, error = %e, "probe answered");
                return true;
            }
            _ => {}
        }
    }
    false
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_is_alive() {
        // Whatever the port state, loopback answers: either something
        // accepts or the kernel refuses, and both prove life.
        assert!(try_resolve("127.0.0.1").await);
    }

    #[tokio::test]
    async fn unresolvable_name_is_dead() {
        assert!(!try_resolve("host.does-not-exist.invalid").await);
    }

    #[tokio::test]
    async fn listening_port_counts_as_alive() {
        // Hold a listener on 127.0.0.1 so at least the direct connect path
        // is exercised too.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ip = listener.local_addr().unwrap().ip();
        assert!(probe(ip).await);
    }
}
