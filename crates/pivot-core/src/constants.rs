//! Protocol and configuration constants for pivot.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// ALPN identifier for QUIC connections.
pub const ALPN: &[u8] = b"pivot/1";

/// Maximum envelope payload size (1 MiB).
///
/// Envelopes carry control payloads and relayed UDP datagrams, never bulk
/// TCP data, so the cap stays small.
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

// =============================================================================
// Timing Constants
// =============================================================================

/// Deadline for an agent-side dial of a tunneled target.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the agent's connection to the proxy endpoint.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-port budget for a smart-ping TCP probe.
pub const SMART_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// QUIC idle timeout; agents may sit quiet for long stretches.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Keep-alive interval on the agent side, well under the idle timeout.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

// =============================================================================
// Relay Constants
// =============================================================================

/// Buffer size per relay direction.
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

// =============================================================================
// Smart Ping Constants
// =============================================================================

/// Ports probed to establish reachability of a ping target.
///
/// 445 and 80 are near-universally filtered-or-answered: a SYN that draws
/// any response (accept or refuse) proves the host is up.
pub const SMART_PING_PORTS: &[u16] = &[445, 80];

// =============================================================================
// Default Values
// =============================================================================

/// Default proxy listen port.
pub const DEFAULT_PROXY_PORT: u16 = 11601;

/// Default TUN interface name on the proxy side.
pub const DEFAULT_TUN_NAME: &str = "pivot0";

/// Default depth of the userland stack's internal packet channel.
pub const DEFAULT_STACK_BUFFER: usize = 1024;

/// Default per-socket TCP buffer in the userland stack.
pub const DEFAULT_TCP_BUFFER: usize = 512 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_is_versioned() {
        assert!(ALPN.ends_with(b"/1"));
    }

    #[test]
    fn dial_timeout_is_five_seconds() {
        assert_eq!(DIAL_TIMEOUT, Duration::from_secs(5));
    }

    #[test]
    fn relay_buffer_within_bound() {
        assert!(RELAY_BUFFER_SIZE <= 64 * 1024);
    }
}
