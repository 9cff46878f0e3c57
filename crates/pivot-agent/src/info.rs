//! Host identity and interface inventory.
//!
//! Everything here is best effort: a field that cannot be read becomes
//! the literal string "UNKNOWN" (or 0 for the MTU) rather than an error,
//! because the info exchange must never fail a working tunnel.

use std::collections::BTreeMap;

use pivot_core::protocol::NetInterface;

/// `<user>@<host>` for the operator's agent listing.
pub fn agent_name() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "UNKNOWN".to_string());

    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "UNKNOWN".to_string());

    format!("{user}@{host}")
}

/// Enumerate the host's interfaces with their addresses, MAC and MTU.
pub fn interfaces() -> Vec<NetInterface> {
    let Ok(addrs) = nix::ifaddrs::getifaddrs() else {
        return Vec::new();
    };

    let mut table: BTreeMap<String, NetInterface> = BTreeMap::new();

    for ifaddr in addrs {
        let name = ifaddr.interface_name.clone();
        let entry = table.entry(name.clone()).or_insert_with(|| NetInterface {
            name: name.clone(),
            addrs: Vec::new(),
            mac: "UNKNOWN".to_string(),
            mtu: read_mtu(&name),
        });

        let Some(address) = ifaddr.address else {
            continue;
        };

        if let Some(link) = address.as_link_addr() {
            if let Some(mac) = link.addr() {
                entry.mac = format!(
                    "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                    mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
                );
            }
        } else if let Some(sin) = address.as_sockaddr_in() {
            entry.addrs.push(sin.ip().to_string());
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            entry.addrs.push(sin6.ip().to_string());
        }
    }

    table.into_values().collect()
}

fn read_mtu(name: &str) -> u32 {
    std::fs::read_to_string(format!("/sys/class/net/{name}/mtu"))
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
