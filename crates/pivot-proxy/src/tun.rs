//! TUN device handling.
//!
//! Opens the device the operator routes target networks into. Requires
//! CAP_NET_ADMIN. No address is assigned here; the operator points routes
//! at the interface and the userland stack terminates whatever arrives.

use tun::{AbstractDevice, AsyncDevice, Configuration};

use pivot_core::{Error, Result};

/// An opened TUN device plus the properties read back from the kernel.
pub struct TunDevice {
    device: AsyncDevice,
    name: String,
    mtu: u16,
}

impl TunDevice {
    /// Open (creating if necessary) the named TUN device at the given MTU.
    pub fn open(name: &str, mtu: u16) -> Result<Self> {
        let mut config = Configuration::default();
        if !name.is_empty() {
            config.tun_name(name);
        }
        config.mtu(mtu);
        config.up();

        let device = tun::create_as_async(&config).map_err(|e| Error::StackInit {
            message: format!("failed to open tun device {name:?}: {e}"),
        })?;

        let actual_name = device.tun_name().map_err(|e| Error::StackInit {
            message: format!("failed to read tun name: {e}"),
        })?;
        let actual_mtu = device.mtu().map_err(|e| Error::StackInit {
            message: format!("failed to read tun mtu: {e}"),
        })?;

        Ok(Self {
            device,
            name: actual_name,
            mtu: actual_mtu,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn into_inner(self) -> AsyncDevice {
        self.device
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Real device creation needs CAP_NET_ADMIN; exercised only when run as root.
    #[test]
    #[ignore = "requires root privileges"]
    fn open_tun_device() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let device = TunDevice::open("pivot-test0", 1400).unwrap();
        assert_eq!(device.mtu(), 1400);
        assert!(!device.name().is_empty());
    }
}
