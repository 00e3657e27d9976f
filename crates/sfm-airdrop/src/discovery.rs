//! mDNS discovery — advertise this device and scan for peers.
//!
//! Peers announce `_sfm-airdrop._tcp` on `local.` with TXT records
//! `name=<device_name>` and `capability=file-transfer`. Discovery only finds
//! devices; all authentication happens in the transfer handshake.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::error::TransferError;

/// mDNS service type for the AirDrop transfer service.
pub const SERVICE_TYPE: &str = "_sfm-airdrop._tcp.local.";
/// Default transfer port.
pub const DEFAULT_PORT: u16 = 53317;

/// A peer found on the local network.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub hostname: String,
}

/// Keeps this device announced on the local network for its lifetime.
pub struct Advertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Advertiser {
    /// Register the service and start answering mDNS queries.
    pub fn start(device_name: &str, port: u16) -> Result<Self, TransferError> {
        let daemon = ServiceDaemon::new()?;

        let hostname = format!("{device_name}.local.");
        let properties = [("name", device_name), ("capability", "file-transfer")];
        let info = ServiceInfo::new(SERVICE_TYPE, device_name, &hostname, "", port, &properties[..])?
            .enable_addr_auto();
        let fullname = info.get_fullname().to_string();

        daemon.register(info)?;
        tracing::info!(device_name, port, "advertising on mDNS");

        Ok(Self { daemon, fullname })
    }

    /// Withdraw the announcement and stop the responder.
    pub fn stop(self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
    }
}

/// Scan the local network for peers for `timeout`, skipping our own
/// `device_name`. Devices are deduplicated by address.
pub fn scan(device_name: &str, timeout: Duration) -> Result<Vec<DiscoveredDevice>, TransferError> {
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(SERVICE_TYPE)?;

    let deadline = Instant::now() + timeout;
    let mut devices: HashMap<IpAddr, DiscoveredDevice> = HashMap::new();

    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        let event = match receiver.recv_timeout(remaining) {
            Ok(event) => event,
            Err(_) => break,
        };

        if let ServiceEvent::ServiceResolved(info) = event {
            let name = info
                .get_property_val_str("name")
                .unwrap_or_default()
                .to_string();
            if name.is_empty() || name == device_name {
                continue;
            }
            let Some(addr) = info.get_addresses().iter().next().copied() else {
                continue;
            };

            tracing::debug!(device = %name, %addr, port = info.get_port(), "discovered peer");
            devices.insert(
                addr,
                DiscoveredDevice {
                    name,
                    addr,
                    port: info.get_port(),
                    hostname: info.get_hostname().to_string(),
                },
            );
        }
    }

    let _ = daemon.shutdown();
    Ok(devices.into_values().collect())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
