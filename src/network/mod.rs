//! Network Interface Resolver
//!
//! Lists usable local addresses for the HTTP server to bind, honoring the
//! advanced network filter settings. Kept behind a trait so the state
//! machine tests can simulate empty discovery results.

use std::net::IpAddr;

use serde::Serialize;

use crate::settings::SettingsSnapshot;

/// A discovered local address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetInterface {
    pub name: String,
    pub address: IpAddr,
}

/// Filter flags taken from the network settings group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceFilter {
    pub wifi_only: bool,
    pub enable_ipv6: bool,
    pub enable_loopback: bool,
    pub loopback_only: bool,
}

impl InterfaceFilter {
    pub fn from_settings(settings: &SettingsSnapshot) -> Self {
        Self {
            wifi_only: settings.wifi_only,
            enable_ipv6: settings.enable_ipv6,
            enable_loopback: settings.enable_loopback,
            loopback_only: settings.loopback_only,
        }
    }

    fn accepts(&self, name: &str, address: &IpAddr) -> bool {
        if address.is_unspecified() || is_multicast(address) {
            return false;
        }
        if self.loopback_only {
            return address.is_loopback();
        }
        if address.is_loopback() {
            return self.enable_loopback;
        }
        if !self.enable_ipv6 && address.is_ipv6() {
            return false;
        }
        if self.wifi_only && !is_wireless_name(name) {
            return false;
        }
        true
    }
}

fn is_multicast(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => v4.is_multicast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

// Linux/BSD wireless interface naming conventions; Android reports "wlan0".
fn is_wireless_name(name: &str) -> bool {
    name.starts_with("wlan") || name.starts_with("wlp") || name.starts_with("wifi") || name.starts_with("ap")
}

/// Local address enumeration seam
pub trait InterfaceResolver: Send + Sync {
    /// Usable addresses under `filter`, sorted by interface name.
    /// An empty result is not an error; the orchestrator retries discovery.
    fn resolve(&self, filter: &InterfaceFilter) -> Vec<NetInterface>;
}

/// Resolver backed by the operating system interface table
#[derive(Debug, Default)]
pub struct SystemInterfaceResolver;

impl InterfaceResolver for SystemInterfaceResolver {
    fn resolve(&self, filter: &InterfaceFilter) -> Vec<NetInterface> {
        let interfaces = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                tracing::warn!(error = %e, "Interface enumeration failed");
                return Vec::new();
            }
        };

        let mut found: Vec<NetInterface> = interfaces
            .into_iter()
            .filter(|iface| filter.accepts(&iface.name, &iface.ip()))
            .map(|iface| NetInterface {
                address: iface.ip(),
                name: iface.name,
            })
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.address.cmp(&b.address)));
        found.dedup();

        tracing::debug!(count = found.len(), "Resolved local interfaces");
        found
    }
}
