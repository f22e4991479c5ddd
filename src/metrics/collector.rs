use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use netdev::interface::InterfaceType;
use sysinfo::Networks;
use tracing::{debug, warn};

use crate::error::CollectError;
use crate::metrics::types::{LinkType, OperStatus, RawInterface};

/// Supplies one reading of every interface the OS knows about.
pub trait CounterSource: Send + Sync {
    fn read_counters(&self) -> Result<Vec<RawInterface>, CollectError>;
}

/// Counters from `sysinfo`, joined by name with `netdev` for link type,
/// description and operational status.
pub struct SystemCounterSource {
    networks: Mutex<Networks>,
}

impl SystemCounterSource {
    pub fn new() -> Self {
        Self {
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }
}

impl Default for SystemCounterSource {
    fn default() -> Self {
        Self::new()
    }
}

fn link_type_of(iface: &netdev::Interface) -> LinkType {
    if iface.is_loopback() {
        return LinkType::Loopback;
    }
    match iface.if_type {
        InterfaceType::Ethernet => LinkType::Ethernet,
        InterfaceType::Wireless80211 => LinkType::Wireless,
        InterfaceType::Ppp => LinkType::Ppp,
        InterfaceType::Loopback => LinkType::Loopback,
        _ => LinkType::Other,
    }
}

impl CounterSource for SystemCounterSource {
    fn read_counters(&self) -> Result<Vec<RawInterface>, CollectError> {
        let mut networks = self
            .networks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        networks.refresh(true);

        let counters: HashMap<&str, (u64, u64)> = networks
            .iter()
            .map(|(name, data)| {
                (
                    name.as_str(),
                    (data.total_received(), data.total_transmitted()),
                )
            })
            .collect();

        let interfaces = netdev::get_interfaces();
        // A working host always reports at least its loopback device.
        if interfaces.is_empty() {
            return Err(CollectError::Enumeration(
                "the OS reported no network interfaces".to_string(),
            ));
        }

        let mut rows = Vec::with_capacity(interfaces.len());
        for iface in interfaces {
            let found = counters.get(iface.name.as_str()).or_else(|| {
                iface
                    .friendly_name
                    .as_deref()
                    .and_then(|friendly| counters.get(friendly))
            });
            let Some(&(bytes_in, bytes_out)) = found else {
                debug!(interface = %iface.name, "No byte counters for interface, skipping.");
                continue;
            };

            let status = if iface.is_up() {
                OperStatus::Up
            } else {
                OperStatus::Down
            };
            let link_type = link_type_of(&iface);
            let description = iface.description.clone().unwrap_or_default();
            let name = iface.friendly_name.clone().unwrap_or(iface.name);

            rows.push(RawInterface {
                name,
                description,
                status,
                link_type,
                bytes_in,
                bytes_out,
            });
        }

        if rows.is_empty() {
            warn!("Interfaces were enumerated but none had byte counters.");
        }
        Ok(rows)
    }
}
