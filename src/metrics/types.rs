/// Source label used for the synthetic sample covering every monitored interface.
pub const AGGREGATE_LABEL: &str = "All Interfaces";
pub const AGGREGATE_DESCRIPTION: &str = "Aggregated Statistics";

/// Per-interface throughput state, refreshed once per poll cycle.
///
/// Speeds are bytes per second. `last_update_ms` is the tick of the last
/// accepted update; `None` until the interface has been observed once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfaceSample {
    pub name: String,
    pub description: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub prev_bytes_received: u64,
    pub prev_bytes_sent: u64,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub peak_download_speed: f64,
    pub peak_upload_speed: f64,
    pub is_active: bool,
    pub last_update_ms: Option<u32>,
}

impl InterfaceSample {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.name == AGGREGATE_LABEL
    }
}

/// Operational status as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperStatus {
    Up,
    Down,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    Wireless,
    Ppp,
    Loopback,
    Other,
}

/// One interface row from the counter collaborator, copied into engine-owned
/// values before any filtering happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInterface {
    pub name: String,
    pub description: String,
    pub status: OperStatus,
    pub link_type: LinkType,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl RawInterface {
    /// Only interfaces that are up, not loopback, and wired, wireless or PPP
    /// links are tracked.
    pub fn is_eligible(&self) -> bool {
        if self.status != OperStatus::Up {
            return false;
        }
        matches!(
            self.link_type,
            LinkType::Ethernet | LinkType::Wireless | LinkType::Ppp
        )
    }
}
