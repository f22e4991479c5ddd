pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod logging;
pub mod metrics;
pub mod units;
pub mod version;

pub use engine::{CycleReport, EngineSettings, MetricsEngine};
pub use history::{HistoryRecord, HistoryStore, TrafficTotals};
pub use metrics::{InterfaceSample, TrafficMonitor};
