//! Interface sampling: raw counters in, per-interface and aggregate
//! throughput out.

pub mod calculator;
pub mod clock;
pub mod collector;
pub mod monitor;
pub mod types;

pub use calculator::{DeltaCalculator, MIN_ELAPSED_SECS, counter_delta};
pub use clock::{ManualClock, SystemTickClock, TickClock};
pub use collector::{CounterSource, SystemCounterSource};
pub use monitor::TrafficMonitor;
pub use types::{
    AGGREGATE_DESCRIPTION, AGGREGATE_LABEL, InterfaceSample, LinkType, OperStatus, RawInterface,
};
