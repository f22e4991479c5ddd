use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::error::CollectError;
use crate::metrics::calculator::DeltaCalculator;
use crate::metrics::clock::{SystemTickClock, TickClock};
use crate::metrics::collector::{CounterSource, SystemCounterSource};
use crate::metrics::types::{InterfaceSample, RawInterface};

/// Live per-interface statistics, keyed by interface name.
///
/// One mutex guards the whole map. Poll cycles mutate it in a single short
/// critical section and every accessor clones data out, so callers never
/// hold a reference into the cache.
pub struct TrafficMonitor {
    source: Arc<dyn CounterSource>,
    calculator: DeltaCalculator,
    stats: Mutex<BTreeMap<String, InterfaceSample>>,
    running: AtomicBool,
}

impl TrafficMonitor {
    pub fn new(source: Arc<dyn CounterSource>, clock: Arc<dyn TickClock>) -> Self {
        Self {
            source,
            calculator: DeltaCalculator::new(clock),
            stats: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Monitor backed by the OS counters and the process tick clock.
    pub fn system() -> Self {
        Self::new(
            Arc::new(SystemCounterSource::new()),
            Arc::new(SystemTickClock::new()),
        )
    }

    pub fn source(&self) -> Arc<dyn CounterSource> {
        Arc::clone(&self.source)
    }

    fn lock_stats(&self) -> MutexGuard<'_, BTreeMap<String, InterfaceSample>> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queries the interfaces once and starts accepting updates.
    pub fn start(&self) -> bool {
        if self.running.load(Ordering::SeqCst) {
            return true;
        }
        let result = self.source.read_counters();
        if !self.apply_counters(result) {
            warn!("Initial interface query failed, monitor not started.");
            return false;
        }
        self.running.store(true, Ordering::SeqCst);
        info!(interfaces = self.lock_stats().len(), "Traffic monitor started.");
        true
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Traffic monitor stopped.");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs one poll cycle against the counter source.
    pub fn update(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let result = self.source.read_counters();
        self.apply_counters(result)
    }

    /// Applies the outcome of a counter read that was performed elsewhere
    /// (for example on a blocking task with a timeout).
    pub fn apply_poll(&self, result: Result<Vec<RawInterface>, CollectError>) -> bool {
        if !self.is_running() {
            return false;
        }
        self.apply_counters(result)
    }

    fn apply_counters(&self, result: Result<Vec<RawInterface>, CollectError>) -> bool {
        let interfaces = match result {
            Ok(interfaces) => interfaces,
            Err(e) => {
                // Keep the previous cycle's view intact.
                warn!(error = %e, "Counter read failed, keeping cached interface stats.");
                return false;
            }
        };

        let mut stats = self.lock_stats();
        let mut seen: HashSet<String> = HashSet::with_capacity(stats.len());

        for iface in interfaces.into_iter().filter(RawInterface::is_eligible) {
            let sample = stats.entry(iface.name.clone()).or_insert_with(|| {
                info!(interface = %iface.name, description = %iface.description, "Interface appeared.");
                InterfaceSample::new(iface.name.clone(), iface.description.clone())
            });
            if !self
                .calculator
                .update(sample, iface.bytes_in, iface.bytes_out)
            {
                debug!(interface = %iface.name, "Update skipped, interval too short.");
            }
            seen.insert(iface.name);
        }

        stats.retain(|name, _| {
            let keep = seen.contains(name);
            if !keep {
                info!(interface = %name, "Interface disappeared, dropping cached stats.");
            }
            keep
        });
        true
    }

    /// Copies of every active interface sample, ordered by name.
    pub fn get_all_stats(&self) -> Vec<InterfaceSample> {
        self.lock_stats()
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect()
    }

    pub fn get_aggregated_stats(&self) -> InterfaceSample {
        let all = self.get_all_stats();
        self.calculator.aggregate(&all)
    }

    /// `None` when the interface was not present in the latest cycle.
    pub fn get_interface_stats(&self, name: &str) -> Option<InterfaceSample> {
        self.lock_stats().get(name).cloned()
    }

    /// Restarts speed and peak tracking for one interface.
    pub fn reset_interface(&self, name: &str) -> bool {
        let mut stats = self.lock_stats();
        match stats.get_mut(name) {
            Some(sample) => {
                self.calculator.reset(sample);
                true
            }
            None => false,
        }
    }
}
