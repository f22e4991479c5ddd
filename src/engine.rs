//! The poll loop: sample the interfaces, then record how many bytes the
//! chosen source moved since the previous cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::CollectError;
use crate::history::{HistoryStore, HistoryWriter};
use crate::metrics::{InterfaceSample, TrafficMonitor};

const RETENTION_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub update_interval: Duration,
    pub collector_timeout: Duration,
    pub selected_interface: Option<String>,
    pub record_history: bool,
    pub auto_trim_days: u32,
}

impl From<&MonitorConfig> for EngineSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            update_interval: config.update_interval(),
            collector_timeout: config.collector_timeout(),
            selected_interface: config.selected_interface().map(str::to_string),
            record_history: config.history.enabled,
            auto_trim_days: config.history.auto_trim_days,
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub updated: bool,
    /// Label of the sample whose totals were compared this cycle.
    pub source: Option<String>,
    /// Bytes down/up handed to the history store.
    pub recorded: Option<(u64, u64)>,
}

impl CycleReport {
    fn failed() -> Self {
        Self {
            updated: false,
            source: None,
            recorded: None,
        }
    }
}

/// Cumulative totals of the recorded source at the end of the last cycle.
/// The aggregate keeps one entry per contributing interface so that an
/// interface joining or leaving does not show up as traffic.
struct Baseline {
    label: String,
    totals: HashMap<String, (u64, u64)>,
}

pub struct MetricsEngine {
    monitor: TrafficMonitor,
    store: Arc<HistoryStore>,
    writer: Mutex<Option<HistoryWriter>>,
    settings: EngineSettings,
    selected: Mutex<Option<String>>,
    baseline: Mutex<Option<Baseline>>,
    /// Set while a counter read is running on the blocking pool, including
    /// one the cycle already gave up on.
    read_in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag when the blocking read ends, however it ends.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-direction growth since the baseline. A decrease means the counter
/// was reset underneath us and contributes nothing.
fn grown(previous: u64, current: u64) -> u64 {
    current.saturating_sub(previous)
}

/// Summed growth over interfaces present in both readings.
fn growth(
    previous: &HashMap<String, (u64, u64)>,
    current: &HashMap<String, (u64, u64)>,
) -> (u64, u64) {
    current
        .iter()
        .filter_map(|(name, &(rx, tx))| {
            let &(prev_rx, prev_tx) = previous.get(name)?;
            if rx < prev_rx || tx < prev_tx {
                debug!(interface = %name, "Counters went backwards, treating as reset.");
            }
            Some((grown(prev_rx, rx), grown(prev_tx, tx)))
        })
        .fold((0, 0), |(down, up), (d, u)| {
            (down.saturating_add(d), up.saturating_add(u))
        })
}

impl MetricsEngine {
    pub fn new(monitor: TrafficMonitor, store: Arc<HistoryStore>, settings: EngineSettings) -> Self {
        let selected = settings.selected_interface.clone();
        Self {
            monitor,
            store,
            writer: Mutex::new(None),
            settings,
            selected: Mutex::new(selected),
            baseline: Mutex::new(None),
            read_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Engine on the OS counters with the store and writer described by
    /// `config`.
    pub fn from_config(config: &MonitorConfig) -> Self {
        let store = if config.history.enabled {
            Arc::new(HistoryStore::new(config.history.database_path.clone()))
        } else {
            Arc::new(HistoryStore::unavailable())
        };
        let engine = Self::new(TrafficMonitor::system(), store, EngineSettings::from(config));
        if config.history.enabled && config.history.background_writer {
            engine.enable_background_writer(config.history.writer_queue_capacity);
        }
        engine
    }

    /// Routes history writes through a dedicated thread. On failure to spawn
    /// the thread, writes stay inline.
    pub fn enable_background_writer(&self, capacity: usize) -> bool {
        match HistoryWriter::spawn(Arc::clone(&self.store), capacity) {
            Ok(writer) => {
                *lock(&self.writer) = Some(writer);
                info!(capacity, "History writes moved to background thread.");
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to start history writer thread, writing inline.");
                false
            }
        }
    }

    pub fn monitor(&self) -> &TrafficMonitor {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<HistoryStore> {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn selected_interface(&self) -> Option<String> {
        lock(&self.selected).clone()
    }

    /// Changes which source is recorded. The next cycle starts a fresh
    /// baseline for it.
    pub fn select_interface(&self, name: Option<String>) {
        let name = name.filter(|n| !n.is_empty());
        info!(interface = ?name, "Recorded interface changed.");
        *lock(&self.selected) = name;
    }

    /// Starts sampling and applies startup retention.
    pub fn start(&self) -> bool {
        if !self.monitor.start() {
            return false;
        }
        if self.settings.record_history && self.settings.auto_trim_days > 0 {
            self.apply_retention();
        }
        true
    }

    /// `start` off the async threads: the initial query is bounded by the
    /// collector timeout, retention runs afterwards on the blocking pool.
    pub async fn launch(self: &Arc<Self>) -> bool {
        let engine = Arc::clone(self);
        let limit = self.settings.collector_timeout;
        let query = tokio::task::spawn_blocking(move || engine.monitor.start());
        let started = match tokio::time::timeout(limit, query).await {
            Ok(Ok(started)) => started,
            Ok(Err(e)) => {
                error!(error = %e, "Initial interface query task failed.");
                false
            }
            Err(_) => {
                error!(timeout_ms = limit.as_millis() as u64, "Initial interface query timed out.");
                false
            }
        };
        if !started {
            return false;
        }
        if self.settings.record_history && self.settings.auto_trim_days > 0 {
            self.apply_retention_blocking().await;
        }
        true
    }

    async fn apply_retention_blocking(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        if let Err(e) = tokio::task::spawn_blocking(move || engine.apply_retention()).await {
            warn!(error = %e, "History retention task failed.");
        }
    }

    fn apply_retention(&self) {
        let days = i64::from(self.settings.auto_trim_days);
        if self.store.trim_to_recent_days(days) {
            info!(days, "Applied history retention.");
        }
    }

    /// Runs one cycle on the calling thread.
    pub fn tick(&self) -> CycleReport {
        let updated = self.monitor.update();
        self.finish_cycle(updated)
    }

    /// Runs one cycle with the counter read on the blocking pool, bounded by
    /// the collector timeout. A read that outlives its timeout keeps the next
    /// cycles from starting another one until it returns. Cache and history
    /// updates also run on the blocking pool.
    pub async fn poll_cycle(self: &Arc<Self>) -> CycleReport {
        if !self.monitor.is_running() {
            return CycleReport::failed();
        }
        if self.read_in_flight.swap(true, Ordering::SeqCst) {
            warn!("Previous counter read still running, skipping this cycle.");
            return CycleReport::failed();
        }
        let guard = InFlightGuard(Arc::clone(&self.read_in_flight));
        let source = self.monitor.source();
        let limit = self.settings.collector_timeout;
        let read = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            source.read_counters()
        });
        let result = match tokio::time::timeout(limit, read).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(CollectError::Task(join_error.to_string())),
            Err(_) => Err(CollectError::Timeout(limit)),
        };

        let engine = Arc::clone(self);
        let finish = tokio::task::spawn_blocking(move || {
            let updated = engine.monitor.apply_poll(result);
            engine.finish_cycle(updated)
        });
        match finish.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Cycle processing task failed.");
                CycleReport::failed()
            }
        }
    }

    fn finish_cycle(&self, updated: bool) -> CycleReport {
        if !updated {
            return CycleReport::failed();
        }
        let (sample, contributors) = self.recorded_source();
        let recorded = self.record_delta(&sample.name, contributors);
        CycleReport {
            updated,
            source: Some(sample.name),
            recorded,
        }
    }

    /// The selected interface if it is present, otherwise the aggregate.
    pub fn current_stats(&self) -> InterfaceSample {
        self.recorded_source().0
    }

    fn recorded_source(&self) -> (InterfaceSample, HashMap<String, (u64, u64)>) {
        if let Some(name) = self.selected_interface() {
            if let Some(sample) = self.monitor.get_interface_stats(&name).filter(|s| s.is_active) {
                let totals =
                    HashMap::from([(sample.name.clone(), (sample.bytes_received, sample.bytes_sent))]);
                return (sample, totals);
            }
            debug!(interface = %name, "Selected interface not present, using aggregate.");
        }
        let all = self.monitor.get_all_stats();
        let totals = all
            .iter()
            .map(|s| (s.name.clone(), (s.bytes_received, s.bytes_sent)))
            .collect();
        (self.monitor.get_aggregated_stats(), totals)
    }

    /// Compares the source's totals with the previous cycle and hands any
    /// growth to history. The first cycle for a label only sets the baseline.
    fn record_delta(
        &self,
        label: &str,
        totals: HashMap<String, (u64, u64)>,
    ) -> Option<(u64, u64)> {
        let delta = {
            let mut baseline = lock(&self.baseline);
            let delta = match baseline.as_ref() {
                Some(previous) if previous.label == label => Some(growth(&previous.totals, &totals)),
                Some(previous) => {
                    info!(from = %previous.label, to = %label, "Recorded source changed, re-baselining.");
                    None
                }
                None => None,
            };
            *baseline = Some(Baseline {
                label: label.to_string(),
                totals,
            });
            delta
        };

        let (down, up) = delta?;
        if down == 0 && up == 0 {
            return None;
        }
        if self.settings.record_history {
            self.write_history(label, down, up);
        }
        Some((down, up))
    }

    fn write_history(&self, label: &str, down: u64, up: u64) {
        let writer = lock(&self.writer);
        let accepted = match writer.as_ref() {
            Some(writer) => writer.submit(label, down, up),
            None => self.store.append_sample(label, down, up),
        };
        if !accepted {
            debug!(source = %label, down, up, "History sample not recorded.");
        }
    }

    /// Drives cycles on the configured interval until `shutdown_rx` fires.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<()>) {
        let mut collect_interval = tokio::time::interval(self.settings.update_interval);
        collect_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut retention_interval = tokio::time::interval(RETENTION_CHECK_INTERVAL);
        // The first retention tick completes immediately and startup already trimmed.
        retention_interval.tick().await;

        info!(
            interval_ms = self.settings.update_interval.as_millis() as u64,
            selected = ?self.selected_interface(),
            "Metrics engine loop started."
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping metrics engine loop.");
                    break;
                }
                _ = collect_interval.tick() => {
                    let report = self.poll_cycle().await;
                    if !report.updated {
                        debug!("Poll cycle failed, will retry on next tick.");
                    } else if let Some((down, up)) = report.recorded {
                        debug!(source = ?report.source, down, up, "Cycle recorded.");
                    }
                }
                _ = retention_interval.tick() => {
                    if self.settings.record_history && self.settings.auto_trim_days > 0 {
                        self.apply_retention_blocking().await;
                    }
                }
            }
        }
    }

    /// Flushes pending history, closes the store and stops sampling.
    pub fn shutdown(&self) {
        if let Some(writer) = lock(&self.writer).take() {
            writer.shutdown();
        }
        self.store.close();
        self.monitor.stop();
        info!("Metrics engine stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::StoreStatus;
    use crate::metrics::monitor::tests::{ScriptedSource, setup, up};
    use crate::metrics::{AGGREGATE_LABEL, LinkType, ManualClock};
    use crate::metrics::{CounterSource, RawInterface};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    fn settings(selected: Option<&str>) -> EngineSettings {
        EngineSettings {
            update_interval: Duration::from_millis(1000),
            collector_timeout: Duration::from_secs(5),
            selected_interface: selected.map(str::to_string),
            record_history: true,
            auto_trim_days: 0,
        }
    }

    fn engine(
        selected: Option<&str>,
    ) -> (Arc<ScriptedSource>, Arc<ManualClock>, Arc<HistoryStore>, MetricsEngine) {
        let (source, clock, monitor) = setup();
        let store = Arc::new(HistoryStore::open_in_memory());
        let engine = MetricsEngine::new(monitor, Arc::clone(&store), settings(selected));
        (source, clock, store, engine)
    }

    fn recorded(store: &HistoryStore) -> Vec<(String, u64, u64)> {
        let mut rows: Vec<_> = store
            .recent_samples(100, None, false)
            .unwrap()
            .into_iter()
            .map(|r| (r.source, r.bytes_down, r.bytes_up))
            .collect();
        rows.reverse();
        rows
    }

    #[test]
    fn test_first_cycle_only_sets_baseline() {
        let (source, clock, store, engine) = engine(Some("Ethernet"));
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 1_000, 500)]);
        assert!(engine.start());

        clock.advance(1_000);
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 1_000, 500)]);
        let report = engine.tick();
        assert!(report.updated);
        assert_eq!(report.source.as_deref(), Some("Ethernet"));
        assert_eq!(report.recorded, None);
        assert_eq!(store.record_count(), Some(0));
    }

    #[test]
    fn test_selected_interface_growth_is_recorded() {
        let (source, clock, store, engine) = engine(Some("Ethernet"));
        source.respond(vec![
            up("Ethernet", LinkType::Ethernet, 1_000, 500),
            up("Wi-Fi", LinkType::Wireless, 50, 50),
        ]);
        assert!(engine.start());
        clock.advance(1_000);
        engine.tick();

        clock.advance(1_000);
        source.respond(vec![
            up("Ethernet", LinkType::Ethernet, 5_000, 2_000),
            up("Wi-Fi", LinkType::Wireless, 900, 900),
        ]);
        let report = engine.tick();
        assert_eq!(report.recorded, Some((4_000, 1_500)));
        assert_eq!(recorded(&store), vec![("Ethernet".to_string(), 4_000, 1_500)]);
    }

    #[test]
    fn test_decrease_is_treated_as_reset() {
        let (source, clock, store, engine) = engine(Some("Ethernet"));
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 10_000, 10_000)]);
        assert!(engine.start());
        clock.advance(1_000);
        engine.tick();

        clock.advance(1_000);
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 100, 100)]);
        assert_eq!(engine.tick().recorded, None);
        assert_eq!(store.record_count(), Some(0));

        // Growth from the new, lower baseline is recorded normally.
        clock.advance(1_000);
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 300, 100)]);
        assert_eq!(engine.tick().recorded, Some((200, 0)));
    }

    #[test]
    fn test_aggregate_is_one_source_per_cycle() {
        let (source, clock, store, engine) = engine(None);
        source.respond(vec![
            up("Ethernet", LinkType::Ethernet, 1_000, 100),
            up("Wi-Fi", LinkType::Wireless, 2_000, 200),
        ]);
        assert!(engine.start());
        clock.advance(1_000);
        engine.tick();

        clock.advance(1_000);
        source.respond(vec![
            up("Ethernet", LinkType::Ethernet, 1_500, 150),
            up("Wi-Fi", LinkType::Wireless, 2_100, 300),
        ]);
        let report = engine.tick();
        assert_eq!(report.source.as_deref(), Some(AGGREGATE_LABEL));
        assert_eq!(report.recorded, Some((600, 150)));
        assert_eq!(
            recorded(&store),
            vec![(AGGREGATE_LABEL.to_string(), 600, 150)]
        );
    }

    #[test]
    fn test_interface_joining_aggregate_is_not_traffic() {
        let (source, clock, _store, engine) = engine(None);
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 1_000, 100)]);
        assert!(engine.start());
        clock.advance(1_000);
        engine.tick();

        clock.advance(1_000);
        source.respond(vec![
            up("Ethernet", LinkType::Ethernet, 1_100, 100),
            up("Wi-Fi", LinkType::Wireless, 9_000_000, 9_000_000),
        ]);
        assert_eq!(engine.tick().recorded, Some((100, 0)));
    }

    #[test]
    fn test_source_change_rebaselines() {
        let (source, clock, store, engine) = engine(Some("Wi-Fi"));
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 1_000, 1_000)]);
        assert!(engine.start());

        // Wi-Fi is absent, so the aggregate is recorded.
        clock.advance(1_000);
        assert_eq!(engine.tick().source.as_deref(), Some(AGGREGATE_LABEL));

        // Wi-Fi appears: the label switches and nothing is written.
        clock.advance(1_000);
        source.respond(vec![
            up("Ethernet", LinkType::Ethernet, 2_000, 2_000),
            up("Wi-Fi", LinkType::Wireless, 70_000, 70_000),
        ]);
        let report = engine.tick();
        assert_eq!(report.source.as_deref(), Some("Wi-Fi"));
        assert_eq!(report.recorded, None);

        clock.advance(1_000);
        source.respond(vec![
            up("Ethernet", LinkType::Ethernet, 3_000, 3_000),
            up("Wi-Fi", LinkType::Wireless, 70_500, 70_000),
        ]);
        assert_eq!(engine.tick().recorded, Some((500, 0)));
        assert_eq!(recorded(&store), vec![("Wi-Fi".to_string(), 500, 0)]);

        engine.select_interface(None);
        clock.advance(1_000);
        source.respond(vec![
            up("Ethernet", LinkType::Ethernet, 4_000, 4_000),
            up("Wi-Fi", LinkType::Wireless, 71_000, 70_000),
        ]);
        let report = engine.tick();
        assert_eq!(report.source.as_deref(), Some(AGGREGATE_LABEL));
        assert_eq!(report.recorded, None);
    }

    #[test]
    fn test_failed_cycle_records_nothing_and_keeps_stats() {
        let (source, clock, store, engine) = engine(Some("Ethernet"));
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 1_000, 500)]);
        assert!(engine.start());
        clock.advance(1_000);
        engine.tick();

        clock.advance(1_000);
        source.fail("adapter table unavailable");
        assert_eq!(engine.tick(), CycleReport::failed());
        assert_eq!(store.record_count(), Some(0));
        assert_eq!(engine.current_stats().name, "Ethernet");
    }

    #[test]
    fn test_history_disabled_still_reports_delta() {
        let (source, clock, monitor) = setup();
        let store = Arc::new(HistoryStore::open_in_memory());
        let mut quiet = settings(None);
        quiet.record_history = false;
        let engine = MetricsEngine::new(monitor, Arc::clone(&store), quiet);

        source.respond(vec![up("Ethernet", LinkType::Ethernet, 0, 0)]);
        assert!(engine.start());
        clock.advance(1_000);
        engine.tick();
        clock.advance(1_000);
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 10, 10)]);
        assert_eq!(engine.tick().recorded, Some((10, 10)));
        assert_eq!(store.status(), StoreStatus::Uninitialized);
    }

    #[test]
    fn test_background_writer_flushes_on_shutdown() {
        let (source, clock, store, engine) = engine(Some("Ethernet"));
        assert!(engine.enable_background_writer(8));
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 0, 0)]);
        assert!(engine.start());
        clock.advance(1_000);
        engine.tick();
        clock.advance(1_000);
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 64, 32)]);
        assert_eq!(engine.tick().recorded, Some((64, 32)));

        // Flush the writer first so the rows can be read before close.
        let writer = lock(&engine.writer).take();
        if let Some(writer) = writer {
            writer.shutdown();
        }
        assert_eq!(recorded(&store), vec![("Ethernet".to_string(), 64, 32)]);

        engine.shutdown();
        assert_eq!(store.status(), StoreStatus::Closed);
        assert!(!engine.monitor().is_running());
    }

    #[test]
    fn test_startup_retention_trims_old_history() {
        let (source, _clock, monitor) = setup();
        let store = Arc::new(HistoryStore::open_in_memory());
        store.append_sample_at(Utc::now() - chrono::Duration::days(40), "Ethernet", 1, 1);
        store.append_sample_at(Utc::now() - chrono::Duration::days(2), "Ethernet", 2, 2);

        let mut keep_week = settings(None);
        keep_week.auto_trim_days = 7;
        let engine = MetricsEngine::new(monitor, Arc::clone(&store), keep_week);
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 0, 0)]);
        assert!(engine.start());
        assert_eq!(store.record_count(), Some(1));
    }

    #[tokio::test]
    async fn test_poll_cycle_reads_on_blocking_pool() {
        let (source, clock, store, engine) = engine(Some("Ethernet"));
        let engine = Arc::new(engine);
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 100, 100)]);
        assert!(engine.start());
        clock.advance(1_000);
        assert!(engine.poll_cycle().await.updated);
        clock.advance(1_000);
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 400, 100)]);
        assert_eq!(engine.poll_cycle().await.recorded, Some((300, 0)));
        assert_eq!(store.record_count(), Some(1));
    }

    #[tokio::test]
    async fn test_poll_cycle_on_stopped_engine_fails() {
        let (source, _clock, _store, engine) = engine(None);
        let engine = Arc::new(engine);
        assert_eq!(engine.poll_cycle().await, CycleReport::failed());
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_signal() {
        let (source, _clock, _store, engine) = engine(None);
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 0, 0)]);
        assert!(engine.start());
        let engine = Arc::new(engine);
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let handle = tokio::spawn(Arc::clone(&engine).run(shutdown_rx));
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        engine.shutdown();
        assert!(!engine.monitor().is_running());
    }

    /// Blocks each read for a configurable time and tracks how many reads
    /// run at once.
    #[derive(Default)]
    struct SlowSource {
        delay_ms: AtomicU64,
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
    }

    impl CounterSource for SlowSource {
        fn read_counters(&self) -> Result<Vec<RawInterface>, CollectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(running, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![up("Ethernet", LinkType::Ethernet, 0, 0)])
        }
    }

    fn slow_engine(timeout_ms: u64) -> (Arc<SlowSource>, Arc<ManualClock>, Arc<MetricsEngine>) {
        let source = Arc::new(SlowSource::default());
        let clock = Arc::new(ManualClock::starting_at(1_000));
        let monitor = TrafficMonitor::new(source.clone(), clock.clone());
        let mut quick_timeout = settings(None);
        quick_timeout.collector_timeout = Duration::from_millis(timeout_ms);
        let engine = MetricsEngine::new(
            monitor,
            Arc::new(HistoryStore::open_in_memory()),
            quick_timeout,
        );
        (source, clock, Arc::new(engine))
    }

    async fn wait_for_read_to_finish(engine: &MetricsEngine) {
        for _ in 0..100 {
            if !engine.read_in_flight.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("counter read never finished");
    }

    #[tokio::test]
    async fn test_hung_read_times_out_and_cycles_never_overlap() {
        let (source, clock, engine) = slow_engine(50);
        assert!(engine.start());

        source.delay_ms.store(400, Ordering::SeqCst);
        for _ in 0..5 {
            clock.advance(1_000);
            assert_eq!(engine.poll_cycle().await, CycleReport::failed());
        }
        // The initial query plus the one read that hung.
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(source.max_active.load(Ordering::SeqCst), 1);
        // A timed-out cycle leaves the cache alone.
        assert!(engine.monitor().get_interface_stats("Ethernet").is_some());

        source.delay_ms.store(0, Ordering::SeqCst);
        wait_for_read_to_finish(&engine).await;
        clock.advance(1_000);
        assert!(engine.poll_cycle().await.updated);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(source.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_launch_times_out_on_hung_initial_query() {
        let (source, _clock, engine) = slow_engine(50);
        source.delay_ms.store(400, Ordering::SeqCst);
        assert!(!engine.launch().await);
        // The stuck query is still running when launch gives up.
        assert!(!engine.monitor().is_running());
    }

    #[tokio::test]
    async fn test_launch_starts_and_applies_retention() {
        let (source, _clock, monitor) = setup();
        let store = Arc::new(HistoryStore::open_in_memory());
        store.append_sample_at(Utc::now() - chrono::Duration::days(40), "Ethernet", 1, 1);
        store.append_sample_at(Utc::now() - chrono::Duration::hours(1), "Ethernet", 2, 2);

        let mut keep_week = settings(None);
        keep_week.auto_trim_days = 7;
        let engine = Arc::new(MetricsEngine::new(monitor, Arc::clone(&store), keep_week));
        source.respond(vec![up("Ethernet", LinkType::Ethernet, 0, 0)]);
        assert!(engine.launch().await);
        assert!(engine.monitor().is_running());
        assert_eq!(store.record_count(), Some(1));
    }
}
