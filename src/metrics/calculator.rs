use std::sync::Arc;

use tracing::debug;

use crate::metrics::clock::{TickClock, elapsed_secs};
use crate::metrics::types::{AGGREGATE_DESCRIPTION, AGGREGATE_LABEL, InterfaceSample};

/// Updates closer together than this are ignored; the rate would be noise.
pub const MIN_ELAPSED_SECS: f64 = 0.1;

/// Bytes transferred between two readings of a 64-bit cumulative counter.
///
/// A reading lower than the previous one is taken as a single wrap of the
/// counter. A driver reset looks the same and yields a very large delta.
pub fn counter_delta(previous: u64, current: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        (u64::MAX - previous) + current + 1
    }
}

fn speed(delta: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    delta as f64 / elapsed_secs
}

/// Turns raw counter readings into speeds and peaks.
#[derive(Clone)]
pub struct DeltaCalculator {
    clock: Arc<dyn TickClock>,
}

impl DeltaCalculator {
    pub fn new(clock: Arc<dyn TickClock>) -> Self {
        Self { clock }
    }

    /// Feeds one reading into `sample`.
    ///
    /// Returns `false`, leaving the sample untouched, when less than
    /// [`MIN_ELAPSED_SECS`] has passed since the last accepted reading.
    pub fn update(&self, sample: &mut InterfaceSample, raw_in: u64, raw_out: u64) -> bool {
        let now = self.clock.now_ms();

        let Some(last) = sample.last_update_ms else {
            sample.bytes_received = raw_in;
            sample.bytes_sent = raw_out;
            sample.prev_bytes_received = raw_in;
            sample.prev_bytes_sent = raw_out;
            sample.download_speed = 0.0;
            sample.upload_speed = 0.0;
            sample.last_update_ms = Some(now);
            sample.is_active = true;
            return true;
        };

        let elapsed = elapsed_secs(last, now);
        if elapsed < MIN_ELAPSED_SECS {
            return false;
        }

        sample.prev_bytes_received = sample.bytes_received;
        sample.prev_bytes_sent = sample.bytes_sent;
        sample.bytes_received = raw_in;
        sample.bytes_sent = raw_out;

        let delta_in = counter_delta(sample.prev_bytes_received, raw_in);
        let delta_out = counter_delta(sample.prev_bytes_sent, raw_out);

        sample.download_speed = speed(delta_in, elapsed);
        sample.upload_speed = speed(delta_out, elapsed);
        sample.peak_download_speed = sample.peak_download_speed.max(sample.download_speed);
        sample.peak_upload_speed = sample.peak_upload_speed.max(sample.upload_speed);

        sample.last_update_ms = Some(now);
        sample.is_active = true;

        debug!(
            interface = %sample.name,
            elapsed_secs = elapsed,
            delta_in,
            delta_out,
            download_bps = sample.download_speed,
            upload_bps = sample.upload_speed,
            "Interface sample updated."
        );
        true
    }

    /// Folds the active samples into one "All Interfaces" sample.
    pub fn aggregate(&self, samples: &[InterfaceSample]) -> InterfaceSample {
        let mut aggregate = InterfaceSample::new(AGGREGATE_LABEL, AGGREGATE_DESCRIPTION);
        if samples.is_empty() {
            return aggregate;
        }

        for sample in samples.iter().filter(|s| s.is_active) {
            aggregate.bytes_received = aggregate.bytes_received.wrapping_add(sample.bytes_received);
            aggregate.bytes_sent = aggregate.bytes_sent.wrapping_add(sample.bytes_sent);
            aggregate.download_speed += sample.download_speed;
            aggregate.upload_speed += sample.upload_speed;
            aggregate.peak_download_speed =
                aggregate.peak_download_speed.max(sample.peak_download_speed);
            aggregate.peak_upload_speed = aggregate.peak_upload_speed.max(sample.peak_upload_speed);
        }

        aggregate.is_active = true;
        aggregate.last_update_ms = Some(self.clock.now_ms());
        aggregate
    }

    /// Re-baselines a sample: counters carry over, speeds and peaks restart.
    pub fn reset(&self, sample: &mut InterfaceSample) {
        sample.prev_bytes_received = sample.bytes_received;
        sample.prev_bytes_sent = sample.bytes_sent;
        sample.download_speed = 0.0;
        sample.upload_speed = 0.0;
        sample.peak_download_speed = 0.0;
        sample.peak_upload_speed = 0.0;
        sample.last_update_ms = Some(self.clock.now_ms());
    }
}
