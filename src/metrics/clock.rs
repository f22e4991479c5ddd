use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Millisecond tick source. The counter is 32 bits wide and wraps roughly
/// every 49.7 days.
pub trait TickClock: Send + Sync {
    fn now_ms(&self) -> u32;
}

/// Ticks since the clock was created, truncated to 32 bits.
#[derive(Debug)]
pub struct SystemTickClock {
    origin: Instant,
}

impl SystemTickClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTickClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock for SystemTickClock {
    fn now_ms(&self) -> u32 {
        // Truncation is the wrap.
        self.origin.elapsed().as_millis() as u32
    }
}

/// A clock that only moves when told to. Lets callers drive poll cycles
/// deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU32,
}

impl ManualClock {
    pub fn starting_at(ms: u32) -> Self {
        Self {
            ticks: AtomicU32::new(ms),
        }
    }

    pub fn set(&self, ms: u32) {
        self.ticks.store(ms, Ordering::SeqCst);
    }

    /// Advances the clock, wrapping past `u32::MAX`.
    pub fn advance(&self, ms: u32) {
        let _ = self
            .ticks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some(t.wrapping_add(ms))
            });
    }
}

impl TickClock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.ticks.load(Ordering::SeqCst)
    }
}

/// Milliseconds from `start` to `end`, treating `end < start` as one wrap of
/// the 32-bit counter.
pub fn elapsed_ms(start: u32, end: u32) -> u32 {
    if end >= start {
        end - start
    } else {
        (u32::MAX - start) + end + 1
    }
}

pub fn elapsed_secs(start: u32, end: u32) -> f64 {
    f64::from(elapsed_ms(start, end)) / 1000.0
}
