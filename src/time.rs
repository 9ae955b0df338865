use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic millisecond clock supplied by the surrounding scheduler.
pub trait Clock: Send + Sync {
    fn millis(&self) -> u64;

    fn elapsed_since(&self, start: u64) -> Duration {
        Duration::from_millis(self.millis().saturating_sub(start))
    }
    fn has_elapsed(&self, start: u64, duration: Duration) -> bool {
        self.elapsed_since(start) >= duration
    }
}

/// Wall-clock backed by [`Instant`], counting from construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// A tick counter advanced explicitly, e.g. from a timer interrupt.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }
    pub fn advance(&self, duration: Duration) {
        self.now.fetch_add(duration.as_millis() as u64, Ordering::AcqRel);
    }
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn millis(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
