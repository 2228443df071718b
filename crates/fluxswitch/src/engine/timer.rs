use std::time::{Duration, Instant};

/// Monotonic stopwatch counted in fixed ticks.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    tick: Duration,
    armed_at: Instant,
}

impl Timer {
    pub fn new(tick: Duration) -> Self {
        Self { tick, armed_at: Instant::now() }
    }

    pub fn arm(&mut self) {
        self.armed_at = Instant::now();
    }

    /// True once at least `ticks` ticks have passed since the last `arm`.
    pub fn elapsed(&self, ticks: u32) -> bool {
        self.armed_at.elapsed() >= self.tick.saturating_mul(ticks)
    }
}
