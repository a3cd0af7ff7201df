use std::time::Duration;

/// Countdown in milliseconds. Passed once the remaining time drops to zero or below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeTracker {
    expiry: i64,
}

impl TimeTracker {
    pub fn new(expiry_ms: u64) -> Self {
        Self {
            expiry: expiry_ms as i64,
        }
    }

    pub fn update(&mut self, diff_ms: u64) {
        self.expiry -= diff_ms as i64;
    }

    pub fn passed(&self) -> bool {
        self.expiry <= 0
    }

    pub fn reset(&mut self, expiry_ms: u64) {
        self.expiry = expiry_ms as i64;
    }

    /// Milliseconds left, zero once passed.
    pub fn remaining(&self) -> u64 {
        self.expiry.max(0) as u64
    }
}

/// Rolling history of tick durations for instrumentation.
#[derive(Debug)]
pub struct TickTimer {
    history: Vec<Duration>,
    capacity: usize,
    index: usize,
    filled: bool,
}

impl TickTimer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: vec![Duration::ZERO; capacity],
            capacity,
            index: 0,
            filled: false,
        }
    }

    pub fn record(&mut self, dt: Duration) {
        self.history[self.index] = dt;
        self.index = (self.index + 1) % self.capacity;
        if self.index == 0 {
            self.filled = true;
        }
    }

    fn window(&self) -> &[Duration] {
        &self.history[..self.count()]
    }

    pub fn average(&self) -> Duration {
        let window = self.window();
        if window.is_empty() {
            return Duration::ZERO;
        }
        window.iter().sum::<Duration>() / window.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.window().iter().copied().max().unwrap_or(Duration::ZERO)
    }

    pub fn min(&self) -> Duration {
        self.window().iter().copied().min().unwrap_or(Duration::ZERO)
    }

    pub fn count(&self) -> usize {
        if self.filled {
            self.capacity
        } else {
            self.index
        }
    }
}
