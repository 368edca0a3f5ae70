/// Wrapping millisecond clock driving the scheduler timers
use tokio::time::Instant;

pub trait Clock {
    /// Milliseconds since an arbitrary origin, wrapping at `u32::MAX`
    fn now_ms(&self) -> u32;
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u32 {
        // Truncation is the rollover
        self.origin.elapsed().as_millis() as u32
    }
}
