/// Fixed-capacity running average, reset at the end of every publish cycle
use crate::models::Metric;

/// Mean of at most `capacity` samples
///
/// Once full, further samples are ignored until `clear()`; the oldest value is
/// never overwritten, so one publish cycle carries at most `capacity` samples.
#[derive(Debug, Clone)]
pub struct RunningAverage {
    capacity: usize,
    count: usize,
    sum: f64,
}

impl RunningAverage {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            count: 0,
            sum: 0.0,
        }
    }

    /// Returns false when the sample was dropped because the budget is spent
    pub fn add_value(&mut self, value: f32) -> bool {
        if self.count >= self.capacity {
            return false;
        }
        self.sum += f64::from(value);
        self.count += 1;
        true
    }

    /// 0 when empty, never NaN
    pub fn average(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.sum = 0.0;
    }
}

/// A configured metric paired with its accumulator
#[derive(Debug, Clone)]
pub struct SensorChannel {
    pub metric: Metric,
    pub average: RunningAverage,
}

impl SensorChannel {
    pub fn new(metric: Metric, capacity: usize) -> Self {
        Self {
            metric,
            average: RunningAverage::new(capacity),
        }
    }
}
