use serde::{Deserialize, Serialize};

/// Running mean and population standard deviation (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    count: u32,
    mean: f64,
    m2: f64,
}

impl ErrorStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f32) {
        let value = value as f64;
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// 0.0 when empty.
    pub fn mean(&self) -> f32 {
        self.mean as f32
    }

    pub fn variance(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64) as f32
        }
    }

    pub fn std_dev(&self) -> f32 {
        self.variance().sqrt()
    }
}
