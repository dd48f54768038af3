//! Display time axis derived from the accepted acquisition settings.

use serde::Serialize;

/// Time values for each sample of a burst relative to the trigger.
///
/// Sample `i` is at `(i - num_pre) * step`, so the trigger sample is at zero
/// and pre-trigger samples have negative times.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeAxis {
    /// Time between samples, in units of `1 / unit_inv` seconds.
    pub step: f64,
    pub num_pre: u32,
    pub num_post: u32,
}

impl TimeAxis {
    /// `unit_inv` is the inverse of the time unit (1.0 for seconds, 1e6 for
    /// microseconds); `rate` is the display sample rate in Hz.
    pub fn new(unit_inv: f64, rate: f64, num_pre: u32, num_post: u32) -> Self {
        Self {
            step: unit_inv / rate,
            num_pre,
            num_post,
        }
    }

    pub fn len(&self) -> usize {
        self.num_pre as usize + self.num_post as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> Vec<f64> {
        let num_pre = i64::from(self.num_pre);
        (0..self.len() as i64)
            .map(|i| (i - num_pre) as f64 * self.step)
            .collect()
    }
}
