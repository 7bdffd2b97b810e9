use serde::{Deserialize, Serialize};

use cms_core::ValueObject;

/// Partial completion of an in-flight job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    processed: u64,
    total: u64,
}

impl ValueObject for Progress {}

impl Progress {
    pub fn new(processed: u64, total: u64) -> Self {
        Self { processed, total }
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// `processed / total * 100`, or `0.0` when nothing is known about the total.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.processed as f64 / self.total as f64 * 100.0
    }
}
