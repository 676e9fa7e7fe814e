//! Task execution configuration.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest worker-pool size a task may request.
pub const MIN_CONCURRENCY: usize = 1;
/// Largest worker-pool size a task may request.
pub const MAX_CONCURRENCY: usize = 100;

/// Per-item success criterion for fill-mode submissions.
///
/// `Range(lo, hi)` draws a fresh value per item, so submitted scores vary
/// across a unit the way a real session would.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracySpec {
    /// Every item is submitted with this exact accuracy percent.
    Fixed(u8),
    /// Each item samples uniformly from `lo..=hi` percent.
    Range(u8, u8),
}

impl AccuracySpec {
    /// Draw the accuracy to submit for one item.
    pub fn sample(&self) -> u8 {
        match *self {
            Self::Fixed(value) => value,
            Self::Range(lo, hi) => rand::thread_rng().gen_range(lo..=hi),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::Fixed(value) if value > 100 => Err(ConfigError::InvalidAccuracyRange {
                lo: value,
                hi: value,
            }),
            Self::Range(lo, hi) if lo > hi || hi > 100 => {
                Err(ConfigError::InvalidAccuracyRange { lo, hi })
            }
            _ => Ok(()),
        }
    }
}

/// Execution parameters for one task. Immutable once the task is created;
/// a resumed run carries the config forward unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Upper bound on item jobs in flight at once, in [1, 100].
    pub max_concurrency: usize,
    /// Per-item success criterion (fill mode).
    pub accuracy: AccuracySpec,
    /// Target total time per unit, in minutes (duration mode).
    pub duration_minutes: u32,
    /// Uniform perturbation applied to each unit's target, in minutes
    /// (duration mode).
    pub jitter_minutes: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            accuracy: AccuracySpec::Range(90, 100),
            duration_minutes: 30,
            jitter_minutes: 5,
        }
    }
}

impl TaskConfig {
    /// Validate the config. Called at task construction; a failure here is
    /// fatal and surfaces before any work is dispatched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.max_concurrency) {
            return Err(ConfigError::ConcurrencyOutOfRange {
                value: self.max_concurrency,
                min: MIN_CONCURRENCY,
                max: MAX_CONCURRENCY,
            });
        }
        self.accuracy.validate()?;
        if self.duration_minutes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "duration_minutes",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
