//! Hardware limits and dispatch tuning for the source/measure unit.
//!
//! Both structures deserialize from JSON with every field optional, so a host only needs to
//! spell out the limits that differ from the stock unit:
//!
//! ```
//! use pulsecompiler_backend::config::*;
//!
//! let cfg = PmuConfig::from_json_str(r#"{"max_point_cap": 50000}"#).unwrap();
//! assert_eq!(cfg.max_point_cap, 50000);
//! assert_eq!(cfg.min_segment_duration, 20e-9);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PmuConfig {
    /// Shortest segment the sequencer accepts, in seconds.
    pub min_segment_duration: f64,
    /// Longest single segment, in seconds.
    pub max_segment_duration: f64,
    /// Segment memory of the sequencer.
    pub max_segments: usize,
    /// Base clock of the digitizer, in Hz.
    pub default_max_rate: f64,
    /// The slowest rate is `default_max_rate / min_rate_divisor`.
    pub min_rate_divisor: u32,
    pub min_samples_per_segment: u32,
    /// Absolute number of points the unit can hand back per acquisition.
    pub max_point_cap: usize,
    /// Extra points allocated beyond `floor(total * rate)`.
    pub point_margin: usize,
    /// Currents at or below this magnitude (A) are treated as zero.
    pub noise_floor: f64,
    /// Inner fraction of a flat-top used as the probe window.
    pub window_fraction: (f64, f64),
}

impl Default for PmuConfig {
    fn default() -> Self {
        Self {
            min_segment_duration: 20e-9,
            max_segment_duration: 1.0,
            max_segments: 2048,
            default_max_rate: 200e6,
            min_rate_divisor: 1000,
            min_samples_per_segment: 5,
            max_point_cap: 1_000_000,
            point_margin: 10,
            noise_floor: 1e-12,
            window_fraction: (0.4, 0.9),
        }
    }
}

impl PmuConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidParameter(format!("malformed unit config: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn min_rate(&self) -> f64 {
        self.default_max_rate / self.min_rate_divisor as f64
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidParameter(msg));
        if !(self.min_segment_duration > 0.0) || !(self.max_segment_duration >= self.min_segment_duration)
        {
            return invalid(format!(
                "segment bounds [{:e}, {:e}] s are not an increasing positive interval",
                self.min_segment_duration, self.max_segment_duration
            ));
        }
        if self.max_segments == 0 {
            return invalid("max_segments must be positive".to_string());
        }
        if !(self.default_max_rate > 0.0) || self.min_rate_divisor == 0 {
            return invalid(format!(
                "rate limits {:e} Hz / {} do not define a positive rate range",
                self.default_max_rate, self.min_rate_divisor
            ));
        }
        if self.min_samples_per_segment == 0 {
            return invalid("min_samples_per_segment must be positive".to_string());
        }
        if self.max_point_cap <= self.point_margin {
            return invalid(format!(
                "point cap {} leaves no room beside a margin of {}",
                self.max_point_cap, self.point_margin
            ));
        }
        if !(self.noise_floor >= 0.0) {
            return invalid(format!("noise floor {:e} A is negative", self.noise_floor));
        }
        let (lo, hi) = self.window_fraction;
        if !(0.0 <= lo && lo < hi && hi <= 1.0) {
            return invalid(format!(
                "window fraction ({}, {}) is not an increasing sub-interval of [0, 1]",
                lo, hi
            ));
        }
        Ok(())
    }
}

/// Bounds on the blocking poll loop that waits for an acquisition to finish.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_polls: usize,
    pub poll_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_polls: 200,
            poll_interval_ms: 10,
        }
    }
}

impl DispatchConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidParameter(format!("malformed dispatch config: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_polls == 0 {
            return Err(Error::InvalidParameter(
                "dispatch needs at least one poll".to_string(),
            ));
        }
        Ok(())
    }
}
