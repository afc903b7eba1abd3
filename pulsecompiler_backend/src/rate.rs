//! Sample rate selection.
//!
//! Short programs with short segments want the fastest clock for resolution, long programs have
//! to slow down to stay inside the point budget. The digitizer only runs at integer divisions of
//! its base clock, so candidates are `default_max_rate / n`.

use log::{debug, info};

use crate::config::PmuConfig;
use crate::error::{Error, Result};

/// Sample rate chosen for one acquisition and the point counts that follow from it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateDecision {
    pub sample_rate: f64,
    /// `round(total_duration * sample_rate)`
    pub acquired_point_count: usize,
    /// `floor(total_duration * sample_rate) + margin`, the buffer size handed to the unit
    pub allocated_point_count: usize,
}

impl RateDecision {
    pub fn sample_period(&self) -> f64 {
        1.0 / self.sample_rate
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RateSelector {
    default_max_rate: f64,
    min_rate_divisor: u32,
    min_samples_per_segment: u32,
    max_point_cap: usize,
    point_margin: usize,
}

impl RateSelector {
    pub fn from_config(config: &PmuConfig) -> Self {
        Self {
            default_max_rate: config.default_max_rate,
            min_rate_divisor: config.min_rate_divisor,
            min_samples_per_segment: config.min_samples_per_segment,
            max_point_cap: config.max_point_cap,
            point_margin: config.point_margin,
        }
    }

    pub fn min_rate(&self) -> f64 {
        self.default_max_rate / self.min_rate_divisor as f64
    }

    /// Fastest rate that still puts `min_samples_per_segment` samples into the shortest segment.
    ///
    /// Never exceeds the base clock and never drops below the slowest rate of the digitizer.
    pub fn effective_max_rate(&self, min_segment_duration: f64) -> f64 {
        if min_segment_duration > 0.0 {
            let ceiling = self.min_samples_per_segment as f64 / min_segment_duration;
            self.default_max_rate.min(ceiling).max(self.min_rate())
        } else {
            self.default_max_rate
        }
    }

    /// Picks the fastest clock division that keeps `total_duration` plus the margin strictly
    /// under `max_point_budget`.
    ///
    /// # Examples
    ///
    /// A millisecond program with 20 ns segments and a budget of 10000 points ends up on the
    /// 21st division of the 200 MHz clock:
    ///
    /// ```
    /// use pulsecompiler_backend::config::PmuConfig;
    /// use pulsecompiler_backend::rate::RateSelector;
    ///
    /// let selector = RateSelector::from_config(&PmuConfig::default());
    /// let decision = selector.select_rate(1e-3, 10000, 2e-8).unwrap();
    /// assert_eq!(decision.sample_rate, 200e6 / 21.);
    /// assert_eq!(decision.acquired_point_count, 9524);
    /// assert_eq!(decision.allocated_point_count, 9533);
    /// ```
    ///
    /// Conflicting constraints are reported instead of truncating the acquisition:
    ///
    /// ```
    /// # use pulsecompiler_backend::config::PmuConfig;
    /// # use pulsecompiler_backend::rate::RateSelector;
    /// let selector = RateSelector::from_config(&PmuConfig::default());
    /// // One second at the slowest 200 kHz rate needs 200000 points
    /// let err = selector.select_rate(1.0, 10000, 1e-3).unwrap_err();
    /// assert_eq!(err.status_code(), -302);
    /// ```
    pub fn select_rate(
        &self,
        total_duration: f64,
        max_point_budget: usize,
        min_segment_duration: f64,
    ) -> Result<RateDecision> {
        if max_point_budget > self.max_point_cap {
            return Err(Error::PointBudgetExceeded {
                budget: max_point_budget,
                cap: self.max_point_cap,
            });
        }
        if !(total_duration > 0.0) || !total_duration.is_finite() {
            return Err(Error::EmptyWaveform);
        }

        let effective_max = self.effective_max_rate(min_segment_duration);
        let first_divisor = ((self.default_max_rate / effective_max).ceil() as u32).max(1);
        debug!(
            "rate search from {:e} Hz (division {}) for {:e} s",
            effective_max, first_divisor, total_duration
        );

        let budget = max_point_budget as f64;
        let margin = self.point_margin as f64;
        for divisor in first_divisor..=self.min_rate_divisor {
            let rate = self.default_max_rate / divisor as f64;
            let points = total_duration * rate;
            if points + margin < budget {
                let decision = RateDecision {
                    sample_rate: rate,
                    acquired_point_count: points.round() as usize,
                    allocated_point_count: points.floor() as usize + self.point_margin,
                };
                info!(
                    "sample rate {:e} Hz, {} points acquired, {} allocated",
                    rate, decision.acquired_point_count, decision.allocated_point_count
                );
                return Ok(decision);
            }
        }
        Err(Error::RateUnattainable {
            total_duration,
            budget: max_point_budget,
            min_segment: min_segment_duration,
        })
    }
}
