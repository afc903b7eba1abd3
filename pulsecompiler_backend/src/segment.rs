//! Piecewise-linear voltage programs for the pulse sequencer.
//!
//! ## Main Structures:
//!
//! - `Segment`: one linear ramp (or hold, when both ends agree) of fixed duration.
//!
//! - `SegmentBuilder`: accumulates segments during the build phase of a pattern. It enforces the
//!   hardware duration bounds, the segment memory capacity and voltage continuity between
//!   neighbours, and reports the elapsed time before each appended segment so callers can place
//!   probe windows relative to it.
//!
//! - `Waveform`: the frozen result of `SegmentBuilder::finalize`. Besides handing the segment list
//!   to the acquisition collaborator, it can render itself on a uniform time grid, which is what the
//!   loopback unit and debugging tools use.

use std::fmt;

use log::trace;
use ndarray::{s, Array1};

use crate::config::PmuConfig;
use crate::error::{Error, Result};

/// One `(start_v, stop_v, duration)` triple.
///
/// Segments are immutable once built: fields are only reachable through getters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    start_v: f64,
    stop_v: f64,
    duration: f64,
}

impl Segment {
    pub fn start_v(&self) -> f64 {
        self.start_v
    }
    pub fn stop_v(&self) -> f64 {
        self.stop_v
    }
    pub fn duration(&self) -> f64 {
        self.duration
    }
    pub fn is_hold(&self) -> bool {
        self.start_v == self.stop_v
    }

    /// Voltage at `dt` seconds after the segment starts. `dt` is clamped to the segment.
    pub fn value_at(&self, dt: f64) -> f64 {
        if self.is_hold() {
            return self.start_v;
        }
        let frac = (dt / self.duration).clamp(0.0, 1.0);
        self.start_v + (self.stop_v - self.start_v) * frac
    }

    /// Replaces the absolute time values in `t_arr` by the segment voltage at those times, given
    /// that the segment starts at `seg_start`.
    ///
    /// ```
    /// use ndarray::array;
    /// use pulsecompiler_backend::segment::*;
    /// use pulsecompiler_backend::config::PmuConfig;
    ///
    /// let mut builder = SegmentBuilder::new(&PmuConfig::default());
    /// builder.append_segment(1e-6, 0.0, 1.0).unwrap();
    /// let waveform = builder.finalize();
    ///
    /// let mut t_arr = array![0.0, 0.5e-6, 1e-6];
    /// waveform.segments()[0].eval_inplace(&mut t_arr.view_mut(), 0.0);
    /// assert_eq!(t_arr, array![0.0, 0.5, 1.0]);
    /// ```
    pub fn eval_inplace(&self, t_arr: &mut ndarray::ArrayViewMut1<f64>, seg_start: f64) {
        t_arr.map_inplace(|t| *t = self.value_at(*t - seg_start));
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Segment({} V -> {} V, {:e} s)",
            self.start_v, self.stop_v, self.duration
        )
    }
}

/// Frozen, ordered list of segments plus the cumulative segment end times.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Waveform {
    segments: Vec<Segment>,
    seg_end: Vec<f64>,
    total_duration: f64,
}

impl Waveform {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
    pub fn len(&self) -> usize {
        self.segments.len()
    }
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
    pub fn total_duration(&self) -> f64 {
        self.total_duration
    }

    /// Elapsed time at which segment `idx` starts.
    pub fn segment_start(&self, idx: usize) -> f64 {
        if idx == 0 {
            0.0
        } else {
            self.seg_end[idx - 1]
        }
    }

    /// Shortest segment in the program, `0.0` for an empty waveform.
    pub fn min_segment_duration(&self) -> f64 {
        self.segments
            .iter()
            .map(Segment::duration)
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    /// Whether every segment starts where its predecessor stopped.
    pub fn is_continuous(&self) -> bool {
        self.segments
            .windows(2)
            .all(|pair| pair[0].stop_v == pair[1].start_v)
    }

    // Index of the segment active at time `t`: the first one ending strictly after `t`.
    // Times past the end map onto the last segment.
    fn binfind_segment(&self, t: f64) -> usize {
        let idx = self.seg_end.partition_point(|&end| end <= t);
        idx.min(self.segments.len().saturating_sub(1))
    }

    /// Programmed voltage at time `t`. Before the start and after the end the waveform holds its
    /// first and last value; an empty waveform sits at 0 V.
    pub fn value_at(&self, t: f64) -> f64 {
        if self.segments.is_empty() {
            return 0.0;
        }
        let idx = self.binfind_segment(t);
        self.segments[idx].value_at(t - self.segment_start(idx))
    }

    /// Samples the program at `num_samps` uniformly spaced times `start_time + k / samp_rate`.
    ///
    /// # Examples
    ///
    /// ```
    /// use pulsecompiler_backend::segment::*;
    /// use pulsecompiler_backend::config::PmuConfig;
    ///
    /// let mut builder = SegmentBuilder::new(&PmuConfig::default());
    /// builder.append_segment(1e-6, 0.0, 0.0).unwrap();
    /// builder.append_segment(1e-6, 0.0, 2.0).unwrap();
    /// builder.append_segment(1e-6, 2.0, 2.0).unwrap();
    /// let waveform = builder.finalize();
    ///
    /// let signal = waveform.calc_signal_nsamps(0.0, 4e6, 12);
    /// assert_eq!(signal[0], 0.0);
    /// assert!((signal[6] - 1.0).abs() < 1e-9);
    /// assert_eq!(signal[11], 2.0);
    /// ```
    pub fn calc_signal_nsamps(&self, start_time: f64, samp_rate: f64, num_samps: usize) -> Array1<f64> {
        let times: Vec<f64> = (0..num_samps)
            .map(|k| start_time + k as f64 / samp_rate)
            .collect();
        if self.segments.is_empty() {
            return Array1::zeros(num_samps);
        }
        let mut buffer = Array1::from_vec(times);
        self.fill_signal(&mut buffer.view_mut());
        buffer
    }

    /// Replaces the time values in `buffer` by the programmed voltage at those times.
    ///
    /// `buffer` must hold non-decreasing times, as any acquisition grid does.
    pub fn fill_signal(&self, buffer: &mut ndarray::ArrayViewMut1<f64>) {
        if self.segments.is_empty() {
            buffer.fill(0.0);
            return;
        }
        let n = buffer.len();
        if n == 0 {
            return;
        }
        let first = self.binfind_segment(buffer[0]);
        let last = self.binfind_segment(buffer[n - 1]);

        let mut lo = 0;
        for idx in first..=last {
            // Samples in [lo, hi) fall before the end of segment `idx`
            let hi = if idx == last {
                n
            } else {
                let end = self.seg_end[idx];
                lo + buffer.slice(s![lo..]).iter().take_while(|&&t| t < end).count()
            };
            if hi > lo {
                let seg_start = self.segment_start(idx);
                self.segments[idx].eval_inplace(&mut buffer.slice_mut(s![lo..hi]), seg_start);
            }
            lo = hi;
        }
    }
}

/// Accumulates the segments of one pattern invocation.
///
/// The builder never infers voltages: callers pass both ends of every segment, and a start that
/// differs from the previous stop is rejected.
///
/// # Examples
///
/// ```
/// use pulsecompiler_backend::segment::*;
/// use pulsecompiler_backend::config::PmuConfig;
///
/// let mut builder = SegmentBuilder::new(&PmuConfig::default());
/// assert_eq!(builder.append_segment(1e-6, 0.0, 0.5).unwrap(), 0.0);
/// assert_eq!(builder.append_segment(2e-6, 0.5, 0.5).unwrap(), 1e-6);
/// // Starts at 0.0 V while the previous segment stopped at 0.5 V
/// assert!(builder.append_segment(1e-6, 0.0, 0.0).is_err());
/// ```
///
/// Durations outside the hardware bounds are rejected:
///
/// ```
/// # use pulsecompiler_backend::segment::*;
/// # use pulsecompiler_backend::config::PmuConfig;
/// let mut builder = SegmentBuilder::new(&PmuConfig::default());
/// let err = builder.append_segment(1e-9, 0.0, 0.0).unwrap_err();
/// assert_eq!(err.status_code(), -101);
/// ```
pub struct SegmentBuilder {
    min_duration: f64,
    max_duration: f64,
    capacity: usize,
    segments: Vec<Segment>,
    seg_end: Vec<f64>,
    elapsed: f64,
}

impl SegmentBuilder {
    pub fn new(config: &PmuConfig) -> Self {
        Self {
            min_duration: config.min_segment_duration,
            max_duration: config.max_segment_duration,
            capacity: config.max_segments,
            segments: Vec::new(),
            seg_end: Vec::new(),
            elapsed: 0.0,
        }
    }

    /// Builder with room for `num_segments` segments allocated up front.
    pub fn with_capacity(config: &PmuConfig, num_segments: usize) -> Result<Self> {
        if num_segments > config.max_segments {
            return Err(Error::SegmentCapacityExceeded {
                capacity: config.max_segments,
            });
        }
        let mut builder = Self::new(config);
        let alloc_err = |_| Error::AllocationFailed {
            what: "segments",
            requested: num_segments,
        };
        builder.segments.try_reserve_exact(num_segments).map_err(alloc_err)?;
        builder.seg_end.try_reserve_exact(num_segments).map_err(alloc_err)?;
        Ok(builder)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }
    /// Voltage the next segment has to start from, `None` before the first append.
    pub fn last_voltage(&self) -> Option<f64> {
        self.segments.last().map(Segment::stop_v)
    }

    /// Appends one segment and returns the elapsed time before it.
    ///
    /// Nothing is appended when an error is returned.
    pub fn append_segment(&mut self, duration: f64, start_v: f64, stop_v: f64) -> Result<f64> {
        // Written so that NaN fails the check
        if !(duration >= self.min_duration && duration <= self.max_duration) {
            return Err(Error::InvalidSegmentDuration {
                duration,
                min: self.min_duration,
                max: self.max_duration,
            });
        }
        if !start_v.is_finite() || !stop_v.is_finite() {
            return Err(Error::InvalidParameter(format!(
                "segment voltages {} V -> {} V are not finite",
                start_v, stop_v
            )));
        }
        if let Some(expected) = self.last_voltage() {
            if expected != start_v {
                return Err(Error::VoltageDiscontinuity {
                    index: self.segments.len(),
                    expected,
                    found: start_v,
                });
            }
        }
        if self.segments.len() >= self.capacity {
            return Err(Error::SegmentCapacityExceeded {
                capacity: self.capacity,
            });
        }

        let seg = Segment {
            start_v,
            stop_v,
            duration,
        };
        let t_before = self.elapsed;
        self.elapsed += duration;
        trace!("segment {} at {:e} s: {}", self.segments.len(), t_before, seg);
        self.segments.push(seg);
        self.seg_end.push(self.elapsed);
        Ok(t_before)
    }

    /// Freezes the program. The builder is consumed, so no further appends are possible.
    pub fn finalize(self) -> Waveform {
        Waveform {
            segments: self.segments,
            seg_end: self.seg_end,
            total_duration: self.elapsed,
        }
    }
}
