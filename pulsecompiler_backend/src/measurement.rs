//! Physical quantities derived from the averaged traces of a probe.

use log::debug;

use crate::config::PmuConfig;
use crate::error::Result;
use crate::probe::ProbeWindow;
use crate::trace::{RawTraceSet, TraceKind};

/// Result of one read.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DerivedMeasurement {
    pub voltage: f64,
    pub current: f64,
    pub resistance: f64,
    pub timestamp: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeasurementDeriver {
    noise_floor: f64,
}

impl MeasurementDeriver {
    pub fn new(noise_floor: f64) -> Self {
        Self { noise_floor }
    }

    pub fn from_config(config: &PmuConfig) -> Self {
        Self::new(config.noise_floor)
    }

    /// Largest resistance reported for a channel on the given current range.
    pub fn ceiling(current_range: f64) -> f64 {
        1e4 / current_range
    }

    /// `|voltage / current|`, clamped to `1e4 / current_range`.
    ///
    /// Currents within the noise floor return the ceiling instead of dividing by noise.
    ///
    /// ```
    /// use pulsecompiler_backend::measurement::MeasurementDeriver;
    ///
    /// let deriver = MeasurementDeriver::new(1e-12);
    /// assert_eq!(deriver.resistance(0.5, 5e-7, 1e-4), 1e6);
    /// assert_eq!(deriver.resistance(0.5, -5e-7, 1e-4), 1e6);
    /// assert_eq!(deriver.resistance(0.5, 1e-13, 1e-4), 1e8);
    /// // Above the ceiling but outside the noise floor
    /// assert_eq!(deriver.resistance(0.5, 1e-10, 1e-4), 1e8);
    /// ```
    pub fn resistance(&self, voltage: f64, current: f64, current_range: f64) -> f64 {
        let ceiling = Self::ceiling(current_range);
        if current.abs() <= self.noise_floor {
            return ceiling;
        }
        (voltage / current).abs().min(ceiling)
    }

    pub fn compensated_current(&self, measured: f64, offset: f64) -> f64 {
        measured - offset
    }

    /// Combines averaged voltage and current, subtracting `offset_current` first when present.
    pub fn derive(
        &self,
        voltage: f64,
        current: f64,
        offset_current: Option<f64>,
        current_range: f64,
        timestamp: f64,
    ) -> DerivedMeasurement {
        let current = match offset_current {
            Some(offset) => self.compensated_current(current, offset),
            None => current,
        };
        DerivedMeasurement {
            voltage,
            current,
            resistance: self.resistance(voltage, current, current_range),
            timestamp,
        }
    }

    /// Averages the measured traces over the probe's window(s) and derives the read.
    ///
    /// The timestamp is the mean sample time in the window, taken from the `T` trace when the
    /// unit returned one and from the current trace's own time base otherwise.
    pub fn measure_probe(
        &self,
        traces: &RawTraceSet,
        probe: &ProbeWindow,
        current_range: f64,
    ) -> Result<DerivedMeasurement> {
        let (start, end) = (probe.window.start, probe.window.end);
        let current_trace = traces.find(TraceKind::MeasureCurrent)?;
        let voltage = traces.find(TraceKind::MeasureVoltage)?.average(start, end)?;
        let current = current_trace.average(start, end)?;
        let timestamp = match traces.get(TraceKind::Time) {
            Some(time_trace) => time_trace.average(start, end)?,
            None => current_trace.time_average(start, end)?,
        };
        let offset_current = match probe.offset {
            Some(offset) => Some(current_trace.average(offset.start, offset.end)?),
            None => None,
        };

        let meas = self.derive(voltage, current, offset_current, current_range, timestamp);
        debug!(
            "probe {}: {} V, {:e} A, {:e} Ohm at {:e} s",
            probe.index, meas.voltage, meas.current, meas.resistance, meas.timestamp
        );
        Ok(meas)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::probe::Window;
    use crate::trace::RawTrace;
    use ndarray::Array1;

    #[test]
    fn clamp_holds_at_noise_floor() {
        let deriver = MeasurementDeriver::from_config(&PmuConfig::default());
        for i in [0.0, 1e-12, -1e-12, 5e-13] {
            assert_eq!(deriver.resistance(1.0, i, 1e-3), 1e7);
        }
        assert_eq!(deriver.resistance(1.0, 2e-12, 1e-3), 1e7);
        assert_eq!(deriver.resistance(1.0, 1e-3, 1e-3), 1e3);
    }

    #[test]
    fn offset_is_subtracted_before_resistance() {
        let deriver = MeasurementDeriver::new(1e-12);
        let meas = deriver.derive(0.2, 3e-6, Some(1e-6), 1e-4, 0.5);
        assert!((meas.current - 2e-6).abs() < 1e-18);
        assert!((meas.resistance - 1e5).abs() < 1e-6);
        assert_eq!(meas.timestamp, 0.5);
    }

    #[test]
    fn probe_reads_measured_traces() {
        let n = 100;
        // Current steps from 1 uA to 3 uA half way through
        let current = Array1::from_iter((0..n).map(|k| if k < 50 { 1e-6 } else { 3e-6 }));
        let mut traces = RawTraceSet::new();
        traces.insert(TraceKind::MeasureVoltage, RawTrace::uniform(Array1::from_elem(n, 0.3), 1e3));
        traces.insert(TraceKind::MeasureCurrent, RawTrace::uniform(current, 1e3));

        let probe = ProbeWindow {
            index: 0,
            window: Window::new(0.06, 0.08).unwrap(),
            offset: Some(Window::new(0.01, 0.02).unwrap()),
        };
        let deriver = MeasurementDeriver::new(1e-12);
        let meas = deriver.measure_probe(&traces, &probe, 1e-4).unwrap();
        assert_eq!(meas.voltage, 0.3);
        assert!((meas.current - 2e-6).abs() < 1e-15);
        assert!((meas.resistance - 1.5e5).abs() < 1e-3);
        assert!((meas.timestamp - 0.07).abs() < 1e-9);

        traces = RawTraceSet::new();
        assert!(deriver.measure_probe(&traces, &probe, 1e-4).is_err());
    }
}
