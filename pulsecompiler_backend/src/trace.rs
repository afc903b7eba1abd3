//! Raw traces returned by the acquisition collaborator and windowed averaging over them.
//!
//! ## Main Structures and Enumerations:
//!
//! - `TraceKind`: closed set of traces the unit can report. Hosts name them with the short codes
//!   `VF`, `IF`, `VM`, `IM` and `T`; `TraceKind::from_code` is the only place those strings are
//!   interpreted.
//!
//! - `RawTrace`: a `(values, times)` pair with non-decreasing times.
//!
//! - `RawTraceSet`: the traces of one acquisition, keyed by kind in the order the unit returned them.
//!
//! ## Averaging
//!
//! `average` scans the trace from the first sample while `time <= end` and takes the mean of the
//! samples with `time >= start`. The mean is computed relative to the first sample in the window,
//! so a window over a constant trace returns that constant exactly.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use maplit::hashmap;
use ndarray::Array1;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TraceKind {
    ForceVoltage,
    ForceCurrent,
    MeasureVoltage,
    MeasureCurrent,
    Time,
}

impl TraceKind {
    pub const ALL: [TraceKind; 5] = [
        TraceKind::ForceVoltage,
        TraceKind::ForceCurrent,
        TraceKind::MeasureVoltage,
        TraceKind::MeasureCurrent,
        TraceKind::Time,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            TraceKind::ForceVoltage => "VF",
            TraceKind::ForceCurrent => "IF",
            TraceKind::MeasureVoltage => "VM",
            TraceKind::MeasureCurrent => "IM",
            TraceKind::Time => "T",
        }
    }

    /// Lookup table from host code to kind.
    pub fn code_table() -> HashMap<&'static str, TraceKind> {
        hashmap! {
            "VF" => TraceKind::ForceVoltage,
            "IF" => TraceKind::ForceCurrent,
            "VM" => TraceKind::MeasureVoltage,
            "IM" => TraceKind::MeasureCurrent,
            "T" => TraceKind::Time,
        }
    }

    /// ```
    /// use pulsecompiler_backend::trace::TraceKind;
    ///
    /// assert_eq!(TraceKind::from_code("IM").unwrap(), TraceKind::MeasureCurrent);
    /// assert!(TraceKind::from_code("XX").is_err());
    /// ```
    pub fn from_code(code: &str) -> Result<Self> {
        Self::code_table()
            .get(code)
            .copied()
            .ok_or_else(|| Error::InvalidParameter(format!("unknown trace code {:?}", code)))
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for TraceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_code(s)
    }
}

/// Mean of `values[i]` over the samples with `start <= times[i] <= end`.
fn window_mean(values: &Array1<f64>, times: &Array1<f64>, start: f64, end: f64) -> Result<f64> {
    let mut pivot: Option<f64> = None;
    let mut sum = 0.0;
    let mut count = 0usize;
    for (&t, &v) in times.iter().zip(values.iter()) {
        if t > end {
            break;
        }
        if t >= start {
            let x0 = *pivot.get_or_insert(v);
            sum += v - x0;
            count += 1;
        }
    }
    match pivot {
        Some(x0) => Ok(x0 + sum / count as f64),
        None => Err(Error::NoSamplesInWindow { start, end }),
    }
}

/// Averages `trace.values` over the window `[start, end]`.
///
/// # Examples
///
/// ```
/// use pulsecompiler_backend::trace::*;
///
/// let trace = RawTrace::from_vecs(vec![1., 2., 3., 4.], vec![0., 1., 2., 3.]).unwrap();
/// assert_eq!(average(&trace, 1., 2.).unwrap(), 2.5);
/// // Nothing was sampled after t = 3
/// assert!(average(&trace, 3.5, 5.).is_err());
/// ```
pub fn average(trace: &RawTrace, start: f64, end: f64) -> Result<f64> {
    trace.average(start, end)
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawTrace {
    values: Array1<f64>,
    times: Array1<f64>,
}

impl RawTrace {
    /// Checks that both arrays have the same length and that `times` never decreases.
    pub fn new(values: Array1<f64>, times: Array1<f64>) -> Result<Self> {
        if values.len() != times.len() {
            return Err(Error::MalformedTrace(format!(
                "{} values against {} timestamps",
                values.len(),
                times.len()
            )));
        }
        let decreasing = times
            .iter()
            .zip(times.iter().skip(1))
            .position(|(a, b)| !(b >= a));
        if let Some(idx) = decreasing {
            return Err(Error::MalformedTrace(format!(
                "timestamp {} decreases from {:e} to {:e} s",
                idx + 1,
                times[idx],
                times[idx + 1]
            )));
        }
        Ok(Self { values, times })
    }

    pub fn from_vecs(values: Vec<f64>, times: Vec<f64>) -> Result<Self> {
        Self::new(Array1::from_vec(values), Array1::from_vec(times))
    }

    /// Trace sampled at `k / samp_rate`.
    pub fn uniform(values: Array1<f64>, samp_rate: f64) -> Self {
        let times = Array1::from_iter((0..values.len()).map(|k| k as f64 / samp_rate));
        Self { values, times }
    }

    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }
    pub fn times(&self) -> &Array1<f64> {
        &self.times
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn average(&self, start: f64, end: f64) -> Result<f64> {
        window_mean(&self.values, &self.times, start, end)
    }

    /// Mean sample time inside the window.
    pub fn time_average(&self, start: f64, end: f64) -> Result<f64> {
        window_mean(&self.times, &self.times, start, end)
    }
}

/// All traces of one acquisition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawTraceSet {
    traces: IndexMap<TraceKind, RawTrace>,
}

impl RawTraceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a trace, replacing and returning any earlier trace of the same kind.
    pub fn insert(&mut self, kind: TraceKind, trace: RawTrace) -> Option<RawTrace> {
        self.traces.insert(kind, trace)
    }

    pub fn get(&self, kind: TraceKind) -> Option<&RawTrace> {
        self.traces.get(&kind)
    }

    /// Like `get`, with a missing trace reported as an acquisition error.
    pub fn find(&self, kind: TraceKind) -> Result<&RawTrace> {
        self.traces.get(&kind).ok_or(Error::MissingTrace { kind })
    }

    /// Host-facing lookup by trace code.
    pub fn find_by_code(&self, code: &str) -> Result<&RawTrace> {
        self.find(TraceKind::from_code(code)?)
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
    pub fn kinds(&self) -> impl Iterator<Item = TraceKind> + '_ {
        self.traces.keys().copied()
    }

    /// Fails if any trace holds more points than the unit was allowed to return.
    pub fn check_allocated(&self, allocated: usize) -> Result<()> {
        for (&kind, trace) in &self.traces {
            if trace.len() > allocated {
                return Err(Error::TraceOverrun {
                    kind,
                    len: trace.len(),
                    allocated,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn code_table_covers_every_kind() {
        let table = TraceKind::code_table();
        assert_eq!(table.len(), TraceKind::ALL.len());
        for kind in TraceKind::ALL {
            assert_eq!(kind.code().parse::<TraceKind>().unwrap(), kind);
            assert_eq!(table[kind.code()], kind);
        }
    }

    #[test]
    fn constant_trace_averages_exactly() {
        let trace = RawTrace::uniform(Array1::from_elem(1000, 5e-7), 1e6);
        for (start, end) in [(0.0, 1e-3), (1.1e-4, 1.3e-4), (3e-4, 3e-4)] {
            assert_eq!(trace.average(start, end).unwrap(), 5e-7);
        }
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let trace = RawTrace::from_vecs(vec![1., 2., 3.], vec![0., 1., 2.]).unwrap();
        assert_eq!(trace.average(1., 1.).unwrap(), 2.);
        assert_eq!(trace.time_average(0., 2.).unwrap(), 1.);
        assert_eq!(
            trace.average(0.2, 0.8),
            Err(Error::NoSamplesInWindow { start: 0.2, end: 0.8 })
        );
    }

    #[test]
    fn malformed_traces_are_rejected() {
        assert!(RawTrace::new(array![1., 2.], array![0.]).is_err());
        assert!(RawTrace::from_vecs(vec![1., 2., 3.], vec![0., 2., 1.]).is_err());
        assert!(RawTrace::from_vecs(vec![1., 2.], vec![0., f64::NAN]).is_err());
        assert!(RawTrace::from_vecs(vec![1., 2.], vec![1., 1.]).is_ok());
    }

    #[test]
    fn trace_set_keeps_insertion_order() {
        let mut set = RawTraceSet::new();
        set.insert(TraceKind::MeasureCurrent, RawTrace::uniform(array![0., 0.], 1.));
        set.insert(TraceKind::Time, RawTrace::uniform(array![0., 1., 2.], 1.));
        let kinds: Vec<TraceKind> = set.kinds().collect();
        assert_eq!(kinds, vec![TraceKind::MeasureCurrent, TraceKind::Time]);
        assert!(set.find_by_code("IM").is_ok());
        assert_eq!(
            set.find(TraceKind::MeasureVoltage),
            Err(Error::MissingTrace {
                kind: TraceKind::MeasureVoltage
            })
        );
        assert!(set.check_allocated(3).is_ok());
        assert!(set.check_allocated(2).is_err());
    }
}
