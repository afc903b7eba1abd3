//! Error definitions shared by every stage of a pattern invocation.
//!
//! Errors fall into five families, each with its own band of negative status codes so that
//! a host reading a single integer can tell a parameter problem from a hardware problem:
//!
//! | family       | codes          | fatal |
//! |--------------|----------------|-------|
//! | composition  | `-100..=-199`  | yes   |
//! | resource     | `-200..=-299`  | yes   |
//! | rate/timing  | `-300..=-399`  | yes   |
//! | acquisition  | hardware code, else `-400..=-499` | yes |
//! | extraction   | `-500..=-599`  | no, degrades a single probe |

use std::time::Duration;

use thiserror::Error;

use crate::trace::TraceKind;

/// Opaque failure reported by the acquisition collaborator.
///
/// `code` is the instrument's own status code and is passed through to the host unchanged.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("acquisition failed with status {code}: {message}")]
pub struct AcquisitionError {
    pub code: i32,
    pub message: String,
}

impl AcquisitionError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Clone, Debug, PartialEq)]
pub enum Error {
    // Composition
    #[error("segment duration {duration:e} s outside hardware bounds [{min:e}, {max:e}] s")]
    InvalidSegmentDuration { duration: f64, min: f64, max: f64 },
    #[error("segment {index} starts at {found} V but previous segment stops at {expected} V")]
    VoltageDiscontinuity {
        index: usize,
        expected: f64,
        found: f64,
    },
    #[error("waveform exceeds the segment capacity of {capacity}")]
    SegmentCapacityExceeded { capacity: usize },
    #[error("probe capacity of {capacity} exceeded")]
    ProbeCapacityExceeded { capacity: usize },
    #[error("probe index {index} out of range, {count} probes recorded")]
    ProbeIndexOutOfRange { index: usize, count: usize },
    #[error("invalid probe window [{start:e}, {end:e}] s")]
    InvalidProbeWindow { start: f64, end: f64 },
    #[error("probe {index} window ends at {end:e} s, past the waveform end at {total:e} s")]
    WindowOutsideWaveform { index: usize, end: f64, total: f64 },
    #[error("output array `{name}` holds {actual} elements but {required} probes are declared")]
    OutputArrayTooSmall {
        name: &'static str,
        required: usize,
        actual: usize,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    // Resource
    #[error("failed to allocate {requested} {what}")]
    AllocationFailed { what: &'static str, requested: usize },

    // Rate / timing
    #[error("point budget {budget} exceeds the hardware cap of {cap} points")]
    PointBudgetExceeded { budget: usize, cap: usize },
    #[error(
        "no sample rate fits {total_duration:e} s into {budget} points \
        (minimum segment {min_segment:e} s)"
    )]
    RateUnattainable {
        total_duration: f64,
        budget: usize,
        min_segment: f64,
    },
    #[error("waveform has no duration")]
    EmptyWaveform,

    // Acquisition
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error("acquisition did not finish within {polls} polls of {interval:?}")]
    DispatchTimeout { polls: usize, interval: Duration },
    #[error("acquisition returned no {kind} trace")]
    MissingTrace { kind: TraceKind },
    #[error("{kind} trace holds {len} points, only {allocated} were allocated")]
    TraceOverrun {
        kind: TraceKind,
        len: usize,
        allocated: usize,
    },
    #[error("malformed trace: {0}")]
    MalformedTrace(String),

    // Extraction
    #[error("no samples in window [{start:e}, {end:e}] s")]
    NoSamplesInWindow { start: f64, end: f64 },
}

impl Error {
    /// Negative status code reported to the host for this error.
    pub fn status_code(&self) -> i32 {
        match self {
            Error::InvalidSegmentDuration { .. } => -101,
            Error::VoltageDiscontinuity { .. } => -102,
            Error::SegmentCapacityExceeded { .. } => -103,
            Error::ProbeCapacityExceeded { .. } => -104,
            Error::ProbeIndexOutOfRange { .. } => -105,
            Error::InvalidProbeWindow { .. } => -106,
            Error::WindowOutsideWaveform { .. } => -107,
            Error::OutputArrayTooSmall { .. } => -108,
            Error::InvalidParameter(_) => -109,
            Error::AllocationFailed { .. } => -201,
            Error::PointBudgetExceeded { .. } => -301,
            Error::RateUnattainable { .. } => -302,
            Error::EmptyWaveform => -303,
            Error::Acquisition(err) if err.code < 0 => err.code,
            Error::Acquisition(_) => -400,
            Error::DispatchTimeout { .. } => -401,
            Error::MissingTrace { .. } => -402,
            Error::TraceOverrun { .. } => -403,
            Error::MalformedTrace(_) => -404,
            Error::NoSamplesInWindow { .. } => -501,
        }
    }

    /// Whether the error only degrades a single probe instead of aborting the invocation.
    pub fn is_per_probe(&self) -> bool {
        matches!(self, Error::NoSamplesInWindow { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
