//! Segmented waveform synthesis and windowed measurement extraction for a pulse source/measure
//! unit.
//!
//! A pattern invocation runs through [`PatternOrchestrator`]: segments are appended with a
//! [`SegmentBuilder`] while a [`ProbeWindowRegistry`] records one window per read, a
//! [`RateSelector`] fixes the sample rate, the frozen [`Waveform`] is handed once to an
//! [`Acquisition`] collaborator, and the returned traces are averaged per window and turned into
//! voltage, current, resistance and timestamp by the [`MeasurementDeriver`].

pub mod acquisition;
pub mod config;
pub mod error;
pub mod measurement;
pub mod orchestrator;
pub mod pattern;
pub mod probe;
pub mod rate;
pub mod segment;
pub mod trace;

pub use acquisition::*;
pub use config::*;
pub use error::*;
pub use measurement::*;
pub use orchestrator::*;
pub use pattern::*;
pub use probe::*;
pub use rate::*;
pub use segment::*;
pub use trace::*;
