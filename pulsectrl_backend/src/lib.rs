//! Runs compiled pulse patterns on source/measure units.
//!
//! Builds on `pulsecompiler_backend`: this crate supplies the unit side of the [`Acquisition`]
//! contract (a threaded [`LoopbackPmu`] that replays the program through a resistive load), the
//! two-phase [`BiasTimedRead`], and, with the `python` feature, a `Session` class for Python hosts.
//!
//! [`Acquisition`]: pulsecompiler_backend::Acquisition

#[cfg(feature = "python")]
use pyo3::prelude::*;

pub mod bias_timed;
#[cfg(feature = "python")]
pub mod experiment;
pub mod loopback;
pub mod utils;
pub mod worker_cmd_chan;

pub use crate::bias_timed::{ArmedBias, BiasTimedRead, SpotMeasure};
#[cfg(feature = "python")]
pub use crate::experiment::Session;
pub use crate::loopback::{Fault, LoopbackPmu, OutputState};
pub use crate::utils::ChunkCounter;
pub use crate::worker_cmd_chan::{CmdChan, CmdRecvr, WorkerCmd};

#[cfg(feature = "python")]
#[pymodule]
fn pulsectrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<Session>()?;
    Ok(())
}
