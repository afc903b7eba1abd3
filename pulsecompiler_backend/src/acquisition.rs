//! Contract with the acquisition collaborator that runs a program on the unit.
//!
//! The collaborator only needs to provide the primitive steps (`load`, `start`, `poll`, `fetch`
//! and `force_zero`); the `Acquisition::execute` default method drives them as the single
//! blocking DISPATCH of a pattern invocation:
//!
//! 1. load the frozen waveform and the rate decision onto the configured channels,
//! 2. start the run,
//! 3. poll it a bounded number of times, sleeping between polls,
//! 4. fetch the traces and check them against the allocated point count.
//!
//! Any failure on the way forces the output back to 0 V before the error is returned; the run
//! itself cannot be cancelled.

use std::thread;

use log::{error, info, warn};
use regex::Regex;

use crate::config::DispatchConfig;
use crate::error::{AcquisitionError, Error, Result};
use crate::rate::RateDecision;
use crate::segment::Waveform;
use crate::trace::RawTraceSet;

/// Which unit channels force and measure, and the ranges they run on.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelConfig {
    force: String,
    measure: String,
    /// Current range of the measure channel (A). Also sets the resistance ceiling.
    pub current_range: f64,
    /// Voltage range of the force channel (V).
    pub voltage_range: f64,
}

impl ChannelConfig {
    /// Channel names follow the unit's `ch<N>` convention.
    ///
    /// # Examples
    ///
    /// ```
    /// use pulsecompiler_backend::acquisition::ChannelConfig;
    ///
    /// let channels = ChannelConfig::new("ch1", "ch2", 1e-4, 10.0).unwrap();
    /// assert_eq!(channels.force(), "ch1");
    /// assert!(ChannelConfig::new("ao0", "ch2", 1e-4, 10.0).is_err());
    /// assert!(ChannelConfig::new("ch1", "ch2", 0.0, 10.0).is_err());
    /// ```
    pub fn new(force: &str, measure: &str, current_range: f64, voltage_range: f64) -> Result<Self> {
        let re = Regex::new(r"^ch\d+$")
            .map_err(|e| Error::InvalidParameter(format!("channel name pattern: {}", e)))?;
        for name in [force, measure] {
            if !re.is_match(name) {
                return Err(Error::InvalidParameter(format!(
                    "expecting channels of format 'ch<N>' yet received channel name {}",
                    name
                )));
            }
        }
        for (what, range) in [("current", current_range), ("voltage", voltage_range)] {
            if !(range > 0.0 && range.is_finite()) {
                return Err(Error::InvalidParameter(format!(
                    "{} range {} is not positive",
                    what, range
                )));
            }
        }
        Ok(Self {
            force: force.to_string(),
            measure: measure.to_string(),
            current_range,
            voltage_range,
        })
    }

    pub fn force(&self) -> &str {
        &self.force
    }
    pub fn measure(&self) -> &str {
        &self.measure
    }

    /// Fails if the program swings beyond the force channel's voltage range.
    pub fn check_waveform(&self, waveform: &Waveform) -> Result<()> {
        for (idx, seg) in waveform.segments().iter().enumerate() {
            let peak = seg.start_v().abs().max(seg.stop_v().abs());
            if peak > self.voltage_range {
                return Err(Error::InvalidParameter(format!(
                    "segment {} reaches {} V, beyond the {} V range of {}",
                    idx, peak, self.voltage_range, self.force
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Done,
}

/// A unit that can run one program and hand back its raw traces.
pub trait Acquisition {
    fn name(&self) -> &str;

    /// Programs the segments onto the configured channels at the chosen rate.
    fn load(
        &mut self,
        waveform: &Waveform,
        rate: &RateDecision,
        channels: &ChannelConfig,
    ) -> Result<(), AcquisitionError>;
    fn start(&mut self) -> Result<(), AcquisitionError>;
    fn poll(&mut self) -> Result<RunStatus, AcquisitionError>;
    /// Traces of the finished run, one per monitored quantity.
    fn fetch(&mut self) -> Result<RawTraceSet>;
    /// Drives the force channel to 0 V.
    fn force_zero(&mut self, channels: &ChannelConfig) -> Result<(), AcquisitionError>;

    /// Runs the program once to completion, see the module documentation.
    fn execute(
        &mut self,
        waveform: &Waveform,
        rate: &RateDecision,
        channels: &ChannelConfig,
        dispatch: &DispatchConfig,
    ) -> Result<RawTraceSet> {
        info!(
            "dispatching {} segments ({:e} s) to {} at {:e} Hz",
            waveform.len(),
            waveform.total_duration(),
            self.name(),
            rate.sample_rate
        );
        let result = (|| -> Result<RawTraceSet> {
            self.load(waveform, rate, channels)?;
            self.start()?;
            let mut finished = false;
            for _ in 0..dispatch.max_polls {
                if self.poll()? == RunStatus::Done {
                    finished = true;
                    break;
                }
                thread::sleep(dispatch.poll_interval());
            }
            if !finished {
                return Err(Error::DispatchTimeout {
                    polls: dispatch.max_polls,
                    interval: dispatch.poll_interval(),
                });
            }
            let traces = self.fetch()?;
            traces.check_allocated(rate.allocated_point_count)?;
            Ok(traces)
        })();

        match result {
            Ok(traces) => {
                info!("{} returned {} traces", self.name(), traces.len());
                Ok(traces)
            }
            Err(err) => {
                warn!(
                    "acquisition on {} failed ({}), forcing {} to 0 V",
                    self.name(),
                    err,
                    channels.force()
                );
                if let Err(zero_err) = self.force_zero(channels) {
                    error!("{} could not force 0 V: {}", self.name(), zero_err);
                }
                Err(err)
            }
        }
    }
}
