//! The pattern state machine: one invocation from parameters to filled output arrays.
//!
//! ## Phases
//!
//! `InitDelay -> InitialRead* -> {ProgramPulse* -> Read*} x cycles -> FinalHold -> Dispatch
//! -> Extract -> Done`
//!
//! The first five phases build the waveform and the probe windows and select the sample rate.
//! Any failure there aborts before the unit is touched. `Dispatch` hands the frozen program to the
//! acquisition collaborator exactly once, and `Extract` walks the probe windows in recording order,
//! writing one measurement per probe into the caller's arrays.
//!
//! A probe whose window holds no samples is written as `0.0` and counted in
//! [`RunReport::failed_probes`]; every other failure is returned as an error. Output arrays are
//! zero-filled before anything else happens, so an aborted invocation leaves them fully defined.
//!
//! ## Read and pulse shapes
//!
//! ```text
//!  read:   rise 0 -> V | flat V (probe) | [settle V] | fall V -> 0 | delay 0 ([offset])
//!  pulse:  rise 0 -> V | flat V         | fall V -> 0 | delay 0
//! ```
//!
//! The probe window covers `window_fraction` of the flat top, the offset window the same fraction
//! of the trailing delay.

use std::fmt;

use log::{debug, info, warn};
use ndarray::Array1;

use crate::acquisition::{Acquisition, ChannelConfig};
use crate::config::{DispatchConfig, PmuConfig};
use crate::error::{Error, Result};
use crate::measurement::{DerivedMeasurement, MeasurementDeriver};
use crate::pattern::{PatternSpec, PulseShape};
use crate::probe::{ProbeWindowRegistry, Window};
use crate::rate::{RateDecision, RateSelector};
use crate::segment::{SegmentBuilder, Waveform};
use crate::trace::{RawTraceSet, TraceKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    InitDelay,
    InitialRead,
    ProgramPulse,
    Read,
    FinalHold,
    Dispatch,
    Extract,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Phase::Idle => "IDLE",
            Phase::InitDelay => "INIT_DELAY",
            Phase::InitialRead => "INITIAL_READ",
            Phase::ProgramPulse => "PROGRAM_PULSE",
            Phase::Read => "READ",
            Phase::FinalHold => "FINAL_HOLD",
            Phase::Dispatch => "DISPATCH",
            Phase::Extract => "EXTRACT",
            Phase::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

/// Output of the build and rate phases: everything the unit needs, plus the probe windows.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledPattern {
    pub waveform: Waveform,
    pub probes: ProbeWindowRegistry,
    pub rate: RateDecision,
}

/// Host-side identifiers of the output arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputParam {
    Voltage,
    Current,
    Resistance,
    Timestamp,
}

impl OutputParam {
    pub const ALL: [OutputParam; 4] = [
        OutputParam::Voltage,
        OutputParam::Current,
        OutputParam::Resistance,
        OutputParam::Timestamp,
    ];

    /// Parameter number used by hosts to retrieve the array.
    pub fn code(&self) -> i32 {
        match self {
            OutputParam::Voltage => 1,
            OutputParam::Current => 2,
            OutputParam::Resistance => 3,
            OutputParam::Timestamp => 4,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|param| param.code() == code)
            .ok_or_else(|| Error::InvalidParameter(format!("unknown output parameter {}", code)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutputParam::Voltage => "voltage",
            OutputParam::Current => "current",
            OutputParam::Resistance => "resistance",
            OutputParam::Timestamp => "timestamp",
        }
    }
}

/// Caller-provided result arrays, one element per probe.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputArrays {
    pub voltage: Array1<f64>,
    pub current: Array1<f64>,
    pub resistance: Array1<f64>,
    pub timestamp: Array1<f64>,
}

impl OutputArrays {
    pub fn with_len(len: usize) -> Self {
        Self {
            voltage: Array1::zeros(len),
            current: Array1::zeros(len),
            resistance: Array1::zeros(len),
            timestamp: Array1::zeros(len),
        }
    }

    /// Like [`OutputArrays::with_len`], but reports a failed allocation instead of aborting.
    pub fn try_with_len(len: usize) -> Result<Self> {
        let zeros = || -> Result<Array1<f64>> {
            let mut values = Vec::new();
            values
                .try_reserve_exact(len)
                .map_err(|_| Error::AllocationFailed {
                    what: "output arrays",
                    requested: len,
                })?;
            values.resize(len, 0.0);
            Ok(Array1::from_vec(values))
        };
        Ok(Self {
            voltage: zeros()?,
            current: zeros()?,
            resistance: zeros()?,
            timestamp: zeros()?,
        })
    }

    pub fn get(&self, param: OutputParam) -> &Array1<f64> {
        match param {
            OutputParam::Voltage => &self.voltage,
            OutputParam::Current => &self.current,
            OutputParam::Resistance => &self.resistance,
            OutputParam::Timestamp => &self.timestamp,
        }
    }

    /// Fails with the first array shorter than `required`.
    pub fn check_len(&self, required: usize) -> Result<()> {
        for param in OutputParam::ALL {
            let actual = self.get(param).len();
            if actual < required {
                return Err(Error::OutputArrayTooSmall {
                    name: param.name(),
                    required,
                    actual,
                });
            }
        }
        Ok(())
    }

    pub fn fill(&mut self, value: f64) {
        self.voltage.fill(value);
        self.current.fill(value);
        self.resistance.fill(value);
        self.timestamp.fill(value);
    }

    pub fn write(&mut self, idx: usize, meas: &DerivedMeasurement) {
        self.voltage[idx] = meas.voltage;
        self.current[idx] = meas.current;
        self.resistance[idx] = meas.resistance;
        self.timestamp[idx] = meas.timestamp;
    }
}

/// Summary of a completed invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub probe_count: usize,
    /// Probes whose window held no samples, in probe order.
    pub failed_probes: Vec<usize>,
    pub rate: RateDecision,
    pub total_duration: f64,
}

impl RunReport {
    pub fn valid_count(&self) -> usize {
        self.probe_count - self.failed_probes.len()
    }

    /// Quality signal for the caller; the invocation itself still succeeded.
    pub fn all_failed(&self) -> bool {
        self.probe_count > 0 && self.failed_probes.len() == self.probe_count
    }
}

/// Integer status reported to hosts: the number of valid probes on success, a negative error code
/// otherwise.
pub fn status_code(result: &Result<RunReport>) -> i32 {
    match result {
        Ok(report) => i32::try_from(report.valid_count()).unwrap_or_else(|_| {
            Error::InvalidParameter(format!(
                "{} valid probes exceed the status range",
                report.valid_count()
            ))
            .status_code()
        }),
        Err(err) => err.status_code(),
    }
}

/// Drives one pattern invocation through its phases.
///
/// # Examples
///
/// Compiling a read train without running it:
///
/// ```
/// use pulsecompiler_backend::*;
///
/// let spec: PatternSpec = ReadTrainParams {
///     init_delay: 1e-6,
///     read: ReadTiming {
///         meas_v: 0.5,
///         width: 2e-6,
///         rise: 1e-7,
///         fall: 1e-7,
///         settle: 0.0,
///         delay: 1e-6,
///         offset_compensation: false,
///     },
///     num_reads: 3,
///     final_hold: 1e-6,
/// }
/// .into();
/// let mut orchestrator = PatternOrchestrator::new(PmuConfig::default(), spec).unwrap();
/// let compiled = orchestrator.compile(100_000).unwrap();
///
/// assert_eq!(compiled.probes.len(), 3);
/// assert_eq!(compiled.waveform.len(), 2 + 3 * 4 + 1);
/// assert!(compiled.waveform.is_continuous());
/// assert!(compiled.rate.acquired_point_count < 100_000);
/// ```
#[derive(Clone, Debug)]
pub struct PatternOrchestrator {
    config: PmuConfig,
    spec: PatternSpec,
    probe_count: usize,
    segment_count: usize,
    phase: Phase,
}

impl PatternOrchestrator {
    pub fn new(config: PmuConfig, spec: PatternSpec) -> Result<Self> {
        config.validate()?;
        spec.validate(&config)?;
        let overflow = || Error::SegmentCapacityExceeded {
            capacity: config.max_segments,
        };
        let probe_count = spec.probe_count().ok_or_else(overflow)?;
        let segment_count = spec.segment_count().ok_or_else(overflow)?;
        Ok(Self {
            config,
            spec,
            probe_count,
            segment_count,
            phase: Phase::Idle,
        })
    }

    pub fn spec(&self) -> &PatternSpec {
        &self.spec
    }
    pub fn config(&self) -> &PmuConfig {
        &self.config
    }
    pub fn probe_count(&self) -> usize {
        self.probe_count
    }
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }
    /// Last phase entered; after an error, the phase that failed.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!("{} pattern: {} -> {}", self.spec.family, self.phase, phase);
            self.phase = phase;
        }
    }

    fn append_read(
        &self,
        builder: &mut SegmentBuilder,
        probes: &mut ProbeWindowRegistry,
    ) -> Result<usize> {
        let read = &self.spec.read;
        let fraction = self.config.window_fraction;
        let v = read.meas_v;

        builder.append_segment(read.rise, 0.0, v)?;
        let t_flat = builder.append_segment(read.width, v, v)?;
        let window = Window::inner(t_flat, read.width, fraction)?;
        let index = probes.record(window.start, window.end)?;
        if read.settle > 0.0 {
            builder.append_segment(read.settle, v, v)?;
        }
        builder.append_segment(read.fall, v, 0.0)?;
        let t_delay = builder.append_segment(read.delay, 0.0, 0.0)?;
        if read.offset_compensation {
            probes.attach_offset(index, Window::inner(t_delay, read.delay, fraction)?)?;
        }
        Ok(index)
    }

    fn append_pulse(builder: &mut SegmentBuilder, pulse: &PulseShape) -> Result<()> {
        let v = pulse.voltage;
        builder.append_segment(pulse.rise, 0.0, v)?;
        builder.append_segment(pulse.width, v, v)?;
        builder.append_segment(pulse.fall, v, 0.0)?;
        builder.append_segment(pulse.delay, 0.0, 0.0)?;
        Ok(())
    }

    /// Build and rate phases only: returns the frozen program without touching the unit.
    pub fn compile(&mut self, max_point_budget: usize) -> Result<CompiledPattern> {
        let probe_count = self.probe_count;
        let structure = self.spec.structure;
        let mut builder = SegmentBuilder::with_capacity(&self.config, self.segment_count)?;
        let mut probes = ProbeWindowRegistry::reserve(probe_count)?;

        self.enter(Phase::InitDelay);
        builder.append_segment(self.spec.init_delay, 0.0, 0.0)?;
        builder.append_segment(self.spec.read.rise, 0.0, 0.0)?;

        self.enter(Phase::InitialRead);
        for _ in 0..structure.initial_reads {
            self.append_read(&mut builder, &mut probes)?;
        }

        for cycle in 0..structure.cycle_count {
            for &polarity in structure.polarity_schedule.groups() {
                debug!("cycle {} {:?} group", cycle, polarity);
                self.enter(Phase::Read);
                for _ in 0..structure.reads_before_pulses {
                    self.append_read(&mut builder, &mut probes)?;
                }
                self.enter(Phase::ProgramPulse);
                let pulse = self.spec.pulse_for(polarity);
                for _ in 0..structure.pulses_per_group {
                    Self::append_pulse(&mut builder, &pulse)?;
                }
                self.enter(Phase::Read);
                for _ in 0..structure.reads_per_cycle {
                    self.append_read(&mut builder, &mut probes)?;
                }
            }
        }

        self.enter(Phase::FinalHold);
        builder.append_segment(self.spec.final_hold, 0.0, 0.0)?;

        if probes.len() != probe_count {
            return Err(Error::InvalidParameter(format!(
                "{} pattern declared {} reads but recorded {}",
                self.spec.family,
                probe_count,
                probes.len()
            )));
        }
        let waveform = builder.finalize();
        probes.check_within(waveform.total_duration())?;

        let rate = RateSelector::from_config(&self.config).select_rate(
            waveform.total_duration(),
            max_point_budget,
            waveform.min_segment_duration(),
        )?;
        info!(
            "{} pattern: {} segments, {} probes, {:e} s",
            self.spec.family,
            waveform.len(),
            probes.len(),
            waveform.total_duration()
        );
        Ok(CompiledPattern {
            waveform,
            probes,
            rate,
        })
    }

    /// Runs the whole invocation on `device` and fills `out`.
    pub fn run<A: Acquisition + ?Sized>(
        &mut self,
        device: &mut A,
        channels: &ChannelConfig,
        max_point_budget: usize,
        dispatch: &DispatchConfig,
        out: &mut OutputArrays,
    ) -> Result<RunReport> {
        out.check_len(self.probe_count())?;
        out.fill(0.0);

        let compiled = self.compile(max_point_budget)?;
        channels.check_waveform(&compiled.waveform)?;

        self.enter(Phase::Dispatch);
        let traces = device.execute(&compiled.waveform, &compiled.rate, channels, dispatch)?;

        self.enter(Phase::Extract);
        let report = self.extract(&compiled, &traces, channels, out)?;
        self.enter(Phase::Done);
        Ok(report)
    }

    /// Extract phase over already acquired traces.
    pub fn extract(
        &self,
        compiled: &CompiledPattern,
        traces: &RawTraceSet,
        channels: &ChannelConfig,
        out: &mut OutputArrays,
    ) -> Result<RunReport> {
        out.check_len(compiled.probes.len())?;
        traces.find(TraceKind::MeasureVoltage)?;
        traces.find(TraceKind::MeasureCurrent)?;

        let deriver = MeasurementDeriver::from_config(&self.config);
        let mut failed_probes = Vec::new();
        for probe in &compiled.probes {
            match deriver.measure_probe(traces, probe, channels.current_range) {
                Ok(meas) => out.write(probe.index, &meas),
                Err(err) if err.is_per_probe() => {
                    warn!("probe {} degraded to 0: {}", probe.index, err);
                    out.write(probe.index, &DerivedMeasurement::default());
                    failed_probes.push(probe.index);
                }
                Err(err) => return Err(err),
            }
        }

        let report = RunReport {
            probe_count: compiled.probes.len(),
            failed_probes,
            rate: compiled.rate,
            total_duration: compiled.waveform.total_duration(),
        };
        if report.all_failed() {
            warn!(
                "{} pattern: none of the {} probes had samples",
                self.spec.family, report.probe_count
            );
        }
        Ok(report)
    }
}
