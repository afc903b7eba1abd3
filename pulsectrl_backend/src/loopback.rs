//! A source/measure unit double that replays the programmed waveform through a fixed load.
//!
//! `LoopbackPmu` implements the [`Acquisition`] contract without hardware: `start` spawns a worker
//! thread that renders the loaded waveform chunk by chunk at the chosen sample rate, derives the
//! current through `load_ohms`, and sends the finished traces back over a channel. `poll` checks the
//! channel without blocking, so the engine's bounded poll loop behaves as it would against a real
//! unit. The worker listens for abort commands between chunks.
//!
//! The unit also answers spot measurements ([`SpotMeasure`]) for the bias-timed read, and keeps the
//! last level driven on every channel in a shared [`OutputState`].
//!
//! Failures can be injected with [`Fault`] to exercise the engine's error paths.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, TryRecvError};
use indexmap::IndexMap;
use log::{debug, error, info};
use ndarray::{s, Array1};
use parking_lot::Mutex;

use pulsecompiler_backend::*;

use crate::bias_timed::SpotMeasure;
use crate::utils::ChunkCounter;
use crate::worker_cmd_chan::{CmdChan, CmdRecvr, WorkerCmd};

/// No program has been loaded or no run has been started.
pub const NOT_READY: i32 = -4101;
/// The worker thread went away without reporting a result.
pub const WORKER_LOST: i32 = -4102;
/// The run was stopped by a host command.
pub const ABORTED: i32 = -4103;

/// Failure injected into the next run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    FailLoad(i32),
    FailStart(i32),
    /// The run completes but reports the given status.
    FailRun(i32),
    /// The run never finishes until it is aborted.
    Hang,
}

/// Levels driven on each channel, shared between the host side and the worker.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutputState {
    levels: IndexMap<String, f64>,
    runs: usize,
    zero_events: usize,
}

impl OutputState {
    /// Last level driven on `channel`; channels never driven sit at 0 V.
    pub fn level(&self, channel: &str) -> f64 {
        self.levels.get(channel).copied().unwrap_or(0.0)
    }
    pub fn runs(&self) -> usize {
        self.runs
    }
    /// How often the unit was forced back to 0 V.
    pub fn zero_events(&self) -> usize {
        self.zero_events
    }
    fn drive(&mut self, channel: &str, volts: f64) {
        self.levels.insert(channel.to_string(), volts);
    }
}

// Everything the worker needs for one run
struct Job {
    waveform: Waveform,
    rate: RateDecision,
    force: String,
    load_ohms: f64,
    chunk_points: usize,
    fault: Option<Fault>,
}

pub struct LoopbackPmu {
    name: String,
    load_ohms: f64,
    chunk_points: usize,
    fault: Option<Fault>,
    state: Arc<Mutex<OutputState>>,
    cmd_chan: CmdChan,
    loaded: Option<(Waveform, RateDecision, ChannelConfig)>,
    worker: Option<JoinHandle<()>>,
    result_rx: Option<Receiver<Result<RawTraceSet>>>,
    finished: Option<Result<RawTraceSet>>,
}

impl LoopbackPmu {
    /// Unit terminated by a `load_ohms` resistor, rendering `chunk_points` samples per chunk.
    ///
    /// # Examples
    ///
    /// ```
    /// use pulsecompiler_backend::*;
    /// use pulsectrl_backend::LoopbackPmu;
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
    ///     num_reads: 4,
    ///     final_hold: 1e-6,
    /// }
    /// .into();
    /// let mut orchestrator = PatternOrchestrator::new(PmuConfig::default(), spec).unwrap();
    /// let mut unit = LoopbackPmu::new("loopback", 1e6, 256);
    /// let channels = ChannelConfig::new("ch1", "ch2", 1e-4, 10.0).unwrap();
    /// let mut out = OutputArrays::with_len(4);
    ///
    /// let result = orchestrator.run(&mut unit, &channels, 100_000, &DispatchConfig::default(), &mut out);
    /// assert_eq!(status_code(&result), 4);
    /// assert!(out.resistance.iter().all(|&r| r == 1e6));
    /// ```
    pub fn new(name: &str, load_ohms: f64, chunk_points: usize) -> Self {
        Self {
            name: name.to_string(),
            load_ohms,
            chunk_points,
            fault: None,
            state: Arc::new(Mutex::new(OutputState::default())),
            cmd_chan: CmdChan::new(),
            loaded: None,
            worker: None,
            result_rx: None,
            finished: None,
        }
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn set_fault(&mut self, fault: Option<Fault>) {
        self.fault = fault;
    }

    pub fn load_ohms(&self) -> f64 {
        self.load_ohms
    }

    /// Snapshot of the channel levels and run counters.
    pub fn state(&self) -> OutputState {
        self.state.lock().clone()
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("{} worker panicked", self.name);
            }
        }
    }
}

fn render(job: &Job, recvr: &mut CmdRecvr, state: &Mutex<OutputState>) -> Result<RawTraceSet> {
    if job.fault == Some(Fault::Hang) {
        let cmd = recvr.recv()?;
        return Err(AcquisitionError::new(ABORTED, format!("run stopped by {:?}", cmd)).into());
    }

    let rate = job.rate.sample_rate;
    let num_samps = job.rate.acquired_point_count;
    let times = Array1::from_iter((0..num_samps).map(|k| k as f64 / rate));
    // Written with t-values, each chunk is then replaced by the signal
    let mut voltage = times.clone();
    for (start_pos, end_pos) in ChunkCounter::new(num_samps, job.chunk_points) {
        if let Some(cmd) = recvr.try_recv()? {
            return Err(AcquisitionError::new(ABORTED, format!("run stopped by {:?}", cmd)).into());
        }
        let mut chunk = voltage.slice_mut(s![start_pos..end_pos]);
        job.waveform.fill_signal(&mut chunk);
        state.lock().drive(&job.force, chunk[end_pos - start_pos - 1]);
    }
    if let Some(Fault::FailRun(code)) = job.fault {
        return Err(AcquisitionError::new(code, "run reported a failure").into());
    }

    let current = voltage.mapv(|v| v / job.load_ohms);
    let mut traces = RawTraceSet::new();
    traces.insert(TraceKind::ForceVoltage, RawTrace::uniform(voltage.clone(), rate));
    traces.insert(TraceKind::ForceCurrent, RawTrace::uniform(current.clone(), rate));
    traces.insert(TraceKind::MeasureVoltage, RawTrace::uniform(voltage, rate));
    traces.insert(TraceKind::MeasureCurrent, RawTrace::uniform(current, rate));
    traces.insert(TraceKind::Time, RawTrace::uniform(times, rate));
    Ok(traces)
}

impl Acquisition for LoopbackPmu {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(
        &mut self,
        waveform: &Waveform,
        rate: &RateDecision,
        channels: &ChannelConfig,
    ) -> Result<(), AcquisitionError> {
        if let Some(Fault::FailLoad(code)) = self.fault {
            return Err(AcquisitionError::new(code, "segment table rejected"));
        }
        debug!("{} loaded {} segments on {}", self.name, waveform.len(), channels.force());
        self.loaded = Some((waveform.clone(), *rate, channels.clone()));
        self.finished = None;
        Ok(())
    }

    fn start(&mut self) -> Result<(), AcquisitionError> {
        if let Some(Fault::FailStart(code)) = self.fault {
            return Err(AcquisitionError::new(code, "output relay did not close"));
        }
        let (waveform, rate, channels) = self
            .loaded
            .clone()
            .ok_or_else(|| AcquisitionError::new(NOT_READY, "no program loaded"))?;
        self.join_worker();

        let job = Job {
            waveform,
            rate,
            force: channels.force().to_string(),
            load_ohms: self.load_ohms,
            chunk_points: self.chunk_points,
            fault: self.fault,
        };
        let (result_tx, result_rx) = bounded(1);
        let mut recvr = self.cmd_chan.new_recvr();
        let state = self.state.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-worker", self.name))
            .spawn(move || {
                let result = render(&job, &mut recvr, &state);
                // The host may have given up on this run already
                let _ = result_tx.send(result);
            })
            .map_err(|e| AcquisitionError::new(NOT_READY, format!("worker spawn failed: {}", e)))?;

        self.state.lock().runs += 1;
        self.worker = Some(handle);
        self.result_rx = Some(result_rx);
        self.finished = None;
        info!("{} started at {:e} Hz", self.name, rate.sample_rate);
        Ok(())
    }

    fn poll(&mut self) -> Result<RunStatus, AcquisitionError> {
        if self.finished.is_some() {
            return Ok(RunStatus::Done);
        }
        let rx = self
            .result_rx
            .as_ref()
            .ok_or_else(|| AcquisitionError::new(NOT_READY, "no run started"))?;
        match rx.try_recv() {
            Ok(result) => {
                self.finished = Some(result);
                Ok(RunStatus::Done)
            }
            Err(TryRecvError::Empty) => Ok(RunStatus::Running),
            Err(TryRecvError::Disconnected) => Err(AcquisitionError::new(
                WORKER_LOST,
                "worker exited without a result",
            )),
        }
    }

    fn fetch(&mut self) -> Result<RawTraceSet> {
        let result = self
            .finished
            .take()
            .ok_or_else(|| AcquisitionError::new(NOT_READY, "no finished run"))?;
        self.join_worker();
        self.result_rx = None;
        result
    }

    fn force_zero(&mut self, channels: &ChannelConfig) -> Result<(), AcquisitionError> {
        if self.worker.is_some() {
            self.cmd_chan.send(WorkerCmd::Abort);
            self.join_worker();
        }
        self.result_rx = None;
        let mut state = self.state.lock();
        state.drive(channels.force(), 0.0);
        state.zero_events += 1;
        Ok(())
    }
}

impl SpotMeasure for LoopbackPmu {
    fn set_bias(&mut self, channels: &ChannelConfig, volts: f64) -> Result<(), AcquisitionError> {
        if let Some(Fault::FailStart(code)) = self.fault {
            return Err(AcquisitionError::new(code, "output relay did not close"));
        }
        let mut state = self.state.lock();
        state.drive(channels.force(), volts);
        if volts == 0.0 {
            state.zero_events += 1;
        }
        Ok(())
    }

    fn sample_spot(&mut self, channels: &ChannelConfig) -> Result<(f64, f64), AcquisitionError> {
        if let Some(Fault::FailRun(code)) = self.fault {
            return Err(AcquisitionError::new(code, "spot measurement failed"));
        }
        let volts = self.state.lock().level(channels.force());
        Ok((volts, volts / self.load_ohms))
    }
}

impl Drop for LoopbackPmu {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.cmd_chan.send(WorkerCmd::Close);
            self.join_worker();
        }
    }
}
