//! Python bindings for running pulse patterns on the loopback unit.
//!
//! A [`Session`] owns one unit, its channel configuration and the output arrays of the last run.
//! Patterns are submitted as JSON (the serialized form of [`PatternParams`]); every run returns the
//! engine's integer status code, and the output arrays are read back by their
//! [`OutputParam`] code.
//!
//! # Example (python)
//! ```python
//! from pulsectrl_backend import Session
//!
//! s = Session(1e6)
//! status = s.run_pattern('{"family": "read_train", "init_delay": 1e-6, "read": '
//!                        '{"meas_v": 0.5, "width": 2e-6, "rise": 1e-7, "fall": 1e-7, "delay": 1e-6}, '
//!                        '"num_reads": 4}', 100000)
//! assert status == 4
//! resistance = s.output(3)
//! ```

use std::time::{Duration, Instant};

use log::warn;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use pulsecompiler_backend::*;

use crate::bias_timed::BiasTimedRead;
use crate::loopback::LoopbackPmu;

fn to_py_err(err: Error) -> PyErr {
    PyValueError::new_err(format!("{} (status {})", err, err.status_code()))
}

#[pyclass]
pub struct Session {
    config: PmuConfig,
    dispatch: DispatchConfig,
    channels: ChannelConfig,
    unit: LoopbackPmu,
    outputs: OutputArrays,
    status: i32,
}

impl Session {
    fn run_json(&mut self, params_json: &str, max_points: usize) -> Result<RunReport> {
        let spec = PatternParams::from_json_str(params_json)?.into_spec();
        let mut orchestrator = PatternOrchestrator::new(self.config.clone(), spec)?;
        self.outputs = OutputArrays::try_with_len(orchestrator.probe_count())?;
        orchestrator.run(
            &mut self.unit,
            &self.channels,
            max_points,
            &self.dispatch,
            &mut self.outputs,
        )
    }

    fn run_bias_timed(&mut self, read: &BiasTimedRead) -> Result<usize> {
        read.validate(&self.channels)?;
        self.outputs = OutputArrays::try_with_len(read.num_samples)?;
        let armed = read.arm(&mut self.unit, &self.channels)?;
        // The external event fires here; samples are timed from this point
        let epoch = Instant::now();
        let deriver = MeasurementDeriver::from_config(&self.config);
        read.sample(
            &mut self.unit,
            &self.channels,
            &armed,
            epoch,
            &deriver,
            &mut self.outputs,
        )
    }
}

#[pymethods]
impl Session {
    /// Loopback session terminated by `load_ohms`.
    ///
    /// `config_json` and `dispatch_json` override the unit limits and the completion polling; both
    /// accept partial objects, missing fields keep their defaults.
    #[new]
    #[pyo3(signature = (
        load_ohms,
        current_range = 1e-4,
        voltage_range = 10.0,
        force = "ch1",
        measure = "ch2",
        chunk_points = 4096,
        config_json = None,
        dispatch_json = None
    ))]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        load_ohms: f64,
        current_range: f64,
        voltage_range: f64,
        force: &str,
        measure: &str,
        chunk_points: usize,
        config_json: Option<&str>,
        dispatch_json: Option<&str>,
    ) -> PyResult<Self> {
        let config = match config_json {
            Some(json) => PmuConfig::from_json_str(json).map_err(to_py_err)?,
            None => PmuConfig::default(),
        };
        let dispatch = match dispatch_json {
            Some(json) => DispatchConfig::from_json_str(json).map_err(to_py_err)?,
            None => DispatchConfig::default(),
        };
        let channels =
            ChannelConfig::new(force, measure, current_range, voltage_range).map_err(to_py_err)?;
        Ok(Self {
            config,
            dispatch,
            channels,
            unit: LoopbackPmu::new("loopback", load_ohms, chunk_points),
            outputs: OutputArrays::with_len(0),
            status: 0,
        })
    }

    /// Compiles and runs the JSON pattern; returns the status code (valid probe count on success).
    pub fn run_pattern(&mut self, params_json: &str, max_points: usize) -> i32 {
        let result = self.run_json(params_json, max_points);
        if let Err(err) = &result {
            warn!("pattern run failed: {}", err);
        }
        self.status = status_code(&result);
        self.status
    }

    /// Arms `bias_v`, waits `settle` seconds, then samples `num_samples` points every `interval`
    /// seconds. Returns the sample count or a negative status code.
    pub fn bias_timed_read(
        &mut self,
        bias_v: f64,
        settle: f64,
        interval: f64,
        num_samples: usize,
    ) -> PyResult<i32> {
        let read = BiasTimedRead {
            bias_v,
            settle: Duration::try_from_secs_f64(settle)
                .map_err(|e| PyValueError::new_err(format!("settle {}: {}", settle, e)))?,
            interval: Duration::try_from_secs_f64(interval)
                .map_err(|e| PyValueError::new_err(format!("interval {}: {}", interval, e)))?,
            num_samples,
        };
        let result = self.run_bias_timed(&read).and_then(|n| {
            i32::try_from(n).map_err(|_| {
                Error::InvalidParameter(format!("{} samples exceed the status range", n))
            })
        });
        self.status = match result {
            Ok(n) => n,
            Err(err) => {
                warn!("bias-timed read failed: {}", err);
                err.status_code()
            }
        };
        Ok(self.status)
    }

    /// Output array of the last run: 1 voltage, 2 current, 3 resistance, 4 timestamp.
    pub fn output(&self, param_code: i32, py: Python) -> PyResult<PyObject> {
        let param = OutputParam::from_code(param_code).map_err(to_py_err)?;
        let arr = self.outputs.get(param);
        Ok(numpy::PyArray::from_array(py, arr).to_object(py))
    }

    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn load_ohms(&self) -> f64 {
        self.unit.load_ohms()
    }

    /// Level last driven on the force channel.
    pub fn force_level(&self) -> f64 {
        self.unit.state().level(self.channels.force())
    }
}
