use ndarray::Array1;
use proptest::prelude::*;

use pulsecompiler_backend::*;

/// Unit double that plays back a constant voltage and current on every sample.
struct ConstantUnit {
    voltage: f64,
    current: f64,
    // Fraction of the acquired points actually returned
    returned_fraction: f64,
    fail_with: Option<AcquisitionError>,
    loaded: Option<(usize, RateDecision)>,
    zeroed: bool,
}

impl ConstantUnit {
    fn new(voltage: f64, current: f64) -> Self {
        Self {
            voltage,
            current,
            returned_fraction: 1.0,
            fail_with: None,
            loaded: None,
            zeroed: false,
        }
    }
}

impl Acquisition for ConstantUnit {
    fn name(&self) -> &str {
        "constant"
    }
    fn load(
        &mut self,
        waveform: &Waveform,
        rate: &RateDecision,
        _channels: &ChannelConfig,
    ) -> Result<(), AcquisitionError> {
        self.loaded = Some((waveform.len(), *rate));
        Ok(())
    }
    fn start(&mut self) -> Result<(), AcquisitionError> {
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
    fn poll(&mut self) -> Result<RunStatus, AcquisitionError> {
        Ok(RunStatus::Done)
    }
    fn fetch(&mut self) -> Result<RawTraceSet> {
        let rate = match self.loaded {
            Some((_, rate)) => rate,
            None => return Err(AcquisitionError::new(-1, "fetch before load").into()),
        };
        let n = (rate.acquired_point_count as f64 * self.returned_fraction) as usize;
        let mut traces = RawTraceSet::new();
        traces.insert(
            TraceKind::MeasureVoltage,
            RawTrace::uniform(Array1::from_elem(n, self.voltage), rate.sample_rate),
        );
        traces.insert(
            TraceKind::MeasureCurrent,
            RawTrace::uniform(Array1::from_elem(n, self.current), rate.sample_rate),
        );
        Ok(traces)
    }
    fn force_zero(&mut self, _channels: &ChannelConfig) -> Result<(), AcquisitionError> {
        self.zeroed = true;
        Ok(())
    }
}

fn read_timing(meas_v: f64, width: f64) -> ReadTiming {
    ReadTiming {
        meas_v,
        width,
        rise: 1e-7,
        fall: 1e-7,
        settle: 0.0,
        delay: 1e-6,
        offset_compensation: false,
    }
}

fn read_train(num_reads: usize) -> PatternSpec {
    ReadTrainParams {
        init_delay: 1e-6,
        read: read_timing(0.5, 2e-6),
        num_reads,
        final_hold: DEFAULT_FINAL_HOLD,
    }
    .into()
}

fn channels() -> ChannelConfig {
    ChannelConfig::new("ch1", "ch2", 1e-4, 10.0).unwrap()
}

fn fast_dispatch() -> DispatchConfig {
    DispatchConfig {
        max_polls: 5,
        poll_interval_ms: 0,
    }
}

#[test]
fn read_train_on_constant_trace() {
    let mut orchestrator = PatternOrchestrator::new(PmuConfig::default(), read_train(10)).unwrap();
    let mut unit = ConstantUnit::new(0.5, 5e-7);
    let mut out = OutputArrays::with_len(10);

    let result = orchestrator.run(&mut unit, &channels(), 100_000, &fast_dispatch(), &mut out);
    assert_eq!(status_code(&result), 10);
    let report = result.unwrap();
    assert!(report.failed_probes.is_empty());
    assert_eq!(orchestrator.phase(), Phase::Done);

    for i in 0..10 {
        assert_eq!(out.resistance[i], 1.0e6);
        assert_eq!(out.voltage[i], 0.5);
        assert_eq!(out.current[i], 5e-7);
    }
    // Timestamps follow probe order
    for i in 1..10 {
        assert!(out.timestamp[i] > out.timestamp[i - 1]);
    }
    assert_eq!(out.get(OutputParam::Resistance), &out.resistance);
}

#[test]
fn millisecond_program_fits_ten_thousand_points() {
    let selector = RateSelector::from_config(&PmuConfig::default());
    let decision = selector.select_rate(1e-3, 10_000, 2e-8).unwrap();
    assert!(decision.sample_rate <= 200e6);
    assert!(decision.acquired_point_count < 10_000);
}

#[test]
fn nanosecond_segment_is_rejected() {
    let mut builder = SegmentBuilder::new(&PmuConfig::default());
    let err = builder.append_segment(1e-9, 0.0, 0.0).unwrap_err();
    assert!(matches!(err, Error::InvalidSegmentDuration { duration, .. } if duration == 1e-9));
    assert!(builder.is_empty());
}

#[test]
fn registry_of_five_rejects_sixth_probe() {
    let mut registry = ProbeWindowRegistry::reserve(5).unwrap();
    for k in 0..5 {
        registry.record(k as f64, k as f64 + 0.5).unwrap();
    }
    let err = registry.record(5.0, 5.5).unwrap_err();
    assert_eq!(err, Error::ProbeCapacityExceeded { capacity: 5 });
    assert_eq!(err.status_code(), -104);
}

#[test]
fn potentiation_depression_probe_count() {
    let spec: PatternSpec = PotDepParams {
        init_delay: 1e-6,
        read: read_timing(0.2, 1e-6),
        pulse: PulseShape {
            voltage: 1.2,
            width: 1e-6,
            rise: 1e-7,
            fall: 1e-7,
            delay: 1e-6,
        },
        pulse_v_neg: -1.0,
        cycle_count: 2,
        pulses_per_group: 3,
        reads_per_cycle: 2,
        final_hold: DEFAULT_FINAL_HOLD,
    }
    .into();
    let mut orchestrator = PatternOrchestrator::new(PmuConfig::default(), spec).unwrap();
    assert_eq!(orchestrator.probe_count(), 12);

    let mut unit = ConstantUnit::new(0.2, 2e-6);
    let mut out = OutputArrays::with_len(12);
    let report = orchestrator
        .run(&mut unit, &channels(), 100_000, &fast_dispatch(), &mut out)
        .unwrap();
    assert_eq!(report.probe_count, 12);
    assert_eq!(report.valid_count(), 12);
    assert!(out.resistance.iter().all(|&r| (r - 1e5).abs() < 1e-6));
}

#[test]
fn huge_counts_from_json_report_segment_capacity() {
    let json = format!(
        r#"{{
            "family": "potentiation_depression",
            "init_delay": 1e-6,
            "read": {{"meas_v": 0.2, "width": 1e-6, "rise": 1e-7, "fall": 1e-7, "delay": 1e-6}},
            "pulse": {{"voltage": 1.0, "width": 1e-6, "rise": 1e-7, "fall": 1e-7, "delay": 1e-6}},
            "pulse_v_neg": 0.0,
            "cycle_count": {},
            "pulses_per_group": 3,
            "reads_per_cycle": 2
        }}"#,
        usize::MAX / 2
    );
    let spec = PatternParams::from_json_str(&json).unwrap().into_spec();
    let err = PatternOrchestrator::new(PmuConfig::default(), spec).unwrap_err();
    assert_eq!(err.status_code(), -103);

    let err = PatternOrchestrator::new(PmuConfig::default(), read_train(usize::MAX / 2)).unwrap_err();
    assert_eq!(err, Error::SegmentCapacityExceeded { capacity: 2048 });

    // 2 + 600 * 4 + 1 segments do not fit in 2048
    let err = PatternOrchestrator::new(PmuConfig::default(), read_train(600)).unwrap_err();
    assert_eq!(err.status_code(), -103);
}

#[test]
fn undersized_output_fails_before_dispatch() {
    let mut orchestrator = PatternOrchestrator::new(PmuConfig::default(), read_train(10)).unwrap();
    let mut unit = ConstantUnit::new(0.5, 5e-7);
    let mut out = OutputArrays::with_len(10);
    out.timestamp = Array1::zeros(9);

    let result = orchestrator.run(&mut unit, &channels(), 100_000, &fast_dispatch(), &mut out);
    assert_eq!(status_code(&result), -108);
    assert!(unit.loaded.is_none());
    assert_eq!(orchestrator.phase(), Phase::Idle);
}

#[test]
fn hardware_error_passes_through_and_zeroes_output() {
    let mut orchestrator = PatternOrchestrator::new(PmuConfig::default(), read_train(4)).unwrap();
    let mut unit = ConstantUnit::new(0.5, 5e-7);
    unit.fail_with = Some(AcquisitionError::new(-2201, "compliance trip"));
    let mut out = OutputArrays::with_len(6);
    out.fill(7.0);

    let result = orchestrator.run(&mut unit, &channels(), 100_000, &fast_dispatch(), &mut out);
    assert_eq!(status_code(&result), -2201);
    assert!(unit.zeroed);
    assert_eq!(orchestrator.phase(), Phase::Dispatch);
    for param in OutputParam::ALL {
        assert!(out.get(param).iter().all(|&x| x == 0.0));
    }
}

#[test]
fn truncated_trace_degrades_late_probes() {
    let mut orchestrator = PatternOrchestrator::new(PmuConfig::default(), read_train(10)).unwrap();
    let mut unit = ConstantUnit::new(0.5, 5e-7);
    unit.returned_fraction = 0.5;
    let mut out = OutputArrays::with_len(10);

    let report = orchestrator
        .run(&mut unit, &channels(), 100_000, &fast_dispatch(), &mut out)
        .unwrap();
    assert!(!report.failed_probes.is_empty());
    assert!(!report.all_failed());
    assert_eq!(report.failed_probes.last(), Some(&9));
    for &i in &report.failed_probes {
        assert_eq!(out.resistance[i], 0.0);
        assert_eq!(out.timestamp[i], 0.0);
    }
    assert_eq!(out.resistance[0], 1.0e6);
}

#[test]
fn empty_trace_is_a_quality_signal_not_an_error() {
    let mut orchestrator = PatternOrchestrator::new(PmuConfig::default(), read_train(3)).unwrap();
    let mut unit = ConstantUnit::new(0.5, 5e-7);
    unit.returned_fraction = 0.0;
    let mut out = OutputArrays::with_len(3);

    let result = orchestrator.run(&mut unit, &channels(), 100_000, &fast_dispatch(), &mut out);
    assert_eq!(status_code(&result), 0);
    assert!(result.unwrap().all_failed());
}

#[test]
fn pattern_from_json_runs() {
    let params = PatternParams::from_json_str(
        r#"{
            "family": "interleaved",
            "init_delay": 1e-6,
            "read": {"meas_v": 0.1, "width": 1e-6, "rise": 1e-7, "fall": 1e-7,
                     "delay": 1e-6, "offset_compensation": true},
            "pulse": {"voltage": -2.0, "width": 5e-7, "rise": 5e-8, "fall": 5e-8, "delay": 5e-7},
            "cycle_count": 3,
            "pulses_per_cycle": 2,
            "reads_per_cycle": 2
        }"#,
    )
    .unwrap();
    let mut orchestrator = PatternOrchestrator::new(PmuConfig::default(), params.into()).unwrap();
    assert_eq!(orchestrator.probe_count(), 7);

    let mut unit = ConstantUnit::new(0.1, 1e-6);
    let mut out = OutputArrays::with_len(7);
    let report = orchestrator
        .run(&mut unit, &channels(), 100_000, &fast_dispatch(), &mut out)
        .unwrap();
    assert_eq!(report.valid_count(), 7);
    // Constant current cancels against its own offset window
    assert!(out.current.iter().all(|&i| i == 0.0));
    assert!(out.resistance.iter().all(|&r| r == MeasurementDeriver::ceiling(1e-4)));
}

#[test]
fn waveform_beyond_voltage_range_never_dispatches() {
    let mut orchestrator = PatternOrchestrator::new(PmuConfig::default(), read_train(2)).unwrap();
    let mut unit = ConstantUnit::new(0.5, 5e-7);
    let narrow = ChannelConfig::new("ch1", "ch2", 1e-4, 0.25).unwrap();
    let mut out = OutputArrays::with_len(2);
    assert!(orchestrator
        .run(&mut unit, &narrow, 100_000, &fast_dispatch(), &mut out)
        .is_err());
    assert!(unit.loaded.is_none());
}

fn duration() -> impl Strategy<Value = f64> {
    2e-8..1e-5f64
}

prop_compose! {
    fn arb_potdep()(
        meas_v in -1.0..1.0f64,
        read_width in duration(),
        read_edge in duration(),
        settle in prop_oneof![Just(0.0), duration()],
        pulse_v in -3.0..3.0f64,
        pulse_v_neg in prop_oneof![Just(0.0), -3.0..0.0f64],
        pulse_width in duration(),
        pulse_edge in duration(),
        cycle_count in 0usize..3,
        pulses_per_group in 0usize..4,
        reads_per_cycle in 0usize..3,
    ) -> PatternSpec {
        PotDepParams {
            init_delay: 1e-6,
            read: ReadTiming {
                meas_v,
                width: read_width,
                rise: read_edge,
                fall: read_edge,
                settle,
                delay: read_width,
                offset_compensation: true,
            },
            pulse: PulseShape {
                voltage: pulse_v,
                width: pulse_width,
                rise: pulse_edge,
                fall: pulse_edge,
                delay: pulse_width,
            },
            pulse_v_neg,
            cycle_count,
            pulses_per_group,
            reads_per_cycle,
            final_hold: DEFAULT_FINAL_HOLD,
        }
        .into()
    }
}

proptest! {
    #[test]
    fn compiled_programs_are_continuous_and_bounded(spec in arb_potdep()) {
        let config = PmuConfig::default();
        prop_assume!(spec.probe_count() > Some(0));
        let mut orchestrator = PatternOrchestrator::new(config.clone(), spec.clone()).unwrap();
        let compiled = orchestrator.compile(1_000_000).unwrap();

        prop_assert!(compiled.waveform.is_continuous());
        for seg in compiled.waveform.segments() {
            prop_assert!(seg.duration() >= config.min_segment_duration);
            prop_assert!(seg.duration() <= config.max_segment_duration);
        }
        prop_assert_eq!(Some(compiled.probes.len()), spec.probe_count());
        for (k, probe) in compiled.probes.iter().enumerate() {
            prop_assert_eq!(probe.index, k);
            prop_assert!(probe.window.end <= compiled.waveform.total_duration());
        }
    }

    #[test]
    fn larger_budget_never_slows_the_clock(
        total in 1e-6..1e-2f64,
        min_seg in 2e-8..1e-3f64,
        budget in 20usize..500_000,
        extra in 0usize..500_000,
    ) {
        let selector = RateSelector::from_config(&PmuConfig::default());
        if let Ok(small) = selector.select_rate(total, budget, min_seg) {
            let large = selector.select_rate(total, budget + extra, min_seg).unwrap();
            prop_assert!(large.sample_rate >= small.sample_rate);
            prop_assert!(large.sample_rate <= selector.effective_max_rate(min_seg));
        }
    }

    #[test]
    fn constant_trace_averages_to_its_value(
        v in -10.0..10.0f64,
        n in 1usize..500,
        rate in 1e3..1e8f64,
        a in 0.0..1.0f64,
        b in 0.0..1.0f64,
    ) {
        let trace = RawTrace::uniform(Array1::from_elem(n, v), rate);
        let i = (a * (n - 1) as f64) as usize;
        let j = i + (b * (n - 1 - i) as f64) as usize;
        let (start, end) = (trace.times()[i], trace.times()[j]);
        prop_assert_eq!(average(&trace, start, end).unwrap(), v);
    }
}
