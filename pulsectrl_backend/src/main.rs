use std::process;
use std::time::{Duration, Instant};

use log::error;
use pulsecompiler_backend::*;
use pulsectrl_backend::*;

fn exit_on(err: Error) -> ! {
    error!("{}", err);
    process::exit(err.status_code())
}

// Runs a retention pattern on a 1 MOhm loopback, then a short bias-timed read, and prints the
// results as JSON.
fn main() {
    env_logger::init();

    let config = PmuConfig::default();
    let channels = ChannelConfig::new("ch1", "ch2", 1e-4, 10.0).unwrap_or_else(|e| exit_on(e));
    let mut unit = LoopbackPmu::new("loopback", 1e6, 4096);

    let spec: PatternSpec = RetentionParams {
        init_delay: 1e-6,
        read: ReadTiming {
            meas_v: 0.2,
            width: 2e-6,
            rise: 1e-7,
            fall: 1e-7,
            settle: 0.0,
            delay: 1e-6,
            offset_compensation: true,
        },
        pulse: PulseShape {
            voltage: 1.5,
            width: 1e-6,
            rise: 1e-7,
            fall: 1e-7,
            delay: 1e-6,
        },
        initial_reads: 2,
        num_pulses: 1,
        num_reads: 8,
        final_hold: DEFAULT_FINAL_HOLD,
    }
    .into();
    let mut orchestrator =
        PatternOrchestrator::new(config.clone(), spec).unwrap_or_else(|e| exit_on(e));
    let mut out = OutputArrays::with_len(orchestrator.probe_count());
    let result = orchestrator.run(&mut unit, &channels, 100_000, &DispatchConfig::default(), &mut out);
    let status = status_code(&result);
    if let Err(err) = result {
        exit_on(err);
    }
    println!(
        "{}",
        serde_json::json!({
            "family": "retention",
            "status": status,
            "resistance": out.resistance.to_vec(),
            "timestamp": out.timestamp.to_vec(),
        })
    );

    let read = BiasTimedRead {
        bias_v: 0.1,
        settle: Duration::from_millis(5),
        interval: Duration::from_millis(10),
        num_samples: 5,
    };
    let mut spots = OutputArrays::with_len(read.num_samples);
    let armed = read.arm(&mut unit, &channels).unwrap_or_else(|e| exit_on(e));
    let epoch = Instant::now();
    let deriver = MeasurementDeriver::from_config(&config);
    let n = read
        .sample(&mut unit, &channels, &armed, epoch, &deriver, &mut spots)
        .unwrap_or_else(|e| exit_on(e));
    println!(
        "{}",
        serde_json::json!({
            "family": "bias_timed",
            "status": n,
            "resistance": spots.resistance.to_vec(),
            "timestamp": spots.timestamp.to_vec(),
            "zero_events": unit.state().zero_events(),
        })
    );
}
