use std::env;
use std::fs;
use std::process;

use log::error;
use pulsecompiler_backend::*;

// Dry run: compiles the pattern given as a JSON file (or a built-in potentiation/depression demo)
// and prints the program, the probe windows and the chosen rate.
fn main() {
    env_logger::init();

    let params = match env::args().nth(1) {
        Some(path) => match fs::read_to_string(&path)
            .map_err(|e| Error::InvalidParameter(format!("{}: {}", path, e)))
            .and_then(|json| PatternParams::from_json_str(&json))
        {
            Ok(params) => params,
            Err(err) => {
                error!("{}", err);
                process::exit(err.status_code());
            }
        },
        None => PatternParams::PotentiationDepression(PotDepParams {
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
            pulse_v_neg: 0.0,
            cycle_count: 2,
            pulses_per_group: 3,
            reads_per_cycle: 2,
            final_hold: DEFAULT_FINAL_HOLD,
        }),
    };

    let compiled = PatternOrchestrator::new(PmuConfig::default(), params.into_spec())
        .and_then(|mut orchestrator| orchestrator.compile(100_000));
    let compiled = match compiled {
        Ok(compiled) => compiled,
        Err(err) => {
            error!("{}", err);
            process::exit(err.status_code());
        }
    };

    for (idx, seg) in compiled.waveform.segments().iter().enumerate() {
        println!("{:4} {:>12.3e} s  {}", idx, compiled.waveform.segment_start(idx), seg);
    }
    for probe in &compiled.probes {
        println!(
            "probe {:3}: [{:.3e}, {:.3e}] s{}",
            probe.index,
            probe.window.start,
            probe.window.end,
            probe
                .offset
                .map_or(String::new(), |w| format!(", offset [{:.3e}, {:.3e}] s", w.start, w.end))
        );
    }
    println!(
        "{:.4e} Hz, {} points acquired, {} allocated",
        compiled.rate.sample_rate,
        compiled.rate.acquired_point_count,
        compiled.rate.allocated_point_count
    );
}
