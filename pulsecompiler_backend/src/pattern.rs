//! Pattern descriptions for the supported experiment families.
//!
//! Every family reduces to the same shape, captured by `PatternSpec`:
//!
//! ```text
//! init delay, initial reads,
//! cycle_count x { for each polarity group: reads_before_pulses reads,
//!                                          pulses_per_group pulses,
//!                                          reads_per_cycle reads },
//! final hold
//! ```
//!
//! | family                   | initial | cycles | groups | before | pulses | reads |
//! |--------------------------|---------|--------|--------|--------|--------|-------|
//! | read train               | 0       | 1      | +      | 0      | 0      | N     |
//! | retention                | I       | 1      | +      | 0      | K      | M     |
//! | potentiation/depression  | 0       | C      | +, -   | 1      | K      | M     |
//! | interleaved pulse-read   | 1       | C      | +      | 0      | K      | M     |
//!
//! The per-family parameter structs are what hosts fill in; `PatternParams` lets them arrive as
//! JSON tagged with the family name.

use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::PmuConfig;
use crate::error::{Error, Result};

/// Settling time at 0 V appended after the last read.
pub const DEFAULT_FINAL_HOLD: f64 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub fn sign(&self) -> f64 {
        match self {
            Polarity::Positive => 1.0,
            Polarity::Negative => -1.0,
        }
    }
}

/// Timing of one read: rise to `meas_v`, flat top, optional settle, fall and a trailing delay,
/// all at 0 V baseline outside the pulse.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadTiming {
    pub meas_v: f64,
    pub width: f64,
    pub rise: f64,
    pub fall: f64,
    /// Extra hold at `meas_v` after the probe flat top. `0` omits the segment.
    #[serde(default)]
    pub settle: f64,
    pub delay: f64,
    /// Also measure the current during the trailing 0 V delay and subtract it.
    #[serde(default)]
    pub offset_compensation: bool,
}

impl ReadTiming {
    pub fn segment_count(&self) -> usize {
        if self.settle > 0.0 {
            5
        } else {
            4
        }
    }
}

/// One programming pulse: rise, flat top at `voltage`, fall and a trailing delay at 0 V.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseShape {
    pub voltage: f64,
    pub width: f64,
    pub rise: f64,
    pub fall: f64,
    pub delay: f64,
}

impl PulseShape {
    pub fn with_voltage(&self, voltage: f64) -> Self {
        Self { voltage, ..*self }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolaritySchedule {
    Unipolar(Polarity),
    /// A positive group followed by a negative group in every cycle.
    Alternating,
}

impl PolaritySchedule {
    pub fn groups(&self) -> &'static [Polarity] {
        match self {
            PolaritySchedule::Unipolar(Polarity::Positive) => &[Polarity::Positive],
            PolaritySchedule::Unipolar(Polarity::Negative) => &[Polarity::Negative],
            PolaritySchedule::Alternating => &[Polarity::Positive, Polarity::Negative],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStructure {
    pub initial_reads: usize,
    pub cycle_count: usize,
    pub reads_before_pulses: usize,
    pub pulses_per_group: usize,
    pub reads_per_cycle: usize,
    pub polarity_schedule: PolaritySchedule,
}

impl CycleStructure {
    /// Number of reads, hence probe windows, the structure produces; `None` if it overflows.
    ///
    /// ```
    /// use pulsecompiler_backend::pattern::*;
    ///
    /// let potdep = CycleStructure {
    ///     initial_reads: 0,
    ///     cycle_count: 2,
    ///     reads_before_pulses: 1,
    ///     pulses_per_group: 3,
    ///     reads_per_cycle: 2,
    ///     polarity_schedule: PolaritySchedule::Alternating,
    /// };
    /// assert_eq!(potdep.probe_count(), Some(2 * 2 * (1 + 2)));
    ///
    /// let huge = CycleStructure { cycle_count: usize::MAX / 2, ..potdep };
    /// assert_eq!(huge.probe_count(), None);
    /// ```
    pub fn probe_count(&self) -> Option<usize> {
        let groups = self.polarity_schedule.groups().len();
        let per_group = self.reads_before_pulses.checked_add(self.reads_per_cycle)?;
        self.cycle_count
            .checked_mul(groups)?
            .checked_mul(per_group)?
            .checked_add(self.initial_reads)
    }

    pub fn pulse_count(&self) -> Option<usize> {
        self.cycle_count
            .checked_mul(self.polarity_schedule.groups().len())?
            .checked_mul(self.pulses_per_group)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternFamily {
    ReadTrain,
    Retention,
    PotentiationDepression,
    Interleaved,
}

impl fmt::Display for PatternFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                PatternFamily::ReadTrain => "read-train",
                PatternFamily::Retention => "retention",
                PatternFamily::PotentiationDepression => "potentiation-depression",
                PatternFamily::Interleaved => "interleaved pulse-read",
            }
        )
    }
}

/// Family-independent description consumed by the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub struct PatternSpec {
    pub family: PatternFamily,
    pub init_delay: f64,
    pub read: ReadTiming,
    /// Shape of positive pulses.
    pub pulse: PulseShape,
    /// Flat-top voltage of negative pulses (signed).
    pub negative_pulse_v: f64,
    pub structure: CycleStructure,
    pub final_hold: f64,
}

impl PatternSpec {
    pub fn probe_count(&self) -> Option<usize> {
        self.structure.probe_count()
    }

    pub fn pulse_for(&self, polarity: Polarity) -> PulseShape {
        match polarity {
            Polarity::Positive => self.pulse,
            Polarity::Negative => self.pulse.with_voltage(self.negative_pulse_v),
        }
    }

    /// Segments the program will hold: init delay and rise, four per pulse, four or five per
    /// read, and the final hold. `None` if the count overflows.
    pub fn segment_count(&self) -> Option<usize> {
        let reads = self.probe_count()?.checked_mul(self.read.segment_count())?;
        let pulses = self.structure.pulse_count()?.checked_mul(4)?;
        reads.checked_add(pulses)?.checked_add(3)
    }

    /// Checks values the segment builder cannot see, such as non-finite voltages, and that the
    /// program fits in the unit's segment memory.
    pub fn validate(&self, config: &PmuConfig) -> Result<()> {
        let voltages = [
            ("read voltage", self.read.meas_v),
            ("pulse voltage", self.pulse.voltage),
            ("negative pulse voltage", self.negative_pulse_v),
        ];
        for (what, v) in voltages {
            if !v.is_finite() {
                return Err(Error::InvalidParameter(format!("{} {} is not finite", what, v)));
            }
        }
        if !(self.read.settle >= 0.0) {
            return Err(Error::InvalidParameter(format!(
                "read settle {:e} s is negative",
                self.read.settle
            )));
        }
        if self.probe_count() == Some(0) {
            return Err(Error::InvalidParameter(format!(
                "{} pattern declares no reads",
                self.family
            )));
        }
        match self.segment_count() {
            Some(n) if n <= config.max_segments => Ok(()),
            _ => Err(Error::SegmentCapacityExceeded {
                capacity: config.max_segments,
            }),
        }
    }
}

fn default_final_hold() -> f64 {
    DEFAULT_FINAL_HOLD
}

/// `num_reads` identical reads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadTrainParams {
    pub init_delay: f64,
    pub read: ReadTiming,
    pub num_reads: usize,
    #[serde(default = "default_final_hold")]
    pub final_hold: f64,
}

/// Baseline reads, a burst of programming pulses, then periodic reads spaced by `read.delay`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetentionParams {
    pub init_delay: f64,
    pub read: ReadTiming,
    pub pulse: PulseShape,
    pub initial_reads: usize,
    pub num_pulses: usize,
    pub num_reads: usize,
    #[serde(default = "default_final_hold")]
    pub final_hold: f64,
}

/// Alternating potentiation (`pulse.voltage`) and depression (`pulse_v_neg`) groups.
///
/// `pulse_v_neg == 0` means `-pulse.voltage`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PotDepParams {
    pub init_delay: f64,
    pub read: ReadTiming,
    pub pulse: PulseShape,
    #[serde(default)]
    pub pulse_v_neg: f64,
    pub cycle_count: usize,
    pub pulses_per_group: usize,
    pub reads_per_cycle: usize,
    #[serde(default = "default_final_hold")]
    pub final_hold: f64,
}

/// One initial read, then `cycle_count` repetitions of pulses followed by reads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterleavedParams {
    pub init_delay: f64,
    pub read: ReadTiming,
    pub pulse: PulseShape,
    pub cycle_count: usize,
    pub pulses_per_cycle: usize,
    pub reads_per_cycle: usize,
    #[serde(default = "default_final_hold")]
    pub final_hold: f64,
}

impl From<ReadTrainParams> for PatternSpec {
    fn from(p: ReadTrainParams) -> Self {
        PatternSpec {
            family: PatternFamily::ReadTrain,
            init_delay: p.init_delay,
            read: p.read,
            // No pulses are played; keep a well-formed shape at 0 V
            pulse: PulseShape {
                voltage: 0.0,
                width: p.read.width,
                rise: p.read.rise,
                fall: p.read.fall,
                delay: p.read.delay,
            },
            negative_pulse_v: 0.0,
            structure: CycleStructure {
                initial_reads: 0,
                cycle_count: 1,
                reads_before_pulses: 0,
                pulses_per_group: 0,
                reads_per_cycle: p.num_reads,
                polarity_schedule: PolaritySchedule::Unipolar(Polarity::Positive),
            },
            final_hold: p.final_hold,
        }
    }
}

impl From<RetentionParams> for PatternSpec {
    fn from(p: RetentionParams) -> Self {
        PatternSpec {
            family: PatternFamily::Retention,
            init_delay: p.init_delay,
            read: p.read,
            pulse: p.pulse,
            negative_pulse_v: -p.pulse.voltage,
            structure: CycleStructure {
                initial_reads: p.initial_reads,
                cycle_count: 1,
                reads_before_pulses: 0,
                pulses_per_group: p.num_pulses,
                reads_per_cycle: p.num_reads,
                polarity_schedule: PolaritySchedule::Unipolar(Polarity::Positive),
            },
            final_hold: p.final_hold,
        }
    }
}

impl From<PotDepParams> for PatternSpec {
    fn from(p: PotDepParams) -> Self {
        let negative_pulse_v = if p.pulse_v_neg == 0.0 {
            warn!(
                "depression voltage left at 0 V, using -{} V from the potentiation pulse",
                p.pulse.voltage
            );
            -p.pulse.voltage
        } else {
            p.pulse_v_neg
        };
        PatternSpec {
            family: PatternFamily::PotentiationDepression,
            init_delay: p.init_delay,
            read: p.read,
            pulse: p.pulse,
            negative_pulse_v,
            structure: CycleStructure {
                initial_reads: 0,
                cycle_count: p.cycle_count,
                reads_before_pulses: 1,
                pulses_per_group: p.pulses_per_group,
                reads_per_cycle: p.reads_per_cycle,
                polarity_schedule: PolaritySchedule::Alternating,
            },
            final_hold: p.final_hold,
        }
    }
}

impl From<InterleavedParams> for PatternSpec {
    fn from(p: InterleavedParams) -> Self {
        PatternSpec {
            family: PatternFamily::Interleaved,
            init_delay: p.init_delay,
            read: p.read,
            pulse: p.pulse,
            negative_pulse_v: -p.pulse.voltage,
            structure: CycleStructure {
                initial_reads: 1,
                cycle_count: p.cycle_count,
                reads_before_pulses: 0,
                pulses_per_group: p.pulses_per_cycle,
                reads_per_cycle: p.reads_per_cycle,
                polarity_schedule: PolaritySchedule::Unipolar(Polarity::Positive),
            },
            final_hold: p.final_hold,
        }
    }
}

/// Parameters of any family, tagged by `"family"` in JSON.
///
/// # Examples
///
/// ```
/// use pulsecompiler_backend::pattern::*;
///
/// let params = PatternParams::from_json_str(r#"{
///     "family": "read_train",
///     "init_delay": 1e-6,
///     "read": {"meas_v": 0.5, "width": 2e-6, "rise": 1e-7, "fall": 1e-7, "delay": 1e-6},
///     "num_reads": 10
/// }"#).unwrap();
/// let spec = params.into_spec();
/// assert_eq!(spec.family, PatternFamily::ReadTrain);
/// assert_eq!(spec.probe_count(), Some(10));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum PatternParams {
    ReadTrain(ReadTrainParams),
    Retention(RetentionParams),
    PotentiationDepression(PotDepParams),
    Interleaved(InterleavedParams),
}

impl PatternParams {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidParameter(format!("malformed pattern parameters: {}", e)))
    }

    pub fn into_spec(self) -> PatternSpec {
        match self {
            PatternParams::ReadTrain(p) => p.into(),
            PatternParams::Retention(p) => p.into(),
            PatternParams::PotentiationDepression(p) => p.into(),
            PatternParams::Interleaved(p) => p.into(),
        }
    }
}

impl From<PatternParams> for PatternSpec {
    fn from(params: PatternParams) -> Self {
        params.into_spec()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn read() -> ReadTiming {
        ReadTiming {
            meas_v: 0.2,
            width: 1e-6,
            rise: 1e-7,
            fall: 1e-7,
            settle: 0.0,
            delay: 1e-6,
            offset_compensation: false,
        }
    }

    fn pulse() -> PulseShape {
        PulseShape {
            voltage: 1.5,
            width: 1e-6,
            rise: 1e-7,
            fall: 1e-7,
            delay: 1e-6,
        }
    }

    #[test]
    fn family_probe_counts() {
        let retention: PatternSpec = RetentionParams {
            init_delay: 1e-6,
            read: read(),
            pulse: pulse(),
            initial_reads: 3,
            num_pulses: 5,
            num_reads: 7,
            final_hold: DEFAULT_FINAL_HOLD,
        }
        .into();
        assert_eq!(retention.probe_count(), Some(10));
        assert_eq!(retention.structure.pulse_count(), Some(5));

        let interleaved: PatternSpec = InterleavedParams {
            init_delay: 1e-6,
            read: read(),
            pulse: pulse(),
            cycle_count: 4,
            pulses_per_cycle: 2,
            reads_per_cycle: 3,
            final_hold: DEFAULT_FINAL_HOLD,
        }
        .into();
        assert_eq!(interleaved.probe_count(), Some(13));
        assert_eq!(interleaved.segment_count(), Some(2 + 13 * 4 + 8 * 4 + 1));
    }

    #[test]
    fn zero_depression_voltage_mirrors_potentiation() {
        let mut params = PotDepParams {
            init_delay: 1e-6,
            read: read(),
            pulse: pulse(),
            pulse_v_neg: 0.0,
            cycle_count: 2,
            pulses_per_group: 3,
            reads_per_cycle: 2,
            final_hold: DEFAULT_FINAL_HOLD,
        };
        let spec: PatternSpec = params.clone().into();
        assert_eq!(spec.pulse_for(Polarity::Negative).voltage, -1.5);
        assert_eq!(spec.probe_count(), Some(12));

        params.pulse_v_neg = -0.8;
        let spec: PatternSpec = params.into();
        assert_eq!(spec.pulse_for(Polarity::Negative).voltage, -0.8);
        assert_eq!(spec.pulse_for(Polarity::Positive).voltage, 1.5);
    }

    #[test]
    fn settle_adds_a_segment_per_read() {
        let mut timing = read();
        assert_eq!(timing.segment_count(), 4);
        timing.settle = 5e-7;
        assert_eq!(timing.segment_count(), 5);
    }

    #[test]
    fn validation_rejects_empty_and_non_finite() {
        let mut spec: PatternSpec = ReadTrainParams {
            init_delay: 1e-6,
            read: read(),
            num_reads: 0,
            final_hold: DEFAULT_FINAL_HOLD,
        }
        .into();
        let config = PmuConfig::default();
        assert!(spec.validate(&config).is_err());
        spec.structure.reads_per_cycle = 2;
        assert!(spec.validate(&config).is_ok());
        spec.read.meas_v = f64::NAN;
        assert!(spec.validate(&config).is_err());
    }

    #[test]
    fn oversized_programs_are_rejected_without_overflow() {
        let config = PmuConfig::default();
        let mut spec: PatternSpec = PotDepParams {
            init_delay: 1e-6,
            read: read(),
            pulse: pulse(),
            pulse_v_neg: 0.0,
            cycle_count: usize::MAX / 2,
            pulses_per_group: 3,
            reads_per_cycle: 2,
            final_hold: DEFAULT_FINAL_HOLD,
        }
        .into();
        assert_eq!(spec.probe_count(), None);
        assert_eq!(spec.segment_count(), None);
        assert_eq!(
            spec.validate(&config),
            Err(Error::SegmentCapacityExceeded { capacity: 2048 })
        );

        // Representable, but beyond the segment memory: 2 + 600 * 4 + 1 segments
        spec.structure = CycleStructure {
            initial_reads: 600,
            cycle_count: 0,
            reads_before_pulses: 0,
            pulses_per_group: 0,
            reads_per_cycle: 0,
            polarity_schedule: PolaritySchedule::Unipolar(Polarity::Positive),
        };
        assert_eq!(spec.segment_count(), Some(2403));
        assert_eq!(spec.validate(&config).unwrap_err().status_code(), -103);
    }

    #[test]
    fn unknown_family_is_rejected() {
        let err = PatternParams::from_json_str(r#"{"family": "sweep"}"#).unwrap_err();
        assert_eq!(err.status_code(), -109);
    }
}
