//! Two-phase bias-timed read.
//!
//! Used when an external instrument (a light source, a second stimulus) has to be triggered at the
//! moment the device under test reaches bias. The host makes two sequential calls:
//!
//! 1. [`BiasTimedRead::arm`] forces the bias, waits for it to settle and returns. The host
//!    triggers its external event only after this returns, and captures an epoch `Instant` at that
//!    moment.
//! 2. [`BiasTimedRead::sample`] starts sampling immediately, on a fixed cadence. Timestamps are
//!    measured from the host's epoch, never from the arm call's internal timing.
//!
//! There is no cancellation mid-sampling; on any failure, and once sampling is done, the force
//! channel is returned to 0 V.

use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use pulsecompiler_backend::*;

/// Static bias and single-point measurements on the force channel.
pub trait SpotMeasure {
    fn set_bias(&mut self, channels: &ChannelConfig, volts: f64) -> Result<(), AcquisitionError>;
    /// One `(voltage, current)` reading at the present bias.
    fn sample_spot(&mut self, channels: &ChannelConfig) -> Result<(f64, f64), AcquisitionError>;
}

/// Proof that call A completed: the bias is applied and settled.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArmedBias {
    pub bias_v: f64,
    pub ready_at: Instant,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BiasTimedRead {
    pub bias_v: f64,
    pub settle: Duration,
    pub interval: Duration,
    pub num_samples: usize,
}

fn restore_zero<D: SpotMeasure + ?Sized>(dev: &mut D, channels: &ChannelConfig, err: Error) -> Error {
    warn!("bias-timed read failed ({}), forcing {} to 0 V", err, channels.force());
    if let Err(zero_err) = dev.set_bias(channels, 0.0) {
        warn!("could not force 0 V: {}", zero_err);
    }
    err
}

impl BiasTimedRead {
    pub fn validate(&self, channels: &ChannelConfig) -> Result<()> {
        if !self.bias_v.is_finite() || self.bias_v.abs() > channels.voltage_range {
            return Err(Error::InvalidParameter(format!(
                "bias {} V outside the {} V range",
                self.bias_v, channels.voltage_range
            )));
        }
        if self.num_samples == 0 {
            return Err(Error::InvalidParameter("no samples requested".to_string()));
        }
        self.sample_count()?;
        Ok(())
    }

    // The whole schedule, `interval * num_samples`, must be representable
    fn sample_count(&self) -> Result<u32> {
        u32::try_from(self.num_samples)
            .ok()
            .filter(|&n| self.interval.checked_mul(n).is_some())
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "{} samples every {:?} overflow the sampling schedule",
                    self.num_samples, self.interval
                ))
            })
    }

    /// Call A: applies the bias and returns once it has settled.
    pub fn arm<D: SpotMeasure + ?Sized>(
        &self,
        dev: &mut D,
        channels: &ChannelConfig,
    ) -> Result<ArmedBias> {
        self.validate(channels)?;
        if let Err(err) = dev.set_bias(channels, self.bias_v) {
            return Err(restore_zero(dev, channels, err.into()));
        }
        thread::sleep(self.settle);
        info!("{} biased at {} V, ready", channels.force(), self.bias_v);
        Ok(ArmedBias {
            bias_v: self.bias_v,
            ready_at: Instant::now(),
        })
    }

    /// Call B: samples `num_samples` points every `interval`, timestamped from `epoch`.
    ///
    /// Returns the number of samples written to `out`.
    pub fn sample<D: SpotMeasure + ?Sized>(
        &self,
        dev: &mut D,
        channels: &ChannelConfig,
        armed: &ArmedBias,
        epoch: Instant,
        deriver: &MeasurementDeriver,
        out: &mut OutputArrays,
    ) -> Result<usize> {
        let count = match self
            .sample_count()
            .and_then(|count| out.check_len(self.num_samples).map(|_| count))
        {
            Ok(count) => count,
            Err(err) => return Err(restore_zero(dev, channels, err)),
        };
        out.fill(0.0);

        let start = Instant::now();
        for k in 0..count {
            if let Some(deadline) = start.checked_add(self.interval * k) {
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
            }
            let (voltage, current) = match dev.sample_spot(channels) {
                Ok(reading) => reading,
                Err(err) => return Err(restore_zero(dev, channels, err.into())),
            };
            let timestamp = epoch.elapsed().as_secs_f64();
            let meas = deriver.derive(voltage, current, None, channels.current_range, timestamp);
            out.write(k as usize, &meas);
        }

        dev.set_bias(channels, 0.0)?;
        info!(
            "{} samples at {} V, {:?} after arming",
            self.num_samples,
            armed.bias_v,
            armed.ready_at.elapsed()
        );
        Ok(self.num_samples)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Records every bias applied; fails the sample at `fail_at`
    struct Recorder {
        biases: Vec<f64>,
        samples: usize,
        fail_at: Option<usize>,
    }

    impl SpotMeasure for Recorder {
        fn set_bias(&mut self, _: &ChannelConfig, volts: f64) -> Result<(), AcquisitionError> {
            self.biases.push(volts);
            Ok(())
        }
        fn sample_spot(&mut self, _: &ChannelConfig) -> Result<(f64, f64), AcquisitionError> {
            if self.fail_at == Some(self.samples) {
                return Err(AcquisitionError::new(-12, "overrange"));
            }
            self.samples += 1;
            let v = *self.biases.last().unwrap_or(&0.0);
            Ok((v, v / 1e4))
        }
    }

    fn read() -> BiasTimedRead {
        BiasTimedRead {
            bias_v: 0.3,
            settle: Duration::from_millis(1),
            interval: Duration::from_millis(2),
            num_samples: 5,
        }
    }

    #[test]
    fn samples_are_timed_from_the_host_epoch() {
        let channels = ChannelConfig::new("ch1", "ch2", 1e-3, 5.0).unwrap();
        let mut dev = Recorder {
            biases: vec![],
            samples: 0,
            fail_at: None,
        };
        let armed = read().arm(&mut dev, &channels).unwrap();
        let epoch = Instant::now() - Duration::from_secs(1);
        let mut out = OutputArrays::with_len(5);
        let n = read()
            .sample(&mut dev, &channels, &armed, epoch, &MeasurementDeriver::new(1e-12), &mut out)
            .unwrap();

        assert_eq!(n, 5);
        assert_eq!(dev.biases, vec![0.3, 0.0]);
        assert!(out.timestamp[0] >= 1.0);
        for k in 1..5 {
            assert!(out.timestamp[k] > out.timestamp[k - 1]);
        }
        // Fifth sample is due four intervals after the first
        assert!(out.timestamp[4] - out.timestamp[0] >= 0.007);
        assert!(out.resistance.iter().all(|&r| (r - 1e4).abs() < 1e-6));
    }

    #[test]
    fn failed_sample_returns_to_zero() {
        let channels = ChannelConfig::new("ch1", "ch2", 1e-3, 5.0).unwrap();
        let mut dev = Recorder {
            biases: vec![],
            samples: 0,
            fail_at: Some(2),
        };
        let armed = read().arm(&mut dev, &channels).unwrap();
        let mut out = OutputArrays::with_len(5);
        let err = read()
            .sample(&mut dev, &channels, &armed, Instant::now(), &MeasurementDeriver::new(1e-12), &mut out)
            .unwrap_err();
        assert_eq!(err.status_code(), -12);
        assert_eq!(dev.biases.last(), Some(&0.0));
    }

    #[test]
    fn bias_beyond_range_is_not_applied() {
        let channels = ChannelConfig::new("ch1", "ch2", 1e-3, 0.1).unwrap();
        let mut dev = Recorder {
            biases: vec![],
            samples: 0,
            fail_at: None,
        };
        assert!(read().arm(&mut dev, &channels).is_err());
        assert!(dev.biases.is_empty());
    }

    #[test]
    fn unschedulable_sample_count_is_rejected() {
        let channels = ChannelConfig::new("ch1", "ch2", 1e-3, 5.0).unwrap();
        let mut dev = Recorder {
            biases: vec![],
            samples: 0,
            fail_at: None,
        };
        let mut huge = read();
        huge.num_samples = u32::MAX as usize + 1;
        assert_eq!(huge.arm(&mut dev, &channels).unwrap_err().status_code(), -109);
        assert!(dev.biases.is_empty());

        // Fits in u32, but the schedule overflows a Duration
        let mut long = read();
        long.interval = Duration::from_secs(u64::MAX / 2);
        long.num_samples = 3;
        assert!(long.validate(&channels).is_err());

        // `sample` checks the schedule itself and leaves the output at 0 V
        let armed = read().arm(&mut dev, &channels).unwrap();
        let mut out = OutputArrays::with_len(5);
        let err = huge
            .sample(&mut dev, &channels, &armed, Instant::now(), &MeasurementDeriver::new(1e-12), &mut out)
            .unwrap_err();
        assert_eq!(err.status_code(), -109);
        assert_eq!(dev.biases, vec![0.3, 0.0]);
        assert_eq!(dev.samples, 0);
    }
}
