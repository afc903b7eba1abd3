//! Probe windows: the time intervals of the program in which a read is averaged.
//!
//! Windows are recorded while the program is built and consumed after the acquisition, always in
//! recording order, which is also the order of the caller's output arrays.

use log::debug;

use crate::error::{Error, Result};

/// Closed time interval `[start, end]` into the acquired trace.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Window {
    pub start: f64,
    pub end: f64,
}

impl Window {
    /// Checks `0 <= start < end`.
    pub fn new(start: f64, end: f64) -> Result<Self> {
        if !(start >= 0.0 && start < end) || !end.is_finite() {
            return Err(Error::InvalidProbeWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Inner `(lo, hi)` fraction of a segment starting at `seg_start` and lasting `duration`.
    ///
    /// ```
    /// use pulsecompiler_backend::probe::Window;
    ///
    /// let w = Window::inner(10.0, 10.0, (0.4, 0.9)).unwrap();
    /// assert_eq!((w.start, w.end), (14.0, 19.0));
    /// ```
    pub fn inner(seg_start: f64, duration: f64, fraction: (f64, f64)) -> Result<Self> {
        Self::new(
            seg_start + fraction.0 * duration,
            seg_start + fraction.1 * duration,
        )
    }

    pub fn width(&self) -> f64 {
        self.end - self.start
    }
}

/// One recorded read: its measurement window and, for offset-compensated reads, the zero-volt
/// window whose current is subtracted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProbeWindow {
    pub index: usize,
    pub window: Window,
    pub offset: Option<Window>,
}

/// Fixed-capacity list of probe windows for one invocation.
///
/// # Examples
///
/// ```
/// use pulsecompiler_backend::probe::*;
///
/// let mut registry = ProbeWindowRegistry::reserve(2).unwrap();
/// assert_eq!(registry.record(1e-6, 2e-6).unwrap(), 0);
/// assert_eq!(registry.record(5e-6, 6e-6).unwrap(), 1);
/// // A third read was never declared
/// assert!(registry.record(9e-6, 1e-5).is_err());
/// assert_eq!(registry.get(1).unwrap().window.start, 5e-6);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProbeWindowRegistry {
    capacity: usize,
    probes: Vec<ProbeWindow>,
}

impl ProbeWindowRegistry {
    /// Registry for exactly `capacity` probes, allocated up front.
    pub fn reserve(capacity: usize) -> Result<Self> {
        let mut probes = Vec::new();
        probes
            .try_reserve_exact(capacity)
            .map_err(|_| Error::AllocationFailed {
                what: "probe windows",
                requested: capacity,
            })?;
        Ok(Self { capacity, probes })
    }

    /// Records the next probe window and returns its index.
    pub fn record(&mut self, window_start: f64, window_end: f64) -> Result<usize> {
        if self.probes.len() >= self.capacity {
            return Err(Error::ProbeCapacityExceeded {
                capacity: self.capacity,
            });
        }
        let window = Window::new(window_start, window_end)?;
        let index = self.probes.len();
        debug!(
            "probe {} window [{:e}, {:e}] s",
            index, window.start, window.end
        );
        self.probes.push(ProbeWindow {
            index,
            window,
            offset: None,
        });
        Ok(index)
    }

    /// Attaches an offset window to the already recorded probe `index`.
    pub fn attach_offset(&mut self, index: usize, offset: Window) -> Result<()> {
        let count = self.probes.len();
        let probe = self
            .probes
            .get_mut(index)
            .ok_or(Error::ProbeIndexOutOfRange { index, count })?;
        debug!(
            "probe {} offset window [{:e}, {:e}] s",
            index, offset.start, offset.end
        );
        probe.offset = Some(offset);
        Ok(())
    }

    pub fn get(&self, index: usize) -> Result<&ProbeWindow> {
        self.probes.get(index).ok_or(Error::ProbeIndexOutOfRange {
            index,
            count: self.probes.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    pub fn is_full(&self) -> bool {
        self.probes.len() == self.capacity
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProbeWindow> {
        self.probes.iter()
    }

    /// Fails on the first window, measurement or offset, that ends past `total_duration`.
    pub fn check_within(&self, total_duration: f64) -> Result<()> {
        for probe in &self.probes {
            let end = probe
                .offset
                .map_or(probe.window.end, |offset| offset.end.max(probe.window.end));
            if end > total_duration {
                return Err(Error::WindowOutsideWaveform {
                    index: probe.index,
                    end,
                    total: total_duration,
                });
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ProbeWindowRegistry {
    type Item = &'a ProbeWindow;
    type IntoIter = std::slice::Iter<'a, ProbeWindow>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sixth_record_exceeds_capacity_of_five() {
        let mut registry = ProbeWindowRegistry::reserve(5).unwrap();
        for k in 0..5 {
            let t = k as f64;
            assert_eq!(registry.record(t, t + 0.5).unwrap(), k);
        }
        assert!(registry.is_full());
        assert_eq!(
            registry.record(5.0, 5.5),
            Err(Error::ProbeCapacityExceeded { capacity: 5 })
        );
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn degenerate_windows_are_rejected() {
        let mut registry = ProbeWindowRegistry::reserve(3).unwrap();
        assert!(registry.record(2.0, 1.0).is_err());
        assert!(registry.record(1.0, 1.0).is_err());
        assert!(registry.record(-1.0, 1.0).is_err());
        assert!(registry.record(0.0, f64::NAN).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn offsets_count_towards_the_waveform_end() {
        let mut registry = ProbeWindowRegistry::reserve(1).unwrap();
        let idx = registry.record(1.0, 2.0).unwrap();
        assert!(registry.check_within(3.0).is_ok());
        registry.attach_offset(idx, Window::new(3.0, 4.0).unwrap()).unwrap();
        assert_eq!(
            registry.check_within(3.0),
            Err(Error::WindowOutsideWaveform {
                index: 0,
                end: 4.0,
                total: 3.0
            })
        );
        assert!(registry
            .attach_offset(1, Window::new(0.0, 1.0).unwrap())
            .is_err());
    }

    #[test]
    fn iteration_follows_recording_order() {
        let mut registry = ProbeWindowRegistry::reserve(3).unwrap();
        registry.record(5.0, 6.0).unwrap();
        registry.record(1.0, 2.0).unwrap();
        registry.record(3.0, 4.0).unwrap();
        let starts: Vec<f64> = registry.iter().map(|p| p.window.start).collect();
        assert_eq!(starts, vec![5.0, 1.0, 3.0]);
        assert!(registry.get(3).is_err());
    }
}
