//! Frame-loss detection from camera timestamp gaps.
//!
//! Cameras stamp every frame with a hardware clock (picoseconds here). When
//! the bus or the producer drops frames, the stamps that do arrive show a
//! gap larger than the nominal inter-frame interval. The detector flags such
//! gaps, and backwards-running stamps, as advisory warnings; it never blocks
//! or fails the pipeline.

use std::fmt;

/// Number of recent timestamps kept for diagnostics.
pub const TIMESTAMP_WINDOW: usize = 1000;

/// Fixed-size ring of recently observed timestamps. Diagnostic only, never
/// persisted.
#[derive(Debug)]
pub struct TimestampWindow {
    slots: Vec<u64>,
    head: usize,
    filled: usize,
}

impl TimestampWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![0; capacity.max(1)],
            head: 0,
            filled: 0,
        }
    }

    pub fn push(&mut self, timestamp: u64) {
        self.slots[self.head] = timestamp;
        self.head = (self.head + 1) % self.slots.len();
        self.filled = (self.filled + 1).min(self.slots.len());
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Observed timestamps, oldest first.
    pub fn snapshot(&self) -> Vec<u64> {
        let capacity = self.slots.len();
        (0..self.filled)
            .map(|i| self.slots[(self.head + capacity - self.filled + i) % capacity])
            .collect()
    }
}

/// Advisory warning emitted by [`FrameLossDetector::observe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossWarning {
    /// Gap above the loss threshold; `missed` estimates the dropped frames
    /// as `delta / nominal_interval`.
    Gap { delta: u64, missed: u64 },
    /// Timestamp moved backwards. Upstream clock or ordering corruption;
    /// reported rather than silently accepted.
    NonMonotonic { previous: u64, current: u64 },
}

impl fmt::Display for LossWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gap { delta, missed } => {
                write!(f, "timestamp gap of {delta} ps, missed at least {missed} frames")
            }
            Self::NonMonotonic { previous, current } => {
                write!(f, "timestamp went backwards: {previous} -> {current}")
            }
        }
    }
}

/// Rolling gap detector over the frame timestamp stream.
#[derive(Debug)]
pub struct FrameLossDetector {
    nominal_interval: u64,
    loss_threshold: u64,
    last_timestamp: Option<u64>,
    window: TimestampWindow,
    events: u64,
    missed_total: u64,
}

impl FrameLossDetector {
    /// Detector with the default threshold of twice the nominal interval.
    pub fn new(nominal_interval: u64) -> Self {
        Self::with_threshold(nominal_interval, nominal_interval.saturating_mul(2))
    }

    /// Detector with an explicit loss threshold (both in picoseconds).
    pub fn with_threshold(nominal_interval: u64, loss_threshold: u64) -> Self {
        Self {
            nominal_interval: nominal_interval.max(1),
            loss_threshold,
            last_timestamp: None,
            window: TimestampWindow::new(TIMESTAMP_WINDOW),
            events: 0,
            missed_total: 0,
        }
    }

    /// Detector for a camera running at `fps` frames per second.
    pub fn from_frame_rate(fps: f64) -> Self {
        let nominal = if fps > 0.0 {
            (1e12 / fps).round() as u64
        } else {
            1
        };
        Self::new(nominal)
    }

    /// Record one observed timestamp.
    ///
    /// The first observation only seeds the detector. Afterwards a delta
    /// above the threshold yields [`LossWarning::Gap`]; a decreasing stamp
    /// yields [`LossWarning::NonMonotonic`]. Loss is advisory only.
    pub fn observe(&mut self, timestamp: u64) -> Option<LossWarning> {
        self.window.push(timestamp);

        let warning = match self.last_timestamp {
            None => None,
            Some(last) if timestamp < last => Some(LossWarning::NonMonotonic {
                previous: last,
                current: timestamp,
            }),
            Some(last) => {
                let delta = timestamp - last;
                if delta > self.loss_threshold {
                    let missed = delta / self.nominal_interval;
                    self.missed_total += missed;
                    Some(LossWarning::Gap { delta, missed })
                } else {
                    None
                }
            }
        };

        self.last_timestamp = Some(timestamp);
        if warning.is_some() {
            self.events += 1;
        }
        warning
    }

    /// Number of warnings emitted so far.
    pub fn events(&self) -> u64 {
        self.events
    }

    /// Running estimate of frames missed across all gaps.
    pub fn missed_total(&self) -> u64 {
        self.missed_total
    }

    /// Recent timestamps for diagnostics, oldest first.
    pub fn window_snapshot(&self) -> Vec<u64> {
        self.window.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_estimates_missed_frames() {
        // Nominal interval 5, threshold 10: only the 990 jump warns,
        // estimating 990 / 5 = 198 missed frames.
        let mut detector = FrameLossDetector::with_threshold(5, 10);
        let warnings: Vec<_> = [0u64, 5, 10, 1000]
            .into_iter()
            .filter_map(|ts| detector.observe(ts))
            .collect();

        assert_eq!(
            warnings,
            vec![LossWarning::Gap {
                delta: 990,
                missed: 198
            }]
        );
        assert_eq!(detector.events(), 1);
        assert_eq!(detector.missed_total(), 198);
    }

    #[test]
    fn test_quiet_stream_emits_nothing() {
        let mut detector = FrameLossDetector::with_threshold(5, 10);
        for ts in (0..100u64).map(|i| i * 10) {
            assert_eq!(detector.observe(ts), None, "ts {ts}");
        }
        assert_eq!(detector.events(), 0);
    }

    #[test]
    fn test_backwards_timestamp_is_reported() {
        let mut detector = FrameLossDetector::new(5);
        assert_eq!(detector.observe(100), None);
        assert_eq!(
            detector.observe(90),
            Some(LossWarning::NonMonotonic {
                previous: 100,
                current: 90
            })
        );
        // Detector keeps going from the new stamp.
        assert_eq!(detector.observe(95), None);
    }

    #[test]
    fn test_from_frame_rate_derives_interval() {
        // 200 fps -> 5e9 ps nominal, 1e10 ps threshold.
        let mut detector = FrameLossDetector::from_frame_rate(200.0);
        detector.observe(0);
        assert_eq!(detector.observe(5_000_000_000), None);
        let warning = detector.observe(1_000_000_000_000);
        assert!(matches!(warning, Some(LossWarning::Gap { missed: 199, .. })));
    }

    #[test]
    fn test_window_wraps_and_orders() {
        let mut window = TimestampWindow::new(3);
        for ts in 1..=5u64 {
            window.push(ts);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.snapshot(), vec![3, 4, 5]);
    }
}
