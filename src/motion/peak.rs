//! Peak-counting shake recognizer.
//!
//! A peak is a sample whose magnitude strictly exceeds the channel threshold
//! and is more than `min_inter_peak_gap_ms` after the previous peak. For
//! directional channels a peak only extends the sequence when it points the
//! opposite way to the previous one (negative dot product) and arrives within
//! `max_inter_peak_gap_ms`; anything else restarts the count at 1. The
//! gyroscope only counts magnitude peaks inside the same timing window.
//! Reaching `required_peaks` is a shake; the detector then halts until reset.

use tracing::debug;

use super::MotionSample;
use crate::config::{DetectionTuning, SensorChannelConfig, SensorKind};

/// Mutable per-channel state. Zeroed on (re)activation and after a shake.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeakState {
    pub last_peak_timestamp: u64,
    pub peak_count: u32,
    pub last_peak_vector: [f32; 3],
    pub has_peak: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PeakOutcome {
    /// Magnitude at or below threshold.
    Below,
    /// Non-finite components; treated as no peak.
    Malformed,
    /// Above threshold but too close to the previous peak.
    Debounced,
    Peak { count: u32 },
    /// Sequence complete: emit a wake decision.
    Shake { count: u32 },
    /// Already produced a shake; waiting for reset.
    Halted,
}

pub struct MotionPeakDetector {
    kind: SensorKind,
    threshold: f32,
    min_gap_ms: u64,
    max_gap_ms: u64,
    required_peaks: u32,
    state: PeakState,
    halted: bool,
}

impl MotionPeakDetector {
    pub fn new(config: &SensorChannelConfig, tuning: &DetectionTuning) -> Self {
        Self {
            kind: config.kind(),
            threshold: config.magnitude_threshold(),
            min_gap_ms: tuning.min_inter_peak_gap_ms,
            max_gap_ms: tuning.max_inter_peak_gap_ms,
            required_peaks: tuning.required_peaks.max(1),
            state: PeakState::default(),
            halted: false,
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn state(&self) -> &PeakState {
        &self.state
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn reset(&mut self) {
        self.state = PeakState::default();
        self.halted = false;
    }

    pub fn observe(&mut self, sample: &MotionSample) -> PeakOutcome {
        if self.halted {
            return PeakOutcome::Halted;
        }
        if !sample.is_finite() {
            return PeakOutcome::Malformed;
        }
        if sample.magnitude() <= self.threshold {
            return PeakOutcome::Below;
        }

        let state = &mut self.state;
        // Timestamps running backwards collapse to dt = 0 and are debounced.
        let dt = sample.timestamp_ms.saturating_sub(state.last_peak_timestamp);
        if state.has_peak && dt <= self.min_gap_ms {
            return PeakOutcome::Debounced;
        }

        let continues = state.has_peak
            && dt < self.max_gap_ms
            && (!self.kind.tracks_direction() || sample.dot(&state.last_peak_vector) < 0.0);

        state.peak_count = if continues { state.peak_count + 1 } else { 1 };
        state.last_peak_timestamp = sample.timestamp_ms;
        state.last_peak_vector = sample.vector();
        state.has_peak = true;

        let count = state.peak_count;
        if count >= self.required_peaks {
            debug!(channel = %self.kind, count, "shake_detected");
            self.state = PeakState::default();
            self.halted = true;
            return PeakOutcome::Shake { count };
        }
        debug!(channel = %self.kind, count, dt_ms = dt, "peak");
        PeakOutcome::Peak { count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(kind: SensorKind) -> MotionPeakDetector {
        let config = SensorChannelConfig::default_for(kind).with_enabled(true);
        MotionPeakDetector::new(&config, &DetectionTuning::default())
    }

    fn sample(t: u64, x: f32) -> MotionSample {
        MotionSample::new(t, x, 0.0, 0.0)
    }

    #[test]
    fn test_alternating_shake_fires_on_fourth_peak() {
        let mut d = detector(SensorKind::Accelerometer);
        assert_eq!(d.observe(&sample(1000, 15.0)), PeakOutcome::Peak { count: 1 });
        assert_eq!(d.observe(&sample(1200, -15.0)), PeakOutcome::Peak { count: 2 });
        assert_eq!(d.observe(&sample(1400, 15.0)), PeakOutcome::Peak { count: 3 });
        assert_eq!(d.observe(&sample(1600, -15.0)), PeakOutcome::Shake { count: 4 });
        assert!(d.is_halted());
        assert_eq!(*d.state(), PeakState::default());
        assert_eq!(d.observe(&sample(1800, 15.0)), PeakOutcome::Halted);
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut d = detector(SensorKind::Accelerometer);
        assert_eq!(d.observe(&sample(1000, 10.0)), PeakOutcome::Below);
        assert!(!d.state().has_peak);
        assert_eq!(d.observe(&sample(1200, 10.01)), PeakOutcome::Peak { count: 1 });
    }

    #[test]
    fn test_debounce_within_min_gap() {
        let mut d = detector(SensorKind::Accelerometer);
        d.observe(&sample(1000, 15.0));
        assert_eq!(d.observe(&sample(1150, -15.0)), PeakOutcome::Debounced);
        assert_eq!(d.observe(&sample(1100, -15.0)), PeakOutcome::Debounced);
        assert_eq!(d.state().peak_count, 1);
        assert_eq!(d.state().last_peak_timestamp, 1000);
        assert_eq!(d.observe(&sample(1151, -15.0)), PeakOutcome::Peak { count: 2 });
    }

    #[test]
    fn test_stale_peak_restarts_sequence() {
        let mut d = detector(SensorKind::Accelerometer);
        d.observe(&sample(1000, 15.0));
        d.observe(&sample(1200, -15.0));
        assert_eq!(d.state().peak_count, 2);
        assert_eq!(d.observe(&sample(1701, 15.0)), PeakOutcome::Peak { count: 1 });
        // Exactly at the max gap is also too late.
        assert_eq!(d.observe(&sample(2201, -15.0)), PeakOutcome::Peak { count: 1 });
    }

    #[test]
    fn test_same_direction_restarts_sequence() {
        let mut d = detector(SensorKind::LinearAcceleration);
        d.observe(&sample(1000, 12.0));
        assert_eq!(d.observe(&sample(1200, 12.0)), PeakOutcome::Peak { count: 1 });
        assert_eq!(d.observe(&sample(1400, -12.0)), PeakOutcome::Peak { count: 2 });
    }

    #[test]
    fn test_gyroscope_ignores_direction() {
        let mut d = detector(SensorKind::Gyroscope);
        for (i, t) in [1000, 1200, 1400].iter().enumerate() {
            assert_eq!(
                d.observe(&sample(*t, 4.0)),
                PeakOutcome::Peak { count: i as u32 + 1 }
            );
        }
        assert_eq!(d.observe(&sample(1600, 4.0)), PeakOutcome::Shake { count: 4 });
    }

    #[test]
    fn test_gyroscope_window_resets() {
        let mut d = detector(SensorKind::Gyroscope);
        d.observe(&sample(1000, 4.0));
        d.observe(&sample(1200, 4.0));
        assert_eq!(d.observe(&sample(1800, 4.0)), PeakOutcome::Peak { count: 1 });
    }

    #[test]
    fn test_malformed_sample_is_no_peak() {
        let mut d = detector(SensorKind::Accelerometer);
        assert_eq!(
            d.observe(&MotionSample::new(1000, f32::NAN, 20.0, 0.0)),
            PeakOutcome::Malformed
        );
        assert_eq!(
            d.observe(&MotionSample::new(1000, f32::INFINITY, 0.0, 0.0)),
            PeakOutcome::Malformed
        );
        assert!(!d.state().has_peak);
    }

    #[test]
    fn test_reset_clears_halt() {
        let mut d = detector(SensorKind::Gyroscope);
        for t in [1000, 1200, 1400, 1600] {
            d.observe(&sample(t, 4.0));
        }
        assert!(d.is_halted());
        d.reset();
        assert_eq!(d.observe(&sample(1800, 4.0)), PeakOutcome::Peak { count: 1 });
    }
}
