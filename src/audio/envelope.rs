//! Amplitude-envelope burst classification.
//! A burst is the run of frames whose mean absolute amplitude stays above the
//! threshold; it qualifies only if it lasted between the min and max duration
//! (both inclusive). Clicks are too short, ambient noise too long.

use crate::config::DetectionTuning;

/// Mean absolute sample value over a frame of 16-bit PCM.
#[inline]
pub fn mean_abs_amplitude(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: i64 = samples.iter().map(|&s| (s as i64).abs()).sum();
    (sum as f64 / samples.len() as f64) as f32
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BurstOutcome {
    Quiet,
    Started,
    Continuing,
    /// Trailing edge inside the duration window.
    Completed { duration_ms: u64 },
    /// Trailing edge outside the window.
    Discarded { duration_ms: u64 },
}

pub struct SoundEnvelope {
    threshold: f32,
    min_duration_ms: u64,
    max_duration_ms: u64,
    burst_active: bool,
    burst_start_timestamp: u64,
}

impl SoundEnvelope {
    pub fn new(tuning: &DetectionTuning) -> Self {
        Self {
            threshold: tuning.sound_threshold,
            min_duration_ms: tuning.min_sound_duration_ms,
            max_duration_ms: tuning.max_sound_duration_ms,
            burst_active: false,
            burst_start_timestamp: 0,
        }
    }

    pub fn burst_active(&self) -> bool {
        self.burst_active
    }

    pub fn burst_start_timestamp(&self) -> u64 {
        self.burst_start_timestamp
    }

    pub fn reset(&mut self) {
        self.burst_active = false;
        self.burst_start_timestamp = 0;
    }

    pub fn observe(&mut self, amplitude: f32, now_ms: u64) -> BurstOutcome {
        let loud = amplitude > self.threshold;
        match (loud, self.burst_active) {
            (true, false) => {
                self.burst_active = true;
                self.burst_start_timestamp = now_ms;
                BurstOutcome::Started
            }
            (true, true) => BurstOutcome::Continuing,
            (false, true) => {
                let duration_ms = now_ms.saturating_sub(self.burst_start_timestamp);
                self.reset();
                if (self.min_duration_ms..=self.max_duration_ms).contains(&duration_ms) {
                    BurstOutcome::Completed { duration_ms }
                } else {
                    BurstOutcome::Discarded { duration_ms }
                }
            }
            (false, false) => BurstOutcome::Quiet,
        }
    }
}
