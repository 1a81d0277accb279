//! Latency windows and event counters.
//! Per-sample and per-frame costs are tracked to keep the detectors inside
//! their one-period budget; the coordinator logs the tail at session end.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const WINDOW: usize = 512;

/// Records the time from creation to `stop` under one latency name.
#[must_use = "a timer records nothing unless stopped"]
pub struct LatencyTimer {
    name: &'static str,
    started: Instant,
    registry: Arc<MetricsRegistry>,
}

impl LatencyTimer {
    pub fn stop(self) -> Duration {
        let elapsed = self.started.elapsed();
        self.registry.record_latency(self.name, elapsed);
        elapsed
    }
}

/// Most recent `WINDOW` observations, oldest evicted first.
#[derive(Default)]
struct LatencyWindow {
    recent: VecDeque<Duration>,
}

impl LatencyWindow {
    fn push(&mut self, value: Duration) {
        if self.recent.len() == WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(value);
    }

    /// Nearest-rank percentile, `p` in 0..=100.
    fn percentile(&self, p: f64) -> Option<Duration> {
        let mut sorted: Vec<Duration> = self.recent.iter().copied().collect();
        sorted.sort_unstable();
        let last = sorted.len().checked_sub(1)?;
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * last as f64).round() as usize;
        sorted.get(rank.min(last)).copied()
    }
}

#[derive(Default)]
pub struct MetricsRegistry {
    latencies: Mutex<HashMap<&'static str, LatencyWindow>>,
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_latency(&self, name: &'static str, value: Duration) {
        self.latencies.lock().entry(name).or_default().push(value);
    }

    pub fn timer(self: &Arc<Self>, name: &'static str) -> LatencyTimer {
        LatencyTimer {
            name,
            started: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    pub fn increment(&self, name: &'static str) {
        *self.counters.lock().entry(name).or_insert(0) += 1;
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// `None` until something was recorded under `name`.
    pub fn latency_percentile(&self, name: &str, p: f64) -> Option<Duration> {
        self.latencies.lock().get(name).and_then(|w| w.percentile(p))
    }
}

pub mod metric_names {
    pub const SAMPLE_OBSERVE: &str = "t_sample_observe";
    pub const FRAME_OBSERVE: &str = "t_frame_observe";
    pub const WAKE_DISPATCH: &str = "t_wake_dispatch";
    pub const WAKE_ACTION: &str = "t_wake_action";

    pub const WAKE_FIRED: &str = "wake_fired";
    pub const WAKE_SUPPRESSED: &str = "wake_suppressed";
    pub const CHANNEL_ACTIVATION_FAILED: &str = "channel_activation_failed";
    pub const BURST_DISCARDED: &str = "burst_discarded";
    pub const SAMPLE_MALFORMED: &str = "sample_malformed";
    pub const FRAME_OVERREAD: &str = "frame_overread";
    pub const SOUND_LOOP_FAILED: &str = "sound_loop_failed";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_latency_percentiles() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record_latency(metric_names::SAMPLE_OBSERVE, ms(v));
        }
        let p = |q| registry.latency_percentile(metric_names::SAMPLE_OBSERVE, q).unwrap();
        assert_eq!(p(0.0), ms(1));
        assert_eq!(p(100.0), ms(100));
        assert!((ms(50)..=ms(51)).contains(&p(50.0)));
    }

    #[test]
    fn test_unknown_metric() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.latency_percentile("nope", 99.0), None);
        assert_eq!(registry.count("nope"), 0);
    }

    #[test]
    fn test_counters() {
        let registry = MetricsRegistry::new();
        registry.increment(metric_names::WAKE_FIRED);
        registry.increment(metric_names::WAKE_FIRED);
        assert_eq!(registry.count(metric_names::WAKE_FIRED), 2);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let registry = MetricsRegistry::new();
        registry.record_latency(metric_names::WAKE_ACTION, ms(10_000));
        for _ in 0..WINDOW {
            registry.record_latency(metric_names::WAKE_ACTION, ms(1));
        }
        assert_eq!(
            registry.latency_percentile(metric_names::WAKE_ACTION, 100.0),
            Some(ms(1))
        );
    }

    #[test]
    fn test_timer_records_on_stop() {
        let registry = Arc::new(MetricsRegistry::new());
        let elapsed = registry.timer(metric_names::FRAME_OBSERVE).stop();
        assert_eq!(
            registry.latency_percentile(metric_names::FRAME_OBSERVE, 50.0),
            Some(elapsed)
        );
    }
}
