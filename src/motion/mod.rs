//! Motion delivery path: sensor callbacks → per-channel detector → decision.
//! Detectors live in a table indexed by channel kind, owned by the coordinator;
//! sensor callbacks reach them only through a `MotionSink`.

pub mod peak;
pub mod significant;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{DetectionTuning, SensorChannelConfig, SensorKind};
use crate::dispatch::DecisionSender;
use crate::error::EngineError;
use crate::latch::{LatchGuard, WakeSource};
use crate::metrics::{metric_names, MetricsRegistry};

use peak::{MotionPeakDetector, PeakOutcome};
use significant::SignificantMotionTrigger;

/// One timestamped 3-axis reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSample {
    pub timestamp_ms: u64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl MotionSample {
    pub fn new(timestamp_ms: u64, x: f32, y: f32, z: f32) -> Self {
        Self {
            timestamp_ms,
            x,
            y,
            z,
        }
    }

    /// Build from a raw value slice. Fewer than three axes is malformed.
    pub fn from_values(timestamp_ms: u64, values: &[f32]) -> Option<Self> {
        match values {
            [x, y, z, ..] => Some(Self::new(timestamp_ms, *x, *y, *z)),
            _ => None,
        }
    }

    #[inline]
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    #[inline]
    pub fn dot(&self, other: &[f32; 3]) -> f32 {
        self.x * other[0] + self.y * other[1] + self.z * other[2]
    }

    #[inline]
    pub fn vector(&self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Registration issued by the sensor collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub id: u64,
    pub kind: SensorKind,
    /// The hardware obtained can rouse the processor by itself.
    pub wake_capable: bool,
}

/// Platform sensor facility.
pub trait MotionSampleSource: Send + Sync {
    /// Register the channel and deliver its samples (or its single trigger
    /// event) to `sink`. When the config asks for wake-capable hardware the
    /// source tries that variant first and falls back to the plain one,
    /// reporting which it got in the handle.
    fn try_activate(
        &self,
        config: &SensorChannelConfig,
        sink: MotionSink,
    ) -> Result<ChannelHandle, EngineError>;

    fn deactivate(&self, handle: ChannelHandle);
}

/// Detector variant selected by channel kind.
pub enum ChannelDetector {
    Peak(MotionPeakDetector),
    Trigger(SignificantMotionTrigger),
}

impl ChannelDetector {
    pub fn for_config(config: &SensorChannelConfig, tuning: &DetectionTuning) -> Self {
        match config.kind() {
            SensorKind::SignificantMotion => ChannelDetector::Trigger(SignificantMotionTrigger::armed()),
            SensorKind::Accelerometer | SensorKind::Gyroscope | SensorKind::LinearAcceleration => {
                ChannelDetector::Peak(MotionPeakDetector::new(config, tuning))
            }
        }
    }
}

/// Detector slots keyed by `SensorKind::index()`. `epoch` changes on every
/// registration cycle so callbacks from an old registration are dropped.
pub struct ChannelTable {
    epoch: u64,
    slots: [Option<ChannelDetector>; SensorKind::ALL.len()],
}

impl ChannelTable {
    fn new() -> Self {
        Self {
            epoch: 0,
            slots: [None, None, None, None],
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Empty every slot and open a new epoch.
    fn begin_registration(&mut self) -> u64 {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.epoch += 1;
        self.epoch
    }

    fn install(&mut self, kind: SensorKind, detector: ChannelDetector) {
        self.slots[kind.index()] = Some(detector);
    }

    fn remove(&mut self, kind: SensorKind) {
        self.slots[kind.index()] = None;
    }

    pub fn get_mut(&mut self, kind: SensorKind) -> Option<&mut ChannelDetector> {
        self.slots[kind.index()].as_mut()
    }

    pub fn is_installed(&self, kind: SensorKind) -> bool {
        self.slots[kind.index()].is_some()
    }
}

/// Shared between the coordinator and every sink it hands out.
pub struct MotionHub {
    table: Mutex<ChannelTable>,
    decisions: DecisionSender,
    metrics: Arc<MetricsRegistry>,
}

impl MotionHub {
    pub fn new(decisions: DecisionSender, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            table: Mutex::new(ChannelTable::new()),
            decisions,
            metrics,
        }
    }

    pub fn begin_registration(&self) -> u64 {
        self.table.lock().begin_registration()
    }

    /// Install a fresh (zeroed, armed) detector before the hardware is asked
    /// for samples.
    pub fn install(&self, config: &SensorChannelConfig, tuning: &DetectionTuning) {
        self.table
            .lock()
            .install(config.kind(), ChannelDetector::for_config(config, tuning));
    }

    pub fn remove(&self, kind: SensorKind) {
        self.table.lock().remove(kind);
    }

    /// Drop every detector and invalidate outstanding sinks.
    pub fn clear(&self) {
        self.table.lock().begin_registration();
    }

    pub fn is_installed(&self, kind: SensorKind) -> bool {
        self.table.lock().is_installed(kind)
    }

    pub fn sink(self: &Arc<Self>, kind: SensorKind, epoch: u64, guard: LatchGuard) -> MotionSink {
        MotionSink {
            kind,
            epoch,
            guard,
            hub: Arc::clone(self),
        }
    }
}

/// Delivery endpoint handed to the sensor collaborator for one channel.
#[derive(Clone)]
pub struct MotionSink {
    kind: SensorKind,
    epoch: u64,
    guard: LatchGuard,
    hub: Arc<MotionHub>,
}

impl MotionSink {
    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Sensor callback for stream channels.
    pub fn on_sample(&self, sample: MotionSample) {
        if !self.guard.should_continue() {
            return;
        }
        let timer = self.hub.metrics.timer(metric_names::SAMPLE_OBSERVE);
        let outcome = {
            let mut table = self.hub.table.lock();
            if table.epoch() != self.epoch {
                return;
            }
            match table.get_mut(self.kind) {
                Some(ChannelDetector::Peak(detector)) => detector.observe(&sample),
                _ => return,
            }
        };
        timer.stop();

        match outcome {
            PeakOutcome::Shake { count } => {
                info!(channel = %self.kind, peaks = count, "shake_recognized");
                self.hub
                    .decisions
                    .decide(&self.guard, WakeSource::Motion(self.kind));
            }
            PeakOutcome::Malformed => self.hub.metrics.increment(metric_names::SAMPLE_MALFORMED),
            _ => {}
        }
    }

    /// Sensor callback taking the platform's raw value array.
    pub fn on_values(&self, timestamp_ms: u64, values: &[f32]) {
        match MotionSample::from_values(timestamp_ms, values) {
            Some(sample) => self.on_sample(sample),
            None => {
                self.hub.metrics.increment(metric_names::SAMPLE_MALFORMED);
                debug!(channel = %self.kind, axes = values.len(), "malformed sample ignored");
            }
        }
    }

    /// One-shot hardware trigger callback.
    pub fn on_trigger(&self) {
        if !self.guard.should_continue() {
            return;
        }
        let fired = {
            let mut table = self.hub.table.lock();
            if table.epoch() != self.epoch {
                return;
            }
            match table.get_mut(self.kind) {
                Some(ChannelDetector::Trigger(trigger)) => trigger.fire(),
                _ => false,
            }
        };
        if fired {
            info!(channel = %self.kind, "significant_motion_triggered");
            self.hub
                .decisions
                .decide(&self.guard, WakeSource::Motion(self.kind));
        }
    }
}
