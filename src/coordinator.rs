//! Detection coordinator: starts and stops detectors on screen transitions,
//! owns the shared wake-lock, and resets the wake latch at session boundaries.
//!
//! Screen-off opens a session: every enabled channel is registered, the
//! significant-motion trigger is armed, and the sound loop is started when
//! enabled and permitted. Screen-on is the only reset point: detectors are
//! unregistered, the wake-lock is released and the latch is cleared.
//! Registration failures are per-channel and never abort the session.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel as cb;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audio::{AudioCaptureSource, SoundBurstDetector, SoundContext};
use crate::clock::Clock;
use crate::config::{DetectionTuning, SensorKind, SettingsStore};
use crate::dispatch::{WakeAction, WakeDispatcher};
use crate::error::EngineError;
use crate::latch::{LatchGuard, WakeLatch};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::motion::{ChannelHandle, MotionHub, MotionSampleSource};
use crate::power::{PowerControl, WakeLockHolder, WakeLockLedger};
use crate::state_machine::{EngineState, StateMachine};

/// External capabilities the engine consumes.
pub struct Collaborators {
    pub motion: Arc<dyn MotionSampleSource>,
    pub audio: Arc<dyn AudioCaptureSource>,
    pub power: Arc<dyn PowerControl>,
    pub settings: Arc<dyn SettingsStore>,
    pub wake_action: Arc<dyn WakeAction>,
    pub clock: Arc<dyn Clock>,
}

/// Session boundary notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionEvent {
    ScreenOff,
    ScreenOn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SoundStatus {
    Disabled,
    Active,
    Unavailable(EngineError),
}

/// Outcome of one activation cycle, for the surrounding service.
#[derive(Debug, Clone)]
pub struct ActivationReport {
    pub session_id: String,
    pub activated: Vec<SensorKind>,
    pub failed: Vec<(SensorKind, EngineError)>,
    pub sound: SoundStatus,
    pub wake_lock_held: bool,
    /// No channel enabled and sound disabled.
    pub nothing_configured: bool,
}

impl ActivationReport {
    /// Something configured did not come up.
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty() || matches!(self.sound, SoundStatus::Unavailable(_))
    }

    /// No detector at all is running this session.
    pub fn nothing_active(&self) -> bool {
        self.activated.is_empty() && self.sound != SoundStatus::Active
    }
}

struct SessionResources {
    session_id: Option<String>,
    handles: Vec<ChannelHandle>,
    sound: Option<SoundBurstDetector>,
    last_report: Option<ActivationReport>,
}

pub struct DetectionCoordinator {
    motion: Arc<dyn MotionSampleSource>,
    audio: Arc<dyn AudioCaptureSource>,
    power: Arc<dyn PowerControl>,
    settings: Arc<dyn SettingsStore>,
    clock: Arc<dyn Clock>,
    tuning: DetectionTuning,
    latch: Arc<WakeLatch>,
    state: Arc<StateMachine>,
    metrics: Arc<MetricsRegistry>,
    hub: Arc<MotionHub>,
    /// Lock order: `resources` before `ledger`. The ledger lock is never held
    /// while a detector is stopped, so the sound loop may take it.
    ledger: Arc<Mutex<WakeLockLedger>>,
    resources: Mutex<SessionResources>,
    dispatcher: WakeDispatcher,
}

impl DetectionCoordinator {
    pub fn new(collaborators: Collaborators, tuning: DetectionTuning) -> Result<Self, EngineError> {
        let Collaborators {
            motion,
            audio,
            power,
            settings,
            wake_action,
            clock,
        } = collaborators;

        let latch = Arc::new(WakeLatch::new());
        let state = Arc::new(StateMachine::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = WakeDispatcher::spawn(
            Arc::clone(&latch),
            Arc::clone(&state),
            Arc::clone(&power),
            wake_action,
            tuning,
            Arc::clone(&metrics),
        )?;
        let hub = Arc::new(MotionHub::new(dispatcher.sender(), Arc::clone(&metrics)));

        Ok(Self {
            resources: Mutex::new(SessionResources {
                session_id: None,
                handles: Vec::new(),
                sound: None,
                last_report: None,
            }),
            ledger: Arc::new(Mutex::new(WakeLockLedger::new(Arc::clone(&power)))),
            motion,
            audio,
            power,
            settings,
            clock,
            tuning,
            latch,
            state,
            metrics,
            hub,
            dispatcher,
        })
    }

    /// Begin sensing right away if the screen is already off.
    pub fn start(&self) -> Option<ActivationReport> {
        if self.power.is_screen_on() {
            info!("screen on at start, waiting for screen-off");
            None
        } else {
            info!("screen already off at start");
            Some(self.on_screen_off())
        }
    }

    pub fn handle_event(&self, event: SessionEvent) -> Option<ActivationReport> {
        match event {
            SessionEvent::ScreenOff => Some(self.on_screen_off()),
            SessionEvent::ScreenOn => {
                self.on_screen_on();
                None
            }
        }
    }

    /// Idle → Sensing. A repeated screen-off re-applies the configuration
    /// without resetting the latch.
    pub fn on_screen_off(&self) -> ActivationReport {
        let mut res = self.resources.lock();
        if self.state.current().is_active() {
            debug!("screen-off while already sensing, re-applying configuration");
            return self.apply_locked(&mut res);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(session_id = %session_id, generation = self.latch.generation(), "session_started");
        res.session_id = Some(session_id);
        let _ = self.state.transition(EngineState::Sensing);
        self.apply_locked(&mut res)
    }

    /// Sensing/WakePending → Idle. The only point where the latch clears.
    pub fn on_screen_on(&self) {
        let mut res = self.resources.lock();
        self.teardown_locked(&mut res);
        self.ledger.lock().release_all();
        self.log_latency_tail();
        let generation = self.latch.clear_and_advance();
        self.state.force_idle();
        if let Some(session_id) = res.session_id.take() {
            info!(session_id = %session_id, next_generation = generation, "session_ended");
        }
    }

    /// Settings changed. Re-runs the activation cycle while sensing; otherwise
    /// the new snapshot is picked up at the next screen-off.
    pub fn reconfigure(&self) -> Option<ActivationReport> {
        let mut res = self.resources.lock();
        if !self.state.current().is_active() {
            debug!("reconfigure while idle, deferred to next session");
            return None;
        }
        Some(self.apply_locked(&mut res))
    }

    /// Feed session events from a channel on a dedicated thread until the
    /// sender side is dropped.
    pub fn spawn_event_listener(
        self: &Arc<Self>,
        events: cb::Receiver<SessionEvent>,
    ) -> Result<JoinHandle<()>, EngineError> {
        let coordinator = Arc::clone(self);
        std::thread::Builder::new()
            .name("session-events".into())
            .spawn(move || {
                for event in events.iter() {
                    debug!(event = ?event, "session_event");
                    coordinator.handle_event(event);
                }
                info!("session event channel closed");
            })
            .map_err(|e| EngineError::CaptureStartFailure(format!("failed to spawn event listener: {e}")))
    }

    pub fn state(&self) -> EngineState {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn wake_lock_held(&self) -> bool {
        self.ledger.lock().is_held()
    }

    pub fn has_fired(&self) -> bool {
        self.latch.has_fired()
    }

    /// Latest activation outcome, updated if the sound loop has since failed.
    pub fn last_report(&self) -> Option<ActivationReport> {
        let res = self.resources.lock();
        let mut report = res.last_report.clone()?;
        if let Some(e) = res.sound.as_ref().and_then(SoundBurstDetector::failure) {
            report.sound = SoundStatus::Unavailable(e);
            report.wake_lock_held = self.ledger.lock().is_held();
        }
        Some(report)
    }

    /// Full deactivate/activate cycle against a fresh settings snapshot.
    /// A temporary holder bridges the cycle so the wake-lock never drops
    /// while a still-needed holder is being re-registered.
    fn apply_locked(&self, res: &mut SessionResources) -> ActivationReport {
        {
            let mut ledger = self.ledger.lock();
            if ledger.is_held() {
                let _ = ledger.hold(WakeLockHolder::Reconfigure);
            }
        }
        self.teardown_locked(res);

        let settings = self.settings.snapshot();
        if let Err(e) = settings.validate() {
            warn!(error = %e, "settings snapshot invalid, duplicate channels skipped");
        }

        let epoch = self.hub.begin_registration();
        let guard = self.latch.guard();
        let mut seen = HashSet::new();
        let mut activated = Vec::new();
        let mut failed = Vec::new();

        for config in settings.enabled_channels() {
            let kind = config.kind();
            if !seen.insert(kind) {
                continue;
            }
            self.hub.install(config, &self.tuning);
            let sink = self.hub.sink(kind, epoch, guard.clone());
            match self.motion.try_activate(config, sink) {
                Ok(handle) => {
                    if !handle.wake_capable {
                        if let Err(e) = self.ledger.lock().hold(WakeLockHolder::Channel(kind)) {
                            warn!(channel = %kind, error = %e, "could not keep processor awake for channel");
                        }
                    }
                    info!(
                        channel = %kind,
                        wake_capable = handle.wake_capable,
                        threshold = config.magnitude_threshold(),
                        "channel_activated"
                    );
                    res.handles.push(handle);
                    activated.push(kind);
                }
                Err(e) => {
                    self.hub.remove(kind);
                    self.metrics.increment(metric_names::CHANNEL_ACTIVATION_FAILED);
                    warn!(channel = %kind, error = %e, "channel activation failed, omitted");
                    let e = match e {
                        EngineError::CaptureStartFailure(_) => EngineError::HardwareUnavailable(kind),
                        other => other,
                    };
                    failed.push((kind, e));
                }
            }
        }

        let sound = if settings.sound_enabled {
            self.start_sound_locked(res, guard)
        } else {
            SoundStatus::Disabled
        };

        let wake_lock_held = {
            let mut ledger = self.ledger.lock();
            ledger.release(WakeLockHolder::Reconfigure);
            ledger.is_held()
        };

        let report = ActivationReport {
            session_id: res.session_id.clone().unwrap_or_default(),
            activated,
            failed,
            sound,
            wake_lock_held,
            nothing_configured: settings.nothing_enabled(),
        };
        if report.nothing_active() {
            warn!(
                nothing_configured = report.nothing_configured,
                "no detector active this session"
            );
        }
        info!(
            session_id = %report.session_id,
            channels = report.activated.len(),
            failed = report.failed.len(),
            sound = ?report.sound,
            wake_lock = report.wake_lock_held,
            "detectors_applied"
        );
        res.last_report = Some(report.clone());
        report
    }

    fn start_sound_locked(&self, res: &mut SessionResources, guard: LatchGuard) -> SoundStatus {
        if !self.audio.has_permission() {
            warn!("sound detection enabled but capture permission missing");
            return SoundStatus::Unavailable(EngineError::PermissionDenied);
        }
        let stream = match self.audio.try_open() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "audio capture failed to open");
                return SoundStatus::Unavailable(e);
            }
        };
        // The read loop needs the processor running no matter what.
        if let Err(e) = self.ledger.lock().hold(WakeLockHolder::Sound) {
            warn!(error = %e, "could not keep processor awake for sound detection");
        }
        let ledger = Arc::clone(&self.ledger);
        let ctx = SoundContext {
            guard,
            decisions: self.dispatcher.sender(),
            clock: Arc::clone(&self.clock),
            tuning: self.tuning,
            metrics: Arc::clone(&self.metrics),
            on_failure: Some(Box::new(move |e: &EngineError| {
                warn!(error = %e, "sound detection stopped for this session");
                ledger.lock().release(WakeLockHolder::Sound);
            })),
        };
        match SoundBurstDetector::start(stream, ctx) {
            Ok(detector) => {
                res.sound = Some(detector);
                SoundStatus::Active
            }
            Err(e) => {
                self.ledger.lock().release(WakeLockHolder::Sound);
                warn!(error = %e, "sound detector failed to start");
                SoundStatus::Unavailable(e)
            }
        }
    }

    /// Unregister everything this session registered. Safe to call when
    /// nothing was ever started. Does not touch the Reconfigure holder.
    fn teardown_locked(&self, res: &mut SessionResources) {
        self.hub.clear();
        if let Some(mut sound) = res.sound.take() {
            sound.stop();
        }
        for handle in res.handles.drain(..) {
            self.motion.deactivate(handle);
            debug!(channel = %handle.kind, "channel_deactivated");
        }
        let mut ledger = self.ledger.lock();
        ledger.release(WakeLockHolder::Sound);
        for kind in SensorKind::ALL {
            ledger.release(WakeLockHolder::Channel(kind));
        }
    }

    fn log_latency_tail(&self) {
        for name in [
            metric_names::SAMPLE_OBSERVE,
            metric_names::FRAME_OBSERVE,
            metric_names::WAKE_DISPATCH,
            metric_names::WAKE_ACTION,
        ] {
            if let Some(p99) = self.metrics.latency_percentile(name, 99.0) {
                debug!(metric = name, p99_us = p99.as_micros() as u64, "latency_tail");
            }
        }
    }
}

impl Drop for DetectionCoordinator {
    fn drop(&mut self) {
        let mut res = self.resources.lock();
        self.teardown_locked(&mut res);
        self.ledger.lock().release_all();
    }
}
