//! Wake dispatch: detectors only latch a decision and enqueue it; the wake
//! action runs on a dedicated OS thread so no sample or frame path ever
//! blocks on the platform's wake-up side effect.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel as cb;
use tracing::{debug, error, info, warn};

use crate::config::DetectionTuning;
use crate::error::EngineError;
use crate::latch::{LatchGuard, WakeLatch, WakeSource};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::power::{PowerControl, ScreenWakePulse};
use crate::state_machine::{EngineState, StateMachine};

/// Performs the actual device/UI wake-up. Invoked at most once per session.
pub trait WakeAction: Send + Sync {
    fn wake(&self, source: WakeSource) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
pub struct WakeRequest {
    pub source: WakeSource,
    pub generation: u64,
    pub detected_at: Instant,
}

enum DispatchMsg {
    Wake(WakeRequest),
    Shutdown,
}

/// Cloneable handle detectors use to report a decision.
#[derive(Clone)]
pub struct DecisionSender {
    tx: cb::Sender<DispatchMsg>,
    state: Arc<StateMachine>,
    metrics: Arc<MetricsRegistry>,
}

impl DecisionSender {
    /// Latch and enqueue. Returns true only for the single winning decision
    /// of the guard's session.
    pub fn decide(&self, guard: &LatchGuard, source: WakeSource) -> bool {
        if !guard.try_fire() {
            self.metrics.increment(metric_names::WAKE_SUPPRESSED);
            debug!(source = %source, generation = guard.generation(), "wake_decision_suppressed");
            return false;
        }
        self.metrics.increment(metric_names::WAKE_FIRED);
        self.mark_pending(guard);
        info!(source = %source, generation = guard.generation(), "wake_decision_latched");

        let request = WakeRequest {
            source,
            generation: guard.generation(),
            detected_at: Instant::now(),
        };
        if self.tx.send(DispatchMsg::Wake(request)).is_err() {
            error!("wake dispatch thread gone, decision dropped");
        }
        true
    }

    /// A screen-on may have ended the guard's session since it fired; the
    /// next session's state must not be touched.
    fn mark_pending(&self, guard: &LatchGuard) {
        if self
            .state
            .transition_if(EngineState::WakePending, || guard.is_current())
            .is_none()
        {
            debug!(generation = guard.generation(), "session ended before wake, state left alone");
        }
    }
}

/// Owns the dispatch thread. Dropping it stops and joins the thread.
pub struct WakeDispatcher {
    tx: cb::Sender<DispatchMsg>,
    thread: Option<JoinHandle<()>>,
    state: Arc<StateMachine>,
    metrics: Arc<MetricsRegistry>,
}

impl WakeDispatcher {
    pub fn spawn(
        latch: Arc<WakeLatch>,
        state: Arc<StateMachine>,
        power: Arc<dyn PowerControl>,
        action: Arc<dyn WakeAction>,
        tuning: DetectionTuning,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, EngineError> {
        let (tx, rx) = cb::unbounded();
        let loop_metrics = Arc::clone(&metrics);
        let thread = std::thread::Builder::new()
            .name("wake-dispatch".into())
            .spawn(move || {
                run_dispatch_loop(rx, latch, power, action, tuning, loop_metrics);
            })
            .map_err(|e| EngineError::CaptureStartFailure(format!("failed to spawn wake dispatch thread: {e}")))?;

        Ok(Self {
            tx,
            thread: Some(thread),
            state,
            metrics,
        })
    }

    pub fn sender(&self) -> DecisionSender {
        DecisionSender {
            tx: self.tx.clone(),
            state: Arc::clone(&self.state),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl Drop for WakeDispatcher {
    fn drop(&mut self) {
        let _ = self.tx.send(DispatchMsg::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run_dispatch_loop(
    rx: cb::Receiver<DispatchMsg>,
    latch: Arc<WakeLatch>,
    power: Arc<dyn PowerControl>,
    action: Arc<dyn WakeAction>,
    tuning: DetectionTuning,
    metrics: Arc<MetricsRegistry>,
) {
    info!("wake dispatch loop started");
    loop {
        match rx.recv() {
            Ok(DispatchMsg::Wake(request)) => {
                handle_wake_request(request, &latch, &power, &action, &tuning, &metrics);
            }
            Ok(DispatchMsg::Shutdown) | Err(cb::RecvError) => {
                info!("wake dispatch loop exiting");
                break;
            }
        }
    }
}

fn handle_wake_request(
    request: WakeRequest,
    latch: &WakeLatch,
    power: &Arc<dyn PowerControl>,
    action: &Arc<dyn WakeAction>,
    tuning: &DetectionTuning,
    metrics: &MetricsRegistry,
) {
    // Session ended (screen came on) before we got here.
    if latch.generation() != request.generation {
        debug!(
            source = %request.source,
            generation = request.generation,
            "stale wake request dropped"
        );
        return;
    }
    metrics.record_latency(metric_names::WAKE_DISPATCH, request.detected_at.elapsed());

    let _pulse = if power.is_screen_on() {
        None
    } else {
        Some(ScreenWakePulse::acquire(Arc::clone(power), tuning.screen_wake_pulse))
    };

    let started = Instant::now();
    match action.wake(request.source) {
        Ok(()) => info!(source = %request.source, "wake_action_done"),
        Err(e) => warn!(source = %request.source, error = %e, "wake action failed"),
    }
    metrics.record_latency(metric_names::WAKE_ACTION, started.elapsed());
}
