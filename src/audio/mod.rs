//! Sound burst detection.
//! Capture stream → mean absolute amplitude per frame → envelope → decision.
//! The read loop runs on its own thread, blocks at most one frame per read,
//! and checks its stop token on every iteration.

pub mod envelope;
pub mod ring_buffer;

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::DetectionTuning;
use crate::dispatch::DecisionSender;
use crate::error::EngineError;
use crate::latch::{LatchGuard, WakeSource};
use crate::metrics::{metric_names, MetricsRegistry};

use envelope::{mean_abs_amplitude, BurstOutcome, SoundEnvelope};

/// Continuous capture stream of 16-bit mono PCM.
pub trait AudioStream: Send {
    /// Wait for the next full frame, at most about one frame period.
    /// `Ok(0)` means nothing arrived in time.
    fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize, EngineError>;

    /// Stop capturing and release the device. Idempotent.
    fn close(&mut self);
}

/// Platform audio facility.
pub trait AudioCaptureSource: Send + Sync {
    /// Whether the runtime capture permission is granted.
    fn has_permission(&self) -> bool;

    /// Fails with `PermissionDenied` when the grant is absent.
    fn try_open(&self) -> Result<Box<dyn AudioStream>, EngineError>;
}

/// Run once on the loop thread when capture fails mid-session.
pub type SoundFailureHook = Box<dyn FnOnce(&EngineError) + Send>;

/// What the sound loop needs from the engine.
pub struct SoundContext {
    pub guard: LatchGuard,
    pub decisions: DecisionSender,
    pub clock: Arc<dyn Clock>,
    pub tuning: DetectionTuning,
    pub metrics: Arc<MetricsRegistry>,
    pub on_failure: Option<SoundFailureHook>,
}

/// Handle to a running sound loop. Stopping is idempotent and joins the thread.
pub struct SoundBurstDetector {
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<EngineError>>>,
}

impl SoundBurstDetector {
    pub fn start(stream: Box<dyn AudioStream>, ctx: SoundContext) -> Result<Self, EngineError> {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let failure = Arc::new(Mutex::new(None));
        let loop_failure = Arc::clone(&failure);
        let thread = std::thread::Builder::new()
            .name("sound-burst".into())
            .spawn(move || run_sound_loop(stream, ctx, loop_token, loop_failure))
            .map_err(|e| EngineError::CaptureStartFailure(format!("failed to spawn sound thread: {e}")))?;
        Ok(Self {
            token,
            thread: Some(thread),
            failure,
        })
    }

    /// Why the loop gave up, if capture failed before it was stopped.
    pub fn failure(&self) -> Option<EngineError> {
        self.failure.lock().clone()
    }

    pub fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SoundBurstDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_sound_loop(
    mut stream: Box<dyn AudioStream>,
    mut ctx: SoundContext,
    token: CancellationToken,
    failure: Arc<Mutex<Option<EngineError>>>,
) {
    let mut envelope = SoundEnvelope::new(&ctx.tuning);
    let mut frame = vec![0i16; ctx.tuning.frame_size.max(1)];

    info!(generation = ctx.guard.generation(), "sound loop started");

    while !token.is_cancelled() {
        let read = match stream.read_frame(&mut frame) {
            Ok(n) => n,
            Err(e) if token.is_cancelled() => {
                debug!(error = %e, "audio read failed during stop");
                break;
            }
            Err(e) => {
                warn!(error = %e, "audio read failed, sound detection inactive");
                ctx.metrics.increment(metric_names::SOUND_LOOP_FAILED);
                *failure.lock() = Some(e.clone());
                if let Some(hook) = ctx.on_failure.take() {
                    hook(&e);
                }
                break;
            }
        };
        // Stop requested while we were blocked: no further decisions.
        if token.is_cancelled() {
            break;
        }
        if read == 0 {
            continue;
        }
        if read > frame.len() {
            ctx.metrics.increment(metric_names::FRAME_OVERREAD);
            debug!(read, frame = frame.len(), "stream reported more samples than the frame holds");
        }
        let read = read.min(frame.len());

        let timer = ctx.metrics.timer(metric_names::FRAME_OBSERVE);
        let amplitude = mean_abs_amplitude(&frame[..read]);
        let outcome = envelope.observe(amplitude, ctx.clock.now_ms());
        timer.stop();

        match outcome {
            BurstOutcome::Completed { duration_ms } => {
                info!(duration_ms, "sound_burst_completed");
                if ctx.guard.should_continue() {
                    ctx.decisions.decide(&ctx.guard, WakeSource::Sound);
                }
            }
            BurstOutcome::Discarded { duration_ms } => {
                ctx.metrics.increment(metric_names::BURST_DISCARDED);
                debug!(duration_ms, "sound burst outside window, discarded");
            }
            BurstOutcome::Started => debug!(amplitude, "sound_burst_started"),
            BurstOutcome::Continuing | BurstOutcome::Quiet => {}
        }
    }

    if envelope.burst_active() {
        debug!(
            started_at_ms = envelope.burst_start_timestamp(),
            "capture stopped mid-burst, burst abandoned"
        );
    }
    stream.close();
    info!("sound loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dispatch::WakeDispatcher;
    use crate::latch::WakeLatch;
    use crate::power::{PowerControl, WakeLockHandle, WakeLockKind};
    use crate::state_machine::{EngineState, StateMachine};
    use crossbeam_channel as cb;
    use std::collections::VecDeque;
    use std::time::Duration;

    enum Step {
        Level(i16),
        Fail,
    }

    /// Replays frames, advancing the clock one step per frame.
    struct ScriptedStream {
        steps: VecDeque<Step>,
        clock: Arc<ManualClock>,
        step_ms: u64,
        /// Report one sample more than the buffer holds.
        overread: bool,
        closed: cb::Sender<()>,
    }

    impl AudioStream for ScriptedStream {
        fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize, EngineError> {
            match self.steps.pop_front() {
                Some(Step::Level(level)) => {
                    self.clock.advance(self.step_ms);
                    buf.iter_mut().for_each(|s| *s = level);
                    Ok(buf.len() + usize::from(self.overread))
                }
                Some(Step::Fail) => Err(EngineError::CaptureStartFailure("device unplugged".into())),
                None => {
                    std::thread::sleep(Duration::from_millis(2));
                    Ok(0)
                }
            }
        }

        fn close(&mut self) {
            let _ = self.closed.send(());
        }
    }

    struct ScreenOff;

    impl PowerControl for ScreenOff {
        fn is_screen_on(&self) -> bool {
            false
        }
        fn acquire_wake_lock(
            &self,
            kind: WakeLockKind,
            _timeout: Option<Duration>,
        ) -> Result<WakeLockHandle, EngineError> {
            Ok(WakeLockHandle { id: 1, kind })
        }
        fn release_wake_lock(&self, _handle: WakeLockHandle) {}
    }

    struct ChannelAction(cb::Sender<WakeSource>);

    impl crate::dispatch::WakeAction for ChannelAction {
        fn wake(&self, source: WakeSource) -> Result<(), EngineError> {
            let _ = self.0.send(source);
            Ok(())
        }
    }

    fn script(loud_frames: usize) -> VecDeque<Step> {
        let mut steps = VecDeque::new();
        steps.extend((0..3).map(|_| Step::Level(0)));
        steps.extend((0..loud_frames).map(|_| Step::Level(6000)));
        steps.extend((0..3).map(|_| Step::Level(0)));
        steps
    }

    struct Outcome {
        woke: Option<WakeSource>,
        closed: bool,
        failure: Option<EngineError>,
        hook_error: Option<EngineError>,
        metrics: Arc<MetricsRegistry>,
    }

    fn run_with(steps: VecDeque<Step>, overread: bool) -> Outcome {
        let latch = Arc::new(WakeLatch::new());
        let state = Arc::new(StateMachine::new());
        state.transition(EngineState::Sensing).unwrap();
        let metrics = Arc::new(MetricsRegistry::new());
        let (wake_tx, wake_rx) = cb::unbounded();
        let tuning = DetectionTuning {
            frame_size: 32,
            ..DetectionTuning::default()
        };
        let dispatcher = WakeDispatcher::spawn(
            Arc::clone(&latch),
            Arc::clone(&state),
            Arc::new(ScreenOff),
            Arc::new(ChannelAction(wake_tx)),
            tuning,
            Arc::clone(&metrics),
        )
        .unwrap();

        let clock = Arc::new(ManualClock::new(0));
        let (closed_tx, closed_rx) = cb::unbounded();
        let (hook_tx, hook_rx) = cb::unbounded();
        let stream = ScriptedStream {
            steps,
            clock: Arc::clone(&clock),
            step_ms: 100,
            overread,
            closed: closed_tx,
        };
        let mut detector = SoundBurstDetector::start(
            Box::new(stream),
            SoundContext {
                guard: latch.guard(),
                decisions: dispatcher.sender(),
                clock,
                tuning,
                metrics: Arc::clone(&metrics),
                on_failure: Some(Box::new(move |e: &EngineError| {
                    let _ = hook_tx.send(e.clone());
                })),
            },
        )
        .unwrap();

        let woke = wake_rx.recv_timeout(Duration::from_millis(500)).ok();
        let hook_error = hook_rx.recv_timeout(Duration::from_millis(100)).ok();
        detector.stop();
        detector.stop();
        let closed = closed_rx.recv_timeout(Duration::from_millis(500)).is_ok();
        Outcome {
            woke,
            closed,
            failure: detector.failure(),
            hook_error,
            metrics,
        }
    }

    fn run(steps: VecDeque<Step>) -> Outcome {
        run_with(steps, false)
    }

    #[test]
    fn test_two_second_burst_wakes() {
        let out = run(script(20));
        assert_eq!(out.woke, Some(WakeSource::Sound));
        assert!(out.closed);
        assert_eq!(out.failure, None);
        assert_eq!(out.hook_error, None);
    }

    #[test]
    fn test_click_does_not_wake() {
        let out = run(script(3));
        assert_eq!(out.woke, None);
        assert!(out.closed);
    }

    #[test]
    fn test_continuous_noise_does_not_wake() {
        assert_eq!(run(script(40)).woke, None);
    }

    #[test]
    fn test_overlong_read_count_is_clamped() {
        let out = run_with(script(20), true);
        assert_eq!(out.woke, Some(WakeSource::Sound));
        assert_eq!(out.failure, None);
        assert!(out.metrics.count(metric_names::FRAME_OVERREAD) > 0);
    }

    #[test]
    fn test_read_error_is_reported_once() {
        let mut steps = script(2);
        steps.push_back(Step::Fail);
        steps.push_back(Step::Fail);
        let out = run(steps);
        let expected = EngineError::CaptureStartFailure("device unplugged".into());
        assert_eq!(out.woke, None);
        assert!(out.closed);
        assert_eq!(out.hook_error, Some(expected.clone()));
        assert_eq!(out.failure, Some(expected));
        assert_eq!(out.metrics.count(metric_names::SOUND_LOOP_FAILED), 1);
    }
}
