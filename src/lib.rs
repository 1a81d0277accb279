//! Wakeup engine: wake the device on shake or sound while the screen is off.
//!
//! Motion samples and audio frames flow one way, from the platform sources
//! through per-signal detectors into a single per-session wake latch, and the
//! latched decision is handed to the external wake action on its own thread.
//! Settings flow the other way: a snapshot is read on every (re)activation.

pub mod audio;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod latch;
pub mod metrics;
pub mod motion;
pub mod power;
pub mod state_machine;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{DetectionTuning, EngineSettings, SensorChannelConfig, SensorKind, SettingsStore, StaticSettings};
pub use coordinator::{ActivationReport, Collaborators, DetectionCoordinator, SessionEvent, SoundStatus};
pub use dispatch::WakeAction;
pub use error::EngineError;
pub use latch::WakeSource;
pub use state_machine::EngineState;

/// Install the fmt subscriber. `RUST_LOG` overrides the default filter.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("wakeup_engine=debug")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}

/// Same as [`init_tracing`] with one JSON object per line, for log shipping
/// from long unattended runs.
pub fn init_json_tracing() {
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("wakeup_engine=info")),
        )
        .with_thread_ids(true)
        .try_init();
}
