//! Error taxonomy for the detection engine.
//! Every failure is local to one detector; none of these abort the coordinator.

use crate::config::SensorKind;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// No matching sensor for the requested channel (or it is already claimed).
    HardwareUnavailable(SensorKind),
    /// Audio capture requested without the runtime grant.
    PermissionDenied,
    /// The underlying audio/sensor registration threw.
    CaptureStartFailure(String),
    /// The power collaborator refused a wake-lock.
    WakeLockUnavailable(String),
    /// The external wake action reported a failure.
    WakeActionFailed(String),
    /// A settings snapshot failed validation.
    InvalidSettings(String),
}

impl EngineError {
    /// Whether the failure means "this capability did not activate".
    /// `CaptureStartFailure` is treated the same as missing hardware.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            EngineError::HardwareUnavailable(_)
                | EngineError::CaptureStartFailure(_)
                | EngineError::PermissionDenied
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::HardwareUnavailable(kind) => write!(f, "no hardware for channel {kind}"),
            EngineError::PermissionDenied => write!(f, "audio capture permission denied"),
            EngineError::CaptureStartFailure(msg) => write!(f, "capture start failed: {msg}"),
            EngineError::WakeLockUnavailable(msg) => write!(f, "wake-lock unavailable: {msg}"),
            EngineError::WakeActionFailed(msg) => write!(f, "wake action failed: {msg}"),
            EngineError::InvalidSettings(msg) => write!(f, "invalid settings: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(EngineError::HardwareUnavailable(SensorKind::Gyroscope).is_unavailable());
        assert!(EngineError::CaptureStartFailure("busy".into()).is_unavailable());
        assert!(EngineError::PermissionDenied.is_unavailable());
        assert!(!EngineError::WakeActionFailed("x".into()).is_unavailable());
    }

    #[test]
    fn test_display_names_channel() {
        let msg = EngineError::HardwareUnavailable(SensorKind::Accelerometer).to_string();
        assert_eq!(msg, "no hardware for channel Accelerometer");
    }
}
