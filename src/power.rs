//! Wake-lock ownership. The coordinator is the only owner of the shared
//! processor lock; it tracks holders so re-registration never leaks the lock
//! nor drops it while someone still needs it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::SensorKind;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeLockKind {
    /// Keeps the processor running with the screen off.
    Partial,
    /// Turns the display on and causes a wake-up.
    ScreenBright,
}

/// Opaque lock handle issued by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakeLockHandle {
    pub id: u64,
    pub kind: WakeLockKind,
}

/// Platform power facility.
pub trait PowerControl: Send + Sync {
    fn is_screen_on(&self) -> bool;

    /// `timeout = None` holds until released.
    fn acquire_wake_lock(
        &self,
        kind: WakeLockKind,
        timeout: Option<Duration>,
    ) -> Result<WakeLockHandle, EngineError>;

    fn release_wake_lock(&self, handle: WakeLockHandle);
}

/// Who needs the processor kept awake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeLockHolder {
    /// A channel running on hardware that cannot wake the processor itself.
    Channel(SensorKind),
    /// The sound loop always needs the processor powered.
    Sound,
    /// Held across a reconfiguration cycle.
    Reconfigure,
}

/// Holder-set accounting for the single shared partial wake-lock.
/// The platform lock is acquired on the first holder and released with the last.
pub struct WakeLockLedger {
    power: Arc<dyn PowerControl>,
    holders: HashSet<WakeLockHolder>,
    handle: Option<WakeLockHandle>,
}

impl WakeLockLedger {
    pub fn new(power: Arc<dyn PowerControl>) -> Self {
        Self {
            power,
            holders: HashSet::new(),
            handle: None,
        }
    }

    /// Register a holder. Holding twice is a no-op.
    pub fn hold(&mut self, holder: WakeLockHolder) -> Result<(), EngineError> {
        if self.handle.is_none() {
            let handle = self.power.acquire_wake_lock(WakeLockKind::Partial, None)?;
            info!(lock_id = handle.id, holder = ?holder, "wake_lock_acquired");
            self.handle = Some(handle);
        }
        if self.holders.insert(holder) {
            debug!(holder = ?holder, holders = self.holders.len(), "wake_lock_holder_added");
        }
        Ok(())
    }

    /// Drop a holder; the lock goes with the last one. Unknown holders are ignored.
    pub fn release(&mut self, holder: WakeLockHolder) {
        if !self.holders.remove(&holder) {
            return;
        }
        debug!(holder = ?holder, holders = self.holders.len(), "wake_lock_holder_removed");
        if self.holders.is_empty() {
            self.release_platform_lock();
        }
    }

    pub fn release_all(&mut self) {
        self.holders.clear();
        self.release_platform_lock();
    }

    pub fn is_held(&self) -> bool {
        self.handle.is_some()
    }

    pub fn holder_count(&self) -> usize {
        self.holders.len()
    }

    fn release_platform_lock(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.power.release_wake_lock(handle);
            info!(lock_id = handle.id, "wake_lock_released");
        }
    }
}

impl Drop for WakeLockLedger {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Screen-bright, wake-causing lock held for a bounded pulse.
/// Released when dropped, so the wake action failing cannot leak it.
pub struct ScreenWakePulse {
    power: Arc<dyn PowerControl>,
    handle: Option<WakeLockHandle>,
}

impl ScreenWakePulse {
    pub fn acquire(power: Arc<dyn PowerControl>, duration: Duration) -> Self {
        let handle = match power.acquire_wake_lock(WakeLockKind::ScreenBright, Some(duration)) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "screen wake lock unavailable, continuing without it");
                None
            }
        };
        Self { power, handle }
    }

    pub fn is_held(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for ScreenWakePulse {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.power.release_wake_lock(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingPower {
        next_id: AtomicU64,
        held: Mutex<Vec<WakeLockHandle>>,
        acquired: AtomicU64,
        fail: bool,
    }

    impl PowerControl for CountingPower {
        fn is_screen_on(&self) -> bool {
            false
        }

        fn acquire_wake_lock(
            &self,
            kind: WakeLockKind,
            _timeout: Option<Duration>,
        ) -> Result<WakeLockHandle, EngineError> {
            if self.fail {
                return Err(EngineError::WakeLockUnavailable("denied".into()));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            let handle = WakeLockHandle {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                kind,
            };
            self.held.lock().push(handle);
            Ok(handle)
        }

        fn release_wake_lock(&self, handle: WakeLockHandle) {
            self.held.lock().retain(|h| *h != handle);
        }
    }

    #[test]
    fn test_two_channels_release_one_still_held() {
        let power = Arc::new(CountingPower::default());
        let mut ledger = WakeLockLedger::new(power.clone());
        ledger.hold(WakeLockHolder::Channel(SensorKind::Accelerometer)).unwrap();
        ledger.hold(WakeLockHolder::Channel(SensorKind::Gyroscope)).unwrap();
        assert_eq!(power.acquired.load(Ordering::SeqCst), 1);

        ledger.release(WakeLockHolder::Channel(SensorKind::Gyroscope));
        assert!(ledger.is_held());
        assert_eq!(power.held.lock().len(), 1);

        ledger.release(WakeLockHolder::Channel(SensorKind::Accelerometer));
        assert!(!ledger.is_held());
        assert!(power.held.lock().is_empty());
    }

    #[test]
    fn test_double_hold_and_unknown_release() {
        let power = Arc::new(CountingPower::default());
        let mut ledger = WakeLockLedger::new(power.clone());
        ledger.hold(WakeLockHolder::Sound).unwrap();
        ledger.hold(WakeLockHolder::Sound).unwrap();
        assert_eq!(ledger.holder_count(), 1);
        ledger.release(WakeLockHolder::Channel(SensorKind::Gyroscope));
        assert!(ledger.is_held());
        ledger.release(WakeLockHolder::Sound);
        assert!(!ledger.is_held());
    }

    #[test]
    fn test_failed_acquire_registers_nothing() {
        let power = Arc::new(CountingPower {
            fail: true,
            ..Default::default()
        });
        let mut ledger = WakeLockLedger::new(power);
        assert!(ledger.hold(WakeLockHolder::Sound).is_err());
        assert_eq!(ledger.holder_count(), 0);
        assert!(!ledger.is_held());
    }

    #[test]
    fn test_drop_releases() {
        let power = Arc::new(CountingPower::default());
        {
            let mut ledger = WakeLockLedger::new(power.clone());
            ledger.hold(WakeLockHolder::Sound).unwrap();
        }
        assert!(power.held.lock().is_empty());
    }

    #[test]
    fn test_pulse_released_on_drop() {
        let power = Arc::new(CountingPower::default());
        {
            let pulse = ScreenWakePulse::acquire(power.clone(), Duration::from_secs(3));
            assert!(pulse.is_held());
            assert_eq!(power.held.lock()[0].kind, WakeLockKind::ScreenBright);
        }
        assert!(power.held.lock().is_empty());
    }
}
