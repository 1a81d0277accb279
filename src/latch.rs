//! Wake arbitration: one write-once latch per screen-off session.
//! Session generation and the fired bit share a single atomic word, so a
//! detector from an ended session can never set the bit for the next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::SensorKind;

/// Which detector produced a wake decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WakeSource {
    Motion(SensorKind),
    Sound,
}

impl std::fmt::Display for WakeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WakeSource::Motion(kind) => write!(f, "motion:{kind}"),
            WakeSource::Sound => write!(f, "sound"),
        }
    }
}

const FIRED_BIT: u64 = 1;

/// Process-wide single-flight latch. Bit 0 is `has_fired`, the rest is the
/// session generation.
pub struct WakeLatch {
    word: AtomicU64,
}

impl WakeLatch {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.word.load(Ordering::SeqCst) >> 1
    }

    #[inline]
    pub fn has_fired(&self) -> bool {
        self.word.load(Ordering::SeqCst) & FIRED_BIT != 0
    }

    /// Check-and-set for `generation`. Exactly one caller per generation gets `true`.
    pub fn try_fire(&self, generation: u64) -> bool {
        self.word
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                if word >> 1 != generation || word & FIRED_BIT != 0 {
                    None
                } else {
                    Some(word | FIRED_BIT)
                }
            })
            .is_ok()
    }

    /// Session boundary: clear the fired bit and move to a fresh generation.
    /// Returns the new generation.
    pub fn clear_and_advance(&self) -> u64 {
        let prev = self
            .word
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                Some(((word >> 1) + 1) << 1)
            })
            .unwrap_or_else(|word| word);
        (prev >> 1) + 1
    }

    /// Guard bound to the current generation.
    pub fn guard(self: &Arc<Self>) -> LatchGuard {
        LatchGuard {
            latch: Arc::clone(self),
            generation: self.generation(),
        }
    }
}

impl Default for WakeLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed to every detector. Checks the shared latch, never a private copy.
#[derive(Clone)]
pub struct LatchGuard {
    latch: Arc<WakeLatch>,
    generation: u64,
}

impl LatchGuard {
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Still the session this guard was issued for.
    #[inline]
    pub fn is_current(&self) -> bool {
        self.latch.generation() == self.generation
    }

    /// Current session and nobody has fired yet.
    #[inline]
    pub fn should_continue(&self) -> bool {
        self.is_current() && !self.latch.has_fired()
    }

    pub fn try_fire(&self) -> bool {
        self.latch.try_fire(self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fires_once_per_generation() {
        let latch = Arc::new(WakeLatch::new());
        let guard = latch.guard();
        assert!(guard.should_continue());
        assert!(guard.try_fire());
        assert!(!guard.try_fire());
        assert!(latch.has_fired());
        assert!(!guard.should_continue());
    }

    #[test]
    fn test_clear_opens_new_generation() {
        let latch = Arc::new(WakeLatch::new());
        let old = latch.guard();
        assert!(old.try_fire());
        let gen = latch.clear_and_advance();
        assert_eq!(gen, 1);
        assert!(!latch.has_fired());
        assert!(!old.is_current());
        assert!(!old.try_fire(), "stale guard must not fire the new session");
        let fresh = latch.guard();
        assert!(fresh.try_fire());
    }

    #[test]
    fn test_stale_guard_cannot_poison_next_session() {
        let latch = Arc::new(WakeLatch::new());
        let old = latch.guard();
        latch.clear_and_advance();
        assert!(!old.try_fire());
        assert!(!latch.has_fired());
    }

    #[test]
    fn test_concurrent_fire_single_winner() {
        let latch = Arc::new(WakeLatch::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = latch.guard();
                thread::spawn(move || (0..1000).filter(|_| guard.try_fire()).count())
            })
            .collect();
        let wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(wins, 1);
    }
}
