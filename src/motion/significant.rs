//! One-shot significant-motion trigger.
//! The hardware primitive disarms itself after firing, so the trigger has to
//! be armed explicitly at the start of every off-session.

#[derive(Debug, Default)]
pub struct SignificantMotionTrigger {
    armed: bool,
}

impl SignificantMotionTrigger {
    /// A fresh trigger is armed.
    pub fn armed() -> Self {
        Self { armed: true }
    }

    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Consume the hardware event. True only for the first event after arming.
    pub fn fire(&mut self) -> bool {
        std::mem::replace(&mut self.armed, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_until_rearmed() {
        let mut trigger = SignificantMotionTrigger::armed();
        assert!(trigger.fire());
        assert!(!trigger.fire());
        assert!(!trigger.is_armed());
        trigger.arm();
        assert!(trigger.fire());
    }

    #[test]
    fn test_default_is_disarmed() {
        let mut trigger = SignificantMotionTrigger::default();
        assert!(!trigger.fire());
    }
}
