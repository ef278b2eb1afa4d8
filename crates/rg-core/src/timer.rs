//! One-shot and periodic timers
//!
//! A `Timer` is a deadline against the loop clock. Components embed timers,
//! arm and reset them from their event handlers, and poll them from their
//! `tick`. The loop sleeps until the earliest deadline of any component.

/// One-shot or periodic millisecond timer
#[derive(Debug, Clone)]
pub struct Timer {
    timeout_ms: u64,
    periodic: bool,
    deadline: Option<u64>,
}

impl Timer {
    pub fn one_shot(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            periodic: false,
            deadline: None,
        }
    }

    pub fn periodic(interval_ms: u64) -> Self {
        Self {
            timeout_ms: interval_ms,
            periodic: true,
            deadline: None,
        }
    }

    /// Change the timeout. A running timer keeps its current deadline.
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
    }

    pub fn timeout(&self) -> u64 {
        self.timeout_ms
    }

    /// Arm the timer relative to `now_ms`
    pub fn start(&mut self, now_ms: u64) {
        self.deadline = Some(now_ms + self.timeout_ms);
    }

    /// Disarm without firing
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// Restart from now; equivalent to start for a stopped timer
    pub fn reset(&mut self, now_ms: u64) {
        self.start(now_ms);
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Check for expiry. A one-shot timer disarms itself, a periodic timer
    /// re-arms relative to its previous deadline so the cadence has no drift.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        match self.deadline {
            Some(deadline) if now_ms >= deadline => {
                if self.periodic {
                    self.deadline = Some(deadline + self.timeout_ms);
                } else {
                    self.deadline = None;
                }
                true
            }
            _ => false,
        }
    }
}

/// Earliest deadline among a set of timers
pub fn earliest_deadline(timers: &[&Timer]) -> Option<u64> {
    timers.iter().filter_map(|t| t.deadline()).min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_fires_once() {
        let mut t = Timer::one_shot(100);
        t.start(0);
        assert!(!t.poll(99));
        assert!(t.poll(100));
        assert!(!t.poll(200));
        assert!(!t.is_running());
    }

    #[test]
    fn test_periodic_rearms_without_drift() {
        let mut t = Timer::periodic(50);
        t.start(0);
        assert!(t.poll(55));
        assert_eq!(t.deadline(), Some(100));
        assert!(t.poll(100));
        assert_eq!(t.deadline(), Some(150));
    }

    #[test]
    fn test_reset_pushes_deadline() {
        let mut t = Timer::one_shot(100);
        t.start(0);
        t.reset(80);
        assert!(!t.poll(100));
        assert!(t.poll(180));
    }

    #[test]
    fn test_stop_disarms() {
        let mut t = Timer::one_shot(10);
        t.start(0);
        t.stop();
        assert!(!t.poll(1000));
    }

    #[test]
    fn test_earliest_deadline() {
        let mut a = Timer::one_shot(100);
        let mut b = Timer::one_shot(50);
        a.start(0);
        b.start(0);
        assert_eq!(earliest_deadline(&[&a, &b]), Some(50));
        b.stop();
        assert_eq!(earliest_deadline(&[&a, &b]), Some(100));
    }
}
