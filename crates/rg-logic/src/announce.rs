//! Announce logic
//!
//! Transmit-only logic that periodically raises an announcement event.
//! Announcements are suppressed while the logic has traffic and are rate
//! limited by a minimum interval.

use rg_core::{Timer, TxCtrlMode};

use crate::Logic;
use crate::logic::LogicCore;

pub struct AnnounceLogic {
    core: LogicCore,
    interval_timer: Timer,
    min_interval_ms: u64,
    last_announcement_ms: Option<u64>,
}

impl AnnounceLogic {
    pub fn new(core: LogicCore) -> Self {
        Self {
            core,
            interval_timer: Timer::periodic(0),
            min_interval_ms: 0,
            last_announcement_ms: None,
        }
    }

    pub fn initialize(&mut self, now_ms: u64) -> rg_core::CoreResult<()> {
        {
            let cfg = self.core.config().clone();
            let cfg = cfg.lock();
            let name = self.core.name();
            let interval: u64 = cfg.get_or(name, "ANNOUNCEMENT_INTERVAL", 3600)?;
            self.interval_timer.set_timeout(interval * 1000);
            let min: u64 = cfg.get_or(name, "MIN_ANNOUNCEMENT_INTERVAL", 0)?;
            self.min_interval_ms = min * 1000;
        }
        self.core.initialize(now_ms)?;
        self.core.set_tx_ctrl_mode(TxCtrlMode::Auto);
        self.interval_timer.start(now_ms);
        Ok(())
    }
}

impl Logic for AnnounceLogic {
    fn core(&self) -> &LogicCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LogicCore {
        &mut self.core
    }

    fn next_deadline(&self) -> Option<u64> {
        self.interval_timer.deadline()
    }

    fn tick(&mut self, now_ms: u64) {
        if self.interval_timer.poll(now_ms) && self.core.is_idle() {
            let rate_limited = self
                .last_announcement_ms
                .is_some_and(|last| now_ms.saturating_sub(last) < self.min_interval_ms);
            if !rate_limited {
                self.last_announcement_ms = Some(now_ms);
                self.core.process_event("announce", now_ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{TestEngine, core_with_config};

    #[test]
    fn test_periodic_announcement() {
        let (core, events) = core_with_config(
            "AnnounceLogic",
            "[AnnounceLogic]\nANNOUNCEMENT_INTERVAL=60\n",
            TestEngine::new(),
        );
        let mut logic = AnnounceLogic::new(core);
        logic.initialize(0).unwrap();
        logic.tick(59_000);
        assert!(!events.lock().iter().any(|e| e == "announce"));
        logic.tick(60_000);
        assert!(events.lock().iter().any(|e| e == "announce"));
    }

    #[test]
    fn test_min_interval_rate_limit() {
        let (core, events) = core_with_config(
            "AnnounceLogic",
            "[AnnounceLogic]\nANNOUNCEMENT_INTERVAL=10\nMIN_ANNOUNCEMENT_INTERVAL=30\n",
            TestEngine::new(),
        );
        let mut logic = AnnounceLogic::new(core);
        logic.initialize(0).unwrap();
        logic.tick(10_000);
        logic.tick(20_000);
        logic.tick(30_000);
        let count = events.lock().iter().filter(|e| *e == "announce").count();
        assert_eq!(count, 1);
        logic.tick(40_000);
        let count = events.lock().iter().filter(|e| *e == "announce").count();
        assert_eq!(count, 2);
    }
}
