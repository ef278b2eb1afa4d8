//! Dummy logic
//!
//! A logic without radio hardware. Useful as a pure link endpoint in
//! network-only topologies and in tests.

use crate::Logic;
use crate::logic::LogicCore;

pub struct DummyLogic {
    core: LogicCore,
}

impl DummyLogic {
    pub fn new(core: LogicCore) -> Self {
        Self { core }
    }

    pub fn initialize(&mut self, now_ms: u64) -> rg_core::CoreResult<()> {
        self.core.initialize(now_ms)
    }
}

impl Logic for DummyLogic {
    fn core(&self) -> &LogicCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut LogicCore {
        &mut self.core
    }
}
