//! Test doubles shared by the logic test modules

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rg_core::{Config, NullRx, NullTx};
use rg_script::{EventScriptEngine, ScriptAction, ScriptResult};

use crate::logic::LogicCore;

pub type EventLog = Arc<Mutex<Vec<String>>>;

/// Script engine double: records every processed event and answers from a
/// canned result table.
pub struct TestEngine {
    pub events: EventLog,
    pub results: HashMap<String, String>,
    pub actions: Vec<ScriptAction>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            results: HashMap::new(),
            actions: Vec::new(),
        }
    }

    /// Canned result for an event name (first word of the event string)
    pub fn with_result(mut self, event: &str, result: &str) -> Self {
        self.results.insert(event.to_string(), result.to_string());
        self
    }

    pub fn queue_action(&mut self, action: ScriptAction) {
        self.actions.push(action);
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EventScriptEngine for TestEngine {
    fn load_script(&mut self, _path: &Path) -> ScriptResult<()> {
        Ok(())
    }

    fn set_variable(&mut self, _ns: &str, _name: &str, _value: &str) -> ScriptResult<()> {
        Ok(())
    }

    fn process_event(&mut self, _ns: &str, event: &str) -> ScriptResult<String> {
        self.events.lock().push(event.to_string());
        let name = event.split_whitespace().next().unwrap_or_default();
        Ok(self.results.get(name).cloned().unwrap_or_default())
    }

    fn register_command(&mut self, _name: &str) -> ScriptResult<()> {
        Ok(())
    }

    fn drain_actions(&mut self) -> Vec<ScriptAction> {
        std::mem::take(&mut self.actions)
    }
}

/// Build a core over null radio drivers from inline INI text
pub fn core_with_config(name: &str, ini: &str, engine: TestEngine) -> (LogicCore, EventLog) {
    let events = engine.events.clone();
    let mut cfg = Config::new();
    cfg.load_str(ini).expect("test config parses");
    let cfg = Arc::new(Mutex::new(cfg));
    let core = LogicCore::new(
        name,
        cfg,
        16000,
        Box::new(NullRx),
        Box::new(NullTx::default()),
        Box::new(engine),
    );
    (core, events)
}

/// Drive one receiver event through a logic the way the event loop does
pub fn pump<L: crate::Logic>(logic: &mut L, ev: rg_core::RxEvent, now_ms: u64) {
    if !logic.handle_rx_event(&ev, now_ms) {
        logic.core_mut().handle_rx_event(ev, now_ms);
    }
    logic.tick(now_ms);
    logic.core_mut().tick(now_ms);
}
