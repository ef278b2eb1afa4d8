//! Test doubles for the network logic tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rg_core::{Config, NullRx, NullTx};
use rg_logic::LogicCore;
use rg_script::{EventScriptEngine, ScriptAction, ScriptResult};

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub struct TestEngine {
    pub events: EventLog,
    pub results: HashMap<String, String>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            results: HashMap::new(),
        }
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
        Vec::new()
    }
}

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
