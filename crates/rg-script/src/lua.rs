//! Lua event script engine

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use mlua::{Lua, Table, Value, Variadic};
use parking_lot::Mutex;
use rg_core::SharedConfig;

use crate::{EventScriptEngine, ScriptAction, ScriptError, ScriptResult};

type ActionQueue = Arc<Mutex<VecDeque<ScriptAction>>>;

/// Embedded Lua interpreter with the host callback surface registered as
/// globals. Event procedures live in per-logic namespace tables:
///
/// ```lua
/// RepeaterLogic = RepeaterLogic or {}
/// function RepeaterLogic.repeater_up(reason)
///   playTone(440, 300, 100)
///   return "1"
/// end
/// ```
pub struct LuaScriptEngine {
    lua: Lua,
    actions: ActionQueue,
}

impl LuaScriptEngine {
    pub fn new(config: SharedConfig) -> ScriptResult<Self> {
        let lua = Lua::new();
        let actions: ActionQueue = Arc::new(Mutex::new(VecDeque::new()));

        register_host_callbacks(&lua, &actions, config)?;

        Ok(Self { lua, actions })
    }

    fn ensure_namespace(&self, namespace: &str) -> ScriptResult<Table> {
        let globals = self.lua.globals();
        match globals.get::<Value>(namespace)? {
            Value::Table(t) => Ok(t),
            _ => {
                let t = self.lua.create_table()?;
                globals.set(namespace, &t)?;
                Ok(t)
            }
        }
    }
}

impl EventScriptEngine for LuaScriptEngine {
    fn load_script(&mut self, path: &Path) -> ScriptResult<()> {
        if !path.exists() {
            return Err(ScriptError::NotFound(path.display().to_string()));
        }
        let source = std::fs::read_to_string(path)?;
        self.lua.load(&source).set_name(path.display().to_string()).exec()?;
        Ok(())
    }

    fn set_variable(&mut self, namespace: &str, name: &str, value: &str) -> ScriptResult<()> {
        let table = self.ensure_namespace(namespace)?;
        table.set(name, value)?;
        Ok(())
    }

    fn process_event(&mut self, namespace: &str, event: &str) -> ScriptResult<String> {
        let mut words = event.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(String::new());
        };
        let args: Vec<String> = words
            .map(|w| w.trim_matches('"').to_string())
            .collect();

        let table = match self.lua.globals().get::<Value>(namespace)? {
            Value::Table(t) => t,
            _ => return Ok(String::new()),
        };
        let func = match table.get::<Value>(name)? {
            Value::Function(f) => f,
            _ => return Ok(String::new()),
        };
        let ret: Value = func.call(Variadic::from_iter(args))?;
        Ok(lua_value_to_string(&ret))
    }

    fn register_command(&mut self, name: &str) -> ScriptResult<()> {
        let actions = self.actions.clone();
        let cmd_name = name.to_string();
        let f = self
            .lua
            .create_function(move |_, args: Variadic<String>| {
                actions.lock().push_back(ScriptAction::Custom {
                    name: cmd_name.clone(),
                    args: args.to_vec(),
                });
                Ok(())
            })?;
        self.lua.globals().set(name, f)?;
        Ok(())
    }

    fn drain_actions(&mut self) -> Vec<ScriptAction> {
        self.actions.lock().drain(..).collect()
    }
}

fn lua_value_to_string(value: &Value) -> String {
    match value {
        Value::Nil => String::new(),
        Value::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        _ => String::new(),
    }
}

fn register_host_callbacks(
    lua: &Lua,
    actions: &ActionQueue,
    config: SharedConfig,
) -> ScriptResult<()> {
    let globals = lua.globals();

    let q = actions.clone();
    globals.set(
        "playFile",
        lua.create_function(move |_, path: String| {
            q.lock().push_back(ScriptAction::PlayFile { path });
            Ok(())
        })?,
    )?;

    let q = actions.clone();
    globals.set(
        "playSilence",
        lua.create_function(move |_, length_ms: u64| {
            q.lock().push_back(ScriptAction::PlaySilence { length_ms });
            Ok(())
        })?,
    )?;

    let q = actions.clone();
    globals.set(
        "playTone",
        lua.create_function(move |_, (fq, amp, length_ms): (f32, i32, u64)| {
            q.lock().push_back(ScriptAction::PlayTone {
                fq,
                amp_permille: amp,
                length_ms,
            });
            Ok(())
        })?,
    )?;

    let q = actions.clone();
    globals.set(
        "playDtmf",
        lua.create_function(move |_, (digits, amp, length_ms): (String, i32, u64)| {
            q.lock().push_back(ScriptAction::PlayDtmf {
                digits,
                amp_permille: amp,
                length_ms,
            });
            Ok(())
        })?,
    )?;

    let q = actions.clone();
    globals.set(
        "recordStart",
        lua.create_function(move |_, (path, max_ms): (String, u64)| {
            q.lock().push_back(ScriptAction::RecordStart { path, max_ms });
            Ok(())
        })?,
    )?;

    let q = actions.clone();
    globals.set(
        "recordStop",
        lua.create_function(move |_, ()| {
            q.lock().push_back(ScriptAction::RecordStop);
            Ok(())
        })?,
    )?;

    let q = actions.clone();
    globals.set(
        "deactivateModule",
        lua.create_function(move |_, ()| {
            q.lock().push_back(ScriptAction::DeactivateModule);
            Ok(())
        })?,
    )?;

    let q = actions.clone();
    globals.set(
        "publishStateEvent",
        lua.create_function(move |_, (name, msg): (String, String)| {
            q.lock().push_back(ScriptAction::PublishStateEvent { name, msg });
            Ok(())
        })?,
    )?;

    let q = actions.clone();
    globals.set(
        "injectDtmf",
        lua.create_function(move |_, (digits, duration_ms): (String, u64)| {
            q.lock()
                .push_back(ScriptAction::InjectDtmf { digits, duration_ms });
            Ok(())
        })?,
    )?;

    let cfg = config.clone();
    globals.set(
        "getConfigValue",
        lua.create_function(
            move |_, (section, tag, default): (String, String, Option<String>)| {
                let value = cfg.lock().value(&section, &tag).map(str::to_string);
                Ok(value.or(default))
            },
        )?,
    )?;

    let q = actions.clone();
    let cfg = config;
    globals.set(
        "setConfigValue",
        lua.create_function(
            move |_, (section, tag, value): (String, String, String)| {
                cfg.lock().set_value(&section, &tag, &value);
                q.lock().push_back(ScriptAction::SetConfigValue {
                    section,
                    tag,
                    value,
                });
                Ok(())
            },
        )?,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rg_core::Config;
    use std::io::Write as _;

    fn engine() -> LuaScriptEngine {
        let config = Arc::new(Mutex::new(Config::new()));
        LuaScriptEngine::new(config).unwrap()
    }

    fn engine_with_config(cfg: Config) -> LuaScriptEngine {
        LuaScriptEngine::new(Arc::new(Mutex::new(cfg))).unwrap()
    }

    fn load(engine: &mut LuaScriptEngine, source: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.lua");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(source.as_bytes())
            .unwrap();
        engine.load_script(&path).unwrap();
    }

    #[test]
    fn test_missing_script_errors() {
        let mut e = engine();
        assert!(e.load_script(Path::new("/nonexistent/events.lua")).is_err());
    }

    #[test]
    fn test_event_dispatch_and_result() {
        let mut e = engine();
        load(
            &mut e,
            "Test = {}\n\
             function Test.startup()\n\
               playFile('/sounds/online.wav')\n\
               return '1'\n\
             end\n",
        );
        let result = e.process_event("Test", "startup").unwrap();
        assert_eq!(result, "1");
        assert_eq!(
            e.drain_actions(),
            vec![ScriptAction::PlayFile {
                path: "/sounds/online.wav".into()
            }]
        );
    }

    #[test]
    fn test_unknown_event_is_unhandled() {
        let mut e = engine();
        load(&mut e, "Test = {}\n");
        assert_eq!(e.process_event("Test", "no_such_event").unwrap(), "");
        assert_eq!(e.process_event("NoNamespace", "x").unwrap(), "");
    }

    #[test]
    fn test_event_arguments() {
        let mut e = engine();
        load(
            &mut e,
            "L = {}\n\
             function L.dtmf_cmd_received(cmd)\n\
               playDtmf(cmd, 300, 100)\n\
               return cmd\n\
             end\n",
        );
        let result = e.process_event("L", "dtmf_cmd_received \"9999\"").unwrap();
        assert_eq!(result, "9999");
        assert_eq!(
            e.drain_actions(),
            vec![ScriptAction::PlayDtmf {
                digits: "9999".into(),
                amp_permille: 300,
                length_ms: 100
            }]
        );
    }

    #[test]
    fn test_set_variable_visible_to_script() {
        let mut e = engine();
        load(
            &mut e,
            "L = {}\n\
             function L.report()\n\
               return L.CALLSIGN\n\
             end\n",
        );
        e.set_variable("L", "CALLSIGN", "SM0ABC").unwrap();
        assert_eq!(e.process_event("L", "report").unwrap(), "SM0ABC");
    }

    #[test]
    fn test_config_access() {
        let mut cfg = Config::new();
        cfg.load_str("[L]\nCALLSIGN=SM0XYZ\n").unwrap();
        let mut e = engine_with_config(cfg);
        load(
            &mut e,
            "L = {}\n\
             function L.probe()\n\
               setConfigValue('L', 'SEEN', '1')\n\
               return getConfigValue('L', 'CALLSIGN', 'NONE')\n\
             end\n\
             function L.probe_default()\n\
               return getConfigValue('L', 'MISSING', 'fallback')\n\
             end\n",
        );
        assert_eq!(e.process_event("L", "probe").unwrap(), "SM0XYZ");
        assert_eq!(e.process_event("L", "probe_default").unwrap(), "fallback");
        assert!(e.drain_actions().iter().any(|a| matches!(
            a,
            ScriptAction::SetConfigValue { section, tag, value }
                if section == "L" && tag == "SEEN" && value == "1"
        )));
    }

    #[test]
    fn test_custom_command() {
        let mut e = engine();
        e.register_command("linkTo").unwrap();
        load(
            &mut e,
            "L = {}\n\
             function L.go()\n\
               linkTo('RepeaterLogic', '1')\n\
             end\n",
        );
        e.process_event("L", "go").unwrap();
        assert_eq!(
            e.drain_actions(),
            vec![ScriptAction::Custom {
                name: "linkTo".into(),
                args: vec!["RepeaterLogic".into(), "1".into()]
            }]
        );
    }
}
