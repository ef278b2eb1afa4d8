//! rg-script: scriptable event dispatch
//!
//! Logics hand named events to a user script which decides what to play,
//! record or reconfigure. The engine is pluggable; the bundled
//! implementation embeds Lua. Script callbacks do not touch the logic
//! directly: they queue `ScriptAction`s which the owning logic drains and
//! applies after the event returns, so a multi-play sequence scheduled by
//! one event stays atomic.

use std::path::Path;

use thiserror::Error;

mod lua;

pub use lua::LuaScriptEngine;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Script error: {0}")]
    Lua(#[from] mlua::Error),

    #[error("Script not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ScriptResult<T> = Result<T, ScriptError>;

/// Actions a script can request from its logic
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptAction {
    PlayFile {
        path: String,
    },
    PlaySilence {
        length_ms: u64,
    },
    PlayTone {
        fq: f32,
        amp_permille: i32,
        length_ms: u64,
    },
    PlayDtmf {
        digits: String,
        amp_permille: i32,
        length_ms: u64,
    },
    RecordStart {
        path: String,
        max_ms: u64,
    },
    RecordStop,
    DeactivateModule,
    PublishStateEvent {
        name: String,
        msg: String,
    },
    InjectDtmf {
        digits: String,
        duration_ms: u64,
    },
    SetConfigValue {
        section: String,
        tag: String,
        value: String,
    },
    /// A host-registered custom command was invoked
    Custom {
        name: String,
        args: Vec<String>,
    },
}

/// An embedded (or out-of-process) event script engine
pub trait EventScriptEngine: Send {
    /// Load and execute the user script
    fn load_script(&mut self, path: &Path) -> ScriptResult<()>;

    /// Set a variable in the given namespace
    fn set_variable(&mut self, namespace: &str, name: &str, value: &str) -> ScriptResult<()>;

    /// Evaluate the named event procedure in the given namespace. The
    /// event string is the procedure name followed by its arguments. An
    /// unknown procedure is not an error; it returns the empty string.
    fn process_event(&mut self, namespace: &str, event: &str) -> ScriptResult<String>;

    /// Register an extra host command callable from the script
    fn register_command(&mut self, name: &str) -> ScriptResult<()>;

    /// Drain the actions queued by script callbacks
    fn drain_actions(&mut self) -> Vec<ScriptAction>;
}

/// A script result counts as "handled" when it is non-empty and not "0"
pub fn result_is_handled(result: &str) -> bool {
    !result.is_empty() && result != "0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_is_handled() {
        assert!(result_is_handled("1"));
        assert!(result_is_handled("yes"));
        assert!(!result_is_handled(""));
        assert!(!result_is_handled("0"));
    }
}
