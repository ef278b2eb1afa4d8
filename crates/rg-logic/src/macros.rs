//! DTMF macro table
//!
//! Macros map a short id to `<moduleName>:<moduleCmd>`. An empty module
//! name injects the command digits straight into the DTMF pipeline;
//! otherwise the named module is activated first.

use std::collections::BTreeMap;

use rg_core::Config;

/// Parsed right-hand side of a macro definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroExpansion {
    pub module_name: String,
    pub module_cmd: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroError {
    NotFound,
    Empty,
    SyntaxError,
}

/// Macro id to expansion table, loaded from a config section
#[derive(Default)]
pub struct MacroTable {
    macros: BTreeMap<String, String>,
}

impl MacroTable {
    pub fn load(cfg: &Config, section: &str) -> Self {
        let mut macros = BTreeMap::new();
        for id in cfg.list_section(section) {
            if let Some(expansion) = cfg.value(section, &id) {
                macros.insert(id.clone(), expansion.to_string());
            }
        }
        Self { macros }
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.macros.keys().map(String::as_str)
    }

    /// Look up and parse the expansion for a macro id
    pub fn expand(&self, id: &str) -> Result<MacroExpansion, MacroError> {
        let expansion = self.macros.get(id).ok_or(MacroError::NotFound)?;
        if expansion.is_empty() {
            return Err(MacroError::Empty);
        }
        let colon = expansion.find(':').ok_or(MacroError::SyntaxError)?;
        Ok(MacroExpansion {
            module_name: expansion[..colon].to_string(),
            module_cmd: expansion[colon + 1..].to_string(),
        })
    }
}
