//! Configuration store
//!
//! Section/tag string store with typed getters, runtime updates and change
//! notification. The daemon loads INI-style text into it at startup; every
//! other component only sees the store.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};

type Subscriber = Box<dyn FnMut(&str, &str, &str) + Send>;

/// Shared handle to the process-wide configuration store
pub type SharedConfig = std::sync::Arc<Mutex<Config>>;

/// Section/tag configuration store
#[derive(Default)]
pub struct Config {
    sections: BTreeMap<String, BTreeMap<String, String>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load INI-style text. Later sections with the same name extend earlier
    /// ones, later tags overwrite.
    pub fn load_str(&mut self, text: &str) -> CoreResult<()> {
        let mut section = String::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                let end = line.find(']').ok_or_else(|| {
                    CoreError::Config(format!("unterminated section header on line {}", lineno + 1))
                })?;
                section = line[1..end].trim().to_string();
                self.sections.entry(section.clone()).or_default();
            } else if let Some(eq) = line.find('=') {
                if section.is_empty() {
                    return Err(CoreError::Config(format!(
                        "value outside of section on line {}",
                        lineno + 1
                    )));
                }
                let tag = line[..eq].trim().to_string();
                let value = line[eq + 1..].trim().to_string();
                self.sections
                    .entry(section.clone())
                    .or_default()
                    .insert(tag, value);
            } else {
                return Err(CoreError::Config(format!(
                    "malformed line {}: {:?}",
                    lineno + 1,
                    raw
                )));
            }
        }
        Ok(())
    }

    pub fn load_file(&mut self, path: &Path) -> CoreResult<()> {
        let text = std::fs::read_to_string(path)?;
        self.load_str(&text)
    }

    /// Raw string lookup
    pub fn value(&self, section: &str, tag: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(tag))
            .map(String::as_str)
    }

    /// Typed lookup. Absent tag is `Ok(None)`, unparsable value is an error.
    pub fn get<T: FromStr>(&self, section: &str, tag: &str) -> CoreResult<Option<T>> {
        match self.value(section, tag) {
            None => Ok(None),
            Some(v) => v.parse::<T>().map(Some).map_err(|_| {
                CoreError::InvalidValue(format!("{section}/{tag}"), v.to_string())
            }),
        }
    }

    /// Typed lookup with a default for absent tags
    pub fn get_or<T: FromStr>(&self, section: &str, tag: &str, default: T) -> CoreResult<T> {
        Ok(self.get(section, tag)?.unwrap_or(default))
    }

    /// Mandatory typed lookup
    pub fn get_required<T: FromStr>(&self, section: &str, tag: &str) -> CoreResult<T> {
        self.get(section, tag)?
            .ok_or_else(|| CoreError::MissingConfig(section.to_string(), tag.to_string()))
    }

    /// Set a value and notify subscribers
    pub fn set_value(&mut self, section: &str, tag: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(tag.to_string(), value.to_string());
        for sub in self.subscribers.lock().iter_mut() {
            sub(section, tag, value);
        }
    }

    /// All tags of a section, in sorted order
    pub fn list_section(&self, section: &str) -> Vec<String> {
        self.sections
            .get(section)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Subscribe to value updates. The callback receives (section, tag, value).
    pub fn subscribe<F>(&self, f: F)
    where
        F: FnMut(&str, &str, &str) + Send + 'static,
    {
        self.subscribers.lock().push(Box::new(f));
    }

    /// Split a comma or whitespace separated list value
    pub fn get_list(&self, section: &str, tag: &str) -> Vec<String> {
        self.value(section, tag)
            .map(|v| {
                v.split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_load_and_lookup() {
        let mut cfg = Config::new();
        cfg.load_str(
            "# comment\n\
             [RepeaterLogic]\n\
             TYPE=Repeater\n\
             IDLE_TIMEOUT = 30\n\
             [Macros]\n\
             7=EchoLink:9999\n",
        )
        .unwrap();

        assert_eq!(cfg.value("RepeaterLogic", "TYPE"), Some("Repeater"));
        assert_eq!(
            cfg.get::<u32>("RepeaterLogic", "IDLE_TIMEOUT").unwrap(),
            Some(30)
        );
        assert_eq!(cfg.value("Macros", "7"), Some("EchoLink:9999"));
        assert!(cfg.value("Missing", "X").is_none());
    }

    #[test]
    fn test_set_value_roundtrip() {
        let mut cfg = Config::new();
        cfg.set_value("A", "B", "hello world");
        assert_eq!(cfg.value("A", "B"), Some("hello world"));
    }

    #[test]
    fn test_set_value_notifies() {
        let mut cfg = Config::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        cfg.subscribe(move |section, tag, value| {
            assert_eq!(section, "S");
            assert_eq!(tag, "T");
            assert_eq!(value, "V");
            h.fetch_add(1, Ordering::SeqCst);
        });
        cfg.set_value("S", "T", "V");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_line_rejected() {
        let mut cfg = Config::new();
        assert!(cfg.load_str("[S]\nno equals sign\n").is_err());
        assert!(cfg.load_str("TAG=1\n").is_err());
    }

    #[test]
    fn test_invalid_typed_value() {
        let mut cfg = Config::new();
        cfg.load_str("[S]\nNUM=abc\n").unwrap();
        assert!(cfg.get::<u32>("S", "NUM").is_err());
    }

    #[test]
    fn test_list_section_sorted() {
        let mut cfg = Config::new();
        cfg.load_str("[Macros]\n9=b\n7=a\n").unwrap();
        assert_eq!(cfg.list_section("Macros"), vec!["7", "9"]);
    }

    #[test]
    fn test_get_list() {
        let mut cfg = Config::new();
        cfg.load_str("[G]\nLOGICS=SimplexLogic,RepeaterLogic NetLogic\n")
            .unwrap();
        assert_eq!(
            cfg.get_list("G", "LOGICS"),
            vec!["SimplexLogic", "RepeaterLogic", "NetLogic"]
        );
    }
}
