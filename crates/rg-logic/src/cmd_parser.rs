//! Longest-prefix command registry
//!
//! Commands are digit strings. Dispatch finds the longest registered key
//! that prefixes the received string; the remainder becomes the
//! subcommand. Keys registered exact-match only fire on a full-length hit.

use std::collections::BTreeMap;

struct Entry<V> {
    value: V,
    exact_match: bool,
}

/// Registry mapping digit strings to command values
pub struct CmdParser<V> {
    cmds: BTreeMap<String, Entry<V>>,
}

impl<V> CmdParser<V> {
    pub fn new() -> Self {
        Self {
            cmds: BTreeMap::new(),
        }
    }

    /// Register a command. Keys are unique; a duplicate is rejected.
    pub fn add_cmd(&mut self, key: &str, value: V) -> bool {
        self.add(key, value, false)
    }

    /// Register a command that only matches the whole received string
    pub fn add_exact_cmd(&mut self, key: &str, value: V) -> bool {
        self.add(key, value, true)
    }

    fn add(&mut self, key: &str, value: V, exact_match: bool) -> bool {
        if key.is_empty() || self.cmds.contains_key(key) {
            return false;
        }
        self.cmds
            .insert(key.to_string(), Entry { value, exact_match });
        true
    }

    pub fn remove_cmd(&mut self, key: &str) -> bool {
        self.cmds.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cmds.contains_key(key)
    }

    /// Longest-prefix match; returns the command value and the remainder
    pub fn process_cmd<'a>(&self, cmd_str: &'a str) -> Option<(&V, &'a str)> {
        for len in (1..=cmd_str.len()).rev() {
            if let Some(entry) = self.cmds.get(&cmd_str[..len]) {
                if entry.exact_match && len != cmd_str.len() {
                    continue;
                }
                return Some((&entry.value, &cmd_str[len..]));
            }
        }
        None
    }
}

impl<V> Default for CmdParser<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let mut p = CmdParser::new();
        assert!(p.add_cmd("1", "one"));
        assert!(p.add_cmd("12", "twelve"));
        let (v, sub) = p.process_cmd("1234").unwrap();
        assert_eq!(*v, "twelve");
        assert_eq!(sub, "34");
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut p = CmdParser::new();
        assert!(p.add_cmd("9", 1));
        assert!(!p.add_cmd("9", 2));
    }

    #[test]
    fn test_no_match() {
        let mut p = CmdParser::new();
        p.add_cmd("5", ());
        assert!(p.process_cmd("7").is_none());
        assert!(p.process_cmd("").is_none());
    }

    #[test]
    fn test_exact_match_needs_full_length() {
        let mut p = CmdParser::new();
        p.add_exact_cmd("99", "online");
        p.add_cmd("9", "fallback");
        assert_eq!(p.process_cmd("99").unwrap().0, &"online");
        // "990" must not hit the exact command; falls back to "9"
        let (v, sub) = p.process_cmd("990").unwrap();
        assert_eq!(*v, "fallback");
        assert_eq!(sub, "90");
    }

    #[test]
    fn test_remove_cmd() {
        let mut p = CmdParser::new();
        p.add_cmd("42", ());
        assert!(p.remove_cmd("42"));
        assert!(!p.remove_cmd("42"));
        assert!(p.process_cmd("42").is_none());
    }
}
