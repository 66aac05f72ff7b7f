//! Command-line configuration shared between the `server` and `client`
//! binaries.
//!
//! The `-D`/`--debug` flag follows nbdkit's `NAME.FLAG=N` convention from
//! `server/debug-flags.c`: a list of dotted `component.flag=value` pairs
//! a backend can query at runtime for ad hoc tracing, kept separate from
//! the structured `RUST_LOG` filter `env_logger` already reads.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use clap::Args;
use color_eyre::eyre::{bail, Result};

use crate::proto::DEFAULT_PORT;

/// One `component.flag=value` debug setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugFlag {
    /// Dotted component name, e.g. the plugin or filter it targets.
    pub component: String,
    /// The flag's own name within that component.
    pub flag: String,
    /// The flag's value; nbdkit treats this as an integer, but we keep
    /// it as a string so a backend can parse it however it likes.
    pub value: String,
}

impl FromStr for DebugFlag {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, value) = s
            .split_once('=')
            .ok_or_else(|| color_eyre::eyre::eyre!("debug flag {s:?} is missing '='"))?;
        let (component, flag) = name
            .rsplit_once('.')
            .ok_or_else(|| color_eyre::eyre::eyre!("debug flag {s:?} is missing 'component.flag'"))?;
        if component.is_empty() || flag.is_empty() {
            bail!("debug flag {s:?} has an empty component or flag name");
        }
        Ok(DebugFlag {
            component: component.to_string(),
            flag: flag.to_string(),
            value: value.to_string(),
        })
    }
}

impl fmt::Display for DebugFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.component, self.flag, self.value)
    }
}

/// A parsed set of debug flags, looked up by `(component, flag)`. Tracks
/// which entries a backend actually consulted, so unused ones can be
/// flagged at teardown the way `server/debug-flags.c` warns about a
/// `-D name.flag=value` that no loaded plugin ever read.
#[derive(Debug, Clone, Default)]
pub struct DebugFlags {
    values: HashMap<(String, String), String>,
    used: RefCell<HashSet<(String, String)>>,
}

impl DebugFlags {
    pub fn from_flags(flags: &[DebugFlag]) -> Self {
        let mut values = HashMap::new();
        for f in flags {
            values.insert((f.component.clone(), f.flag.clone()), f.value.clone());
        }
        DebugFlags {
            values,
            used: RefCell::new(HashSet::new()),
        }
    }

    pub fn get(&self, component: &str, flag: &str) -> Option<&str> {
        let key = (component.to_string(), flag.to_string());
        let value = self.values.get(&key).map(String::as_str);
        if value.is_some() {
            self.used.borrow_mut().insert(key);
        }
        value
    }

    /// Warn about every flag set on the command line that no backend
    /// ever looked up, usually a sign of a typo'd component or flag name.
    pub fn warn_unused(&self) {
        let used = self.used.borrow();
        for key @ (component, flag) in self.values.keys() {
            if !used.contains(key) {
                log::warn!("debug flag {component}.{flag} was never read by any backend");
            }
        }
    }
}

/// Connection-related flags shared by commands that talk to a server
/// over TCP.
#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Host to connect to / listen on.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// TCP port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

/// Debug/tracing flags shared across subcommands.
#[derive(Args, Debug, Clone, Default)]
pub struct DebugArgs {
    /// Set a debug flag as `component.flag=value`; may be repeated.
    #[arg(short = 'D', long = "debug", value_name = "COMPONENT.FLAG=VALUE")]
    pub debug: Vec<DebugFlag>,
}

impl DebugArgs {
    pub fn parsed(&self) -> DebugFlags {
        DebugFlags::from_flags(&self.debug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_component_flag_value() {
        let f: DebugFlag = "file.verbose=1".parse().unwrap();
        assert_eq!(f.component, "file");
        assert_eq!(f.flag, "verbose");
        assert_eq!(f.value, "1");
    }

    #[test]
    fn rejects_missing_equals() {
        assert!("file.verbose".parse::<DebugFlag>().is_err());
    }

    #[test]
    fn get_marks_flag_used() {
        let flags = DebugFlags::from_flags(&["loggingfilter.level=info".parse().unwrap()]);
        assert_eq!(flags.get("loggingfilter", "level"), Some("info"));
        assert!(flags.used.borrow().contains(&(
            "loggingfilter".to_string(),
            "level".to_string()
        )));
    }

    #[test]
    fn get_of_unset_flag_returns_none() {
        let flags = DebugFlags::from_flags(&[]);
        assert_eq!(flags.get("loggingfilter", "level"), None);
    }

    #[test]
    fn rejects_missing_dot() {
        assert!("verbose=1".parse::<DebugFlag>().is_err());
    }
}
