//! Configuration: a TOML tree with typed, defaulted lookups.
//!
//! Components pull settings by dotted path (`sys.mem.queueDepth`) as they
//! initialize; every read marks the key used. After initialization,
//! [`Config::finalize`] reports settings nobody consumed — typos, most of
//! the time — as warnings, or as a hard error in strict mode.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Mutex;

use log::warn;
use thiserror::Error;
use toml::Value;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: could not read config: {err}")]
    Io { path: String, err: String },
    #[error("{path}: parse error: {err}")]
    Parse { path: String, err: String },
    #[error("{path}: missing mandatory setting '{key}'")]
    Missing { path: String, key: String },
    #[error("{path}: setting '{key}' is not a {expected}")]
    Type {
        path: String,
        key: String,
        expected: &'static str,
    },
    #[error("{path}: unused settings: {keys}")]
    Unused { path: String, keys: String },
}

pub struct Config {
    path: String,
    root: Value,
    used: Mutex<HashSet<String>>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let display = path.display().to_string();
        let body = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: display.clone(),
            err: e.to_string(),
        })?;
        Config::from_str_named(&body, display)
    }

    pub fn from_str_named(body: &str, path: String) -> Result<Config, ConfigError> {
        let root: Value = body.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.clone(),
            err: e.to_string(),
        })?;
        Ok(Config {
            path,
            root,
            used: Mutex::new(HashSet::new()),
        })
    }

    fn node(&self, key: &str) -> Option<&Value> {
        let mut cur = &self.root;
        for part in key.split('.') {
            cur = cur.as_table()?.get(part)?;
        }
        Some(cur)
    }

    fn mark_used(&self, key: &str) {
        self.used.lock().unwrap().insert(key.to_string());
    }

    fn type_err(&self, key: &str, expected: &'static str) -> ConfigError {
        ConfigError::Type {
            path: self.path.clone(),
            key: key.to_string(),
            expected,
        }
    }

    fn missing(&self, key: &str) -> ConfigError {
        ConfigError::Missing {
            path: self.path.clone(),
            key: key.to_string(),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.node(key).is_some()
    }

    /// Names of the sub-tables directly under `key` (e.g. the caches
    /// defined under `sys.caches`), sorted for determinism.
    pub fn subgroups(&self, key: &str) -> Vec<String> {
        let mut names: Vec<String> = match self.node(key).and_then(|v| v.as_table()) {
            Some(t) => t
                .iter()
                .filter(|(_, v)| v.is_table())
                .map(|(k, _)| k.clone())
                .collect(),
            None => Vec::new(),
        };
        names.sort();
        names
    }

    pub fn get_u32(&self, key: &str, default: u32) -> Result<u32, ConfigError> {
        self.opt_u32(key)?.map_or(Ok(default), Ok)
    }

    pub fn req_u32(&self, key: &str) -> Result<u32, ConfigError> {
        self.opt_u32(key)?.ok_or_else(|| self.missing(key))
    }

    fn opt_u32(&self, key: &str) -> Result<Option<u32>, ConfigError> {
        match self.node(key) {
            None => Ok(None),
            Some(v) => {
                self.mark_used(key);
                let i = v.as_integer().ok_or_else(|| self.type_err(key, "u32"))?;
                u32::try_from(i)
                    .map(Some)
                    .map_err(|_| self.type_err(key, "u32"))
            }
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.node(key) {
            None => Ok(default),
            Some(v) => {
                self.mark_used(key);
                let i = v.as_integer().ok_or_else(|| self.type_err(key, "u64"))?;
                u64::try_from(i).map_err(|_| self.type_err(key, "u64"))
            }
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.node(key) {
            None => Ok(default),
            Some(v) => {
                self.mark_used(key);
                v.as_bool().ok_or_else(|| self.type_err(key, "bool"))
            }
        }
    }

    pub fn get_f64(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        match self.node(key) {
            None => Ok(default),
            Some(v) => {
                self.mark_used(key);
                match v {
                    Value::Float(f) => Ok(*f),
                    Value::Integer(i) => Ok(*i as f64),
                    _ => Err(self.type_err(key, "number")),
                }
            }
        }
    }

    pub fn get_str(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        match self.node(key) {
            None => Ok(default.to_string()),
            Some(v) => {
                self.mark_used(key);
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.type_err(key, "string"))
            }
        }
    }

    pub fn req_str(&self, key: &str) -> Result<String, ConfigError> {
        match self.node(key) {
            None => Err(self.missing(key)),
            Some(v) => {
                self.mark_used(key);
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.type_err(key, "string"))
            }
        }
    }

    fn leaf_keys(value: &Value, prefix: &str, out: &mut Vec<String>) {
        match value.as_table() {
            Some(t) => {
                for (k, v) in t {
                    let key = if prefix.is_empty() {
                        k.clone()
                    } else {
                        format!("{prefix}.{k}")
                    };
                    Self::leaf_keys(v, &key, out);
                }
            }
            None => out.push(prefix.to_string()),
        }
    }

    /// Report settings nobody read. Warnings by default; errors when
    /// `strict`.
    pub fn finalize(&self, strict: bool) -> Result<(), ConfigError> {
        let mut all = Vec::new();
        Self::leaf_keys(&self.root, "", &mut all);
        let used = self.used.lock().unwrap();
        let unused: Vec<&String> = all.iter().filter(|k| !used.contains(*k)).collect();
        if unused.is_empty() {
            return Ok(());
        }
        if strict {
            let mut keys = String::new();
            for (i, k) in unused.iter().enumerate() {
                if i > 0 {
                    let _ = write!(keys, ", ");
                }
                let _ = write!(keys, "{k}");
            }
            Err(ConfigError::Unused {
                path: self.path.clone(),
                keys,
            })
        } else {
            for k in unused {
                warn!("{}: setting '{k}' is not used", self.path);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [sim]
        phaseLength = 10000
        parallelThreads = 4
        maxPhases = 100

        [sys]
        lineBits = 6

        [sys.caches.l1d]
        size = 32768
        assoc = 8

        [sys.mem]
        tech = "DDR3-1333-CL10"
        deferredWrites = true
        controllerLatency = 40
    "#;

    fn cfg() -> Config {
        Config::from_str_named(SAMPLE, "test.toml".into()).unwrap()
    }

    #[test]
    fn typed_lookups_with_defaults() {
        let c = cfg();
        assert_eq!(c.get_u32("sim.phaseLength", 1).unwrap(), 10000);
        assert_eq!(c.get_u32("sim.missing", 77).unwrap(), 77);
        assert!(c.get_bool("sys.mem.deferredWrites", false).unwrap());
        assert_eq!(c.req_str("sys.mem.tech").unwrap(), "DDR3-1333-CL10");
        assert_eq!(c.get_u64("sys.caches.l1d.size", 0).unwrap(), 32768);
    }

    #[test]
    fn missing_mandatory_is_an_error() {
        let c = cfg();
        assert!(matches!(
            c.req_u32("sys.mem.queueDepth"),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let c = cfg();
        assert!(matches!(
            c.get_u32("sys.mem.tech", 0),
            Err(ConfigError::Type { .. })
        ));
        assert!(matches!(
            c.get_bool("sim.phaseLength", false),
            Err(ConfigError::Type { .. })
        ));
    }

    #[test]
    fn negative_values_fail_range_checks() {
        let c = Config::from_str_named("[sim]\nthreads = -3\n", "t.toml".into()).unwrap();
        assert!(matches!(
            c.get_u32("sim.threads", 0),
            Err(ConfigError::Type { .. })
        ));
    }

    #[test]
    fn subgroups_enumerate_tables() {
        let c = cfg();
        assert_eq!(c.subgroups("sys.caches"), vec!["l1d".to_string()]);
        assert!(c.subgroups("sys.nothing").is_empty());
    }

    #[test]
    fn strict_finalize_flags_unused_keys() {
        let c = cfg();
        let _ = c.get_u32("sim.phaseLength", 0).unwrap();
        // Everything else is unread.
        match c.finalize(true) {
            Err(ConfigError::Unused { keys, .. }) => {
                assert!(keys.contains("sys.mem.tech"));
                assert!(!keys.contains("sim.phaseLength"));
            }
            other => panic!("expected unused-keys error, got {other:?}"),
        }
    }

    #[test]
    fn fully_consumed_config_finalizes_cleanly() {
        let c = cfg();
        for key in [
            "sim.phaseLength",
            "sim.parallelThreads",
            "sim.maxPhases",
            "sys.lineBits",
            "sys.caches.l1d.size",
            "sys.caches.l1d.assoc",
            "sys.mem.controllerLatency",
        ] {
            let _ = c.get_u64(key, 0).unwrap();
        }
        let _ = c.get_bool("sys.mem.deferredWrites", false).unwrap();
        let _ = c.req_str("sys.mem.tech").unwrap();
        c.finalize(true).unwrap();
    }
}
