//! # PMOPlayer Configuration Module
//!
//! Configuration management for the playback engine:
//! - embedded default configuration (`pmoplayer.yaml`)
//! - merge with the user's `config.yaml`
//! - environment variable overrides (`PMOPLAYER_CONFIG__SECTION__KEY=value`)
//! - typed getters with defaults, so a missing or malformed key never fails
//!   a caller that has a sensible fallback
//!
//! ## Usage
//!
//! ```no_run
//! use pmoconfig::get_config;
//!
//! let config = get_config()?;
//! let grace = config.get_u64(&["playback", "transition", "grace_ms"], 1500);
//! config.set_value(&["playback", "volume", "default"], 0.5.into())?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Crates built on top of `pmoconfig` expose their own settings through an
//! extension trait implemented for [`Config`] rather than adding getters here.

use anyhow::{anyhow, Result};
use dirs::home_dir;
use once_cell::sync::OnceCell;
use serde_yaml::{Mapping, Value};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = include_str!("pmoplayer.yaml");

const ENV_CONFIG_DIR: &str = "PMOPLAYER_CONFIG";
const ENV_PREFIX: &str = "PMOPLAYER_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmoplayer";
const CONFIG_FILE_NAME: &str = "config.yaml";

static CONFIG: OnceCell<Arc<Config>> = OnceCell::new();

/// Layered YAML configuration.
///
/// A `Config` is either backed by a `config.yaml` file (see
/// [`Config::load_config`]) and written back on every change, or purely in
/// memory (see [`Config::from_yaml_str`]), which is what tests use.
#[derive(Debug)]
pub struct Config {
    path: Option<PathBuf>,
    data: Mutex<Value>,
}

impl Config {
    /// Picks the configuration directory.
    ///
    /// Order: explicit `directory`, `$PMOPLAYER_CONFIG`, `./.pmoplayer`,
    /// `~/.pmoplayer`, and finally `./.pmoplayer` (created on demand).
    fn find_config_dir(directory: &str) -> PathBuf {
        if !directory.is_empty() {
            return PathBuf::from(directory);
        }

        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            info!(env_var = ENV_CONFIG_DIR, path = %env_path, "Using config directory from env");
            return PathBuf::from(env_path);
        }

        let local = Path::new(CONFIG_DIR_NAME);
        if local.exists() {
            return local.to_path_buf();
        }

        if let Some(home) = home_dir() {
            let home_config = home.join(CONFIG_DIR_NAME);
            if home_config.exists() {
                return home_config;
            }
        }

        local.to_path_buf()
    }

    fn prepare_config_dir(path: &Path) -> Result<()> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(anyhow!("{} is not a directory", path.display()));
        }
        Ok(())
    }

    /// Loads the configuration from `directory` (or the default lookup when
    /// empty), merges it over the embedded defaults, applies environment
    /// overrides and writes the merged result back to `config.yaml`.
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::find_config_dir(directory);
        Self::prepare_config_dir(&config_dir)?;
        info!(config_dir = %config_dir.display(), "Using config directory");

        let path = config_dir.join(CONFIG_FILE_NAME);
        let mut value = Self::defaults()?;

        match fs::read(&path) {
            Ok(bytes) => {
                info!(config_file = %path.display(), "Loaded config file");
                let external: Value = serde_yaml::from_slice(&bytes)?;
                merge_yaml(&mut value, &lower_keys(external));
            }
            Err(_) => {
                info!(config_file = %path.display(), "Config file not found, using embedded defaults");
            }
        }

        apply_env_overrides(&mut value, env::vars());

        let config = Config {
            path: Some(path),
            data: Mutex::new(value),
        };
        config.save()?;
        Ok(config)
    }

    /// Builds an in-memory configuration: embedded defaults overlaid with
    /// `overrides`. No file is read or written and the environment is ignored.
    pub fn from_yaml_str(overrides: &str) -> Result<Self> {
        let mut value = Self::defaults()?;
        if !overrides.trim().is_empty() {
            let external: Value = serde_yaml::from_str(overrides)?;
            merge_yaml(&mut value, &lower_keys(external));
        }
        Ok(Config {
            path: None,
            data: Mutex::new(value),
        })
    }

    fn defaults() -> Result<Value> {
        let value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        Ok(lower_keys(value))
    }

    fn data(&self) -> MutexGuard<'_, Value> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the configuration back to disk. No-op for in-memory configs.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let yaml = serde_yaml::to_string(&*self.data())?;
        fs::write(path, yaml)?;
        Ok(())
    }

    /// Sets the value at `path` (e.g. `&["playback", "volume", "default"]`),
    /// creating intermediate mappings, then saves.
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        {
            let mut data = self.data();
            set_value_at(&mut data, path, value)?;
        }
        self.save()
    }

    /// Returns the value at `path`, or an error naming the first missing key.
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data();
        let mut current = &*data;
        for (i, key) in path.iter().enumerate() {
            let Value::Mapping(map) = current else {
                return Err(anyhow!("{} is not a mapping", path[..i].join(".")));
            };
            current = map
                .get(key.to_lowercase().as_str())
                .ok_or_else(|| anyhow!("Path {} does not exist", path[..=i].join(".")))?;
        }
        Ok(current.clone())
    }

    /// Unsigned integer at `path`; numeric strings are accepted, anything
    /// else yields `default`.
    pub fn get_u64(&self, path: &[&str], default: u64) -> u64 {
        match self.get_value(path) {
            Ok(Value::Number(n)) => n.as_u64().unwrap_or_else(|| {
                warn!(key = %path.join("."), "Negative or fractional value, using default");
                default
            }),
            Ok(Value::String(s)) => s.trim().parse().unwrap_or_else(|_| {
                warn!(key = %path.join("."), value = %s, "Invalid integer, using default");
                default
            }),
            _ => default,
        }
    }

    /// Floating point value at `path`, `default` when missing or malformed.
    pub fn get_f64(&self, path: &[&str], default: f64) -> f64 {
        match self.get_value(path) {
            Ok(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Ok(Value::String(s)) => s.trim().parse().unwrap_or_else(|_| {
                warn!(key = %path.join("."), value = %s, "Invalid number, using default");
                default
            }),
            _ => default,
        }
    }

    /// List of strings at `path`. Non-string items are skipped.
    pub fn get_string_list(&self, path: &[&str]) -> Vec<String> {
        match self.get_value(path) {
            Ok(Value::Sequence(seq)) => seq
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Returns the process-wide configuration, loading it on first access.
pub fn get_config() -> Result<Arc<Config>> {
    CONFIG
        .get_or_try_init(|| Config::load_config("").map(Arc::new))
        .cloned()
}

fn set_value_at(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
    let Some((head, rest)) = path.split_first() else {
        *data = value;
        return Ok(());
    };
    let Value::Mapping(map) = data else {
        return Err(anyhow!("Cannot set {}: parent is not a mapping", head));
    };
    let key = Value::String(head.to_lowercase());
    if rest.is_empty() {
        map.insert(key, value);
        return Ok(());
    }
    let entry = map
        .entry(key)
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !entry.is_mapping() {
        *entry = Value::Mapping(Mapping::new());
    }
    set_value_at(entry, rest, value)
}

/// Applies `PMOPLAYER_CONFIG__A__B=value` pairs; values are parsed as YAML
/// so numbers, booleans and lists keep their type.
fn apply_env_overrides<I>(config: &mut Value, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, raw) in vars {
        let Some(stripped) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<&str> = stripped.split("__").collect();
        let value = serde_yaml::from_str::<Value>(&raw).unwrap_or(Value::String(raw.clone()));
        if let Err(err) = set_value_at(config, &path, value) {
            warn!(env_var = %key, error = %err, "Ignoring config override");
        }
    }
}

fn lower_keys(value: Value) -> Value {
    match value {
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| {
                    let k = match k {
                        Value::String(s) => Value::String(s.to_lowercase()),
                        other => other,
                    };
                    (k, lower_keys(v))
                })
                .collect(),
        ),
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(lower_keys).collect()),
        other => other,
    }
}

/// Recursive merge: mappings are merged key by key, scalars and sequences
/// from `external` replace those of `base`.
fn merge_yaml(base: &mut Value, external: &Value) {
    match (base, external) {
        (Value::Mapping(bmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match bmap.get_mut(k) {
                    Some(bv) => merge_yaml(bv, v),
                    None => {
                        bmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (b, e) => *b = e.clone(),
    }
}
