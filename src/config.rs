//! The consumed "Parameter/ParameterCollection" surface (spec.md §1, §6).
//!
//! We only need what the execution core actually calls: get/set by string
//! key, type coercion, and serialization. A `ConfigStore` is a thin wrapper
//! around a `serde_json::Map` so it round-trips through the same JSON path
//! the rest of the crate already uses for tree/plugin serialization.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExecutionError, Result};

/// Global settings keys consumed by the execution core (spec.md §6).
pub mod keys {
    pub const MP_N_WORKERS: &str = "global/mp_n_workers";
    pub const SHARED_BUFFER_SIZE: &str = "global/shared_buffer_size";
    pub const SHARED_BUFFER_MAX_N: &str = "global/shared_buffer_max_n";
    pub const AUTOSAVE_RESULTS: &str = "autosave_results";
    pub const AUTOSAVE_DIRECTORY: &str = "autosave_directory";
    pub const AUTOSAVE_FORMAT: &str = "autosave_format";
    pub const LIVE_PROCESSING: &str = "live_processing";
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigStore {
    values: HashMap<String, Value>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.values.get(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(ExecutionError::user_config(format!(
                "config key '{key}' is not a bool: {other}"
            ))),
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> Result<i64> {
        match self.values.get(key) {
            None => Ok(default),
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                ExecutionError::user_config(format!("config key '{key}' is not an integer"))
            }),
            Some(other) => Err(ExecutionError::user_config(format!(
                "config key '{key}' is not an integer: {other}"
            ))),
        }
    }

    pub fn get_float(&self, key: &str, default: f64) -> Result<f64> {
        match self.values.get(key) {
            None => Ok(default),
            Some(Value::Number(n)) => n.as_f64().ok_or_else(|| {
                ExecutionError::user_config(format!("config key '{key}' is not a float"))
            }),
            Some(other) => Err(ExecutionError::user_config(format!(
                "config key '{key}' is not a float: {other}"
            ))),
        }
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(ExecutionError::user_config(format!(
                "config key '{key}' is not a string: {other}"
            ))),
        }
    }

    pub fn get_path(&self, key: &str) -> Result<Option<PathBuf>> {
        Ok(self.get_string(key)?.map(PathBuf::from))
    }
}
