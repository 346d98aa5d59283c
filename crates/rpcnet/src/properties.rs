//! Flat key/value configuration
//!
//! All runtime and adapter settings are read from a `Properties` set. Keys are
//! dotted names (`Rpc.Trace.Network`, `MyAdapter.Endpoints`); values are
//! plain strings converted on lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{LocalError, Result};

/// Thread-safe property set
#[derive(Debug, Default)]
pub struct Properties {
    entries: RwLock<BTreeMap<String, String>>,
}

impl Properties {
    /// Create an empty property set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared, empty property set
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Build a property set from `(key, value)` pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let props = Self::new();
        for (k, v) in pairs {
            props.set_property(k, v);
        }
        props
    }

    /// Parse `key=value` lines. Blank lines and lines starting with `#` are
    /// ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let props = Self::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                LocalError::Initialization(format!(
                    "invalid property at line {}: `{}'",
                    lineno + 1,
                    line
                ))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(LocalError::Initialization(format!(
                    "empty property name at line {}",
                    lineno + 1
                )));
            }
            props.set_property(key, value.trim());
        }
        Ok(props)
    }

    /// Consume `--Key=Value` arguments and return the ones that were not
    /// property settings.
    pub fn parse_command_line_options(&self, args: &[String]) -> Vec<String> {
        let mut remaining = Vec::new();
        for arg in args {
            match arg.strip_prefix("--").and_then(|s| s.split_once('=')) {
                Some((key, value)) if key.contains('.') => {
                    self.set_property(key, value);
                }
                _ => remaining.push(arg.clone()),
            }
        }
        remaining
    }

    /// Set a property. An empty value removes the key.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let mut entries = self.entries.write();
        if value.is_empty() {
            entries.remove(&key);
        } else {
            entries.insert(key, value);
        }
    }

    /// Get a property, or the empty string if unset
    pub fn get_property(&self, key: &str) -> String {
        self.entries.read().get(key).cloned().unwrap_or_default()
    }

    pub fn get_property_with_default(&self, key: &str, default: &str) -> String {
        self.entries
            .read()
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Get a property as an integer, 0 if unset or malformed
    pub fn get_property_as_int(&self, key: &str) -> i64 {
        self.get_property_as_int_with_default(key, 0)
    }

    /// Get a property as an integer. A malformed value is reported and the
    /// default is returned.
    pub fn get_property_as_int_with_default(&self, key: &str, default: i64) -> i64 {
        let entries = self.entries.read();
        match entries.get(key) {
            None => default,
            Some(value) => match value.trim().parse::<i64>() {
                Ok(v) => v,
                Err(_) => {
                    warn!(
                        target: "rpcnet::properties",
                        "numeric property {} set to non-numeric value `{}', defaulting to {}",
                        key,
                        value,
                        default
                    );
                    default
                }
            },
        }
    }

    /// Get a whitespace or comma separated list
    pub fn get_property_as_list(&self, key: &str) -> Vec<String> {
        self.get_property(key)
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// All properties whose key starts with `prefix`
    pub fn get_properties_for_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Deep copy
    pub fn clone_properties(&self) -> Self {
        Self {
            entries: RwLock::new(self.entries.read().clone()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
