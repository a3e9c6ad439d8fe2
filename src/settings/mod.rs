pub mod views;

#[cfg(test)]
mod tests;

pub use views::*;

use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// One process-wide settings registry.
///
/// Three layers, consulted in order on every read:
/// 1. the override overlay: runtime values set locally or replicated in
///    over multicast; mutable, last-writer-wins;
/// 2. the base map: a snapshot of the process environment merged over an
///    optional dotenv-style file, taken once at startup;
/// 3. the per-key default supplied by the reading view.
///
/// Every key is owned by exactly one environment (a named feature area).
/// Views claim their keys when they are constructed, so a key reachable
/// through two environments is a startup error, not a latent runtime one.
pub struct Settings {
    base: HashMap<String, String>,
    overlay: DashMap<String, String>,
    registry: DashMap<String, &'static str>,
}

#[derive(Debug)]
pub enum SettingsError {
    AlreadyRegistered {
        key: String,
        environment: &'static str,
    },
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::AlreadyRegistered { key, environment } => {
                write!(f, "{} is already registered in environment {}", key, environment)
            }
        }
    }
}

impl std::error::Error for SettingsError {}

impl Settings {
    /// Snapshot the process environment, optionally merged over a dotenv
    /// file. Values from the real environment win over file values.
    pub fn from_process_env(env_file: Option<&Path>) -> Arc<Self> {
        let mut base: HashMap<String, String> = HashMap::new();

        if let Some(path) = env_file {
            match dotenvy::from_path_iter(path) {
                Ok(iter) => {
                    for item in iter.flatten() {
                        base.insert(item.0, item.1);
                    }
                }
                Err(e) => {
                    tracing::warn!("settings: env file not loaded, path={}, error={}", path.display(), e);
                }
            }
        }

        for (k, v) in std::env::vars() {
            base.insert(k, v);
        }

        Arc::new(Self {
            base,
            overlay: DashMap::new(),
            registry: DashMap::new(),
        })
    }

    /// Build from an explicit base map. Test entry point that keeps tests
    /// independent of the process environment.
    pub fn from_map(base: HashMap<String, String>) -> Arc<Self> {
        Arc::new(Self {
            base,
            overlay: DashMap::new(),
            registry: DashMap::new(),
        })
    }

    /// Record that `environment` owns `key`. Idempotent for the same
    /// environment; claiming a key owned elsewhere fails.
    pub fn claim(&self, environment: &'static str, key: &str) -> Result<(), SettingsError> {
        match self.registry.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(environment);
                Ok(())
            }
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if *existing.get() == environment {
                    Ok(())
                } else {
                    Err(SettingsError::AlreadyRegistered {
                        key: key.to_string(),
                        environment: *existing.get(),
                    })
                }
            }
        }
    }

    /// Owning environment of `key`, if any view has claimed it.
    pub fn owner(&self, key: &str) -> Option<&'static str> {
        self.registry.get(key).map(|e| *e.value())
    }

    /// Set a runtime override. Writers are the replicator and explicit
    /// operator calls; the next read anywhere in the process observes it.
    pub fn set_override(&self, key: &str, value: &str) {
        self.overlay.insert(key.to_string(), value.to_string());
        tracing::debug!("settings: override set, key={}", key);
    }

    /// Remove a runtime override, falling back to the base map / default.
    pub fn remove_override(&self, key: &str) {
        self.overlay.remove(key);
        tracing::debug!("settings: override removed, key={}", key);
    }

    /// Current override value, if one is set. Admin/introspection use.
    pub fn override_value(&self, key: &str) -> Option<String> {
        self.overlay.get(key).map(|e| e.value().clone())
    }

    // -- raw reads (overlay first, then base) --

    fn raw(&self, key: &str) -> Option<String> {
        if let Some(v) = self.overlay.get(key) {
            return Some(v.value().clone());
        }
        self.base.get(key).cloned()
    }

    // -- typed reads; parse failures fall back to the default --

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.raw(key) {
            Some(v) => parse_bool(&v).unwrap_or(default),
            None => default,
        }
    }

    pub fn u16_or(&self, key: &str, default: u16) -> u16 {
        self.raw(key)
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(default)
    }

    pub fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.raw(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(default)
    }

    /// Comma-separated list; empty / missing value yields an empty vec.
    pub fn list_or_empty(&self, key: &str) -> Vec<String> {
        match self.raw(key) {
            Some(v) => v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
