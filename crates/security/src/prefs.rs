//! Preference storage.
//!
//! Preferences are flat string values addressed by a dotted key. The allow-list
//! lives here as a JSON-encoded array under a single key.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::StoreError;

/// Key-value preference backend.
pub trait PreferenceStore: Send + Sync {
    /// Get a string preference.
    fn get_char_pref(&self, key: &str) -> Option<String>;

    /// Set a string preference.
    fn set_char_pref(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Check if a preference has been set.
    fn has_pref(&self, key: &str) -> bool {
        self.get_char_pref(key).is_some()
    }
}

/// A view of a store rooted at a key prefix, e.g. `extensions.callgate.`.
#[derive(Clone, Debug)]
pub struct PrefBranch {
    root: String,
}

impl PrefBranch {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// Full key for a name inside this branch.
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.root, name)
    }

    pub fn root(&self) -> &str {
        &self.root
    }
}

/// Memory-backed preferences.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get_char_pref(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set_char_pref(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Preferences persisted as a single JSON object on disk.
#[derive(Debug)]
pub struct JsonFilePreferences {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl JsonFilePreferences {
    /// Open (or lazily create) the preference file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let data = fs::read_to_string(&path)?;
            if data.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&data)?
            }
        } else {
            BTreeMap::new()
        };

        tracing::debug!("Loaded {} preferences from {}", values.len(), path.display());

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_string_pretty(values)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn get_char_pref(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set_char_pref(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.write();
        let mut next = values.clone();
        next.insert(key.to_string(), value.to_string());
        self.save(&next)?;
        *values = next;
        Ok(())
    }
}
