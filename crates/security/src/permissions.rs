//! Per-origin permission decisions.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::origin::Origin;
use crate::StoreError;

/// Permission type recorded for the privileged call capability.
pub const PRIVILEGED_CALL: &str = "privileged-call";

/// Trust decision for an origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrustDecision {
    /// Origin may use the capability.
    Allow,
    /// Origin may not use the capability.
    Deny,
    /// No decision recorded; the user must be asked.
    Unknown,
}

impl TrustDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, TrustDecision::Allow)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, TrustDecision::Unknown)
    }
}

/// A decision that can be persisted. `Unknown` is never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
}

impl From<Verdict> for TrustDecision {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Allow => TrustDecision::Allow,
            Verdict::Deny => TrustDecision::Deny,
        }
    }
}

/// Permission backend keyed by `(origin, permission type)`.
pub trait PermissionStore: Send + Sync {
    /// Look up the exact decision for an origin, `Unknown` when absent.
    fn test_exact(&self, origin: &Origin, kind: &str) -> TrustDecision;

    /// Record a decision.
    fn add(&self, origin: &Origin, kind: &str, verdict: Verdict) -> Result<(), StoreError>;

    /// Forget a decision so the origin is asked again.
    fn remove(&self, origin: &Origin, kind: &str) -> Result<(), StoreError>;
}

type DecisionTable = BTreeMap<String, BTreeMap<String, Verdict>>;

fn lookup(table: &DecisionTable, origin: &Origin, kind: &str) -> TrustDecision {
    table
        .get(&origin.serialize())
        .and_then(|kinds| kinds.get(kind))
        .map(|verdict| TrustDecision::from(*verdict))
        .unwrap_or(TrustDecision::Unknown)
}

fn remove_entry(table: &mut DecisionTable, origin: &Origin, kind: &str) -> bool {
    let key = origin.serialize();
    let Some(kinds) = table.get_mut(&key) else {
        return false;
    };
    let removed = kinds.remove(kind).is_some();
    if kinds.is_empty() {
        table.remove(&key);
    }
    removed
}

/// Memory-backed permission store.
#[derive(Debug, Default)]
pub struct MemoryPermissions {
    states: RwLock<DecisionTable>,
}

impl MemoryPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of origins with at least one recorded decision.
    pub fn origin_count(&self) -> usize {
        self.states.read().len()
    }
}

impl PermissionStore for MemoryPermissions {
    fn test_exact(&self, origin: &Origin, kind: &str) -> TrustDecision {
        lookup(&self.states.read(), origin, kind)
    }

    fn add(&self, origin: &Origin, kind: &str, verdict: Verdict) -> Result<(), StoreError> {
        self.states
            .write()
            .entry(origin.serialize())
            .or_default()
            .insert(kind.to_string(), verdict);
        Ok(())
    }

    fn remove(&self, origin: &Origin, kind: &str) -> Result<(), StoreError> {
        remove_entry(&mut self.states.write(), origin, kind);
        Ok(())
    }
}

/// Permission store persisted as JSON: `{ origin: { kind: "allow" | "deny" } }`.
#[derive(Debug)]
pub struct JsonFilePermissions {
    path: PathBuf,
    states: RwLock<DecisionTable>,
}

impl JsonFilePermissions {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let states = if path.exists() {
            let data = fs::read_to_string(&path)?;
            if data.trim().is_empty() {
                DecisionTable::new()
            } else {
                serde_json::from_str(&data)?
            }
        } else {
            DecisionTable::new()
        };

        tracing::debug!(
            "Loaded permission decisions for {} origins from {}",
            states.len(),
            path.display()
        );

        Ok(Self {
            path,
            states: RwLock::new(states),
        })
    }

    fn save(&self, states: &DecisionTable) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(states)?)?;
        Ok(())
    }
}

impl PermissionStore for JsonFilePermissions {
    fn test_exact(&self, origin: &Origin, kind: &str) -> TrustDecision {
        lookup(&self.states.read(), origin, kind)
    }

    fn add(&self, origin: &Origin, kind: &str, verdict: Verdict) -> Result<(), StoreError> {
        let mut states = self.states.write();
        let mut next = states.clone();
        next.entry(origin.serialize())
            .or_default()
            .insert(kind.to_string(), verdict);
        self.save(&next)?;
        *states = next;
        Ok(())
    }

    fn remove(&self, origin: &Origin, kind: &str) -> Result<(), StoreError> {
        let mut states = self.states.write();
        let mut next = states.clone();
        if remove_entry(&mut next, origin, kind) {
            self.save(&next)?;
            *states = next;
        }
        Ok(())
    }
}
