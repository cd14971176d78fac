//! Static allow-list plus persisted per-origin decisions.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::origin::Origin;
use crate::permissions::{PermissionStore, TrustDecision, Verdict};
use crate::prefs::PreferenceStore;
use crate::StoreError;

/// Origins used when the allow-list preference has never been written.
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 2] = ["http://localhost", "http://mozilla.github.com"];

/// Ordered list of always-trusted origins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowList {
    origins: Vec<Origin>,
}

impl AllowList {
    pub fn new(origins: Vec<Origin>) -> Self {
        Self { origins }
    }

    /// Build from `scheme://host[:port]` patterns, skipping ones that do not parse.
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Self {
        let origins = patterns
            .iter()
            .filter_map(|pattern| {
                let pattern = pattern.as_ref();
                let origin = Origin::parse(pattern);
                if origin.is_none() {
                    tracing::warn!("Ignoring malformed allow-list entry: {:?}", pattern);
                }
                origin
            })
            .collect();
        Self { origins }
    }

    /// Decode the JSON-encoded preference value.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let patterns: Vec<String> = serde_json::from_str(json)?;
        Ok(Self::from_patterns(&patterns))
    }

    pub fn contains(&self, origin: &Origin) -> bool {
        self.origins.iter().any(|listed| listed == origin)
    }

    pub fn origins(&self) -> &[Origin] {
        &self.origins
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

/// Trust source consulted by the consent gate.
pub struct OriginTrustStore {
    prefs: Arc<dyn PreferenceStore>,
    permissions: Arc<dyn PermissionStore>,
    allow_list_key: String,
    default_origins: Vec<String>,
    permission_type: String,
    allow_list: RwLock<Option<AllowList>>,
}

impl OriginTrustStore {
    /// Create a trust store. The allow-list is read on first use.
    pub fn new(
        prefs: Arc<dyn PreferenceStore>,
        permissions: Arc<dyn PermissionStore>,
        allow_list_key: impl Into<String>,
        permission_type: impl Into<String>,
    ) -> Self {
        Self {
            prefs,
            permissions,
            allow_list_key: allow_list_key.into(),
            default_origins: DEFAULT_ALLOWED_ORIGINS.iter().map(|s| s.to_string()).collect(),
            permission_type: permission_type.into(),
            allow_list: RwLock::new(None),
        }
    }

    /// Replace the list written when the preference is absent.
    pub fn with_default_origins(mut self, origins: Vec<String>) -> Self {
        self.default_origins = origins;
        self
    }

    /// Check if an origin is on the allow-list.
    pub fn is_listed(&self, origin: &Origin) -> bool {
        if let Some(list) = self.allow_list.read().as_ref() {
            return list.contains(origin);
        }

        let list = self.load_allow_list();
        let listed = list.contains(origin);
        *self.allow_list.write() = Some(list);
        listed
    }

    /// Current allow-list, loading it if needed.
    pub fn allow_list(&self) -> AllowList {
        if let Some(list) = self.allow_list.read().as_ref() {
            return list.clone();
        }
        let list = self.load_allow_list();
        *self.allow_list.write() = Some(list.clone());
        list
    }

    /// Drop the cached allow-list so the next lookup re-reads the preference.
    pub fn reload_allow_list(&self) {
        *self.allow_list.write() = None;
    }

    /// Persisted decision for an origin, `Unknown` when none was recorded.
    pub fn decision(&self, origin: &Origin) -> TrustDecision {
        self.permissions.test_exact(origin, &self.permission_type)
    }

    /// Persist an explicit decision.
    pub fn set_decision(&self, origin: &Origin, verdict: Verdict) -> Result<(), StoreError> {
        tracing::info!("Recording {:?} for {}", verdict, origin);
        self.permissions.add(origin, &self.permission_type, verdict)
    }

    /// Forget a decision. Used by external management, not by the gate.
    pub fn revoke(&self, origin: &Origin) -> Result<(), StoreError> {
        self.permissions.remove(origin, &self.permission_type)
    }

    fn load_allow_list(&self) -> AllowList {
        let raw = match self.prefs.get_char_pref(&self.allow_list_key) {
            Some(raw) => raw,
            None => {
                let encoded = serde_json::to_string(&self.default_origins)
                    .unwrap_or_else(|_| "[]".to_string());
                if let Err(err) = self.prefs.set_char_pref(&self.allow_list_key, &encoded) {
                    tracing::warn!("Failed to write default allow-list: {}", err);
                }
                encoded
            }
        };

        match AllowList::from_json(&raw) {
            Ok(list) => {
                tracing::debug!("Allow-list loaded with {} origins", list.len());
                list
            }
            Err(err) => {
                tracing::warn!(
                    "Allow-list preference {} is malformed ({}); trusting no origins",
                    self.allow_list_key,
                    err
                );
                AllowList::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{MemoryPermissions, PRIVILEGED_CALL};
    use crate::prefs::MemoryPreferences;

    const KEY: &str = "extensions.callgate.allowedDomains";

    fn store_with(prefs: Arc<MemoryPreferences>) -> OriginTrustStore {
        OriginTrustStore::new(prefs, Arc::new(MemoryPermissions::new()), KEY, PRIVILEGED_CALL)
    }

    #[test]
    fn test_default_allow_list_written_on_first_use() {
        let prefs = Arc::new(MemoryPreferences::new());
        let store = store_with(prefs.clone());
        assert!(!prefs.has_pref(KEY));

        assert!(store.is_listed(&Origin::parse("http://localhost").unwrap()));
        assert!(store.is_listed(&Origin::parse("http://mozilla.github.com/demo").unwrap()));
        assert!(!store.is_listed(&Origin::parse("http://localhost:8080").unwrap()));

        let written = prefs.get_char_pref(KEY).unwrap();
        assert_eq!(written, r#"["http://localhost","http://mozilla.github.com"]"#);
    }

    #[test]
    fn test_configured_allow_list() {
        let prefs = Arc::new(MemoryPreferences::new());
        prefs
            .set_char_pref(KEY, r#"["https://Phone.Example:8443", "bogus entry"]"#)
            .unwrap();
        let store = store_with(prefs);

        assert!(store.is_listed(&Origin::parse("https://phone.example:8443/app").unwrap()));
        assert!(!store.is_listed(&Origin::parse("http://localhost").unwrap()));
        assert_eq!(store.allow_list().len(), 1);
    }

    #[test]
    fn test_malformed_allow_list_trusts_nobody() {
        let prefs = Arc::new(MemoryPreferences::new());
        prefs.set_char_pref(KEY, "{not: a list}").unwrap();
        let store = store_with(prefs);

        assert!(!store.is_listed(&Origin::parse("http://localhost").unwrap()));
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let prefs = Arc::new(MemoryPreferences::new());
        let store = store_with(prefs.clone());
        let origin = Origin::parse("https://new.example").unwrap();
        assert!(!store.is_listed(&origin));

        prefs.set_char_pref(KEY, r#"["https://new.example"]"#).unwrap();
        assert!(!store.is_listed(&origin));

        store.reload_allow_list();
        assert!(store.is_listed(&origin));
    }

    #[test]
    fn test_decisions() {
        let store = store_with(Arc::new(MemoryPreferences::new()));
        let origin = Origin::parse("https://unknown.example").unwrap();

        assert_eq!(store.decision(&origin), TrustDecision::Unknown);
        store.set_decision(&origin, Verdict::Allow).unwrap();
        assert_eq!(store.decision(&origin), TrustDecision::Allow);
        store.revoke(&origin).unwrap();
        assert_eq!(store.decision(&origin), TrustDecision::Unknown);
    }
}
