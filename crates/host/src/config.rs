//! Host configuration.

use callgate_security::{
    JsonFilePermissions, JsonFilePreferences, MemoryPermissions, MemoryPreferences,
    PermissionStore, PrefBranch, PreferenceStore, DEFAULT_ALLOWED_ORIGINS, PRIVILEGED_CALL,
};
use common::{BridgeError, BridgeResult};
use js_engine::CONSENT_MESSAGE;
use std::path::PathBuf;
use std::sync::Arc;

/// Host configuration.
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Preference branch the host's keys live under.
    pub pref_branch: String,
    /// Name of the allow-list preference inside the branch.
    pub allow_list_pref: String,
    /// Allow-list written when the preference is absent.
    pub default_allowed_origins: Vec<String>,
    /// Permission type decisions are recorded under.
    pub permission_type: String,
    /// Text shown by the consent prompt.
    pub consent_message: String,
    /// JSON preference file. In-memory preferences when unset.
    pub prefs_path: Option<PathBuf>,
    /// JSON permission file. In-memory decisions when unset.
    pub permissions_path: Option<PathBuf>,
    /// Size of the default video target.
    pub video_width: u32,
    pub video_height: u32,
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefs_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.prefs_path = Some(path.into());
        self
    }

    pub fn with_permissions_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.permissions_path = Some(path.into());
        self
    }

    pub fn with_default_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.default_allowed_origins = origins;
        self
    }

    pub fn with_consent_message(mut self, message: &str) -> Self {
        self.consent_message = message.to_string();
        self
    }

    pub fn with_video_size(mut self, width: u32, height: u32) -> Self {
        self.video_width = width;
        self.video_height = height;
        self
    }

    /// Full key of the allow-list preference.
    pub fn allow_list_key(&self) -> String {
        PrefBranch::new(self.pref_branch.as_str()).key(&self.allow_list_pref)
    }

    /// Open the configured preference store.
    pub fn open_preferences(&self) -> BridgeResult<Arc<dyn PreferenceStore>> {
        match &self.prefs_path {
            Some(path) => {
                let prefs = JsonFilePreferences::open(path).map_err(|e| {
                    BridgeError::config(format!("preferences {}: {}", path.display(), e))
                })?;
                Ok(Arc::new(prefs))
            }
            None => Ok(Arc::new(MemoryPreferences::new())),
        }
    }

    /// Open the configured permission store.
    pub fn open_permissions(&self) -> BridgeResult<Arc<dyn PermissionStore>> {
        match &self.permissions_path {
            Some(path) => {
                let permissions = JsonFilePermissions::open(path).map_err(|e| {
                    BridgeError::config(format!("permissions {}: {}", path.display(), e))
                })?;
                Ok(Arc::new(permissions))
            }
            None => Ok(Arc::new(MemoryPermissions::new())),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            pref_branch: "extensions.callgate.".to_string(),
            allow_list_pref: "allowedDomains".to_string(),
            default_allowed_origins: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            permission_type: PRIVILEGED_CALL.to_string(),
            consent_message: CONSENT_MESSAGE.to_string(),
            prefs_path: None,
            permissions_path: None,
            video_width: 640,
            video_height: 480,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.allow_list_key(), "extensions.callgate.allowedDomains");
        assert_eq!(
            config.default_allowed_origins,
            vec!["http://localhost", "http://mozilla.github.com"]
        );
        assert_eq!(config.permission_type, "privileged-call");
        assert_eq!((config.video_width, config.video_height), (640, 480));
        assert!(config.prefs_path.is_none());
    }

    #[test]
    fn test_builders() {
        let config = HostConfig::new()
            .with_prefs_path("/tmp/prefs.json")
            .with_consent_message("Allow calls?")
            .with_video_size(320, 240);
        assert_eq!(config.prefs_path, Some(PathBuf::from("/tmp/prefs.json")));
        assert_eq!(config.consent_message, "Allow calls?");
        assert_eq!(config.video_width, 320);
    }

    #[test]
    fn test_file_stores_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::new()
            .with_prefs_path(dir.path().join("prefs.json"))
            .with_permissions_path(dir.path().join("permissions.json"));

        let prefs = config.open_preferences().unwrap();
        prefs.set_char_pref("a", "b").unwrap();
        assert_eq!(prefs.get_char_pref("a"), Some("b".to_string()));
        assert!(config.open_permissions().is_ok());
    }
}
