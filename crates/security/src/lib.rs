//! Origin trust for the privileged call capability.
//!
//! This crate decides whether a calling page may use the capability:
//! - Origins derived from page locations
//! - A static allow-list kept in preferences
//! - Persisted per-origin Allow/Deny decisions
//! - The consent gate that prompts the user for unknown origins

pub mod consent;
pub mod error;
pub mod origin;
pub mod permissions;
pub mod prefs;
pub mod trust_store;

pub use consent::{AutoPrompt, ConsentGate, ConsentPrompt, PromptOutcome};
pub use error::StoreError;
pub use origin::Origin;
pub use permissions::{
    JsonFilePermissions, MemoryPermissions, PermissionStore, TrustDecision, Verdict,
    PRIVILEGED_CALL,
};
pub use prefs::{JsonFilePreferences, MemoryPreferences, PrefBranch, PreferenceStore};
pub use trust_store::{AllowList, OriginTrustStore, DEFAULT_ALLOWED_ORIGINS};
