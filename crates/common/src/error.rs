//! Common error types.

use thiserror::Error;

/// Error reported to the immediate caller of a bridged operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Consent was evaluated false; the privileged operation never ran.
    #[error("Permission denied for {origin}")]
    PermissionDenied { origin: String },

    /// A session or call precondition was violated; the engine was not invoked.
    #[error("Invalid state for {operation}: {state}")]
    InvalidStateTransition {
        operation: &'static str,
        state: String,
    },

    /// The engine itself reported a failure.
    #[error("Engine failure in {operation}: {message}")]
    EngineFailure {
        operation: &'static str,
        message: String,
    },

    /// The page binding this call came through has been torn down.
    #[error("Call API has been revoked")]
    Revoked,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn permission_denied(origin: impl Into<String>) -> Self {
        Self::PermissionDenied {
            origin: origin.into(),
        }
    }

    pub fn invalid_state(operation: &'static str, state: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            operation,
            state: state.into(),
        }
    }

    pub fn engine(operation: &'static str, message: impl Into<String>) -> Self {
        Self::EngineFailure {
            operation,
            message: message.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn script(msg: impl Into<String>) -> Self {
        Self::Script(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this is a consent refusal.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Check if this is a state-machine violation.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidStateTransition { .. })
    }

    /// Check if the engine reported this failure.
    pub fn is_engine_failure(&self) -> bool {
        matches!(self, Self::EngineFailure { .. })
    }

    /// Stable name of the error kind, exposed to page script as `code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "PermissionDenied",
            Self::InvalidStateTransition { .. } => "InvalidStateTransition",
            Self::EngineFailure { .. } => "EngineFailure",
            Self::Revoked => "Revoked",
            Self::Storage(_) => "Storage",
            Self::Script(_) => "Script",
            Self::Config(_) => "Config",
        }
    }
}

impl From<url::ParseError> for BridgeError {
    fn from(err: url::ParseError) -> Self {
        Self::Config(format!("URL parse error: {}", err))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("JSON error: {}", err))
    }
}
