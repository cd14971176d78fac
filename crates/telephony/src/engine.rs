//! The privileged telephony engine and its observers.
//!
//! The engine is an external collaborator. Every operation returns as soon
//! as the engine has accepted the request; progress is reported later through
//! the observer passed with the request.

use std::sync::Arc;
use thiserror::Error;

use crate::property::{PropertyBag, PropertyValue};

/// Failure reported by the engine itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine unavailable")]
    Unavailable,
    #[error("{0}")]
    Rejected(String),
    #[error("media error: {0}")]
    Media(String),
}

/// Event delivered to a session (registration) observer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Registration state reported by the engine (`registered`, `unregistered`, ...).
    RegistrationState(String),
    /// A remote party is calling; answer with `answerCall`.
    IncomingCall { name: String, number: String },
    /// Something went wrong with the session.
    Error(String),
}

impl SessionEvent {
    /// Wire name passed as the first observer argument.
    pub fn state(&self) -> &str {
        match self {
            SessionEvent::RegistrationState(state) => state.as_str(),
            SessionEvent::IncomingCall { .. } => "incoming-call",
            SessionEvent::Error(_) => "error",
        }
    }

    /// Detail passed as the second observer argument.
    pub fn detail(&self) -> &str {
        match self {
            SessionEvent::RegistrationState(_) => "",
            SessionEvent::IncomingCall { number, .. } => number.as_str(),
            SessionEvent::Error(message) => message.as_str(),
        }
    }
}

/// Event delivered to a media (call) observer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaEvent {
    CallConnected,
    CallTerminated,
    CallHeld,
    CallResumed,
    Error(String),
}

impl MediaEvent {
    pub fn state(&self) -> &str {
        match self {
            MediaEvent::CallConnected => "call-connected",
            MediaEvent::CallTerminated => "call-terminated",
            MediaEvent::CallHeld => "call-held",
            MediaEvent::CallResumed => "call-resumed",
            MediaEvent::Error(_) => "error",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            MediaEvent::Error(message) => message.as_str(),
            _ => "",
        }
    }
}

/// Receives session state changes.
pub trait SessionObserver: Send + Sync {
    fn on_session_event(&self, event: &SessionEvent);
}

/// Receives media state changes for one call.
pub trait MediaObserver: Send + Sync {
    fn on_media_event(&self, event: &MediaEvent);
}

/// Observer that ignores everything. Stands in for omitted observers.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn on_session_event(&self, _event: &SessionEvent) {}
}

impl MediaObserver for NoopObserver {
    fn on_media_event(&self, _event: &MediaEvent) {}
}

/// Replace an omitted session observer with a no-op one.
pub fn session_observer_or_noop(
    observer: Option<Arc<dyn SessionObserver>>,
) -> Arc<dyn SessionObserver> {
    observer.unwrap_or_else(|| Arc::new(NoopObserver))
}

/// Replace an omitted media observer with a no-op one.
pub fn media_observer_or_noop(observer: Option<Arc<dyn MediaObserver>>) -> Arc<dyn MediaObserver> {
    observer.unwrap_or_else(|| Arc::new(NoopObserver))
}

/// Where the engine renders remote video for a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoTarget {
    /// Identifies the page surface (e.g. a canvas id).
    pub label: String,
    pub width: u32,
    pub height: u32,
}

impl VideoTarget {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

impl Default for VideoTarget {
    fn default() -> Self {
        Self {
            label: String::new(),
            width: 640,
            height: 480,
        }
    }
}

/// Still image captured by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// The native telephony and media engine.
pub trait TelephonyEngine: Send + Sync {
    /// Whether the engine could be loaded at all.
    fn is_available(&self) -> bool {
        true
    }

    fn register_user(
        &self,
        device_id: &str,
        user: &str,
        credential: &str,
        proxy: &str,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<(), EngineError>;

    fn start_p2p_mode(&self, user: &str, observer: Arc<dyn SessionObserver>)
        -> Result<(), EngineError>;

    /// Expected to no-op when nothing is registered.
    fn unregister_user(&self) -> Result<(), EngineError>;

    fn place_call(
        &self,
        directory_number: &str,
        target: &VideoTarget,
        observer: Arc<dyn MediaObserver>,
    ) -> Result<(), EngineError>;

    fn place_p2p_call(
        &self,
        directory_number: &str,
        ip_address: &str,
        target: &VideoTarget,
        observer: Arc<dyn MediaObserver>,
    ) -> Result<(), EngineError>;

    fn answer_call(
        &self,
        target: &VideoTarget,
        observer: Arc<dyn MediaObserver>,
    ) -> Result<(), EngineError>;

    fn hangup_call(&self) -> Result<(), EngineError>;

    fn send_digits(&self, digits: &str) -> Result<(), EngineError>;

    fn set_property(&self, bag: &PropertyBag) -> Result<(), EngineError>;

    fn get_property(&self, name: &str) -> Result<Option<PropertyValue>, EngineError>;

    fn fetch_image(&self, is_file: bool) -> Result<CapturedImage, EngineError>;
}
