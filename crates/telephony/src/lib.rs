//! Privileged telephony session for page script.
//!
//! This crate provides:
//! - The engine trait and its session/media observers
//! - Property marshalling for engine configuration
//! - The shared session and call state machine
//! - A simulated in-process engine

pub mod engine;
pub mod property;
pub mod session;
pub mod simulated;

pub use engine::{
    media_observer_or_noop, session_observer_or_noop, CapturedImage, EngineError, MediaEvent,
    MediaObserver, NoopObserver, SessionEvent, SessionObserver, TelephonyEngine, VideoTarget,
};
pub use property::{PropertyBag, PropertyCodec, PropertyKind, PropertyValue, PROPERTY_SCHEMA};
pub use session::{
    CallDirection, CallId, CallInfo, CallState, InboundOffer, PrivilegedSession,
    RegistrationMode, SessionStatus,
};
pub use simulated::{EngineCall, SimulatedEngine};
