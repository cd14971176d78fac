//! Page bridge for the privileged call capability.
//!
//! This crate provides:
//! - `CallApi`, the narrow capability bound to one page's origin
//! - Boa bindings exposing it to page script as `navigator.service.call`
//! - `PageContext`, the isolated per-document script context

pub mod bindings;
pub mod bridge;
pub mod console;
pub mod context;

pub use bindings::{ObserverEvent, ObserverKind};
pub use bridge::{
    BridgeServices, CallApi, CallOutput, CallRequest, Operation, CONSENT_MESSAGE,
};
pub use context::PageContext;
