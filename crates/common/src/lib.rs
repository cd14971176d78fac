//! Common types shared across the call bridge crates.

pub mod error;

pub use error::{BridgeError, BridgeResult};
