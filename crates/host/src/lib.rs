//! Callgate host.
//!
//! This crate ties the bridge together for one process:
//! - Configuration of stores, allow-list and consent text
//! - The extension host that injects the call API into page documents
//! - A terminal consent prompt

pub mod config;
pub mod host;
pub mod prompt;

pub use config::HostConfig;
pub use host::ExtensionHost;
pub use prompt::TerminalPrompt;

/// Host version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
