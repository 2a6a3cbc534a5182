//! # plotpipe-core
//!
//! Core types for plotpipe.
//!
//! This crate contains all fundamental types with **no internal dependencies**
//! on other plotpipe crates. It provides:
//!
//! - Session types (SessionId, SessionStatus, SessionInfo, StreamKind)
//! - Configuration loaded from YAML
//! - Error types
//!
//! ## Architecture
//!
//! This is Layer 0 in the architecture - the session crate depends on this one,
//! but this crate has no dependencies on other plotpipe crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod session;

// Re-export commonly used types
pub use config::{EngineSettings, FramingSettings, LogSettings, SessionConfig, TimingSettings};
pub use error::{Error, Result};
pub use session::{SessionId, SessionInfo, SessionStatus, StreamKind};
