//! # plotpipe-session
//!
//! Engine session management for plotpipe.
//!
//! This crate turns an interactive, line-oriented plotting engine running
//! behind stdio pipes into a request/response API:
//! - Engine process spawning and termination
//! - Background line readers feeding per-stream output queues
//! - Sentinel-based command framing with a correlation table
//! - Caret-style engine error detection
//!
//! ## Architecture
//!
//! This is Layer 1 in the architecture - it depends on plotpipe-core for
//! errors, configuration and session types.
//!
//! ## Example
//! ```no_run
//! use plotpipe_session::Session;
//!
//! # fn main() -> plotpipe_core::Result<()> {
//! let session = Session::new("gnuplot")?;
//! assert_eq!(session.ask("print 1+1")?, vec!["2".to_string()]);
//! session.send("plot sin(x)", true)?;
//! session.terminate()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod detector;
pub mod framer;
pub mod logging;
pub mod process;
pub mod queue;
pub mod reader;
pub mod session;

// Re-export commonly used types
pub use detector::{ErrorDetector, ErrorReport};
pub use framer::{CommandTracker, Framer, SentinelTag};
pub use logging::init_tracing;
pub use process::EngineProcess;
pub use queue::OutputQueue;
pub use reader::LineReader;
pub use session::Session;

pub use plotpipe_core::{Error, Result, SessionConfig, SessionInfo, SessionStatus, StreamKind};
