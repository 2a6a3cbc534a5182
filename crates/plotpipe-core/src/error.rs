//! Error types for plotpipe.

use thiserror::Error;

/// Main error type for plotpipe operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine process could not be created
    #[error("Failed to spawn engine '{program}': {source}")]
    Spawn {
        /// Program that was launched
        program: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Writing to the engine's stdin failed
    #[error("Broken pipe to engine: {0}")]
    BrokenPipe(String),

    /// The engine exited while a command was in flight
    #[error("Engine process has exited")]
    ProcessExited,

    /// Session already terminated
    #[error("Session already terminated")]
    SessionTerminated,

    /// The engine reported an error for a command
    #[error("Engine error in '{command}': {message}")]
    Engine {
        /// Command text that was sent
        command: String,
        /// Reconstructed error text (echoed line, caret and diagnostic)
        message: String,
        /// Raw stderr lines drained from the error window
        lines: Vec<String>,
    },

    /// A command sent through `ask` produced no output and no error
    #[error("No response from engine for '{0}'")]
    EmptyResponse(String),

    /// Timeout waiting for a command to complete
    #[error("Timeout waiting for command completion after {0}ms")]
    WaitTimeout(u64),

    /// A response line could not be converted to the requested type
    #[error("Parse error: {0}")]
    Parse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input or parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether this error leaves the session unusable.
    ///
    /// Terminal errors are never retried; the caller has to create a new
    /// session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Spawn { .. } | Error::BrokenPipe(_) | Error::ProcessExited | Error::SessionTerminated
        )
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
