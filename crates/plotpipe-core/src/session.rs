//! Session types for engine session management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an engine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an engine session.
///
/// `Starting` moves to `Ready` once the start-up handshake is done. A session
/// is `Busy` while a command is executing and `Closed` once terminated or
/// after a broken pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Spawned, handshake not finished
    Starting,
    /// Idle and accepting commands
    Ready,
    /// A command is executing
    Busy,
    /// Terminated; only a final drain is allowed
    Closed,
}

impl SessionStatus {
    /// Whether commands may still be written to the engine.
    pub fn is_open(self) -> bool {
        !matches!(self, SessionStatus::Closed)
    }
}

/// One of the engine's two output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Engine standard output
    Stdout,
    /// Engine standard error
    Stderr,
}

impl StreamKind {
    /// Short stream name, used for thread names and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Information about a running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier
    pub id: SessionId,
    /// Engine program that was launched
    pub program: String,
    /// OS process id of the engine, if still known
    pub pid: Option<u32>,
    /// Current status
    pub status: SessionStatus,
    /// When the engine was spawned
    pub started_at: DateTime<Utc>,
    /// Number of framed commands written so far
    pub commands_sent: u64,
    /// Terminal the engine is currently plotting to
    pub active_terminal: Option<String>,
}
