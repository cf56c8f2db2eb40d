//! Warehouse access for conversation history
//!
//! The persistent store client issues commands against the warehouse and
//! classifies its failures; the connection manager owns one client and hides
//! reconnection from everybody else.

mod connection;
mod jsonl;

pub use connection::{
    ConnectionManager, ConnectionState, ConnectionStatus, RetryPolicy, DEFAULT_BASE_DELAY,
    DEFAULT_JITTER_RATIO, DEFAULT_MAX_RETRIES,
};
pub use jsonl::JsonlStore;

use crate::memory::ConversationTurn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Warehouse error code reported when the session token has expired
pub const TOKEN_EXPIRED_ERROR_CODE: &str = "390114";

const TOKEN_EXPIRED_MESSAGE: &str = "authentication token has expired";

/// One unit of work against the warehouse.
///
/// Commands are plain values so the connection manager can retry them after
/// a reconnect without asking the caller for anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreCommand {
    /// Append turns to a session's history, preserving their order
    AppendTurns {
        session_id: String,
        turns: Vec<ConversationTurn>,
    },
    /// Read a session's full history, oldest first
    LoadHistory { session_id: String },
    /// Cheap liveness probe
    Ping,
}

impl StoreCommand {
    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::AppendTurns { .. } => "append_turns",
            Self::LoadHistory { .. } => "load_history",
            Self::Ping => "ping",
        }
    }
}

/// What a successful command produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreOutput {
    /// Number of turns written
    Written(usize),
    /// History of a session, oldest first
    History(Vec<ConversationTurn>),
    Pong,
}

/// How a warehouse failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Session token expired; recoverable by re-authenticating
    TokenExpired,
    /// Network, timeout or similar; recoverable by retrying
    Transient,
    /// Malformed command or authorization denial; never retried
    Permanent,
}

impl FailureKind {
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

/// Failure reported by a persistent store client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct StoreError {
    pub kind: FailureKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn token_expired(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TokenExpired, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    /// Classify a raw warehouse error message.
    ///
    /// Token expiry is only recognised when both the error code and the
    /// expiry text are present; the code alone is reused by other auth errors.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        let kind = if lower.contains(TOKEN_EXPIRED_ERROR_CODE)
            && lower.contains(TOKEN_EXPIRED_MESSAGE)
        {
            FailureKind::TokenExpired
        } else if is_transient_message(&lower) {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        };

        Self { kind, message }
    }
}

fn is_transient_message(lower: &str) -> bool {
    lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("network")
        || lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("connection closed")
        || lower.contains("temporarily unavailable")
        || lower.contains("503")
}

/// Client for one warehouse connection.
///
/// Implementations only run commands and report classified failures; retry
/// and reconnection policy belong to [`ConnectionManager`].
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Run one command against the current connection
    async fn run(&self, command: &StoreCommand) -> std::result::Result<StoreOutput, StoreError>;

    /// Drop the current connection and authenticate a fresh one
    async fn reconnect(&self) -> std::result::Result<(), StoreError>;

    /// Release the connection
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_token_expired_requires_code_and_text() {
        let err = StoreError::classify(
            "390114 (08001): Authentication token has expired.  The user must authenticate again.",
        );
        assert_eq!(err.kind, FailureKind::TokenExpired);

        let err = StoreError::classify("390114: Incorrect username or password was specified.");
        assert_eq!(err.kind, FailureKind::Permanent);
    }

    #[test]
    fn test_classify_transient_and_permanent() {
        assert_eq!(
            StoreError::classify("Connection reset by peer").kind,
            FailureKind::Transient
        );
        assert_eq!(
            StoreError::classify("request timed out after 30s").kind,
            FailureKind::Transient
        );
        assert_eq!(
            StoreError::classify("SQL compilation error: syntax error line 1").kind,
            FailureKind::Permanent
        );
    }

    #[test]
    fn test_command_labels() {
        assert_eq!(StoreCommand::Ping.label(), "ping");
        assert_eq!(
            StoreCommand::LoadHistory {
                session_id: "s".to_string()
            }
            .label(),
            "load_history"
        );
    }
}
