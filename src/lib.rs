//! Turnkeeper - resilient conversation persistence
//!
//! Keeps a conversational assistant's history safe while the warehouse
//! behind it misbehaves:
//! - Batches per-message writes into a per-session write buffer
//! - Survives authentication-token expiry with bounded, backed-off reconnects
//! - Fans long-term memory lookups out to the user and assistant backends

pub mod config;
pub mod memory;
pub mod session;
pub mod warehouse;

pub use config::{Mem0Config, TurnkeeperConfig};
pub use memory::{
    BackendId, ConversationTurn, MemoryBackend, MemoryContext, MemoryOrchestrator,
    MemoryRecord, TurnRole, WriteBuffer,
};
pub use session::{Session, SessionManager, SystemStatus};
pub use warehouse::{
    ConnectionManager, ConnectionState, ConnectionStatus, FailureKind, PersistentStore,
    RetryPolicy, StoreCommand, StoreError, StoreOutput,
};

/// Result type for Turnkeeper operations
pub type Result<T> = std::result::Result<T, TurnkeeperError>;

/// Errors that can occur in Turnkeeper
#[derive(Debug, thiserror::Error)]
pub enum TurnkeeperError {
    #[error("Authentication token expired: {0}")]
    TokenExpired(String),

    #[error("Transient warehouse failure: {0}")]
    Transient(String),

    #[error("Permanent warehouse failure: {0}")]
    Permanent(String),

    #[error("Connection exhausted after {attempts} reconnect attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: StoreError },

    #[error("Memory backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: BackendId, reason: String },

    #[error("All memory backends unavailable (user: {user}; assistant: {assistant})")]
    AllBackendsUnavailable { user: String, assistant: String },

    #[error("Write buffer for session {0} is closed")]
    BufferClosed(String),

    #[error("{pending} turns for session {session_id} are not durable: {source}")]
    Unflushed {
        session_id: String,
        pending: usize,
        #[source]
        source: Box<TurnkeeperError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<StoreError> for TurnkeeperError {
    fn from(err: StoreError) -> Self {
        match err.kind {
            FailureKind::TokenExpired => Self::TokenExpired(err.message),
            FailureKind::Transient => Self::Transient(err.message),
            FailureKind::Permanent => Self::Permanent(err.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_maps_by_kind() {
        let err: TurnkeeperError = StoreError::token_expired("390114").into();
        assert!(matches!(err, TurnkeeperError::TokenExpired(_)));

        let err: TurnkeeperError = StoreError::transient("reset").into();
        assert!(matches!(err, TurnkeeperError::Transient(_)));

        let err: TurnkeeperError = StoreError::permanent("syntax error").into();
        assert!(matches!(err, TurnkeeperError::Permanent(_)));
    }

    #[test]
    fn test_unflushed_display_names_session() {
        let err = TurnkeeperError::Unflushed {
            session_id: "alice".to_string(),
            pending: 3,
            source: Box::new(TurnkeeperError::Transient("timeout".to_string())),
        };
        let text = err.to_string();
        assert!(text.contains("alice"));
        assert!(text.contains('3'));
    }
}
