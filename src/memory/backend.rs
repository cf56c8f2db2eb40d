//! Long-term memory backends.
//!
//! The orchestrator talks to two of these per session: one scoped to the
//! user, one scoped to the assistant. It never looks inside them.

use super::ConversationTurn;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Which slot a backend fills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    User,
    Assistant,
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Assistant => f.write_str("assistant"),
        }
    }
}

/// One retrieved memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory: String,
    #[serde(default)]
    pub score: f64,
}

impl MemoryRecord {
    pub fn new(memory: impl Into<String>, score: f64) -> Self {
        Self {
            memory: memory.into(),
            score,
        }
    }
}

/// Outcome of one backend search within one orchestrator call
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryQueryResult {
    pub backend: BackendId,
    pub items: Vec<MemoryRecord>,
    pub succeeded: bool,
    pub error: Option<String>,
}

impl MemoryQueryResult {
    pub fn success(backend: BackendId, items: Vec<MemoryRecord>) -> Self {
        Self {
            backend,
            items,
            succeeded: true,
            error: None,
        }
    }

    pub fn failure(backend: BackendId, error: impl Into<String>) -> Self {
        Self {
            backend,
            items: Vec::new(),
            succeeded: false,
            error: Some(error.into()),
        }
    }
}

/// A search/store long-term memory service
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Records relevant to `query`, most relevant first
    async fn search(&self, query: &str) -> Result<Vec<MemoryRecord>>;

    async fn store(&self, turn: &ConversationTurn) -> Result<()>;
}

/// Stand-in when no long-term memory is configured: finds nothing, stores nothing.
#[derive(Debug, Clone, Default)]
pub struct NullBackend;

#[async_trait]
impl MemoryBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    async fn search(&self, query: &str) -> Result<Vec<MemoryRecord>> {
        debug!("Long-term memory disabled, no results for {:?}", query);
        Ok(Vec::new())
    }

    async fn store(&self, _turn: &ConversationTurn) -> Result<()> {
        debug!("Long-term memory disabled, turn not stored");
        Ok(())
    }
}

/// Builds the pair of backends for a session
pub trait BackendFactory: Send + Sync {
    /// Backend scoped to `user_id`
    fn user_backend(&self, user_id: &str) -> Arc<dyn MemoryBackend>;

    /// Backend scoped to the assistant persona, shared across users
    fn assistant_backend(&self) -> Arc<dyn MemoryBackend>;

    /// False when this factory only hands out stand-ins
    fn is_operational(&self) -> bool {
        true
    }
}

/// Factory used when long-term memory is not configured
#[derive(Debug, Clone, Default)]
pub struct NullFactory;

impl BackendFactory for NullFactory {
    fn user_backend(&self, _user_id: &str) -> Arc<dyn MemoryBackend> {
        Arc::new(NullBackend)
    }

    fn assistant_backend(&self) -> Arc<dyn MemoryBackend> {
        Arc::new(NullBackend)
    }

    fn is_operational(&self) -> bool {
        false
    }
}
