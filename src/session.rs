//! Conversation sessions
//!
//! One [`Session`] per user, each owning its write buffer and memory
//! orchestrator. The [`SessionManager`] shares a single warehouse connection
//! between all of them and makes sure every session is closed, and its
//! turns flushed, before the connection goes away.

use crate::memory::{
    BackendFactory, BatchPolicy, ConversationTurn, Mem0Factory, MemoryContext,
    MemoryOrchestrator, NullFactory, StoreReport, Strategy, TurnRole, WriteBuffer,
};
use crate::warehouse::{ConnectionManager, ConnectionState, StoreCommand, StoreOutput};
use crate::{Result, TurnkeeperConfig, TurnkeeperError};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

/// Backend factory matching the configuration
pub fn backend_factory(config: &TurnkeeperConfig) -> Arc<dyn BackendFactory> {
    match &config.mem0 {
        Some(mem0) => Arc::new(Mem0Factory::new(mem0.clone(), config.assistant_id.clone())),
        None => {
            info!("No long-term memory configured, running without recall");
            Arc::new(NullFactory)
        }
    }
}

/// Message shape expected by chat-completion APIs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiMessage {
    pub role: TurnRole,
    pub content: String,
}

/// A user's conversation
pub struct Session {
    user_id: String,
    orchestrator: MemoryOrchestrator,
    recent: Mutex<VecDeque<ConversationTurn>>,
    short_term_size: usize,
    fetch_deadline: Duration,
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn buffer(&self) -> &Arc<WriteBuffer> {
        self.orchestrator.buffer()
    }

    fn lock_recent(&self) -> MutexGuard<'_, VecDeque<ConversationTurn>> {
        self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remember(&self, turn: ConversationTurn) {
        let mut recent = self.lock_recent();
        recent.push_back(turn);
        while recent.len() > self.short_term_size {
            recent.pop_front();
        }
    }

    /// Record one turn: queue it for the warehouse and hand it to both
    /// long-term memory backends.
    pub async fn record(&self, role: TurnRole, content: impl Into<String>) -> Result<StoreReport> {
        let turn = ConversationTurn::new(role, content);
        let report = self.orchestrator.store_turn(turn.clone()).await?;
        self.remember(turn);
        Ok(report)
    }

    /// Memories relevant to `query`. Never fails; an unreachable memory
    /// layer yields an empty context.
    pub async fn recall(&self, query: &str) -> MemoryContext {
        match self.orchestrator.fetch_context(query, self.fetch_deadline).await {
            Ok(context) => context,
            Err(e) => {
                warn!(user = %self.user_id, "Recall degraded to empty context: {}", e);
                MemoryContext::empty()
            }
        }
    }

    /// Recent turns, oldest first
    pub fn recent_history(&self) -> Vec<ConversationTurn> {
        self.lock_recent().iter().cloned().collect()
    }

    /// Recent turns as `role: content` lines
    pub fn formatted_history(&self) -> String {
        self.lock_recent()
            .iter()
            .map(ConversationTurn::format)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The last `limit` turns as API messages
    pub fn api_history(&self, limit: usize) -> Vec<ApiMessage> {
        let recent = self.lock_recent();
        let skip = recent.len().saturating_sub(limit);
        recent
            .iter()
            .skip(skip)
            .map(|turn| ApiMessage {
                role: turn.role,
                content: turn.content.clone(),
            })
            .collect()
    }

    pub async fn flush(&self) -> Result<usize> {
        self.buffer().force_flush().await
    }

    async fn close(&self) -> Result<()> {
        self.buffer().close().await
    }
}

/// Per-session summary for status output
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub user_id: String,
    pub pending: usize,
    pub flushes: u64,
    pub recent: usize,
}

/// Snapshot of the whole persistence layer
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub connection: ConnectionState,
    pub sessions: Vec<SessionStatus>,
    pub memory_enabled: bool,
    pub parallel_memory: bool,
}

impl SystemStatus {
    pub fn pending_total(&self) -> usize {
        self.sessions.iter().map(|s| s.pending).sum()
    }
}

/// Owner of every open session and the shared warehouse connection
pub struct SessionManager {
    config: TurnkeeperConfig,
    connection: Arc<ConnectionManager>,
    factory: Arc<dyn BackendFactory>,
    sessions: AsyncMutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(
        config: TurnkeeperConfig,
        connection: Arc<ConnectionManager>,
        factory: Arc<dyn BackendFactory>,
    ) -> Self {
        Self {
            config,
            connection,
            factory,
            sessions: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TurnkeeperConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Open the session for `user_id`, or return the one already open.
    ///
    /// Prior history is loaded into the short-term window; if the warehouse
    /// cannot be read the session starts empty. The session map is not held
    /// while history loads, so other users are never kept waiting.
    pub async fn open(&self, user_id: &str) -> Result<Arc<Session>> {
        if let Some(session) = self.sessions.lock().await.get(user_id) {
            return Ok(session.clone());
        }

        if self.config.strict_memory && !self.factory.is_operational() {
            return Err(TurnkeeperError::Config(
                "strict_memory is set but no long-term memory backend is configured".to_string(),
            ));
        }

        let history = match self.load_history(user_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(user = user_id, "Starting with empty history: {}", e);
                Vec::new()
            }
        };

        let mut sessions = self.sessions.lock().await;
        // Another caller may have opened it while history was loading
        if let Some(session) = sessions.get(user_id) {
            return Ok(session.clone());
        }

        let session = Arc::new(self.build_session(user_id));
        let skip = history.len().saturating_sub(self.config.short_term_size);
        for turn in history.into_iter().skip(skip) {
            session.remember(turn);
        }

        info!(user = user_id, recent = session.lock_recent().len(), "Session opened");
        sessions.insert(user_id.to_string(), session.clone());
        Ok(session)
    }

    fn build_session(&self, user_id: &str) -> Session {
        let buffer = Arc::new(WriteBuffer::new(
            user_id,
            self.connection.clone(),
            BatchPolicy::from_config(&self.config),
        ));
        let strategy = if self.config.parallel_memory {
            Strategy::Concurrent
        } else {
            Strategy::Sequential
        };
        let orchestrator = MemoryOrchestrator::new(
            self.factory.user_backend(user_id),
            self.factory.assistant_backend(),
            buffer,
            strategy,
        )
        .with_store_deadline(self.config.fetch_deadline);

        Session {
            user_id: user_id.to_string(),
            orchestrator,
            recent: Mutex::new(VecDeque::new()),
            short_term_size: self.config.short_term_size,
            fetch_deadline: self.config.fetch_deadline,
        }
    }

    /// Persisted history for `user_id`, oldest first
    pub async fn load_history(&self, user_id: &str) -> Result<Vec<ConversationTurn>> {
        let command = StoreCommand::LoadHistory {
            session_id: user_id.to_string(),
        };
        match self.connection.execute(command).await? {
            StoreOutput::History(turns) => Ok(turns),
            other => Err(TurnkeeperError::Permanent(format!(
                "unexpected warehouse reply to load_history: {other:?}"
            ))),
        }
    }

    /// Close one session, flushing its buffer.
    ///
    /// If the final flush fails the session stays registered, so a later
    /// close can retry it.
    pub async fn close(&self, user_id: &str) -> Result<()> {
        let Some(session) = self.sessions.lock().await.remove(user_id) else {
            debug!(user = user_id, "No open session to close");
            return Ok(());
        };
        if let Err(e) = session.close().await {
            self.keep_unclosed(session).await;
            return Err(e);
        }
        info!(user = user_id, "Session closed");
        Ok(())
    }

    /// Close every session, then the warehouse connection. Returns the first
    /// failure after trying them all.
    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, session)| session).collect()
        };

        let mut first_error = None;
        for session in drained {
            if let Err(e) = session.close().await {
                error!(user = %session.user_id, "Session could not be closed cleanly: {}", e);
                self.keep_unclosed(session).await;
                first_error.get_or_insert(e);
            }
        }

        self.connection.close().await;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Put back a session whose final flush failed
    async fn keep_unclosed(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.user_id) {
            error!(
                user = %session.user_id,
                pending = session.buffer().pending_len(),
                "Session reopened while closing; unflushed turns are only held by the old buffer"
            );
            return;
        }
        sessions.insert(session.user_id.clone(), session);
    }

    pub async fn status(&self) -> SystemStatus {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().await.values().cloned().collect();
        let mut summaries: Vec<SessionStatus> = sessions
            .iter()
            .map(|session| SessionStatus {
                user_id: session.user_id.clone(),
                pending: session.buffer().pending_len(),
                flushes: session.buffer().flush_count(),
                recent: session.lock_recent().len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        SystemStatus {
            connection: self.connection.state(),
            sessions: summaries,
            memory_enabled: self.factory.is_operational(),
            parallel_memory: self.config.parallel_memory,
        }
    }
}
