//! Fan-out of long-term memory work to the user and assistant backends.
//!
//! Retrieval and storage run both backends concurrently when a runtime is
//! available, and sequentially otherwise. Either way a failing backend only
//! empties its own slot; it never fails the turn.

use super::backend::{BackendId, MemoryBackend, MemoryQueryResult, MemoryRecord};
use super::buffer::{FlushHandle, WriteBuffer};
use super::ConversationTurn;
use crate::{Result, TurnkeeperError};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long `store_turn` waits for the backends by default
pub const DEFAULT_STORE_DEADLINE: Duration = Duration::from_secs(5);

type SearchTask = (BackendId, Arc<dyn MemoryBackend>, JoinHandle<Result<Vec<MemoryRecord>>>);
type StoreTask = (BackendId, Arc<dyn MemoryBackend>, JoinHandle<Result<()>>);

/// How the orchestrator schedules the two backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One task per backend, joined with a deadline
    Concurrent,
    /// One backend after the other
    Sequential,
}

/// Memories retrieved for one query, in fixed slots
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryContext {
    pub user_memories: Vec<MemoryRecord>,
    pub assistant_memories: Vec<MemoryRecord>,
    /// Per-backend outcome, user first
    pub outcomes: [MemoryQueryResult; 2],
}

impl MemoryContext {
    /// Context with nothing in it, as used when memory is unavailable
    pub fn empty() -> Self {
        Self {
            user_memories: Vec::new(),
            assistant_memories: Vec::new(),
            outcomes: [
                MemoryQueryResult::success(BackendId::User, Vec::new()),
                MemoryQueryResult::success(BackendId::Assistant, Vec::new()),
            ],
        }
    }

    fn from_outcomes(user: MemoryQueryResult, assistant: MemoryQueryResult) -> Self {
        Self {
            user_memories: user.items.clone(),
            assistant_memories: assistant.items.clone(),
            outcomes: [user, assistant],
        }
    }

    /// True if at least one backend failed
    pub fn is_degraded(&self) -> bool {
        self.outcomes.iter().any(|o| !o.succeeded)
    }

    /// User memories, one per line, most relevant first
    pub fn user_text(&self) -> String {
        join_memories(&self.user_memories)
    }

    /// Assistant memories, one per line, most relevant first
    pub fn assistant_text(&self) -> String {
        join_memories(&self.assistant_memories)
    }
}

fn join_memories(records: &[MemoryRecord]) -> String {
    records
        .iter()
        .map(|r| r.memory.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// What happened to one stored turn
#[derive(Debug)]
pub struct StoreReport {
    /// Background flush started by the append, if the batch filled up
    pub flush: Option<FlushHandle>,
    pub user_stored: bool,
    pub assistant_stored: bool,
}

/// Per-session coordinator of the write buffer and both memory backends
pub struct MemoryOrchestrator {
    user: Arc<dyn MemoryBackend>,
    assistant: Arc<dyn MemoryBackend>,
    buffer: Arc<WriteBuffer>,
    strategy: Strategy,
    store_deadline: Duration,
}

impl MemoryOrchestrator {
    pub fn new(
        user: Arc<dyn MemoryBackend>,
        assistant: Arc<dyn MemoryBackend>,
        buffer: Arc<WriteBuffer>,
        strategy: Strategy,
    ) -> Self {
        Self {
            user,
            assistant,
            buffer,
            strategy,
            store_deadline: DEFAULT_STORE_DEADLINE,
        }
    }

    /// Bound how long `store_turn` waits for the backends. A store that is
    /// still running at the deadline keeps going in the background.
    pub fn with_store_deadline(mut self, deadline: Duration) -> Self {
        self.store_deadline = deadline;
        self
    }

    pub fn buffer(&self) -> &Arc<WriteBuffer> {
        &self.buffer
    }

    fn backends(&self) -> [(BackendId, Arc<dyn MemoryBackend>); 2] {
        [
            (BackendId::User, self.user.clone()),
            (BackendId::Assistant, self.assistant.clone()),
        ]
    }

    /// Concurrent scheduling needs a runtime to spawn onto
    fn effective_strategy(&self) -> Strategy {
        match self.strategy {
            Strategy::Concurrent if tokio::runtime::Handle::try_current().is_ok() => {
                Strategy::Concurrent
            }
            Strategy::Concurrent => {
                debug!("No runtime available, running memory backends sequentially");
                Strategy::Sequential
            }
            Strategy::Sequential => Strategy::Sequential,
        }
    }

    /// Search both backends, waiting at most `deadline`.
    ///
    /// A failed or late backend leaves its slot empty. Only when both fail
    /// does this return [`TurnkeeperError::AllBackendsUnavailable`].
    pub async fn fetch_context(&self, query: &str, deadline: Duration) -> Result<MemoryContext> {
        let started = Instant::now();
        let deadline = started + deadline;

        let [user, assistant] = match self.effective_strategy() {
            Strategy::Concurrent => self.fetch_concurrent(query, deadline).await,
            Strategy::Sequential => {
                let mut results = Vec::with_capacity(2);
                for (id, backend) in self.backends() {
                    results.push(search_guarded(id, backend.as_ref(), query, deadline).await);
                }
                into_pair(results)
            }
        };

        for outcome in [&user, &assistant] {
            if let Some(error) = &outcome.error {
                warn!(backend = %outcome.backend, "Memory backend unavailable: {}", error);
            }
        }
        debug!(
            user = user.items.len(),
            assistant = assistant.items.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Memory retrieval finished"
        );

        if !user.succeeded && !assistant.succeeded {
            return Err(TurnkeeperError::AllBackendsUnavailable {
                user: user.error.unwrap_or_default(),
                assistant: assistant.error.unwrap_or_default(),
            });
        }
        Ok(MemoryContext::from_outcomes(user, assistant))
    }

    async fn fetch_concurrent(&self, query: &str, deadline: Instant) -> [MemoryQueryResult; 2] {
        let spawned: Vec<SearchTask> = self
            .backends()
            .into_iter()
            .map(|(id, backend)| {
                let task_backend = backend.clone();
                let task_query = query.to_string();
                let handle = tokio::spawn(async move { task_backend.search(&task_query).await });
                (id, backend, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(2);
        for (id, backend, handle) in spawned {
            let abort = handle.abort_handle();
            let outcome = match tokio::time::timeout_at(deadline, handle).await {
                Err(_) => {
                    abort.abort();
                    MemoryQueryResult::failure(id, "deadline exceeded")
                }
                Ok(Ok(Ok(items))) => MemoryQueryResult::success(id, items),
                Ok(Ok(Err(e))) => MemoryQueryResult::failure(id, e.to_string()),
                Ok(Err(join_error)) => {
                    warn!(
                        backend = %id,
                        "Concurrent search failed ({}), retrying sequentially",
                        join_error
                    );
                    search_guarded(id, backend.as_ref(), query, deadline).await
                }
            };
            results.push(outcome);
        }
        into_pair(results)
    }

    /// Queue `turn` for the warehouse, then store it in both backends.
    ///
    /// The append happens first and never waits on I/O; backend failures are
    /// logged and reported, never returned. Only a failed append is an error.
    /// The backends get at most the store deadline; a late one counts as
    /// not stored.
    pub async fn store_turn(&self, turn: ConversationTurn) -> Result<StoreReport> {
        let flush = self.buffer.append(turn.clone())?;
        let turn = Arc::new(turn);
        let deadline = Instant::now() + self.store_deadline;

        let [user_stored, assistant_stored] = match self.effective_strategy() {
            Strategy::Concurrent => self.store_concurrent(&turn, deadline).await,
            Strategy::Sequential => {
                let mut stored = [false; 2];
                for (slot, (id, backend)) in self.backends().into_iter().enumerate() {
                    stored[slot] = store_guarded(id, backend.as_ref(), &turn, deadline).await;
                }
                stored
            }
        };

        Ok(StoreReport {
            flush,
            user_stored,
            assistant_stored,
        })
    }

    async fn store_concurrent(&self, turn: &Arc<ConversationTurn>, deadline: Instant) -> [bool; 2] {
        let spawned: Vec<StoreTask> = self
            .backends()
            .into_iter()
            .map(|(id, backend)| {
                let task_backend = backend.clone();
                let task_turn = turn.clone();
                let handle = tokio::spawn(async move { task_backend.store(&task_turn).await });
                (id, backend, handle)
            })
            .collect();

        let mut stored = [false; 2];
        for (slot, (id, backend, handle)) in spawned.into_iter().enumerate() {
            stored[slot] = match tokio::time::timeout_at(deadline, handle).await {
                Err(_) => {
                    warn!(backend = %id, "Long-term memory store still running, not waiting");
                    false
                }
                Ok(Ok(Ok(()))) => true,
                Ok(Ok(Err(e))) => {
                    warn!(backend = %id, "Failed to store turn in long-term memory: {}", e);
                    false
                }
                Ok(Err(join_error)) => {
                    warn!(
                        backend = %id,
                        "Concurrent store failed ({}), retrying sequentially",
                        join_error
                    );
                    store_guarded(id, backend.as_ref(), turn, deadline).await
                }
            };
        }
        stored
    }
}

fn into_pair(results: Vec<MemoryQueryResult>) -> [MemoryQueryResult; 2] {
    let mut results = results.into_iter();
    let user = results
        .next()
        .unwrap_or_else(|| MemoryQueryResult::failure(BackendId::User, "no result"));
    let assistant = results
        .next()
        .unwrap_or_else(|| MemoryQueryResult::failure(BackendId::Assistant, "no result"));
    [user, assistant]
}

/// Sequential search with the deadline applied and panics contained
async fn search_guarded(
    id: BackendId,
    backend: &dyn MemoryBackend,
    query: &str,
    deadline: Instant,
) -> MemoryQueryResult {
    let search = AssertUnwindSafe(backend.search(query)).catch_unwind();
    // Timers need a runtime; without one the backend's own timeout applies
    let outcome = if tokio::runtime::Handle::try_current().is_ok() {
        match tokio::time::timeout_at(deadline, search).await {
            Ok(outcome) => outcome,
            Err(_) => return MemoryQueryResult::failure(id, "deadline exceeded"),
        }
    } else {
        search.await
    };
    match outcome {
        Err(_) => MemoryQueryResult::failure(id, "backend panicked"),
        Ok(Ok(items)) => MemoryQueryResult::success(id, items),
        Ok(Err(e)) => MemoryQueryResult::failure(id, e.to_string()),
    }
}

async fn store_guarded(
    id: BackendId,
    backend: &dyn MemoryBackend,
    turn: &ConversationTurn,
    deadline: Instant,
) -> bool {
    let store = AssertUnwindSafe(backend.store(turn)).catch_unwind();
    let outcome = if tokio::runtime::Handle::try_current().is_ok() {
        match tokio::time::timeout_at(deadline, store).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(backend = %id, "Long-term memory store missed its deadline");
                return false;
            }
        }
    } else {
        store.await
    };
    match outcome {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(backend = %id, "Failed to store turn in long-term memory: {}", e);
            false
        }
        Err(_) => {
            warn!(backend = %id, "Memory backend panicked while storing");
            false
        }
    }
}
