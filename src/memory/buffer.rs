//! Per-session write buffer in front of the warehouse.
//!
//! Turns are queued in memory and written in batches, either when the queue
//! reaches `batch_size` or when `interval` has passed since the last
//! successful flush. A failed flush keeps every queued turn for the next
//! attempt; nothing is dropped on the floor.

use super::ConversationTurn;
use crate::warehouse::{ConnectionManager, StoreCommand};
use crate::{Result, TurnkeeperConfig, TurnkeeperError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Flush once this many turns are queued
pub const DEFAULT_BATCH_SIZE: usize = 5;
/// Flush once this much time has passed since the last flush
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(10);
/// The timer never checks less often than this
const MAX_TIMER_PERIOD: Duration = Duration::from_secs(1);
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Completion of a background flush; resolves to the number of turns written
pub type FlushHandle = JoinHandle<Result<usize>>;

/// When the buffer flushes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub batch_size: usize,
    pub interval: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            interval: DEFAULT_BATCH_INTERVAL,
        }
    }
}

impl BatchPolicy {
    pub fn new(batch_size: usize, interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            interval,
        }
    }

    pub fn from_config(config: &TurnkeeperConfig) -> Self {
        Self::new(config.batch_size, config.batch_interval)
    }

    fn timer_period(&self) -> Duration {
        self.interval.clamp(MIN_TIMER_PERIOD, MAX_TIMER_PERIOD)
    }
}

#[derive(Debug)]
struct BufferState {
    pending: Vec<ConversationTurn>,
    last_flush: Instant,
    closed: bool,
}

struct Shared {
    session_id: String,
    connection: Arc<ConnectionManager>,
    policy: BatchPolicy,
    /// `pending` and `last_flush` only change while this is held
    state: Mutex<BufferState>,
    /// One flush in flight at a time
    flush_lock: AsyncMutex<()>,
    flushes: AtomicU64,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn interval_elapsed(&self) -> bool {
        let state = self.lock_state();
        !state.pending.is_empty() && state.last_flush.elapsed() >= self.policy.interval
    }

    /// Write the queued prefix. Requests that arrive while a flush is in
    /// flight wait for it, then only see turns queued after its snapshot.
    async fn flush(&self) -> Result<usize> {
        let _in_flight = self.flush_lock.lock().await;

        let batch = {
            let state = self.lock_state();
            if state.pending.is_empty() {
                return Ok(0);
            }
            state.pending.clone()
        };
        let count = batch.len();
        debug!(session = %self.session_id, turns = count, "Flushing write buffer");

        let command = StoreCommand::AppendTurns {
            session_id: self.session_id.clone(),
            turns: batch,
        };
        match self.connection.execute(command).await {
            Ok(_) => {
                {
                    let mut state = self.lock_state();
                    state.pending.drain(..count);
                    state.last_flush = Instant::now();
                }
                self.flushes.fetch_add(1, Ordering::SeqCst);
                info!(session = %self.session_id, turns = count, "Flushed turns to warehouse");
                Ok(count)
            }
            Err(e) => {
                warn!(
                    session = %self.session_id,
                    turns = count,
                    "Flush failed, turns stay queued: {}",
                    e
                );
                Err(e)
            }
        }
    }
}

/// Queue of not-yet-durable turns for one session.
pub struct WriteBuffer {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl WriteBuffer {
    /// Create the buffer and start its flush timer. Must be called inside a
    /// tokio runtime.
    pub fn new(
        session_id: impl Into<String>,
        connection: Arc<ConnectionManager>,
        policy: BatchPolicy,
    ) -> Self {
        let shared = Arc::new(Shared {
            session_id: session_id.into(),
            connection,
            policy,
            state: Mutex::new(BufferState {
                pending: Vec::new(),
                last_flush: Instant::now(),
                closed: false,
            }),
            flush_lock: AsyncMutex::new(()),
            flushes: AtomicU64::new(0),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let timer = tokio::spawn(run_timer(
            Arc::downgrade(&shared),
            policy.timer_period(),
            shutdown_rx,
        ));

        Self {
            shared,
            shutdown,
            timer: Mutex::new(Some(timer)),
        }
    }

    /// Queue a turn. Never waits on the warehouse.
    ///
    /// When the queue reaches the batch size a flush is started in the
    /// background and its handle returned; flush failures surface there,
    /// never here.
    pub fn append(&self, turn: ConversationTurn) -> Result<Option<FlushHandle>> {
        let pending = {
            let mut state = self.shared.lock_state();
            if state.closed {
                return Err(TurnkeeperError::BufferClosed(self.shared.session_id.clone()));
            }
            state.pending.push(turn);
            state.pending.len()
        };
        debug!(session = %self.shared.session_id, pending, "Queued turn");

        if pending >= self.shared.policy.batch_size {
            debug!(session = %self.shared.session_id, pending, "Batch size reached");
            let shared = self.shared.clone();
            return Ok(Some(tokio::spawn(async move { shared.flush().await })));
        }
        Ok(None)
    }

    /// Flush everything queued and wait for the warehouse write.
    pub async fn force_flush(&self) -> Result<usize> {
        self.shared.flush().await
    }

    /// Stop the timer and flush one last time.
    ///
    /// Appends are rejected from here on. If the final flush fails the
    /// turns stay queued (see [`WriteBuffer::pending`]) and the failure is
    /// returned as [`TurnkeeperError::Unflushed`]; closing again retries
    /// that flush. Closing a drained buffer twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let was_closed = {
            let mut state = self.shared.lock_state();
            if state.closed && state.pending.is_empty() {
                debug!(session = %self.shared.session_id, "Write buffer already closed");
                return Ok(());
            }
            std::mem::replace(&mut state.closed, true)
        };

        if !was_closed {
            let _ = self.shutdown.send(true);
            let timer = self
                .timer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(handle) = timer {
                if let Err(e) = handle.await {
                    warn!(session = %self.shared.session_id, "Flush timer ended abnormally: {}", e);
                }
            }
        }

        match self.force_flush().await {
            Ok(written) => {
                info!(session = %self.shared.session_id, written, "Write buffer closed");
                Ok(())
            }
            Err(source) => {
                let pending = self.pending_len();
                error!(
                    session = %self.shared.session_id,
                    pending,
                    "Closing with turns that could not be written: {}",
                    source
                );
                Err(TurnkeeperError::Unflushed {
                    session_id: self.shared.session_id.clone(),
                    pending,
                    source: Box::new(source),
                })
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }

    /// Turns not yet confirmed by the warehouse, oldest first
    pub fn pending(&self) -> Vec<ConversationTurn> {
        self.shared.lock_state().pending.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock_state().pending.len()
    }

    /// Number of successful flushes so far
    pub fn flush_count(&self) -> u64 {
        self.shared.flushes.load(Ordering::SeqCst)
    }

    pub fn last_flush_time(&self) -> Instant {
        self.shared.lock_state().last_flush
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        let state = self.shared.lock_state();
        if !state.closed && !state.pending.is_empty() {
            warn!(
                session = %self.shared.session_id,
                pending = state.pending.len(),
                "Write buffer dropped without close()"
            );
        }
    }
}

async fn run_timer(shared: Weak<Shared>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.interval_elapsed() {
            debug!(session = %shared.session_id, "Batch interval elapsed");
            // Failure already logged; turns stay queued for the next tick
            let _ = shared.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{PersistentStore, RetryPolicy, StoreError, StoreOutput};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<Vec<ConversationTurn>>>,
        failures: Mutex<VecDeque<StoreError>>,
    }

    impl RecordingStore {
        fn fail_next(&self, error: StoreError) {
            self.failures.lock().unwrap().push_back(error);
        }

        fn batches(&self) -> Vec<Vec<ConversationTurn>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PersistentStore for RecordingStore {
        async fn run(
            &self,
            command: &StoreCommand,
        ) -> std::result::Result<StoreOutput, StoreError> {
            tokio::task::yield_now().await;
            if let Some(error) = self.failures.lock().unwrap().pop_front() {
                return Err(error);
            }
            match command {
                StoreCommand::AppendTurns { turns, .. } => {
                    self.batches.lock().unwrap().push(turns.clone());
                    Ok(StoreOutput::Written(turns.len()))
                }
                _ => Ok(StoreOutput::Pong),
            }
        }

        async fn reconnect(&self) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    fn buffer(store: &Arc<RecordingStore>, batch_size: usize) -> WriteBuffer {
        let connection = Arc::new(ConnectionManager::new(
            store.clone(),
            RetryPolicy::new(3, Duration::from_millis(10)),
        ));
        WriteBuffer::new(
            "session-1",
            connection,
            BatchPolicy::new(batch_size, Duration::from_secs(10)),
        )
    }

    fn turns(n: usize) -> Vec<ConversationTurn> {
        (0..n)
            .map(|i| ConversationTurn::user(format!("message {i}")))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_flushes_batch_in_order() {
        let store = Arc::new(RecordingStore::default());
        let buffer = buffer(&store, 5);
        let turns = turns(5);

        for turn in &turns[..4] {
            assert!(buffer.append(turn.clone()).unwrap().is_none());
        }
        tokio::task::yield_now().await;
        assert!(store.batches().is_empty());

        let handle = buffer.append(turns[4].clone()).unwrap().unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), 5);
        assert_eq!(store.batches(), vec![turns]);
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.flush_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_trigger_flushes_partial_batch() {
        let store = Arc::new(RecordingStore::default());
        let buffer = buffer(&store, 5);
        let turns = turns(2);
        for turn in &turns {
            buffer.append(turn.clone()).unwrap();
        }

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(store.batches().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.batches(), vec![turns]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_trigger_skips_empty_buffer() {
        let store = Arc::new(RecordingStore::default());
        let buffer = buffer(&store, 5);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.batches().is_empty());
        assert_eq!(buffer.flush_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_flushes_are_coalesced() {
        let store = Arc::new(RecordingStore::default());
        let buffer = buffer(&store, 10);
        for turn in turns(3) {
            buffer.append(turn).unwrap();
        }

        let (a, b) = tokio::join!(buffer.force_flush(), buffer.force_flush());
        assert_eq!(a.unwrap() + b.unwrap(), 3);
        assert_eq!(store.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_keeps_turns_queued() {
        let store = Arc::new(RecordingStore::default());
        let buffer = buffer(&store, 10);
        let turns = turns(3);
        for turn in &turns {
            buffer.append(turn.clone()).unwrap();
        }

        store.fail_next(StoreError::permanent("warehouse rejected write"));
        assert!(buffer.force_flush().await.is_err());
        assert_eq!(buffer.pending(), turns);

        assert_eq!(buffer.force_flush().await.unwrap(), 3);
        assert_eq!(store.batches(), vec![turns]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_preserve_fifo_order() {
        let store = Arc::new(RecordingStore::default());
        let buffer = buffer(&store, 10);
        let turns = turns(5);

        for turn in &turns[..3] {
            buffer.append(turn.clone()).unwrap();
        }
        buffer.force_flush().await.unwrap();
        for turn in &turns[3..] {
            buffer.append(turn.clone()).unwrap();
        }
        buffer.force_flush().await.unwrap();

        let flattened: Vec<_> = store.batches().into_iter().flatten().collect();
        assert_eq!(flattened, turns);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_once_and_rejects_appends() {
        let store = Arc::new(RecordingStore::default());
        let buffer = buffer(&store, 10);
        buffer.append(ConversationTurn::user("bye")).unwrap();

        buffer.close().await.unwrap();
        buffer.close().await.unwrap();
        assert_eq!(store.batches().len(), 1);
        assert!(buffer.is_closed());

        let err = buffer.append(ConversationTurn::user("late")).unwrap_err();
        assert!(matches!(err, TurnkeeperError::BufferClosed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reports_unflushed_turns() {
        let store = Arc::new(RecordingStore::default());
        let buffer = buffer(&store, 10);
        buffer.append(ConversationTurn::user("keep me")).unwrap();

        store.fail_next(StoreError::permanent("insufficient privileges"));
        match buffer.close().await.unwrap_err() {
            TurnkeeperError::Unflushed { pending, .. } => assert_eq!(pending, 1),
            other => panic!("Expected Unflushed, got {other:?}"),
        }
        assert_eq!(buffer.pending_len(), 1);

        buffer.close().await.unwrap();
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(store.batches().len(), 1);
    }
}
