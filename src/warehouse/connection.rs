//! Connection lifecycle for the warehouse client.
//!
//! Every warehouse operation goes through [`ConnectionManager::execute`].
//! Recoverable failures move the manager into `Reconnecting`, where it
//! re-authenticates with exponential backoff; the failed command is then
//! retried exactly once. Exhausting the retry budget parks the manager in
//! `Failed` until someone asks for a manual reconnect.
//!
//! Locking: `gate` is held shared for the duration of each command and
//! exclusively for the whole reconnection, so callers arriving mid-outage
//! wait for it to resolve instead of starting their own. The generation
//! counter behind the gate tells a caller whether the outage it saw has
//! already been dealt with by somebody else.

use super::{PersistentStore, StoreCommand, StoreError, StoreOutput};
use crate::{Result, TurnkeeperConfig, TurnkeeperError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Default number of reconnect attempts per outage
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default delay before the first reconnect attempt
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Upper bound of the random jitter, as a fraction of the backoff delay
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

/// Backoff schedule for reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Kept in `0.0..1.0` so the schedule never decreases
    jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }

    pub fn from_config(config: &TurnkeeperConfig) -> Self {
        Self::new(config.max_reconnect_retries, config.backoff_base)
    }

    /// Upper bound of the jitter as a fraction of the delay. Out-of-range
    /// ratios are clamped and NaN disables jitter.
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 0.99) };
        self
    }

    pub fn jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    /// Lower bound of the wait before attempt `attempt` (0-based): `base * 2^attempt`
    pub fn min_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Wait before attempt `attempt`, including jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let floor = self.min_delay(attempt);
        let max_jitter = floor.mul_f64(self.jitter_ratio);
        if max_jitter.is_zero() {
            return floor;
        }
        let fraction: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        floor.saturating_add(max_jitter.mul_f64(fraction))
    }
}

/// Lifecycle state of the warehouse connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Snapshot of the connection state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Reconnect attempts made in the current (or last failed) outage
    pub retry_count: u32,
    pub last_error: Option<StoreError>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Connected,
            retry_count: 0,
            last_error: None,
        }
    }
}

enum Attempt {
    Done(StoreOutput),
    Failed { generation: u64, error: StoreError },
}

/// Sole owner of the warehouse client, shared by every session.
pub struct ConnectionManager {
    store: Arc<dyn PersistentStore>,
    policy: RetryPolicy,
    /// Reconnection generation; bumped each time an outage is resolved
    gate: RwLock<u64>,
    /// Only written while `gate` is held exclusively
    state: Mutex<ConnectionState>,
}

impl ConnectionManager {
    /// Create a manager around an already-connected client
    pub fn new(store: Arc<dyn PersistentStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            gate: RwLock::new(0),
            state: Mutex::new(ConnectionState::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current state of the connection
    pub fn state(&self) -> ConnectionState {
        self.lock_state().clone()
    }

    /// Run `command`, reconnecting and retrying once on recoverable failures.
    pub async fn execute(&self, command: StoreCommand) -> Result<StoreOutput> {
        let (generation, error) = match self.attempt(&command).await? {
            Attempt::Done(output) => return Ok(output),
            Attempt::Failed { generation, error } => (generation, error),
        };

        if !error.kind.is_recoverable() {
            debug!(
                command = command.label(),
                "Permanent warehouse failure: {}", error.message
            );
            return Err(error.into());
        }

        warn!(
            command = command.label(),
            kind = ?error.kind,
            "Warehouse operation failed, reconnecting: {}",
            error.message
        );
        let attempts = self.recover(generation, error).await?;

        match self.attempt(&command).await? {
            Attempt::Done(output) => Ok(output),
            Attempt::Failed { error, .. } if error.kind.is_recoverable() => {
                warn!(
                    command = command.label(),
                    "Retry after reconnect failed: {}", error.message
                );
                Err(TurnkeeperError::ConnectionExhausted {
                    attempts,
                    last_error: error,
                })
            }
            Attempt::Failed { error, .. } => Err(error.into()),
        }
    }

    /// Manually reconnect. This is the only way out of `Failed`.
    pub async fn reconnect(&self) -> Result<()> {
        let mut generation = self.gate.write().await;
        info!("Manual reconnect requested");
        let cause = self
            .state()
            .last_error
            .unwrap_or_else(|| StoreError::transient("manual reconnect requested"));
        let result = self.reconnect_locked(cause).await;
        *generation += 1;
        result.map(|_| ())
    }

    /// Close the underlying client
    pub async fn close(&self) {
        let _generation = self.gate.write().await;
        self.store.close().await;
        info!("Warehouse connection closed");
    }

    async fn attempt(&self, command: &StoreCommand) -> Result<Attempt> {
        let generation = self.gate.read().await;
        let state = self.state();
        if state.status == ConnectionStatus::Failed {
            return Err(Self::exhausted(&state));
        }

        match self.store.run(command).await {
            Ok(output) => Ok(Attempt::Done(output)),
            Err(error) => Ok(Attempt::Failed {
                generation: *generation,
                error,
            }),
        }
    }

    /// Resolve the outage observed at `observed` generation, unless another
    /// caller already did. Returns the number of reconnect attempts made.
    async fn recover(&self, observed: u64, cause: StoreError) -> Result<u32> {
        let mut generation = self.gate.write().await;
        if *generation != observed {
            let state = self.state();
            return match state.status {
                ConnectionStatus::Failed => Err(Self::exhausted(&state)),
                _ => {
                    debug!("Outage already resolved by another caller");
                    Ok(0)
                }
            };
        }

        let result = self.reconnect_locked(cause).await;
        *generation += 1;
        result
    }

    /// Backoff loop. Caller must hold `gate` exclusively.
    async fn reconnect_locked(&self, cause: StoreError) -> Result<u32> {
        {
            let mut state = self.lock_state();
            state.status = ConnectionStatus::Reconnecting;
            state.retry_count = 0;
            state.last_error = Some(cause.clone());
        }
        info!("Warehouse connection reconnecting");

        let mut last_error = cause;
        for attempt in 0..self.policy.max_retries {
            let delay = self.policy.delay_for(attempt);
            info!(
                attempt = attempt + 1,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Waiting before reconnect attempt"
            );
            tokio::time::sleep(delay).await;
            self.lock_state().retry_count = attempt + 1;

            match self.store.reconnect().await {
                Ok(()) => {
                    let mut state = self.lock_state();
                    state.status = ConnectionStatus::Connected;
                    state.retry_count = 0;
                    state.last_error = None;
                    info!(attempts = attempt + 1, "Reconnected to warehouse");
                    return Ok(attempt + 1);
                }
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        kind = ?err.kind,
                        "Reconnect attempt failed: {}",
                        err.message
                    );
                    self.lock_state().last_error = Some(err.clone());
                    let permanent = !err.kind.is_recoverable();
                    last_error = err;
                    if permanent {
                        break;
                    }
                }
            }
        }

        let mut state = self.lock_state();
        state.status = ConnectionStatus::Failed;
        error!(
            attempts = state.retry_count,
            "Warehouse connection failed: {}", last_error.message
        );
        Err(TurnkeeperError::ConnectionExhausted {
            attempts: state.retry_count,
            last_error,
        })
    }

    fn exhausted(state: &ConnectionState) -> TurnkeeperError {
        TurnkeeperError::ConnectionExhausted {
            attempts: state.retry_count,
            last_error: state
                .last_error
                .clone()
                .unwrap_or_else(|| StoreError::transient("connection failed")),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Default)]
    struct ScriptedStore {
        runs: Mutex<VecDeque<std::result::Result<StoreOutput, StoreError>>>,
        reconnects: Mutex<VecDeque<std::result::Result<(), StoreError>>>,
        reconnect_times: Mutex<Vec<Instant>>,
        run_times: Mutex<Vec<Instant>>,
        run_calls: AtomicUsize,
    }

    impl ScriptedStore {
        fn with_runs(runs: Vec<std::result::Result<StoreOutput, StoreError>>) -> Self {
            Self {
                runs: Mutex::new(runs.into()),
                ..Default::default()
            }
        }

        fn script_reconnects(&self, results: Vec<std::result::Result<(), StoreError>>) {
            *self.reconnects.lock().unwrap() = results.into();
        }

        fn reconnect_count(&self) -> usize {
            self.reconnect_times.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PersistentStore for ScriptedStore {
        async fn run(
            &self,
            _command: &StoreCommand,
        ) -> std::result::Result<StoreOutput, StoreError> {
            tokio::task::yield_now().await;
            self.run_calls.fetch_add(1, Ordering::SeqCst);
            self.run_times.lock().unwrap().push(Instant::now());
            self.runs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(StoreOutput::Pong))
        }

        async fn reconnect(&self) -> std::result::Result<(), StoreError> {
            self.reconnect_times.lock().unwrap().push(Instant::now());
            self.reconnects.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn manager(store: &Arc<ScriptedStore>) -> ConnectionManager {
        ConnectionManager::new(store.clone(), RetryPolicy::new(3, Duration::from_secs(1)))
    }

    #[test]
    fn test_backoff_schedule_is_bounded_below_and_non_decreasing() {
        let policy = RetryPolicy::new(6, Duration::from_millis(100));
        let mut previous = Duration::ZERO;
        for attempt in 0..6 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= policy.min_delay(attempt));
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(policy.min_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_jitter_ratio_is_clamped() {
        let policy = RetryPolicy::default().with_jitter_ratio(5.0);
        assert!(policy.jitter_ratio() < 1.0);
        let policy = RetryPolicy::default().with_jitter_ratio(0.0);
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[test]
    fn test_invalid_jitter_ratio_never_panics() {
        for ratio in [f64::NAN, -1.0, f64::NEG_INFINITY, f64::INFINITY] {
            let policy = RetryPolicy::new(3, Duration::from_millis(100)).with_jitter_ratio(ratio);
            let ratio = policy.jitter_ratio();
            assert!((0.0..1.0).contains(&ratio), "ratio {ratio} out of range");
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(400));
        }
        let policy = RetryPolicy::default().with_jitter_ratio(f64::NAN);
        assert_eq!(policy.delay_for(0), DEFAULT_BASE_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_propagates_without_reconnect() {
        let store = Arc::new(ScriptedStore::with_runs(vec![Err(StoreError::permanent(
            "SQL compilation error",
        ))]));
        let manager = manager(&store);

        let err = manager.execute(StoreCommand::Ping).await.unwrap_err();
        assert!(matches!(err, TurnkeeperError::Permanent(_)));
        assert_eq!(store.reconnect_count(), 0);
        assert_eq!(manager.state().status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_expiry_reconnects_and_retries_once() {
        let store = Arc::new(ScriptedStore::with_runs(vec![
            Err(StoreError::token_expired("390114 Authentication token has expired")),
            Ok(StoreOutput::Written(2)),
        ]));
        let manager = manager(&store);

        let output = manager.execute(StoreCommand::Ping).await.unwrap();
        assert_eq!(output, StoreOutput::Written(2));
        assert_eq!(store.reconnect_count(), 1);
        assert_eq!(store.run_calls.load(Ordering::SeqCst), 2);

        let state = manager.state();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_retry_after_reconnect_is_exhausted() {
        let store = Arc::new(ScriptedStore::with_runs(vec![
            Err(StoreError::transient("connection reset")),
            Err(StoreError::transient("connection reset")),
        ]));
        let manager = manager(&store);

        let err = manager.execute(StoreCommand::Ping).await.unwrap_err();
        match err {
            TurnkeeperError::ConnectionExhausted { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("Expected ConnectionExhausted, got {other:?}"),
        }
        assert_eq!(store.run_calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state().status, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_reconnect_failure_stops_early() {
        let store = Arc::new(ScriptedStore::with_runs(vec![Err(StoreError::token_expired(
            "expired",
        ))]));
        store.script_reconnects(vec![Err(StoreError::permanent("user is disabled"))]);
        let manager = manager(&store);

        let err = manager.execute(StoreCommand::Ping).await.unwrap_err();
        assert!(matches!(
            err,
            TurnkeeperError::ConnectionExhausted { attempts: 1, .. }
        ));
        assert_eq!(store.reconnect_count(), 1);
        assert_eq!(manager.state().status, ConnectionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_state_fails_fast_until_manual_reconnect() {
        let store = Arc::new(ScriptedStore::with_runs(vec![Err(StoreError::transient(
            "network unreachable",
        ))]));
        store.script_reconnects(vec![
            Err(StoreError::transient("timeout")),
            Err(StoreError::transient("timeout")),
            Err(StoreError::transient("timeout")),
        ]);
        let manager = manager(&store);

        assert!(manager.execute(StoreCommand::Ping).await.is_err());
        assert_eq!(manager.state().status, ConnectionStatus::Failed);
        let runs_before = store.run_calls.load(Ordering::SeqCst);

        let err = manager.execute(StoreCommand::Ping).await.unwrap_err();
        assert!(matches!(err, TurnkeeperError::ConnectionExhausted { .. }));
        assert_eq!(store.run_calls.load(Ordering::SeqCst), runs_before);

        manager.reconnect().await.unwrap();
        assert_eq!(manager.state().status, ConnectionStatus::Connected);
        assert_eq!(
            manager.execute(StoreCommand::Ping).await.unwrap(),
            StoreOutput::Pong
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_share_one_reconnection() {
        let store = Arc::new(ScriptedStore::with_runs(vec![
            Err(StoreError::token_expired("expired")),
            Err(StoreError::token_expired("expired")),
            Ok(StoreOutput::Written(1)),
            Ok(StoreOutput::Written(1)),
        ]));
        let manager = manager(&store);

        let (a, b) = tokio::join!(
            manager.execute(StoreCommand::Ping),
            manager.execute(StoreCommand::Ping)
        );
        assert_eq!(a.unwrap(), StoreOutput::Written(1));
        assert_eq!(b.unwrap(), StoreOutput::Written(1));
        assert_eq!(store.reconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_arriving_mid_reconnect_waits_for_it() {
        let store = Arc::new(ScriptedStore::with_runs(vec![Err(StoreError::token_expired(
            "expired",
        ))]));
        let manager = Arc::new(manager(&store));

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.execute(StoreCommand::Ping).await }
        });
        // Well inside the first backoff wait of at least one second
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(manager.state().status, ConnectionStatus::Reconnecting);
        assert_eq!(store.reconnect_count(), 0);

        let late = manager.execute(StoreCommand::Ping).await.unwrap();
        let late_done = Instant::now();
        assert_eq!(late, StoreOutput::Pong);
        assert_eq!(first.await.unwrap().unwrap(), StoreOutput::Pong);

        assert_eq!(store.reconnect_count(), 1);
        let reconnected_at = store.reconnect_times.lock().unwrap()[0];
        assert!(late_done >= reconnected_at);
        let run_times = store.run_times.lock().unwrap().clone();
        assert_eq!(run_times.len(), 3);
        assert!(run_times[1..].iter().all(|at| *at >= reconnected_at));
        assert_eq!(manager.state().status, ConnectionStatus::Connected);
    }
}
