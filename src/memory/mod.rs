//! Memory module for Turnkeeper
//!
//! Short-term durability through the per-session write buffer, long-term
//! recall through the user and assistant memory backends.

mod backend;
mod buffer;
mod mem0;
mod orchestrator;
mod turn;

pub use backend::{
    BackendFactory, BackendId, MemoryBackend, MemoryQueryResult, MemoryRecord, NullBackend,
    NullFactory,
};
pub use buffer::{BatchPolicy, FlushHandle, WriteBuffer, DEFAULT_BATCH_INTERVAL, DEFAULT_BATCH_SIZE};
pub use mem0::{Mem0Backend, Mem0Factory, MemoryScope};
pub use orchestrator::{
    MemoryContext, MemoryOrchestrator, StoreReport, Strategy, DEFAULT_STORE_DEADLINE,
};
pub use turn::{ConversationTurn, TurnRole};
