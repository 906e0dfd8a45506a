//! The append-only transition store.
//!
//! The store is the single durable side effect of the state machine. It
//! assigns dense sequence numbers, guards the post-terminal invariant, and
//! keeps the execution registration (task, agent, input) so a context can
//! be rebuilt after a crash from the log alone.

use async_trait::async_trait;
use snafu::prelude::*;
use uuid::Uuid;

use crate::transition::{Cursor, ExecutionRecord, Transition, TransitionType};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Store error: {message}"))]
    Store { message: String },

    #[snafu(display("Database error: {message}"))]
    Database { message: String },

    #[snafu(display("Serialization error: {source}"))]
    Serialization { source: serde_json::Error },

    #[snafu(display("Execution not found: {execution_id}"))]
    ExecutionNotFound { execution_id: Uuid },

    #[snafu(display("Transition after terminal for execution {execution_id}"))]
    PostTerminal { execution_id: Uuid },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything the engine supplies for one appended transition; the store
/// fills in id, sequence number, and timestamps.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub execution_id: Uuid,
    pub ty: TransitionType,
    pub current: Cursor,
    pub next: Option<Cursor>,
    pub output: serde_json::Value,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait TransitionStore: Send + Sync + std::fmt::Debug {
    /// Register an execution before its first transition.
    async fn save_execution(&self, record: ExecutionRecord) -> Result<()>;

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>>;

    /// Append one transition. Fails with [`Error::PostTerminal`] if the
    /// latest recorded transition is terminal.
    async fn append(&self, request: TransitionRequest) -> Result<Transition>;

    /// All transitions for an execution in sequence order.
    async fn list(&self, execution_id: Uuid) -> Result<Vec<Transition>>;

    /// The most recent transition, if any.
    async fn latest(&self, execution_id: Uuid) -> Result<Option<Transition>>;
}
