//! Durable transition records and the execution view derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Transition types. `Finish`, `Error`, and `Cancelled` are terminal; no
/// further transitions may be appended after one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    Init,
    Step,
    Wait,
    Resume,
    Finish,
    Error,
    Cancelled,
}

impl TransitionType {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransitionType::Finish | TransitionType::Error | TransitionType::Cancelled
        )
    }
}

/// A position in the task: frame name (possibly derived) plus step index.
/// Serialized as the two-element list `[workflow, step]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, usize)", into = "(String, usize)")]
pub struct Cursor {
    pub workflow: String,
    pub step: usize,
}

impl Cursor {
    pub fn new(workflow: impl Into<String>, step: usize) -> Self {
        Self {
            workflow: workflow.into(),
            step,
        }
    }
}

impl From<(String, usize)> for Cursor {
    fn from((workflow, step): (String, usize)) -> Self {
        Self { workflow, step }
    }
}

impl From<Cursor> for (String, usize) {
    fn from(cursor: Cursor) -> Self {
        (cursor.workflow, cursor.step)
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.workflow, self.step)
    }
}

/// One durable record of progress. The transition log is the only
/// authoritative execution state; everything else is reconstructed from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// Dense, strictly increasing per execution; assigned by the store.
    pub seq: u64,
    #[serde(rename = "type")]
    pub ty: TransitionType,
    pub current: Cursor,
    pub next: Option<Cursor>,
    pub output: Value,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transition {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Execution status, a view over the latest transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Starting,
    Running,
    AwaitingInput,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Derive the status from the most recent transition. A `wait` transition
/// counts as awaiting input only when it suspended for external input; a
/// sleep wait leaves the execution logically running.
pub fn derive_status(latest: Option<&Transition>) -> ExecutionStatus {
    match latest {
        None => ExecutionStatus::Queued,
        Some(t) => match t.ty {
            TransitionType::Init => ExecutionStatus::Starting,
            TransitionType::Step | TransitionType::Resume => ExecutionStatus::Running,
            TransitionType::Wait => {
                if t.metadata_str("reason") == Some("sleep") {
                    ExecutionStatus::Running
                } else {
                    ExecutionStatus::AwaitingInput
                }
            }
            TransitionType::Finish => ExecutionStatus::Succeeded,
            TransitionType::Error => ExecutionStatus::Failed,
            TransitionType::Cancelled => ExecutionStatus::Cancelled,
        },
    }
}

/// The persisted registration of one execution: the static definitions it
/// runs against plus its input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub task: crate::definition::TaskDefinition,
    pub agent: crate::definition::AgentDefinition,
    pub input: Value,
    /// Scratch state inherited from a parent execution (child fan-out).
    #[serde(default)]
    pub initial_state: serde_json::Map<String, Value>,
    /// Entry bindings for `main` (element seed and index for mapped
    /// children, branch seed for parallel branches).
    #[serde(default)]
    pub locals: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// The user-visible execution view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
