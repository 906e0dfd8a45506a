use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::persistence::{Error, Result, TransitionRequest, TransitionStore};
use crate::transition::{ExecutionRecord, Transition};

/// In-memory transition store, used by tests and as the default for
/// ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    executions: Arc<Mutex<HashMap<Uuid, ExecutionRecord>>>,
    transitions: Arc<Mutex<HashMap<Uuid, Vec<Transition>>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransitionStore for MemoryStore {
    async fn save_execution(&self, record: ExecutionRecord) -> Result<()> {
        let mut executions = self
            .executions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        executions.insert(record.id, record);
        Ok(())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>> {
        let executions = self
            .executions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(executions.get(&execution_id).cloned())
    }

    async fn append(&self, request: TransitionRequest) -> Result<Transition> {
        let mut transitions = self
            .transitions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let log = transitions.entry(request.execution_id).or_default();

        if log.last().is_some_and(|t| t.ty.is_terminal()) {
            return Err(Error::PostTerminal {
                execution_id: request.execution_id,
            });
        }

        let now = Utc::now();
        let transition = Transition {
            id: Uuid::new_v4(),
            execution_id: request.execution_id,
            seq: log.len() as u64,
            ty: request.ty,
            current: request.current,
            next: request.next,
            output: request.output,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };
        log.push(transition.clone());
        Ok(transition)
    }

    async fn list(&self, execution_id: Uuid) -> Result<Vec<Transition>> {
        let transitions = self
            .transitions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(transitions.get(&execution_id).cloned().unwrap_or_default())
    }

    async fn latest(&self, execution_id: Uuid) -> Result<Option<Transition>> {
        let transitions = self
            .transitions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(transitions
            .get(&execution_id)
            .and_then(|log| log.last().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::{Cursor, TransitionType};
    use serde_json::json;

    fn request(execution_id: Uuid, ty: TransitionType) -> TransitionRequest {
        TransitionRequest {
            execution_id,
            ty,
            current: Cursor::new("main", 0),
            next: Some(Cursor::new("main", 1)),
            output: json!(null),
            metadata: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn sequence_numbers_are_dense() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        for expected in 0..3u64 {
            let t = store.append(request(id, TransitionType::Step)).await.unwrap();
            assert_eq!(t.seq, expected);
        }
    }

    #[tokio::test]
    async fn post_terminal_append_rejected() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.append(request(id, TransitionType::Init)).await.unwrap();
        store.append(request(id, TransitionType::Finish)).await.unwrap();
        let err = store.append(request(id, TransitionType::Step)).await;
        assert!(matches!(err, Err(Error::PostTerminal { .. })));
    }
}
