use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::persistence::{Error, Result, TransitionRequest, TransitionStore};
use crate::transition::{ExecutionRecord, Transition};

const EXECUTIONS_TABLE: redb::TableDefinition<&str, &[u8]> =
    redb::TableDefinition::new("executions");
const TRANSITIONS_TABLE: redb::TableDefinition<&str, &[u8]> =
    redb::TableDefinition::new("transitions");

/// Embedded-database transition store. Keys are `execution_id:seq` with the
/// sequence number zero-padded so lexicographic order is sequence order.
#[derive(Debug)]
pub struct RedbStore {
    db: Arc<redb::Database>,
}

fn db_error(message: impl std::fmt::Display) -> Error {
    Error::Database {
        message: message.to_string(),
    }
}

fn transition_key(execution_id: Uuid, seq: u64) -> String {
    format!("{execution_id}:{seq:020}")
}

fn prefix_range(execution_id: Uuid) -> (String, String) {
    // ';' sorts immediately after ':' so this bounds the id's keys.
    (format!("{execution_id}:"), format!("{execution_id};"))
}

impl RedbStore {
    pub fn new(path: &str) -> Result<Self> {
        let db = redb::Database::create(path).map_err(db_error)?;
        let write_txn = db.begin_write().map_err(db_error)?;
        {
            write_txn.open_table(EXECUTIONS_TABLE).map_err(db_error)?;
            write_txn.open_table(TRANSITIONS_TABLE).map_err(db_error)?;
        }
        write_txn.commit().map_err(db_error)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn last_transition_blocking(
        db: &redb::Database,
        execution_id: Uuid,
    ) -> Result<Option<Transition>> {
        let read_txn = db.begin_read().map_err(db_error)?;
        let table = read_txn.open_table(TRANSITIONS_TABLE).map_err(db_error)?;
        let (start, end) = prefix_range(execution_id);
        let mut range = table
            .range::<&str>(start.as_str()..end.as_str())
            .map_err(db_error)?;
        match range.next_back() {
            Some(entry) => {
                let (_, value) = entry.map_err(db_error)?;
                let transition: Transition = serde_json::from_slice(value.value())
                    .map_err(|source| Error::Serialization { source })?;
                Ok(Some(transition))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TransitionStore for RedbStore {
    async fn save_execution(&self, record: ExecutionRecord) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let write_txn = db.begin_write().map_err(db_error)?;
            {
                let mut table = write_txn.open_table(EXECUTIONS_TABLE).map_err(db_error)?;
                let key = record.id.to_string();
                let value = serde_json::to_vec(&record)
                    .map_err(|source| Error::Serialization { source })?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(db_error)?;
            }
            write_txn.commit().map_err(db_error)
        })
        .await
        .map_err(db_error)?
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<ExecutionRecord>> {
            let read_txn = db.begin_read().map_err(db_error)?;
            let table = read_txn.open_table(EXECUTIONS_TABLE).map_err(db_error)?;
            let key = execution_id.to_string();
            match table.get(key.as_str()).map_err(db_error)? {
                Some(value) => {
                    let record = serde_json::from_slice(value.value())
                        .map_err(|source| Error::Serialization { source })?;
                    Ok(Some(record))
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(db_error)?
    }

    async fn append(&self, request: TransitionRequest) -> Result<Transition> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<Transition> {
            let last = Self::last_transition_blocking(&db, request.execution_id)?;
            if last.as_ref().is_some_and(|t| t.ty.is_terminal()) {
                return Err(Error::PostTerminal {
                    execution_id: request.execution_id,
                });
            }
            let seq = last.map(|t| t.seq + 1).unwrap_or(0);

            let now = Utc::now();
            let transition = Transition {
                id: Uuid::new_v4(),
                execution_id: request.execution_id,
                seq,
                ty: request.ty,
                current: request.current,
                next: request.next,
                output: request.output,
                metadata: request.metadata,
                created_at: now,
                updated_at: now,
            };

            let write_txn = db.begin_write().map_err(db_error)?;
            {
                let mut table = write_txn.open_table(TRANSITIONS_TABLE).map_err(db_error)?;
                let key = transition_key(request.execution_id, seq);
                let value = serde_json::to_vec(&transition)
                    .map_err(|source| Error::Serialization { source })?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(db_error)?;
            }
            write_txn.commit().map_err(db_error)?;
            Ok(transition)
        })
        .await
        .map_err(db_error)?
    }

    async fn list(&self, execution_id: Uuid) -> Result<Vec<Transition>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Transition>> {
            let read_txn = db.begin_read().map_err(db_error)?;
            let table = read_txn.open_table(TRANSITIONS_TABLE).map_err(db_error)?;
            let (start, end) = prefix_range(execution_id);
            let range = table
                .range::<&str>(start.as_str()..end.as_str())
                .map_err(db_error)?;
            let mut transitions = Vec::new();
            for entry in range {
                let (_, value) = entry.map_err(db_error)?;
                let transition = serde_json::from_slice(value.value())
                    .map_err(|source| Error::Serialization { source })?;
                transitions.push(transition);
            }
            Ok(transitions)
        })
        .await
        .map_err(db_error)?
    }

    async fn latest(&self, execution_id: Uuid) -> Result<Option<Transition>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || Self::last_transition_blocking(&db, execution_id))
            .await
            .map_err(db_error)?
    }
}
