/// Tests for the transition stores and crash recovery: a context must be
/// reconstructible from the log alone.
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use rook::config::RookConfig;
use rook::engine::TaskEngine;
use rook::persistence::{Error, TransitionRequest, TransitionStore};
use rook::providers::store::RedbStore;
use rook::transition::{Cursor, ExecutionStatus, TransitionType};

mod common;
use common::{agent, task};

fn redb_store(dir: &tempfile::TempDir) -> Arc<RedbStore> {
    let path = dir.path().join("transitions.db");
    Arc::new(RedbStore::new(path.to_str().unwrap()).unwrap())
}

fn request(execution_id: Uuid, ty: TransitionType) -> TransitionRequest {
    TransitionRequest {
        execution_id,
        ty,
        current: Cursor::new("main", 0),
        next: Some(Cursor::new("main", 1)),
        output: json!({"k": "v"}),
        metadata: serde_json::Map::new(),
    }
}

#[tokio::test]
async fn redb_store_round_trips_transitions_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = redb_store(&dir);
    let execution_id = Uuid::new_v4();

    for _ in 0..3 {
        store
            .append(request(execution_id, TransitionType::Step))
            .await
            .unwrap();
    }

    let listed = store.list(execution_id).await.unwrap();
    assert_eq!(listed.len(), 3);
    for (index, transition) in listed.iter().enumerate() {
        assert_eq!(transition.seq, index as u64);
        assert_eq!(transition.output, json!({"k": "v"}));
    }

    let latest = store.latest(execution_id).await.unwrap().unwrap();
    assert_eq!(latest.seq, 2);
}

#[tokio::test]
async fn redb_store_rejects_post_terminal_appends() {
    let dir = tempfile::tempdir().unwrap();
    let store = redb_store(&dir);
    let execution_id = Uuid::new_v4();

    store
        .append(request(execution_id, TransitionType::Init))
        .await
        .unwrap();
    store
        .append(request(execution_id, TransitionType::Finish))
        .await
        .unwrap();

    let err = store
        .append(request(execution_id, TransitionType::Step))
        .await;
    assert!(matches!(err, Err(Error::PostTerminal { .. })));
}

#[tokio::test]
async fn execution_survives_an_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let t = task(
        r#"
name: durable
main:
  - set:
      prefix: "'hi '"
  - wait_for_input:
      info: "name?"
  - return:
      g: "state.prefix + input.name"
"#,
    );

    // First engine: run up to the suspension point, then drop it.
    let execution_id = {
        let engine = TaskEngine::new(redb_store(&dir), RookConfig::default());
        let (execution_id, _) = engine.start(t, agent(), json!({})).await.unwrap();
        let waited = engine.run(execution_id).await.unwrap();
        assert_eq!(waited.ty, TransitionType::Wait);
        execution_id
    };

    // Second engine over the same database: the context is rebuilt from
    // the transition log, including the scratch state set before the wait.
    let engine = TaskEngine::new(redb_store(&dir), RookConfig::default());
    let status = engine.status(execution_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::AwaitingInput);

    engine
        .resume(execution_id, json!({"name": "ada"}))
        .await
        .unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.ty, TransitionType::Finish);
    assert_eq!(terminal.output, json!({"g": "hi ada"}));
}

#[tokio::test]
async fn foreach_progress_survives_an_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let t = task(
        r#"
name: durable-loop
main:
  - foreach:
      in: "[10, 20]"
      do:
        - wait_for_input:
            info: "tick"
        - evaluate:
            v: "_.add + index"
  - return:
      vs: "_ | map(attribute='v') | list"
"#,
    );

    let execution_id = {
        let engine = TaskEngine::new(redb_store(&dir), RookConfig::default());
        let (execution_id, _) = engine.start(t, agent(), json!({})).await.unwrap();
        engine.run(execution_id).await.unwrap();
        engine
            .resume(execution_id, json!({"add": 100}))
            .await
            .unwrap();
        let waited = engine.run(execution_id).await.unwrap();
        assert_eq!(waited.ty, TransitionType::Wait);
        execution_id
    };

    // Restart mid-loop: iteration results and bindings come back from
    // the log.
    let engine = TaskEngine::new(redb_store(&dir), RookConfig::default());
    engine
        .resume(execution_id, json!({"add": 200}))
        .await
        .unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.ty, TransitionType::Finish);
    assert_eq!(terminal.output, json!({"vs": [100, 201]}));
}

#[tokio::test]
async fn history_is_queryable_for_diagnosis() {
    let dir = tempfile::tempdir().unwrap();
    let engine = TaskEngine::new(redb_store(&dir), RookConfig::default());
    let t = task(
        r#"
name: traced
main:
  - evaluate:
      a: "1"
  - return:
      a: "_.a"
"#,
    );

    let (execution_id, _) = engine.start(t, agent(), json!({})).await.unwrap();
    engine.run(execution_id).await.unwrap();

    let history = engine.history(execution_id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].ty, TransitionType::Init);
    assert_eq!(history[1].metadata["step_kind"], json!("evaluate"));
    assert_eq!(history[2].ty, TransitionType::Finish);
}
