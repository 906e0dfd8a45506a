/// Tests for foreach and map-reduce iteration.
use serde_json::json;

use rook::transition::TransitionType;

mod common;
use common::{agent, engine, task};

#[tokio::test]
async fn foreach_squares_each_element() {
    let engine = engine();
    let t = task(
        r#"
name: squares
main:
  - foreach:
      in: "[1, 2, 3]"
      do:
        - evaluate:
            sq: "_ ** 2"
  - return:
      all: "_ | map(attribute='sq') | list"
"#,
    );

    let (execution_id, _) = engine.start(t, agent(), json!({})).await.unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.ty, TransitionType::Finish);
    assert_eq!(terminal.output, json!({"all": [1, 4, 9]}));
}

#[tokio::test]
async fn foreach_over_empty_sequence_produces_empty_list() {
    let engine = engine();
    let t = task(
        r#"
name: empty
main:
  - foreach:
      in: "[]"
      do:
        - error: "unreachable"
  - return:
      all: "_"
"#,
    );

    let (execution_id, _) = engine.start(t, agent(), json!({})).await.unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.output, json!({"all": []}));
}

#[tokio::test]
async fn foreach_runs_in_declared_order_and_exposes_index() {
    let engine = engine();
    let t = task(
        r#"
name: ordered
main:
  - foreach:
      in: "['a', 'b', 'c']"
      do:
        - evaluate:
            tag: "_ ~ '-' ~ index"
  - return:
      tags: "_ | map(attribute='tag') | list"
"#,
    );

    let (execution_id, _) = engine.start(t, agent(), json!({})).await.unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.output, json!({"tags": ["a-0", "b-1", "c-2"]}));
}

#[tokio::test]
async fn foreach_over_non_sequence_fails() {
    let engine = engine();
    let t = task(
        r#"
name: notalist
main:
  - foreach:
      in: "42"
      do:
        - evaluate:
            x: "_"
"#,
    );

    let (execution_id, _) = engine.start(t, agent(), json!({})).await.unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.ty, TransitionType::Error);
}

#[tokio::test]
async fn map_without_reduce_collects_outputs() {
    let engine = engine();
    let t = task(
        r#"
name: mapped
main:
  - map:
      over: "input.items"
      map:
        - evaluate:
            v: "_ * 10"
  - return:
      out: "_ | map(attribute='v') | list"
"#,
    );

    let (execution_id, _) = engine
        .start(t, agent(), json!({"items": [1, 2, 3]}))
        .await
        .unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.output, json!({"out": [10, 20, 30]}));
}

#[tokio::test]
async fn map_reduce_folds_with_initial() {
    let engine = engine();
    let t = task(
        r#"
name: summed
main:
  - map:
      over: "[1, 2, 3, 4]"
      map:
        - evaluate:
            v: "_ * 2"
      reduce: "results + _.v"
      initial: "0"
  - return:
      total: "_"
"#,
    );

    let (execution_id, _) = engine.start(t, agent(), json!({})).await.unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.output, json!({"total": 20}));
}

#[tokio::test]
async fn map_reduce_over_empty_sequence_yields_initial() {
    let engine = engine();
    let t = task(
        r#"
name: emptyfold
main:
  - map:
      over: "[]"
      map:
        - evaluate:
            v: "_"
      reduce: "results + _.v"
      initial: "99"
  - return:
      total: "_"
"#,
    );

    let (execution_id, _) = engine.start(t, agent(), json!({})).await.unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.output, json!({"total": 99}));
}

#[tokio::test]
async fn foreach_bodies_can_mutate_scratch_state_across_iterations() {
    let engine = engine();
    let t = task(
        r#"
name: accumulate
main:
  - set:
      total: "0"
  - foreach:
      in: "[1, 2, 3]"
      do:
        - set:
            total: "state.total + _"
  - get: total
  - return:
      total: "_"
"#,
    );

    let (execution_id, _) = engine.start(t, agent(), json!({})).await.unwrap();
    let terminal = engine.run(execution_id).await.unwrap();
    assert_eq!(terminal.output, json!({"total": 6}));
}
