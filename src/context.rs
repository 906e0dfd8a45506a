//! Per-execution mutable context.
//!
//! The context is an advisory in-memory snapshot of what the transition
//! log records: scratch state, per-frame step outputs, frame-local
//! bindings, the yield call stack, and the cancellation flag. It can be
//! dropped at any time and rebuilt from the log (see [`crate::history`]).

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::definition::{AgentDefinition, TaskDefinition, owning_workflow};
use crate::tools::Tool;
use crate::transition::{Cursor, ExecutionRecord};

/// Keys never exposed to template rendering.
pub const RESERVED_RENDER_KEYS: [&str; 1] = ["developer_id"];

#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub task: Arc<TaskDefinition>,
    pub agent: Arc<AgentDefinition>,
    pub tools: Arc<Vec<Tool>>,
    /// The execution input map; `resume` inputs are merged into it.
    pub input: Arc<RwLock<Value>>,
    /// The scratch key-value store mutated by `set`.
    pub state: Arc<RwLock<serde_json::Map<String, Value>>>,
    /// Step outputs per frame, keyed by step index. Iteration results are
    /// kept under the frame base (`main[1].iter`) keyed by iteration.
    outputs: Arc<RwLock<HashMap<String, BTreeMap<usize, Value>>>>,
    /// Frame-local bindings: `seed` (the first-step `_`), `index`, and
    /// `input` for yielded workflows.
    locals: Arc<RwLock<HashMap<String, serde_json::Map<String, Value>>>>,
    /// Evaluated collections for iteration frames, keyed by frame base.
    items: Arc<RwLock<HashMap<String, Vec<Value>>>>,
    /// Return sites of in-flight `yield` calls.
    pub call_stack: Arc<RwLock<Vec<Cursor>>>,
    pub cancelled: Arc<RwLock<Option<String>>>,
    /// Child execution ids spawned by `parallel` / `map`.
    pub children: Arc<RwLock<Vec<Uuid>>>,
}

impl ExecutionContext {
    pub fn new(record: &ExecutionRecord, tools: Vec<Tool>) -> Self {
        let mut locals = HashMap::new();
        if !record.locals.is_empty() {
            locals.insert("main".to_string(), record.locals.clone());
        }
        Self {
            execution_id: record.id,
            task: Arc::new(record.task.clone()),
            agent: Arc::new(record.agent.clone()),
            tools: Arc::new(tools),
            input: Arc::new(RwLock::new(record.input.clone())),
            state: Arc::new(RwLock::new(record.initial_state.clone())),
            outputs: Arc::new(RwLock::new(HashMap::new())),
            locals: Arc::new(RwLock::new(locals)),
            items: Arc::new(RwLock::new(HashMap::new())),
            call_stack: Arc::new(RwLock::new(Vec::new())),
            cancelled: Arc::new(RwLock::new(None)),
            children: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn is_cancelled(&self) -> bool {
        self.cancelled.read().await.is_some()
    }

    pub async fn record_output(&self, frame: &str, step: usize, output: Value) {
        let mut outputs = self.outputs.write().await;
        outputs
            .entry(frame.to_string())
            .or_default()
            .insert(step, output);
    }

    pub async fn last_output(&self, frame: &str) -> Option<Value> {
        let outputs = self.outputs.read().await;
        outputs
            .get(frame)
            .and_then(|by_step| by_step.values().next_back().cloned())
    }

    /// Outputs recorded for a frame, in step/iteration order.
    pub async fn frame_outputs(&self, frame: &str) -> Vec<Value> {
        let outputs = self.outputs.read().await;
        outputs
            .get(frame)
            .map(|by_step| by_step.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn set_locals(&self, frame: &str, bindings: serde_json::Map<String, Value>) {
        let mut locals = self.locals.write().await;
        locals.insert(frame.to_string(), bindings);
    }

    pub async fn set_items(&self, base: &str, collection: Vec<Value>) {
        let mut items = self.items.write().await;
        items.insert(base.to_string(), collection);
    }

    pub async fn items(&self, base: &str) -> Option<Vec<Value>> {
        let items = self.items.read().await;
        items.get(base).cloned()
    }

    pub async fn set_state(&self, key: &str, value: Value) {
        let mut state = self.state.write().await;
        state.insert(key.to_string(), value);
    }

    pub async fn get_state(&self, key: &str) -> Option<Value> {
        let state = self.state.read().await;
        state.get(key).cloned()
    }

    /// Merge a resume input over the execution input map.
    pub async fn merge_input(&self, incoming: &Value) {
        let mut input = self.input.write().await;
        match (input.as_object_mut(), incoming.as_object()) {
            (Some(target), Some(source)) => {
                for (k, v) in source {
                    target.insert(k.clone(), v.clone());
                }
            }
            _ => *input = incoming.clone(),
        }
    }

    /// The input visible to expressions in a frame: the `yield` arguments
    /// inside a yielded workflow, the execution input otherwise.
    async fn frame_input(&self, frame: &str) -> Value {
        let owner = owning_workflow(frame);
        if owner != "main" {
            let locals = self.locals.read().await;
            if let Some(bindings) = locals.get(owner)
                && let Some(input) = bindings.get("input")
            {
                return input.clone();
            }
        }
        self.input.read().await.clone()
    }

    /// Build the read-only evaluation scope for a frame.
    ///
    /// Names: `input`, `state`, `_` (previous step output in the frame,
    /// seeded from the frame entry binding), `outputs`, `execution`, plus
    /// `index` inside iteration frames.
    pub async fn scope(&self, frame: &str) -> serde_json::Map<String, Value> {
        let mut scope = serde_json::Map::new();

        let frame_input = self.frame_input(frame).await;
        scope.insert("input".to_string(), frame_input.clone());
        scope.insert(
            "state".to_string(),
            Value::Object(self.state.read().await.clone()),
        );
        scope.insert(
            "execution".to_string(),
            serde_json::json!({"id": self.execution_id}),
        );

        let frame_outputs = self.frame_outputs(frame).await;
        let locals = self.locals.read().await;
        let bindings = locals.get(frame);

        let last = if let Some(output) = frame_outputs.last() {
            output.clone()
        } else if let Some(seed) = bindings.and_then(|b| b.get("seed")) {
            seed.clone()
        } else {
            frame_input
        };
        scope.insert("_".to_string(), last);
        scope.insert("outputs".to_string(), Value::Array(frame_outputs));

        if let Some(index) = bindings.and_then(|b| b.get("index")) {
            scope.insert("index".to_string(), index.clone());
        }

        for reserved in RESERVED_RENDER_KEYS {
            scope.remove(reserved);
        }

        scope
    }
}
