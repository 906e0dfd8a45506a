//! # Rook - Agent Task Execution Engine
//!
//! Rook is a durable, event-sourced execution engine for agent task
//! workflows: declarative multi-step programs over LLM personas and their
//! tools.
//!
//! ## Features
//!
//! - **Durable Execution**: every step appends a transition record to an
//!   append-only log; execution state is reconstructed from the log after
//!   a crash
//! - **Step Interpreter**: sixteen step kinds covering evaluation, scratch
//!   state, prompting, tool calls, branching, iteration, map-reduce, and
//!   parallel fan-out
//! - **LLM Dispatch**: a generic chat-completion backend plus a
//!   native-tools backend for Claude computer-use models, normalized to a
//!   single response shape
//! - **Tool Translation**: heterogeneous tool records are formatted into
//!   the provider schema and model tool calls are re-keyed back to their
//!   original kinds
//! - **Human In The Loop**: executions suspend on `wait_for_input` and
//!   resume with externally supplied values
//! - **Sandboxed Expressions**: a strict template-expression dialect
//!   evaluated against a read-only context
//!
//! ## Core Modules
//!
//! - [`engine`] - the transition state machine and execution facade
//! - [`definition`] - task, agent, and step definitions
//! - [`expressions`] - expression and template evaluation
//! - [`tools`] - the tool catalog and provider-facing formatter
//! - [`backends`] - LLM completion backends
//! - [`persistence`] - the append-only transition store
//! - [`history`] - context reconstruction from the transition log
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use rook::config::RookConfig;
//! use rook::definition::{AgentDefinition, TaskDefinition};
//! use rook::engine::TaskEngine;
//! use rook::providers::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let task_yaml = r#"
//! name: add
//! main:
//!   - evaluate:
//!       sum: "input.a + input.b"
//!   - return:
//!       total: "_.sum"
//! "#;
//!
//! let task: TaskDefinition = serde_yaml::from_str(task_yaml)?;
//! let agent: AgentDefinition = serde_yaml::from_str("name: adder")?;
//!
//! let engine = TaskEngine::new(Arc::new(MemoryStore::new()), RookConfig::default());
//! let (execution_id, _) = engine.start(task, agent, serde_json::json!({"a": 1, "b": 2})).await?;
//! let terminal = engine.run(execution_id).await?;
//! println!("result: {}", terminal.output);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod context;
pub mod definition;
pub mod dispatch;
pub mod engine;
pub mod expressions;
pub mod history;
pub mod persistence;
pub mod providers;
pub mod tools;
pub mod transition;
pub mod validate;
