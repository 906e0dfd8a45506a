#![allow(dead_code)]

use std::sync::Arc;

use rook::config::RookConfig;
use rook::definition::{AgentDefinition, TaskDefinition};
use rook::engine::TaskEngine;
use rook::providers::store::MemoryStore;

pub fn agent() -> AgentDefinition {
    serde_yaml::from_str("name: tester").unwrap()
}

pub fn agent_yaml(yaml: &str) -> AgentDefinition {
    serde_yaml::from_str(yaml).unwrap()
}

pub fn task(yaml: &str) -> TaskDefinition {
    serde_yaml::from_str(yaml).unwrap()
}

pub fn engine() -> Arc<TaskEngine> {
    Arc::new(TaskEngine::new(
        Arc::new(MemoryStore::new()),
        RookConfig::default(),
    ))
}
