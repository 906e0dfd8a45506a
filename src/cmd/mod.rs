pub mod run;
pub mod validate;

pub use run::{RunArgs, handle_run};
pub use validate::{ValidateArgs, handle_validate};

use serde::Deserialize;

use crate::definition::{AgentDefinition, TaskDefinition};

/// A task file pairs the agent persona with the task definition.
#[derive(Debug, Deserialize)]
pub struct TaskFile {
    pub agent: AgentDefinition,
    pub task: TaskDefinition,
}
