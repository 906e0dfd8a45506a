//! Static task, agent, and step definitions.
//!
//! A task is a named set of workflows; `main` is the entry point. Each
//! workflow is an ordered list of [`Step`]s. Nested control flow (branches,
//! iterations, parallel branches) is addressed through *derived frame
//! names* such as `main[2].then` or `main[1].iter[0]`, which keep every
//! cursor a plain `(workflow, step_index)` pair while staying resolvable
//! from the static definition alone.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;
use uuid::Uuid;

use crate::tools::Tool;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unknown workflow: {name}"))]
    UnknownWorkflow { name: String },

    #[snafu(display("Step index {step} out of range in workflow '{workflow}'"))]
    StepOutOfRange { workflow: String, step: usize },

    #[snafu(display("Frame '{frame}' does not match the step it addresses"))]
    FrameMismatch { frame: String },
}

pub type Result<T> = std::result::Result<T, Error>;

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_true() -> bool {
    true
}

/// Immutable-per-execution persona: model, settings, instructions, tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub about: String,
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub default_settings: serde_json::Map<String, Value>,
    #[serde(default)]
    pub tools: Vec<Tool>,
}

/// A named set of workflows plus task-level tools. Task tools shadow agent
/// tools by name; setting `inherit_tools: false` drops the agent's tools
/// entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub main: Vec<Step>,
    #[serde(default)]
    pub workflows: IndexMap<String, Vec<Step>>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default = "default_true")]
    pub inherit_tools: bool,
}

/// One message of a prompt step before rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

/// Prompt payload: a bare string or a message list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptPayload {
    Text(String),
    Messages(Vec<PromptMessage>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptStep {
    pub prompt: PromptPayload,
    #[serde(default)]
    pub unwrap: bool,
    #[serde(default)]
    pub auto_run_tools: bool,
    #[serde(default)]
    pub disable_cache: bool,
    /// Step-level settings overlaid on the agent defaults, passed through
    /// to the backend (temperature, max_tokens, tool_choice, ...).
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub case: String,
    #[serde(default)]
    pub then: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapReduceStep {
    pub over: String,
    pub map: Vec<Step>,
    #[serde(default)]
    pub reduce: Option<String>,
    #[serde(default)]
    pub initial: Option<String>,
    #[serde(default)]
    pub parallelism: Option<usize>,
}

/// The step taxonomy. The serde tag is the step kind; the payload shape is
/// determined by the kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Bind each name to the value of its expression, in declared order.
    Evaluate(IndexMap<String, String>),
    /// Invoke a named tool with evaluated arguments.
    ToolCall {
        tool: String,
        #[serde(default)]
        arguments: IndexMap<String, Value>,
    },
    Prompt(PromptStep),
    /// Read a key from the scratch store.
    Get(String),
    /// Write evaluated values into the scratch store.
    Set(IndexMap<String, String>),
    /// Render a template and emit it to the observer.
    Log(String),
    /// Terminate the workflow with a map result.
    Return(IndexMap<String, String>),
    /// Suspend for wall time; ISO-8601 duration (`PT5S`).
    Sleep(String),
    /// Terminate with an error message.
    Error(String),
    /// Invoke a sibling workflow and receive its result.
    Yield {
        workflow: String,
        #[serde(default)]
        arguments: IndexMap<String, String>,
    },
    /// Suspend pending external resume.
    WaitForInput {
        #[serde(default)]
        info: String,
    },
    IfElse {
        #[serde(rename = "if")]
        condition: String,
        #[serde(default)]
        then: Vec<Step>,
        #[serde(default, rename = "else")]
        otherwise: Vec<Step>,
    },
    /// First-match branch; no match is a no-op.
    Switch(Vec<SwitchCase>),
    Foreach {
        #[serde(rename = "in")]
        collection: String,
        #[serde(rename = "do")]
        body: Vec<Step>,
    },
    /// Concurrent fan-out of independent branches.
    Parallel(Vec<Vec<Step>>),
    /// Lazy map over a sequence with an optional left fold.
    Map(MapReduceStep),
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Evaluate(_) => "evaluate",
            Step::ToolCall { .. } => "tool_call",
            Step::Prompt(_) => "prompt",
            Step::Get(_) => "get",
            Step::Set(_) => "set",
            Step::Log(_) => "log",
            Step::Return(_) => "return",
            Step::Sleep(_) => "sleep",
            Step::Error(_) => "error",
            Step::Yield { .. } => "yield",
            Step::WaitForInput { .. } => "wait_for_input",
            Step::IfElse { .. } => "if_else",
            Step::Switch(_) => "switch",
            Step::Foreach { .. } => "foreach",
            Step::Parallel(_) => "parallel",
            Step::Map(_) => "map",
        }
    }
}

/// The branch selector inside a derived frame name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Then,
    Else,
    Case(usize),
    Branch(usize),
    Iter(usize),
    MapIter(usize),
}

impl FrameKind {
    fn suffix(&self) -> String {
        match self {
            FrameKind::Then => "then".to_string(),
            FrameKind::Else => "else".to_string(),
            FrameKind::Case(k) => format!("case[{k}]"),
            FrameKind::Branch(k) => format!("branch[{k}]"),
            FrameKind::Iter(k) => format!("iter[{k}]"),
            FrameKind::MapIter(k) => format!("map[{k}]"),
        }
    }
}

/// Compose a derived frame name for the sub-steps of the control step at
/// `(parent, step)`.
pub fn frame_name(parent: &str, step: usize, kind: &FrameKind) -> String {
    format!("{parent}[{step}].{}", kind.suffix())
}

/// Split a derived frame name into its parent cursor and branch selector.
/// Returns `None` for plain workflow names.
pub fn parse_frame(name: &str) -> Option<(&str, usize, FrameKind)> {
    let dot = name.rfind('.')?;
    let (prefix, suffix) = (&name[..dot], &name[dot + 1..]);

    let kind = if suffix == "then" {
        FrameKind::Then
    } else if suffix == "else" {
        FrameKind::Else
    } else {
        let open = suffix.find('[')?;
        let close = suffix.rfind(']')?;
        let index: usize = suffix.get(open + 1..close)?.parse().ok()?;
        match &suffix[..open] {
            "case" => FrameKind::Case(index),
            "branch" => FrameKind::Branch(index),
            "iter" => FrameKind::Iter(index),
            "map" => FrameKind::MapIter(index),
            _ => return None,
        }
    };

    // The prefix must end in "[step]".
    let open = prefix.rfind('[')?;
    let close = prefix.rfind(']')?;
    if close != prefix.len() - 1 {
        return None;
    }
    let step: usize = prefix.get(open + 1..close)?.parse().ok()?;
    Some((&prefix[..open], step, kind))
}

/// The real workflow that ultimately owns a (possibly derived) frame.
pub fn owning_workflow(frame: &str) -> &str {
    let mut current = frame;
    while let Some((parent, _, _)) = parse_frame(current) {
        current = parent;
    }
    current
}

impl TaskDefinition {
    /// Look up a plain workflow by name.
    pub fn workflow(&self, name: &str) -> Option<&[Step]> {
        if name == "main" {
            Some(&self.main)
        } else {
            self.workflows.get(name).map(Vec::as_slice)
        }
    }

    /// Resolve a frame name, derived or plain, to its step list.
    pub fn resolve_steps(&self, frame: &str) -> Result<&[Step]> {
        if let Some(steps) = self.workflow(frame) {
            return Ok(steps);
        }

        let (parent, index, kind) = parse_frame(frame).ok_or_else(|| Error::UnknownWorkflow {
            name: frame.to_string(),
        })?;

        let steps = self.resolve_steps(parent)?;
        let step = steps.get(index).ok_or_else(|| Error::StepOutOfRange {
            workflow: parent.to_string(),
            step: index,
        })?;

        match (step, kind) {
            (Step::IfElse { then, .. }, FrameKind::Then) => Ok(then),
            (Step::IfElse { otherwise, .. }, FrameKind::Else) => Ok(otherwise),
            (Step::Switch(cases), FrameKind::Case(k)) => cases
                .get(k)
                .map(|c| c.then.as_slice())
                .ok_or_else(|| Error::FrameMismatch {
                    frame: frame.to_string(),
                }),
            (Step::Parallel(branches), FrameKind::Branch(k)) => {
                branches
                    .get(k)
                    .map(Vec::as_slice)
                    .ok_or_else(|| Error::FrameMismatch {
                        frame: frame.to_string(),
                    })
            }
            (Step::Foreach { body, .. }, FrameKind::Iter(_)) => Ok(body),
            (Step::Map(map_step), FrameKind::MapIter(_)) => Ok(&map_step.map),
            _ => Err(Error::FrameMismatch {
                frame: frame.to_string(),
            }),
        }
    }

    /// The step addressed by a cursor position.
    pub fn step_at(&self, frame: &str, index: usize) -> Result<&Step> {
        let steps = self.resolve_steps(frame)?;
        steps.get(index).ok_or_else(|| Error::StepOutOfRange {
            workflow: frame.to_string(),
            step: index,
        })
    }
}
