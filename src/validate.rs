//! Definition-time validation.
//!
//! Every expression and template occurrence in a task is checked when the
//! task is created, so evaluation errors at run time can only come from
//! the data, not the syntax. Tool invariants (exactly one variant, unique
//! emitted names) and workflow naming rules are enforced here too.

use snafu::prelude::*;

use crate::definition::{AgentDefinition, PromptPayload, Step, TaskDefinition};
use crate::engine::parse_iso8601_duration;
use crate::expressions;
use crate::tools::{NoReflection, format_tools, resolve_catalog};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Task definition is invalid: {}", problems.join("; ")))]
    Invalid { problems: Vec<String> },
}

pub type Result<T> = std::result::Result<T, Error>;

fn check_expression(expr: &str, at: &str, problems: &mut Vec<String>) {
    if let Err(e) = expressions::validate_expression(expr) {
        problems.push(format!("{at}: {e}"));
    }
}

fn check_template(template: &str, at: &str, problems: &mut Vec<String>) {
    if let Err(e) = expressions::validate_template(template) {
        problems.push(format!("{at}: {e}"));
    }
}

fn check_value_expressions(value: &serde_json::Value, at: &str, problems: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => check_expression(s, at, problems),
        serde_json::Value::Object(map) => {
            for (key, v) in map {
                check_value_expressions(v, &format!("{at}.{key}"), problems);
            }
        }
        serde_json::Value::Array(items) => {
            for (index, v) in items.iter().enumerate() {
                check_value_expressions(v, &format!("{at}[{index}]"), problems);
            }
        }
        _ => {}
    }
}

fn walk_steps(
    task: &TaskDefinition,
    steps: &[Step],
    path: &str,
    inside_fanout: bool,
    tool_names: &[String],
    problems: &mut Vec<String>,
) {
    for (index, step) in steps.iter().enumerate() {
        let at = format!("{path}[{index}].{}", step.kind());
        match step {
            Step::Evaluate(bindings) | Step::Set(bindings) | Step::Return(bindings) => {
                for (name, expr) in bindings {
                    check_expression(expr, &format!("{at}.{name}"), problems);
                }
            }
            Step::ToolCall { tool, arguments } => {
                if !tool_names.iter().any(|n| n == tool) {
                    problems.push(format!("{at}: unknown tool '{tool}'"));
                }
                for (name, value) in arguments {
                    check_value_expressions(value, &format!("{at}.{name}"), problems);
                }
            }
            Step::Prompt(prompt) => match &prompt.prompt {
                PromptPayload::Text(text) => {
                    if let Some(expr) = text.strip_prefix("$_ ") {
                        check_expression(expr.trim(), &at, problems);
                    } else {
                        check_template(text, &at, problems);
                    }
                }
                PromptPayload::Messages(messages) => {
                    for (i, message) in messages.iter().enumerate() {
                        check_template(&message.content, &format!("{at}.messages[{i}]"), problems);
                    }
                }
            },
            Step::Get(_) | Step::Error(_) => {}
            Step::Log(template) => check_template(template, &at, problems),
            Step::Sleep(duration) => {
                if let Err(e) = parse_iso8601_duration(duration) {
                    problems.push(format!("{at}: {e}"));
                }
            }
            Step::Yield {
                workflow,
                arguments,
            } => {
                if task.workflow(workflow).is_none() {
                    problems.push(format!("{at}: unknown workflow '{workflow}'"));
                }
                for (name, expr) in arguments {
                    check_expression(expr, &format!("{at}.{name}"), problems);
                }
            }
            Step::WaitForInput { info } => {
                check_template(info, &at, problems);
                if inside_fanout {
                    problems.push(format!(
                        "{at}: wait_for_input is not allowed inside parallel branches"
                    ));
                }
            }
            Step::IfElse {
                condition,
                then,
                otherwise,
            } => {
                check_expression(condition, &at, problems);
                walk_steps(task, then, &format!("{at}.then"), inside_fanout, tool_names, problems);
                walk_steps(
                    task,
                    otherwise,
                    &format!("{at}.else"),
                    inside_fanout,
                    tool_names,
                    problems,
                );
            }
            Step::Switch(cases) => {
                for (i, case) in cases.iter().enumerate() {
                    check_expression(&case.case, &format!("{at}.case[{i}]"), problems);
                    walk_steps(
                        task,
                        &case.then,
                        &format!("{at}.case[{i}].then"),
                        inside_fanout,
                        tool_names,
                        problems,
                    );
                }
            }
            Step::Foreach { collection, body } => {
                check_expression(collection, &at, problems);
                walk_steps(task, body, &format!("{at}.do"), inside_fanout, tool_names, problems);
            }
            Step::Parallel(branches) => {
                for (i, branch) in branches.iter().enumerate() {
                    walk_steps(
                        task,
                        branch,
                        &format!("{at}.branch[{i}]"),
                        true,
                        tool_names,
                        problems,
                    );
                }
            }
            Step::Map(map_step) => {
                check_expression(&map_step.over, &at, problems);
                if let Some(reduce) = &map_step.reduce {
                    check_expression(reduce, &format!("{at}.reduce"), problems);
                }
                if let Some(initial) = &map_step.initial {
                    check_expression(initial, &format!("{at}.initial"), problems);
                }
                if map_step.parallelism == Some(0) {
                    problems.push(format!("{at}: parallelism must be at least 1"));
                }
                let fanout = inside_fanout || map_step.parallelism.unwrap_or(1) > 1;
                walk_steps(task, &map_step.map, &format!("{at}.map"), fanout, tool_names, problems);
            }
        }
    }
}

/// Validate a task against its agent. Invalid definitions reject task
/// creation; nothing is persisted.
pub fn validate_task(task: &TaskDefinition, agent: &AgentDefinition) -> Result<()> {
    let mut problems = Vec::new();

    for (name, _) in &task.workflows {
        if name == "main" {
            problems.push("workflow name 'main' is reserved for the entry workflow".to_string());
        }
        if name.contains(['[', ']', '.']) {
            problems.push(format!(
                "workflow name '{name}' must not contain '[', ']' or '.'"
            ));
        }
    }

    for tool in task.tools.iter().chain(agent.tools.iter()) {
        if let Err(e) = tool.validate() {
            problems.push(e.to_string());
        }
    }

    let catalog = resolve_catalog(&agent.tools, &task.tools, task.inherit_tools);
    if let Err(e) = format_tools(&catalog, &NoReflection) {
        problems.push(e.to_string());
    }
    let tool_names: Vec<String> = catalog.iter().map(|t| t.name.clone()).collect();

    walk_steps(task, &task.main, "main", false, &tool_names, &mut problems);
    for (name, steps) in &task.workflows {
        walk_steps(task, steps, name, false, &tool_names, &mut problems);
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::Invalid { problems })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentDefinition {
        serde_yaml::from_str("name: tester").unwrap()
    }

    fn task(yaml: &str) -> TaskDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn valid_task_passes() {
        let t = task(
            r#"
name: ok
main:
  - evaluate:
      a: "1 + 2"
  - log: "a is {{ _.a }}"
  - return:
      x: "_.a"
"#,
        );
        assert!(validate_task(&t, &agent()).is_ok());
    }

    #[test]
    fn bad_expression_rejected() {
        let t = task(
            r#"
name: bad
main:
  - evaluate:
      a: "1 +"
"#,
        );
        let err = validate_task(&t, &agent()).unwrap_err();
        assert!(err.to_string().contains("main[0].evaluate.a"));
    }

    #[test]
    fn unknown_tool_rejected() {
        let t = task(
            r#"
name: bad
main:
  - tool_call:
      tool: ghost
"#,
        );
        let err = validate_task(&t, &agent()).unwrap_err();
        assert!(err.to_string().contains("unknown tool 'ghost'"));
    }

    #[test]
    fn unknown_yield_target_rejected() {
        let t = task(
            r#"
name: bad
main:
  - yield:
      workflow: nowhere
"#,
        );
        let err = validate_task(&t, &agent()).unwrap_err();
        assert!(err.to_string().contains("unknown workflow 'nowhere'"));
    }

    #[test]
    fn reserved_workflow_characters_rejected() {
        let t = task(
            r#"
name: bad
main:
  - return:
      x: "1"
workflows:
  "sub[0]":
    - return:
        x: "1"
"#,
        );
        let err = validate_task(&t, &agent()).unwrap_err();
        assert!(err.to_string().contains("must not contain"));
    }

    #[test]
    fn wait_inside_parallel_rejected() {
        let t = task(
            r#"
name: bad
main:
  - parallel:
      - - wait_for_input:
            info: "need a hand"
"#,
        );
        let err = validate_task(&t, &agent()).unwrap_err();
        assert!(err.to_string().contains("not allowed inside parallel"));
    }

    #[test]
    fn bad_sleep_duration_rejected() {
        let t = task(
            r#"
name: bad
main:
  - sleep: "5 seconds"
"#,
        );
        assert!(validate_task(&t, &agent()).is_err());
    }
}
