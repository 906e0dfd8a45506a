use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;
use snafu::prelude::*;
use tracing::debug;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Syntax error in '{expression}': {message}"))]
    Syntax { expression: String, message: String },

    #[snafu(display("Unknown name in '{expression}': {message}"))]
    Name { expression: String, message: String },

    #[snafu(display("Type error in '{expression}': {message}"))]
    Type { expression: String, message: String },

    #[snafu(display("Arity error in '{expression}': {message}"))]
    Arity { expression: String, message: String },

    #[snafu(display("Forbidden operation in '{expression}': {message}"))]
    ForbiddenOperation { expression: String, message: String },

    #[snafu(display("Template error in '{template}': {message}"))]
    Template { template: String, message: String },

    #[snafu(display("Result of '{expression}' is not serializable: {source}"))]
    Serialization {
        expression: String,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classify a minijinja error into the evaluator failure taxonomy.
fn classify(expression: &str, err: &minijinja::Error) -> Error {
    use minijinja::ErrorKind;

    let expression = expression.to_string();
    let message = err.to_string();

    match err.kind() {
        ErrorKind::SyntaxError | ErrorKind::BadEscape => Error::Syntax {
            expression,
            message,
        },
        ErrorKind::UndefinedError
        | ErrorKind::UnknownFunction
        | ErrorKind::UnknownFilter
        | ErrorKind::UnknownTest
        | ErrorKind::UnknownMethod => Error::Name {
            expression,
            message,
        },
        ErrorKind::MissingArgument | ErrorKind::TooManyArguments => Error::Arity {
            expression,
            message,
        },
        ErrorKind::InvalidOperation | ErrorKind::CannotUnpack => Error::Type {
            expression,
            message,
        },
        _ => Error::ForbiddenOperation {
            expression,
            message,
        },
    }
}

/// Build the sandboxed environment: strict undefined names, expression
/// grammar only, no I/O.
fn environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}

/// Check that `expression` parses as a single expression. Called at
/// task-definition time on every expression occurrence.
pub fn validate_expression(expression: &str) -> Result<()> {
    let env = environment();
    env.compile_expression(expression)
        .map(|_| ())
        .map_err(|e| classify(expression, &e))
}

/// Check that `template` parses, including every embedded expression.
pub fn validate_template(template: &str) -> Result<()> {
    let env = environment();
    env.template_from_str(template)
        .map(|_| ())
        .map_err(|e| Error::Template {
            template: template.to_string(),
            message: e.to_string(),
        })
}

/// Evaluate a single expression against a read-only scope. Pure with
/// respect to the scope; the dialect has no clock, randomness, or I/O.
pub fn evaluate(expression: &str, scope: &serde_json::Map<String, Value>) -> Result<Value> {
    let env = environment();
    let compiled = env
        .compile_expression(expression)
        .map_err(|e| classify(expression, &e))?;

    debug!(expression, "evaluating expression");

    let result = compiled
        .eval(minijinja::Value::from_serialize(scope))
        .map_err(|e| classify(expression, &e))?;

    serde_json::to_value(&result).context(SerializationSnafu { expression })
}

/// Render a template string against a scope. A template with no
/// substitutions renders to itself.
pub fn render(template: &str, scope: &serde_json::Map<String, Value>) -> Result<String> {
    let env = environment();
    env.render_str(template, minijinja::Value::from_serialize(scope))
        .map_err(|e| Error::Template {
            template: template.to_string(),
            message: e.to_string(),
        })
}

/// Evaluate a JSON value tree where every string leaf is an expression.
/// Objects and arrays are walked recursively; other leaves pass through.
pub fn evaluate_value(value: &Value, scope: &serde_json::Map<String, Value>) -> Result<Value> {
    match value {
        Value::String(s) => evaluate(s, scope),
        Value::Object(map) => {
            let mut result = serde_json::Map::new();
            for (k, v) in map {
                result.insert(k.clone(), evaluate_value(v, scope)?);
            }
            Ok(Value::Object(result))
        }
        Value::Array(arr) => {
            let mut result = Vec::with_capacity(arr.len());
            for item in arr {
                result.push(evaluate_value(item, scope)?);
            }
            Ok(Value::Array(result))
        }
        other => Ok(other.clone()),
    }
}

/// Jinja truthiness, used by `if_else` and `switch` conditions.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn arithmetic() {
        let result = evaluate("1 + 2", &scope(json!({}))).unwrap();
        assert_eq!(result, json!(3));
    }

    #[test]
    fn attribute_access() {
        let result = evaluate("_.a", &scope(json!({"_": {"a": 3}}))).unwrap();
        assert_eq!(result, json!(3));
    }

    #[test]
    fn power_operator() {
        let result = evaluate("_ ** 2", &scope(json!({"_": 4}))).unwrap();
        assert_eq!(result, json!(16));
    }

    #[test]
    fn comparison() {
        let result = evaluate("input.n > 0", &scope(json!({"input": {"n": -1}}))).unwrap();
        assert_eq!(result, json!(false));
    }

    #[test]
    fn list_display() {
        let result = evaluate("[1, 2, 3]", &scope(json!({}))).unwrap();
        assert_eq!(result, json!([1, 2, 3]));
    }

    #[test]
    fn undefined_name_is_name_error() {
        let err = evaluate("nope + 1", &scope(json!({}))).unwrap_err();
        assert!(matches!(err, Error::Name { .. }), "got {err:?}");
    }

    #[test]
    fn bad_syntax_is_syntax_error() {
        let err = validate_expression("1 +").unwrap_err();
        assert!(matches!(err, Error::Syntax { .. }), "got {err:?}");
    }

    #[test]
    fn render_without_substitutions_is_identity() {
        let rendered = render("plain text, no braces", &scope(json!({}))).unwrap();
        assert_eq!(rendered, "plain text, no braces");
    }

    #[test]
    fn render_substitutes() {
        let rendered = render(
            "hello {{ input.name }}",
            &scope(json!({"input": {"name": "ada"}})),
        )
        .unwrap();
        assert_eq!(rendered, "hello ada");
    }

    #[test]
    fn evaluate_value_walks_string_leaves() {
        let result = evaluate_value(
            &json!({"q": "input.q", "n": 3, "nested": {"x": "1 + 1"}}),
            &scope(json!({"input": {"q": "rust"}})),
        )
        .unwrap();
        assert_eq!(result, json!({"q": "rust", "n": 3, "nested": {"x": 2}}));
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!([0])));
        assert!(truthy(&json!(-1)));
    }
}
