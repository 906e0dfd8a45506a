//! Tool records, the per-step catalog, and the provider-facing formatter.
//!
//! A tool is a tagged union over exactly one populated variant. For a model
//! call the catalog is flattened into a single descriptor array in the
//! provider's schema, together with a reverse map from emitted name back to
//! the original record so tool calls in the response can be re-keyed to
//! their true kind.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snafu::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Tool '{name}' must populate exactly one variant, found {count}"))]
    VariantCount { name: String, count: usize },

    #[snafu(display("Duplicate tool name after merge: {name}"))]
    DuplicateName { name: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Model-native tool kinds owned by the Anthropic computer-use protocol.
pub const NATIVE_TOOL_KINDS: [&str; 3] =
    ["computer_20241022", "bash_20241022", "text_editor_20241022"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemDef {
    pub resource: String,
    pub operation: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationDef {
    pub provider: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub setup: Option<Value>,
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallDef {
    pub method: String,
    pub url: String,
    /// JSON schema of the request payload, surfaced to the model as-is.
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub headers: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputerDef {
    pub display_width_px: u32,
    pub display_height_px: u32,
    #[serde(default)]
    pub display_number: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkerDef {}

/// A callable available to prompt and tool_call steps. Exactly one variant
/// field is populated; [`Tool::kind`] is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<IntegrationDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_call: Option<ApiCallDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computer_20241022: Option<ComputerDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bash_20241022: Option<MarkerDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_editor_20241022: Option<MarkerDef>,
}

impl Tool {
    /// The derived type tag: the name of the populated variant.
    pub fn kind(&self) -> &'static str {
        if self.function.is_some() {
            "function"
        } else if self.system.is_some() {
            "system"
        } else if self.integration.is_some() {
            "integration"
        } else if self.api_call.is_some() {
            "api_call"
        } else if self.computer_20241022.is_some() {
            "computer_20241022"
        } else if self.bash_20241022.is_some() {
            "bash_20241022"
        } else if self.text_editor_20241022.is_some() {
            "text_editor_20241022"
        } else {
            "unknown"
        }
    }

    pub fn is_native(&self) -> bool {
        NATIVE_TOOL_KINDS.contains(&self.kind())
    }

    fn populated_count(&self) -> usize {
        [
            self.function.is_some(),
            self.system.is_some(),
            self.integration.is_some(),
            self.api_call.is_some(),
            self.computer_20241022.is_some(),
            self.bash_20241022.is_some(),
            self.text_editor_20241022.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count()
    }

    /// Invariant check: exactly one variant populated.
    pub fn validate(&self) -> Result<()> {
        let count = self.populated_count();
        ensure!(
            count == 1,
            VariantCountSnafu {
                name: self.name.clone(),
                count,
            }
        );
        Ok(())
    }
}

/// Reflection seam for system tools: the collaborator that knows the
/// declared handler derives a JSON schema from its arguments.
pub trait SchemaReflector: Send + Sync {
    fn reflect(&self, system: &SystemDef) -> Option<Value>;
}

/// Default reflector: no handler registry, every system tool gets the
/// empty object schema.
pub struct NoReflection;

impl SchemaReflector for NoReflection {
    fn reflect(&self, _system: &SystemDef) -> Option<Value> {
        None
    }
}

enum ProviderArgs {
    Single(Value),
    PerMethod(HashMap<&'static str, Value>),
}

fn query_schema(field: &str, description: &str) -> Value {
    json!({
        "type": "object",
        "properties": { field: {"type": "string", "description": description} },
        "required": [field],
    })
}

lazy_static! {
    /// Declared argument models per integration provider. Unknown
    /// provider/method combinations fall back to the empty object schema.
    static ref INTEGRATION_ARGS: HashMap<&'static str, ProviderArgs> = {
        let mut map = HashMap::new();
        map.insert(
            "brave",
            ProviderArgs::Single(query_schema("query", "The search query")),
        );
        map.insert("dummy", ProviderArgs::Single(json!({"type": "object", "properties": {}})));
        map.insert(
            "email",
            ProviderArgs::Single(json!({
                "type": "object",
                "properties": {
                    "to": {"type": "string", "description": "Recipient address"},
                    "from": {"type": "string", "description": "Sender address"},
                    "subject": {"type": "string", "description": "Subject line"},
                    "body": {"type": "string", "description": "Message body"},
                },
                "required": ["to", "from", "subject", "body"],
            })),
        );
        map.insert(
            "spider",
            ProviderArgs::Single(json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "The URL to crawl"},
                    "mode": {"type": "string", "description": "Crawl mode"},
                },
                "required": ["url"],
            })),
        );
        map.insert(
            "wikipedia",
            ProviderArgs::Single(query_schema("query", "The article to look up")),
        );
        map.insert(
            "weather",
            ProviderArgs::Single(query_schema("location", "The location to query")),
        );
        map.insert(
            "remote_browser",
            ProviderArgs::Single(json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "description": "Browser action to perform"},
                    "coordinate": {"type": "array", "items": {"type": "integer"}},
                    "text": {"type": "string"},
                },
                "required": ["action"],
            })),
        );
        let mut browserbase = HashMap::new();
        browserbase.insert(
            "create_context",
            json!({"type": "object", "properties": {"project_id": {"type": "string"}}, "required": ["project_id"]}),
        );
        browserbase.insert(
            "install_extension_from_github",
            json!({
                "type": "object",
                "properties": {
                    "repository_name": {"type": "string"},
                    "ref": {"type": "string"},
                },
                "required": ["repository_name", "ref"],
            }),
        );
        browserbase.insert("list_sessions", json!({"type": "object", "properties": {"status": {"type": "string"}}}));
        browserbase.insert(
            "create_session",
            json!({
                "type": "object",
                "properties": {
                    "project_id": {"type": "string"},
                    "extension_id": {"type": "string"},
                    "browser_settings": {"type": "object"},
                },
                "required": ["project_id"],
            }),
        );
        browserbase.insert(
            "get_session",
            json!({"type": "object", "properties": {"id": {"type": "string"}}, "required": ["id"]}),
        );
        browserbase.insert(
            "complete_session",
            json!({"type": "object", "properties": {"id": {"type": "string"}}, "required": ["id"]}),
        );
        browserbase.insert(
            "get_live_urls",
            json!({"type": "object", "properties": {"id": {"type": "string"}}, "required": ["id"]}),
        );
        browserbase.insert(
            "get_connect_url",
            json!({"type": "object", "properties": {"id": {"type": "string"}}, "required": ["id"]}),
        );
        map.insert("browserbase", ProviderArgs::PerMethod(browserbase));
        map
    };
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}, "required": []})
}

/// Synthesize the parameter schema for an integration tool from the
/// provider/method argument registry.
fn integration_parameters(integration: &IntegrationDef) -> Value {
    if let Some(declared) = &integration.arguments {
        return declared.clone();
    }
    match INTEGRATION_ARGS.get(integration.provider.as_str()) {
        Some(ProviderArgs::Single(schema)) => schema.clone(),
        Some(ProviderArgs::PerMethod(methods)) => integration
            .method
            .as_deref()
            .and_then(|m| methods.get(m))
            .cloned()
            .unwrap_or_else(empty_object_schema),
        None => empty_object_schema(),
    }
}

/// Merge task tools over agent tools; task wins by name. With
/// `inherit_tools: false` the agent's tools are not merged at all.
pub fn resolve_catalog(agent_tools: &[Tool], task_tools: &[Tool], inherit: bool) -> Vec<Tool> {
    let mut merged: Vec<Tool> = Vec::new();
    if inherit {
        for tool in agent_tools {
            if !task_tools.iter().any(|t| t.name == tool.name) {
                merged.push(tool.clone());
            }
        }
    }
    merged.extend(task_tools.iter().cloned());
    merged
}

/// Format one tool into the provider-facing descriptor.
pub fn format_tool(tool: &Tool, reflector: &dyn SchemaReflector) -> Value {
    if let Some(computer) = &tool.computer_20241022 {
        return json!({
            "type": "computer_20241022",
            "name": tool.name,
            "display_width_px": computer.display_width_px,
            "display_height_px": computer.display_height_px,
            "display_number": computer.display_number,
        });
    }

    if tool.bash_20241022.is_some() || tool.text_editor_20241022.is_some() {
        return json!({"type": tool.kind(), "name": tool.name});
    }

    if let Some(function) = &tool.function {
        return json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": function.description.clone().or_else(|| tool.description.clone()),
                "parameters": function.parameters.clone().unwrap_or_else(empty_object_schema),
            },
        });
    }

    // Every other kind is surfaced to the model as a function tool.
    let parameters = if let Some(system) = &tool.system {
        system
            .arguments
            .clone()
            .or_else(|| reflector.reflect(system))
            .unwrap_or_else(empty_object_schema)
    } else if let Some(integration) = &tool.integration {
        integration_parameters(integration)
    } else if let Some(api_call) = &tool.api_call {
        api_call.schema.clone().unwrap_or_else(empty_object_schema)
    } else {
        empty_object_schema()
    };

    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": parameters,
        },
    })
}

/// The name a formatted descriptor is emitted under.
pub fn emitted_name(formatted: &Value) -> Option<&str> {
    formatted
        .get("name")
        .and_then(Value::as_str)
        .or_else(|| {
            formatted
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
        })
}

/// Format the whole catalog and build the reverse map from emitted name
/// back to the original record. Collisions are rejected (they would make
/// response translation ambiguous).
pub fn format_tools(
    tools: &[Tool],
    reflector: &dyn SchemaReflector,
) -> Result<(Vec<Value>, HashMap<String, Tool>)> {
    let mut formatted = Vec::with_capacity(tools.len());
    let mut mapping = HashMap::with_capacity(tools.len());

    for tool in tools {
        let descriptor = format_tool(tool, reflector);
        let name = emitted_name(&descriptor)
            .unwrap_or(tool.name.as_str())
            .to_string();
        if mapping.insert(name.clone(), tool.clone()).is_some() {
            return Err(Error::DuplicateName { name });
        }
        formatted.push(descriptor);
    }

    Ok((formatted, mapping))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function_tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: Some("a function".to_string()),
            function: Some(FunctionDef {
                description: None,
                parameters: Some(json!({"type": "object", "properties": {"x": {"type": "number"}}})),
            }),
            system: None,
            integration: None,
            api_call: None,
            computer_20241022: None,
            bash_20241022: None,
            text_editor_20241022: None,
        }
    }

    fn integration_tool(name: &str, provider: &str, method: Option<&str>) -> Tool {
        Tool {
            name: name.to_string(),
            description: Some("an integration".to_string()),
            function: None,
            system: None,
            integration: Some(IntegrationDef {
                provider: provider.to_string(),
                method: method.map(str::to_string),
                setup: None,
                arguments: None,
            }),
            api_call: None,
            computer_20241022: None,
            bash_20241022: None,
            text_editor_20241022: None,
        }
    }

    #[test]
    fn kind_matches_populated_variant() {
        assert_eq!(function_tool("f").kind(), "function");
        assert_eq!(integration_tool("i", "brave", None).kind(), "integration");
    }

    #[test]
    fn function_format_keeps_declared_schema() {
        let formatted = format_tool(&function_tool("f"), &NoReflection);
        assert_eq!(formatted["type"], "function");
        assert_eq!(formatted["function"]["name"], "f");
        assert_eq!(
            formatted["function"]["parameters"]["properties"]["x"]["type"],
            "number"
        );
    }

    #[test]
    fn integration_format_uses_provider_registry() {
        let formatted = format_tool(&integration_tool("search", "brave", None), &NoReflection);
        assert_eq!(formatted["type"], "function");
        assert_eq!(
            formatted["function"]["parameters"]["properties"]["query"]["type"],
            "string"
        );
    }

    #[test]
    fn browserbase_methods_resolve() {
        let formatted = format_tool(
            &integration_tool("bb", "browserbase", Some("get_session")),
            &NoReflection,
        );
        assert_eq!(
            formatted["function"]["parameters"]["required"],
            json!(["id"])
        );
    }

    #[test]
    fn unknown_provider_gets_empty_schema() {
        let formatted = format_tool(&integration_tool("x", "nope", None), &NoReflection);
        assert_eq!(
            formatted["function"]["parameters"],
            empty_object_schema()
        );
    }

    #[test]
    fn computer_tool_native_shape() {
        let tool = Tool {
            name: "computer".to_string(),
            description: None,
            function: None,
            system: None,
            integration: None,
            api_call: None,
            computer_20241022: Some(ComputerDef {
                display_width_px: 1024,
                display_height_px: 768,
                display_number: Some(1),
            }),
            bash_20241022: None,
            text_editor_20241022: None,
        };
        let formatted = format_tool(&tool, &NoReflection);
        assert_eq!(formatted["type"], "computer_20241022");
        assert_eq!(formatted["display_width_px"], 1024);
        assert!(tool.is_native());
    }

    #[test]
    fn reverse_map_round_trips() {
        let tools = vec![function_tool("f"), integration_tool("search", "brave", None)];
        let (formatted, mapping) = format_tools(&tools, &NoReflection).unwrap();
        for descriptor in &formatted {
            let name = emitted_name(descriptor).unwrap();
            assert!(mapping.contains_key(name));
        }
        assert_eq!(mapping["search"].kind(), "integration");
    }

    #[test]
    fn duplicate_names_rejected() {
        let tools = vec![function_tool("dup"), integration_tool("dup", "brave", None)];
        assert!(matches!(
            format_tools(&tools, &NoReflection),
            Err(Error::DuplicateName { .. })
        ));
    }

    #[test]
    fn task_tools_shadow_agent_tools() {
        let agent = vec![function_tool("a"), function_tool("shared")];
        let task = vec![integration_tool("shared", "brave", None)];
        let merged = resolve_catalog(&agent, &task, true);
        assert_eq!(merged.len(), 2);
        let shared = merged.iter().find(|t| t.name == "shared").unwrap();
        assert_eq!(shared.kind(), "integration");

        let no_inherit = resolve_catalog(&agent, &task, false);
        assert_eq!(no_inherit.len(), 1);
    }

    #[test]
    fn exactly_one_variant_enforced() {
        let mut bad = function_tool("bad");
        bad.integration = Some(IntegrationDef {
            provider: "brave".to_string(),
            method: None,
            setup: None,
            arguments: None,
        });
        assert!(bad.validate().is_err());
        assert!(function_tool("ok").validate().is_ok());
    }
}
