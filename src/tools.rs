//! Tool-call envelopes and the registration payload.
//!
//! Every reverse call is answered with a [`ToolResult`]: a list of content
//! blocks plus an `isError` flag. The same shape comes back from outgoing
//! `tools/call` requests.
//!
//! ```
//! use mcp_link::tools::ToolResult;
//!
//! let ok = ToolResult::text("done");
//! assert_eq!(
//!     serde_json::to_value(&ok).unwrap(),
//!     serde_json::json!({"content": [{"type": "text", "text": "done"}], "isError": false})
//! );
//! ```

use crate::config::ClientConfig;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Text the dispatcher includes in a successful registration reply.
pub const REGISTRATION_ACK: &str = "Successfully registered tool";

/// One content block of a tool result.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ToolContent {
    Text(String),
    /// Any non-text block (images, resources), kept verbatim.
    Other(Value),
}

impl ToolContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ToolContent::Text(text) => Some(text),
            ToolContent::Other(_) => None,
        }
    }
}

impl Serialize for ToolContent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        match self {
            ToolContent::Text(text) => {
                let mut s = serializer.serialize_struct("ToolContent", 2)?;
                s.serialize_field("type", "text")?;
                s.serialize_field("text", text)?;
                s.end()
            }
            ToolContent::Other(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ToolContent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de;
        let value = Value::deserialize(deserializer)?;
        let Some(object) = value.as_object() else {
            return Err(de::Error::invalid_type(
                de::Unexpected::Other("non-object content"),
                &"a tool content object with a type",
            ));
        };
        match object.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = object
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| de::Error::missing_field("text"))?;
                Ok(ToolContent::Text(text.to_owned()))
            }
            Some(_) => Ok(ToolContent::Other(value)),
            None => Err(de::Error::missing_field("type")),
        }
    }
}

impl From<String> for ToolContent {
    fn from(value: String) -> Self {
        ToolContent::Text(value)
    }
}

impl From<&str> for ToolContent {
    fn from(value: &str) -> Self {
        ToolContent::Text(value.to_string())
    }
}

/// The result envelope of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn new(content: Vec<ToolContent>) -> Self {
        ToolResult {
            content,
            is_error: false,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        ToolResult::new(vec![ToolContent::Text(text.into())])
    }

    /// An error result whose single text block reads `Error: {message}`.
    pub fn error(message: impl std::fmt::Display) -> Self {
        ToolResult {
            content: vec![ToolContent::Text(format!("Error: {message}"))],
            is_error: true,
        }
    }

    /// An error result carrying `text` unchanged.
    pub fn error_text(text: impl Into<String>) -> Self {
        ToolResult {
            content: vec![ToolContent::Text(text.into())],
            is_error: true,
        }
    }

    /// A result whose text is `report` pretty-printed.
    pub fn json(report: &Value, is_error: bool) -> Self {
        let text = serde_json::to_string_pretty(report).unwrap_or_else(|_| report.to_string());
        ToolResult {
            content: vec![ToolContent::Text(text)],
            is_error,
        }
    }

    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(ToolContent::as_text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// The `tools/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolList {
    pub tools: Vec<ToolInfo>,
}

impl ToolList {
    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }
}

/// Parameters of an outgoing `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    r#type: String,
    properties: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    required: Vec<String>,
}

pub struct Argument {
    name: String,
    r#type: String,
    description: String,
    required: bool,
    default: Option<Value>,
}

impl Argument {
    pub fn new(name: &str, r#type: &str, description: &str, required: bool) -> Self {
        Self {
            name: name.to_owned(),
            r#type: r#type.to_owned(),
            description: description.to_owned(),
            required,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

impl InputSchema {
    pub fn new<A: IntoIterator<Item = Argument>>(arguments: A) -> Self {
        let mut properties = BTreeMap::new();
        let mut required = Vec::new();
        for argument in arguments {
            let mut inner_map: BTreeMap<String, Value> = BTreeMap::new();
            inner_map.insert("type".to_string(), argument.r#type.into());
            inner_map.insert("description".to_string(), argument.description.into());
            if let Some(default) = argument.default {
                inner_map.insert("default".to_string(), default);
            }
            if argument.required {
                required.push(argument.name.clone());
            }
            properties.insert(argument.name, inner_map);
        }
        InputSchema {
            r#type: "object".to_string(),
            properties,
            required,
        }
    }
}

/// Schema of the arguments this client's tool accepts.
pub fn tool_input_schema() -> InputSchema {
    InputSchema::new([
        Argument::new(
            "operation",
            "string",
            "execute | api_call | call_tool; inferred from code or api_path when omitted",
            false,
        )
        .with_default(json!("execute")),
        Argument::new("code", "string", "Code to run for the execute operation", false),
        Argument::new("api_path", "string", "Dotted path to invoke for api_call", false),
        Argument::new("args", "array", "Positional arguments for api_call", false),
        Argument::new("kwargs", "object", "Keyword arguments for api_call", false),
        Argument::new("tool_name", "string", "Target tool for call_tool", false),
        Argument::new("arguments", "object", "Arguments forwarded by call_tool", false),
        Argument::new("session_id", "string", "Named execution context", false)
            .with_default(json!("default")),
        Argument::new(
            "persistent",
            "boolean",
            "Keep variables in the named context between calls",
            false,
        )
        .with_default(json!(true)),
    ])
}

/// The `tools/call` parameters that register this client with the dispatcher.
pub fn registration_params(config: &ClientConfig) -> Value {
    json!({
        "name": config.dispatcher_tool,
        "arguments": {
            "input": {
                "operation": "register",
                "tool_name": config.tool_name,
                "description": config.description,
                "readme": config.readme,
                "parameters": tool_input_schema(),
                "callback_endpoint": config.callback_endpoint(),
                "TOOL_API_KEY": config.tool_key(),
            }
        }
    })
}

/// Whether a registration reply's result acknowledges the tool.
pub fn registration_accepted(result: &Value) -> bool {
    ToolResult::deserialize(result)
        .ok()
        .and_then(|r| r.first_text().map(|t| t.contains(REGISTRATION_ACK)))
        .unwrap_or(false)
}
