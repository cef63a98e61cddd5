//! Turning a reverse-call payload into a host action.
//!
//! The router runs on the main thread, inside [`crate::bridge::WorkBridge::drain`].
//! It decodes which operation the caller wants and hands it to the host:
//!
//! | operation | also accepted as | inferred from | goes to |
//! |---|---|---|---|
//! | `execute` | `execute_python` | `code` | [`HostCapability::execute`] |
//! | `api_call` | `invoke_path` | `api_path` / `path` | [`HostCapability::invoke_path`] |
//! | `call_tool` | | | [`ToolCaller::call_tool`] |
//!
//! Every outcome, failures included, is a [`ToolResult`].

use crate::error::{Error, Result};
use crate::jrpc::Response;
use crate::tools::ToolResult;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Context name used when the caller does not pick one.
pub const DEFAULT_CONTEXT: &str = "default";

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub code: String,
    /// Name of the execution context.
    pub context: String,
    /// Whether the context outlives this call.
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathInvocation {
    pub path: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub tool_name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Execute(ExecuteRequest),
    InvokePath(PathInvocation),
    CallTool(ToolCallRequest),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouteError {
    #[error("Unknown operation '{0}'. Use execute, api_call or call_tool")]
    UnknownOperation(String),
    #[error("'{field}' parameter required for {operation}")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },
}

fn non_empty_str<'a>(arguments: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

impl Operation {
    /// Decodes a reverse-call payload.
    ///
    /// Arguments are read from `params.arguments` when present, else from the
    /// payload itself.
    ///
    /// ```
    /// use mcp_link::router::Operation;
    /// use serde_json::json;
    ///
    /// let payload = json!({"params": {"arguments": {"code": "print(1)"}}});
    /// match Operation::decode(&payload).unwrap() {
    ///     Operation::Execute(request) => {
    ///         assert_eq!(request.context, "default");
    ///         assert!(request.persistent);
    ///     }
    ///     other => panic!("unexpected {other:?}"),
    /// }
    /// ```
    pub fn decode(payload: &Value) -> std::result::Result<Operation, RouteError> {
        let empty = Map::new();
        let arguments = payload
            .get("params")
            .and_then(|p| p.get("arguments"))
            .and_then(Value::as_object)
            .or_else(|| payload.as_object())
            .unwrap_or(&empty);

        let named = arguments.get("operation").and_then(Value::as_str);
        match named {
            Some("execute" | "execute_python") => Self::execute(arguments),
            Some("api_call" | "invoke_path") => Self::invoke_path(arguments),
            Some("call_tool") => Self::call_tool(arguments),
            other => {
                if arguments.get("code").is_some_and(|c| !c.is_null()) {
                    Self::execute(arguments)
                } else if arguments.contains_key("api_path") || arguments.contains_key("path") {
                    Self::invoke_path(arguments)
                } else {
                    Err(RouteError::UnknownOperation(other.unwrap_or_default().to_owned()))
                }
            }
        }
    }

    fn execute(arguments: &Map<String, Value>) -> std::result::Result<Operation, RouteError> {
        let code = non_empty_str(arguments, "code").ok_or(RouteError::MissingField {
            operation: "execute",
            field: "code",
        })?;
        Ok(Operation::Execute(ExecuteRequest {
            code: code.to_owned(),
            context: non_empty_str(arguments, "session_id")
                .unwrap_or(DEFAULT_CONTEXT)
                .to_owned(),
            persistent: arguments
                .get("persistent")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        }))
    }

    fn invoke_path(arguments: &Map<String, Value>) -> std::result::Result<Operation, RouteError> {
        let path = non_empty_str(arguments, "api_path")
            .or_else(|| non_empty_str(arguments, "path"))
            .ok_or(RouteError::MissingField {
                operation: "api_call",
                field: "api_path",
            })?;
        Ok(Operation::InvokePath(PathInvocation {
            path: path.to_owned(),
            args: arguments
                .get("args")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            kwargs: arguments
                .get("kwargs")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }))
    }

    fn call_tool(arguments: &Map<String, Value>) -> std::result::Result<Operation, RouteError> {
        let tool_name = non_empty_str(arguments, "tool_name").ok_or(RouteError::MissingField {
            operation: "call_tool",
            field: "tool_name",
        })?;
        Ok(Operation::CallTool(ToolCallRequest {
            tool_name: tool_name.to_owned(),
            arguments: arguments
                .get("arguments")
                .cloned()
                .filter(|a| !a.is_null())
                .unwrap_or_else(|| json!({})),
        }))
    }
}

/// Variables that survive between executions sharing a context name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedExecutionContext {
    name: String,
    pub variables: Map<String, Value>,
}

impl NamedExecutionContext {
    pub fn new(name: impl Into<String>) -> Self {
        NamedExecutionContext {
            name: name.into(),
            variables: Map::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The named contexts of one router. Lives on the main thread.
#[derive(Debug, Default)]
pub struct ExecutionContexts {
    contexts: HashMap<String, NamedExecutionContext>,
}

impl ExecutionContexts {
    pub fn get(&self, name: &str) -> Option<&NamedExecutionContext> {
        self.contexts.get(name)
    }

    pub fn get_or_create(&mut self, name: &str) -> &mut NamedExecutionContext {
        self.contexts
            .entry(name.to_owned())
            .or_insert_with(|| NamedExecutionContext::new(name))
    }

    pub fn clear(&mut self) {
        self.contexts.clear();
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub return_value: Option<Value>,
}

/// A failure reported by the host.
#[derive(Debug, Clone, Default, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HostError {
    pub message: String,
    /// A traceback or similar, when the host has one.
    pub detail: Option<String>,
    /// Output captured before the failure.
    pub output: ExecutionOutput,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        HostError {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// What the host application can do. Called on the main thread only.
pub trait HostCapability {
    /// Runs `code`, reading and updating `context`.
    ///
    /// `tools` lets the running code call other tools on the control plane,
    /// so a script can reach a database tool without leaving the host.
    fn execute(
        &mut self,
        code: &str,
        context: &mut NamedExecutionContext,
        tools: ToolBridge<'_>,
    ) -> std::result::Result<ExecutionOutput, HostError>;

    /// Resolves the dotted `path` and calls it.
    fn invoke_path(
        &mut self,
        path: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> std::result::Result<Value, HostError>;
}

/// Outgoing tool calls through the control plane.
pub trait ToolCaller: Send + Sync {
    fn call_tool(&self, name: &str, arguments: Value, timeout: Duration) -> Result<Response<Value>>;
}

/// The outgoing half of the router, lent to [`HostCapability::execute`].
#[derive(Clone, Copy)]
pub struct ToolBridge<'a> {
    caller: Option<&'a dyn ToolCaller>,
    timeout: Duration,
}

impl<'a> ToolBridge<'a> {
    pub fn new(caller: Option<&'a dyn ToolCaller>, timeout: Duration) -> Self {
        ToolBridge { caller, timeout }
    }

    /// A bridge with no connection behind it; every call fails with [`Error::NotConnected`].
    pub fn unavailable() -> Self {
        ToolBridge::new(None, crate::config::TOOL_CALL_TIMEOUT)
    }

    pub fn is_available(&self) -> bool {
        self.caller.is_some()
    }

    /// Calls `name` and waits for its response.
    pub fn call(&self, name: &str, arguments: Value) -> Result<Response<Value>> {
        self.caller
            .ok_or(Error::NotConnected)?
            .call_tool(name, arguments, self.timeout)
    }
}

pub struct Router<H> {
    host: H,
    contexts: ExecutionContexts,
    caller: Option<Arc<dyn ToolCaller>>,
    tool_call_timeout: Duration,
}

impl<H: HostCapability> Router<H> {
    pub fn new(host: H) -> Self {
        Router {
            host,
            contexts: ExecutionContexts::default(),
            caller: None,
            tool_call_timeout: crate::config::TOOL_CALL_TIMEOUT,
        }
    }

    /// Enables `call_tool` and the [`ToolBridge`] given to executed code.
    pub fn with_caller(mut self, caller: Arc<dyn ToolCaller>) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn with_tool_call_timeout(mut self, timeout: Duration) -> Self {
        self.tool_call_timeout = timeout;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Persistent contexts created so far, keyed by name.
    pub fn contexts(&self) -> &ExecutionContexts {
        &self.contexts
    }

    pub fn contexts_mut(&mut self) -> &mut ExecutionContexts {
        &mut self.contexts
    }

    /// Handles one reverse-call payload.
    pub fn handle(&mut self, payload: Value) -> ToolResult {
        match Operation::decode(&payload) {
            Ok(operation) => self.dispatch(operation),
            Err(e) => ToolResult::error_text(format!("ERROR: {e}")),
        }
    }

    /// Runs an already decoded operation.
    pub fn dispatch(&mut self, operation: Operation) -> ToolResult {
        match operation {
            Operation::Execute(request) => self.execute(request),
            Operation::InvokePath(invocation) => self.invoke_path(invocation),
            Operation::CallTool(request) => self.call_tool(request),
        }
    }

    fn execute(&mut self, request: ExecuteRequest) -> ToolResult {
        let mut temporary = NamedExecutionContext::new(request.context.as_str());
        let context = if request.persistent {
            self.contexts.get_or_create(&request.context)
        } else {
            &mut temporary
        };
        let tools = ToolBridge::new(self.caller.as_deref(), self.tool_call_timeout);
        match self.host.execute(&request.code, context, tools) {
            Ok(output) => {
                let mut report = json!({
                    "success": true,
                    "stdout": output.stdout,
                    "stderr": output.stderr,
                });
                if let Some(value) = output.return_value {
                    report["return_value"] = value;
                }
                if request.persistent {
                    report["session_id"] = json!(context.name());
                    report["session_variables"] =
                        json!(context.variables.keys().collect::<Vec<_>>());
                }
                ToolResult::json(&report, false)
            }
            Err(e) => {
                let mut report = json!({
                    "success": false,
                    "error": e.message,
                    "stdout": e.output.stdout,
                    "stderr": e.output.stderr,
                });
                if let Some(detail) = e.detail {
                    report["detail"] = json!(detail);
                }
                ToolResult::json(&report, true)
            }
        }
    }

    fn invoke_path(&mut self, invocation: PathInvocation) -> ToolResult {
        match self
            .host
            .invoke_path(&invocation.path, &invocation.args, &invocation.kwargs)
        {
            Ok(Value::Null) => ToolResult::text("Operation completed successfully (no return value)"),
            Ok(Value::String(s)) => ToolResult::text(format!("Result: {s}")),
            Ok(value) => ToolResult::text(format!("Result: {value}")),
            Err(e) => ToolResult::error_text(format!("ERROR calling {}: {e}", invocation.path)),
        }
    }

    fn call_tool(&mut self, request: ToolCallRequest) -> ToolResult {
        let Some(caller) = &self.caller else {
            return ToolResult::error("no control-plane connection is available for call_tool");
        };
        match caller.call_tool(&request.tool_name, request.arguments, self.tool_call_timeout) {
            Ok(response) => match response.into_result() {
                Ok(value) => serde_json::from_value::<ToolResult>(value.clone())
                    .unwrap_or_else(|_| ToolResult::json(&value, false)),
                Err(e) => ToolResult::error(e),
            },
            Err(e) => ToolResult::error(e),
        }
    }
}
