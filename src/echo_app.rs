use mcp_link::config::{ClientConfig, DEFAULT_TOOL_NAME, TICK_INTERVAL};
use mcp_link::router::{ExecutionOutput, HostCapability, HostError, NamedExecutionContext, ToolBridge};
use mcp_link::Client;
use serde_json::{Map, Value, json};

/// Answers every call by describing it.
struct EchoHost {
    executions: u64,
}

impl HostCapability for EchoHost {
    fn execute(
        &mut self,
        code: &str,
        context: &mut NamedExecutionContext,
        tools: ToolBridge<'_>,
    ) -> Result<ExecutionOutput, HostError> {
        self.executions += 1;
        context.variables.insert("last_code".to_owned(), json!(code));
        context
            .variables
            .insert("tools_available".to_owned(), json!(tools.is_available()));
        Ok(ExecutionOutput {
            stdout: format!("{code}\n"),
            stderr: String::new(),
            return_value: Some(json!(self.executions)),
        })
    }

    fn invoke_path(
        &mut self,
        path: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, HostError> {
        Ok(json!({"path": path, "args": args, "kwargs": kwargs}))
    }
}

fn main() -> mcp_link::Result<()> {
    let tool_name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_TOOL_NAME.to_owned());
    let config = ClientConfig::new(tool_name).with_description("Echoes every call back to the caller");
    let (_client, mut pump) = Client::start(config, EchoHost { executions: 0 })?;
    loop {
        pump.tick();
        std::thread::sleep(TICK_INTERVAL);
    }
}
