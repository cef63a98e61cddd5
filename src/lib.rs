/*!
A resilient remote-tool client for a local MCP control plane.

mcp-link lets a host application (a modeling package, a game editor, anything with a
main loop) expose itself as a tool on a control plane that is already running on the
same machine. The control plane then calls *back* into the host over the connection
the host opened.

# Overview

Getting connected takes five steps, all run on a background thread:

1. **Discovery**: find the control plane's manifest in one of the platform-specific
   locations (see [`discovery`]).
2. **Native handshake**: run the helper binary the manifest points at and read one
   length-prefixed JSON message from it, which names the server URL and credential
   (see [`handshake`]).
3. **Stream handshake**: open a server-sent-events stream and wait for the `endpoint`
   event that carries our session id (see [`stream`]).
4. **Dispatcher check**: `tools/list` must offer the dispatcher tool.
5. **Registration**: `tools/call` the dispatcher with our name, description and
   parameter schema.

After that the server pushes *reverse calls* over the stream. Each one is handed to the
host's main thread through a [`bridge::WorkBridge`], executed by the [`router::Router`],
and answered with `tools/reply`.

If anything fails, or the stream later drops, the [`supervisor`] backs off
exponentially (2 s, 4 s, … capped at 60 s) and starts over. It never gives up on its
own; only [`Client::stop`] ends it.

# Threads

There is no async runtime. Threads for everyone:

- one supervisor thread per client;
- one reader thread per live stream;
- the host's main thread, which only ever runs [`MainThreadPump::tick`];
- whatever threads the host uses for outgoing [`ClientHandle::call_tool`] calls.

The main thread is never blocked for longer than one batch of work items.

# Quick Start

```no_run
use mcp_link::config::{ClientConfig, TICK_INTERVAL};
use mcp_link::router::{ExecutionOutput, HostCapability, HostError, NamedExecutionContext, ToolBridge};
use mcp_link::Client;
use serde_json::{Map, Value};

struct Host;

impl HostCapability for Host {
    fn execute(&mut self, code: &str, _context: &mut NamedExecutionContext, _tools: ToolBridge<'_>)
        -> Result<ExecutionOutput, HostError> {
        Ok(ExecutionOutput { stdout: format!("ran {code}"), ..Default::default() })
    }

    fn invoke_path(&mut self, path: &str, _args: &[Value], _kwargs: &Map<String, Value>)
        -> Result<Value, HostError> {
        Err(HostError::new(format!("{path} is not available")))
    }
}

let (client, mut pump) = Client::start(ClientConfig::new("modeler"), Host)?;
loop {
    // the host's own loop
    pump.tick();
    std::thread::sleep(TICK_INTERVAL);
    # break;
}
client.stop();
# Ok::<(), mcp_link::Error>(())
```

# Calling other tools

Any thread may call other tools on the control plane through a [`ClientHandle`]. These
calls go straight to the [`correlator`] and never touch the main thread:

```no_run
# fn demo(client: &mcp_link::Client) -> mcp_link::Result<()> {
let handle = client.handle();
let response = handle.call_tool("sqlite", serde_json::json!({"query": "select 1"}))?;
println!("{:?}", response.into_result());
# Ok(())
# }
```

# Logging

Everything is logged through [logwise](https://docs.rs/logwise). Credentials are never
logged.

# Module Organization

- [`client`] - the facade: [`Client`], [`ClientHandle`], [`MainThreadPump`]
- [`config`] - [`ClientConfig`] and default timeouts
- [`discovery`], [`handshake`], [`stream`] - the connect sequence
- [`correlator`], [`jrpc`] - request/response matching
- [`supervisor`] - reconnection with backoff
- [`bridge`], [`router`] - main-thread execution
- [`tools`] - tool result and schema types
- [`http`] - the minimal HTTP/1.1 client underneath
*/
pub mod bridge;
pub mod client;
pub mod config;
pub mod correlator;
pub mod discovery;
mod error;
pub mod handshake;
pub mod http;
pub mod jrpc;
pub mod router;
pub mod stream;
pub mod supervisor;
pub mod sys;
pub mod tools;

pub use client::{Client, ClientHandle, MainThreadPump};
pub use config::ClientConfig;
pub use error::{Error, Result};
