//! Full connect sequence against a fake control plane on localhost.
#![cfg(unix)]

use mcp_link::config::ClientConfig;
use mcp_link::router::{ExecutionOutput, HostCapability, HostError, NamedExecutionContext, ToolBridge};
use mcp_link::supervisor::State;
use mcp_link::{Client, MainThreadPump};
use serde_json::{Map, Value, json};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

// each test spawns helper scripts; run them one at a time
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

struct EchoHost;

impl HostCapability for EchoHost {
    fn execute(
        &mut self,
        code: &str,
        _context: &mut NamedExecutionContext,
        tools: ToolBridge<'_>,
    ) -> Result<ExecutionOutput, HostError> {
        if let Some(tool) = code.strip_prefix("call:") {
            let response = tools.call(tool, json!({})).map_err(|e| HostError::new(e.to_string()))?;
            let result = response.into_result().map_err(|e| HostError::new(e.to_string()))?;
            return Ok(ExecutionOutput {
                stdout: result["content"][0]["text"].as_str().unwrap_or_default().to_owned(),
                ..Default::default()
            });
        }
        Ok(ExecutionOutput {
            stdout: code.to_owned(),
            ..Default::default()
        })
    }

    fn invoke_path(
        &mut self,
        path: &str,
        _args: &[Value],
        _kwargs: &Map<String, Value>,
    ) -> Result<Value, HostError> {
        Ok(json!(path))
    }
}

/// Speaks just enough of the control-plane protocol.
struct ControlPlane {
    url: String,
    events: Arc<Mutex<Option<TcpStream>>>,
    posts: Arc<Mutex<Vec<Value>>>,
}

fn read_request(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut head = String::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        if line.trim_end().is_empty() {
            break;
        }
        if let Some(len) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = len.trim().parse().unwrap();
        }
        head.push_str(&line);
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).unwrap();
    (head, body)
}

fn answer(request: &Value) -> Option<Value> {
    let id = request["id"].clone();
    let result = match request["method"].as_str()? {
        "tools/list" => json!({"tools": [{"name": "remote", "description": "dispatcher"}]}),
        "tools/call" if request["params"]["arguments"]["input"]["operation"] == "register" => {
            let tool = &request["params"]["arguments"]["input"]["tool_name"];
            json!({"content": [{"type": "text", "text": format!("Successfully registered tool {tool}")}]})
        }
        "tools/call" => {
            let name = request["params"]["name"].as_str().unwrap_or_default();
            json!({"content": [{"type": "text", "text": format!("called {name}")}]})
        }
        _ => return None,
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

impl ControlPlane {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/sse", listener.local_addr().unwrap());
        let events: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));
        let posts = Arc::new(Mutex::new(Vec::new()));
        let plane = ControlPlane {
            url,
            events: events.clone(),
            posts: posts.clone(),
        };
        std::thread::spawn(move || {
            for connection in listener.incoming() {
                let Ok(mut connection) = connection else {
                    break;
                };
                let (head, body) = read_request(&mut connection);
                if head.starts_with("GET") {
                    connection
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n\
                              event: endpoint\r\ndata: /messages/?session_id=abc\r\n\r\n",
                        )
                        .unwrap();
                    *events.lock().unwrap() = Some(connection);
                    continue;
                }
                let request: Value = serde_json::from_slice(&body).unwrap();
                connection
                    .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\n\r\n")
                    .unwrap();
                drop(connection);
                posts.lock().unwrap().push(request.clone());
                if let Some(response) = answer(&request) {
                    push_to(&events, &response);
                }
            }
        });
        plane
    }

    fn push(&self, message: &Value) {
        push_to(&self.events, message);
    }

    /// Closes the event stream from the server side.
    fn hang_up(&self) {
        if let Some(stream) = self.events.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn posts(&self) -> Vec<Value> {
        self.posts.lock().unwrap().clone()
    }

    fn posts_for(&self, method: &str) -> Vec<Value> {
        self.posts()
            .into_iter()
            .filter(|p| p["method"] == method)
            .collect()
    }
}

fn push_to(events: &Mutex<Option<TcpStream>>, message: &Value) {
    if let Some(stream) = events.lock().unwrap().as_mut() {
        let _ = write!(stream, "data: {message}\r\n\r\n");
    }
}

/// Writes a helper that prints one framed handshake pointing at `url`, plus the manifest naming it.
fn install_helper(dir: &Path, url: &str) -> PathBuf {
    let payload = json!({"mcpServers": {"local": {
        "url": url,
        "headers": {"Authorization": "Bearer secret", "Content-Type": "application/json"}
    }}})
    .to_string();
    let header: String = (payload.len() as u32)
        .to_le_bytes()
        .iter()
        .map(|b| format!("\\{b:03o}"))
        .collect();
    let helper = dir.join("helper.sh");
    std::fs::write(
        &helper,
        format!("#!/bin/sh\nprintf '{header}'\nprintf '%s' '{payload}'\n"),
    )
    .unwrap();
    std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();

    let manifest = dir.join("manifest.json");
    std::fs::write(
        &manifest,
        json!({"name": "local", "description": "test", "path": helper, "type": "stdio"}).to_string(),
    )
    .unwrap();
    manifest
}

fn connected_client(plane: &ControlPlane, dir: &Path) -> (Client, MainThreadPump<EchoHost>) {
    let manifest = install_helper(dir, &plane.url);
    let config = ClientConfig::new("echo").with_manifest_path(manifest);
    let (client, pump) = Client::start(config, EchoHost).unwrap();
    assert!(
        client
            .status()
            .wait_for(|s| s.state == State::Connected, Duration::from_secs(10))
            .is_some(),
        "client never connected: {:?}",
        client.status().snapshot()
    );
    (client, pump)
}

#[test]
fn connects_registers_and_answers_reverse_calls() {
    let _serial = serial();
    let plane = ControlPlane::start();
    let dir = tempfile::tempdir().unwrap();
    let (client, mut pump) = connected_client(&plane, dir.path());
    assert!(client.is_connected());

    let posts = plane.posts();
    assert_eq!(posts[0]["method"], "tools/list");
    assert_eq!(posts[1]["method"], "tools/call");
    let input = &posts[1]["params"]["arguments"]["input"];
    assert_eq!(posts[1]["params"]["name"], "remote");
    assert_eq!(input["tool_name"], "echo");
    assert_eq!(input["callback_endpoint"], "mcp-link://echo-callback");

    // outgoing calls bypass the main thread
    let response = client.handle().call_tool("sqlite", json!({"q": 1})).unwrap();
    assert_eq!(
        response.into_result().unwrap()["content"][0]["text"],
        "called sqlite"
    );

    plane.push(&json!({"reverse": {"tool": "someone_else", "call_id": "call-0", "input": {}}}));
    plane.push(&json!({"reverse": {"tool": "echo", "call_id": "call-1", "input": {
        "params": {"arguments": {"operation": "execute", "code": "print(1)"}}
    }}}));

    let deadline = Instant::now() + Duration::from_secs(10);
    while plane.posts_for("tools/reply").is_empty() {
        assert!(Instant::now() < deadline, "no reply was sent");
        pump.tick();
        std::thread::sleep(Duration::from_millis(10));
    }
    let replies = plane.posts_for("tools/reply");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["id"], "call-1");
    let result = &replies[0]["params"]["result"];
    assert_eq!(result["isError"], false);
    let report: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(report["stdout"], "print(1)");
    assert_eq!(report["session_id"], "default");
    assert!(pump.router().contexts().get("default").is_some());

    // executed code reaches other tools while running on the main thread
    plane.push(&json!({"reverse": {"tool": "echo", "call_id": "call-2", "input": {
        "code": "call:sqlite"
    }}}));
    let deadline = Instant::now() + Duration::from_secs(10);
    while plane.posts_for("tools/reply").len() < 2 {
        assert!(Instant::now() < deadline, "no reply to the nested call");
        pump.tick();
        std::thread::sleep(Duration::from_millis(10));
    }
    let result = &plane.posts_for("tools/reply")[1]["params"]["result"];
    let report: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(report["stdout"], "called sqlite");

    client.stop();
    assert!(!client.is_connected());
    client.stop();
    assert!(!client.is_connected());
    assert_eq!(client.state(), State::Stopped);
}

#[test]
fn dropped_stream_backs_off_then_reconnects() {
    let _serial = serial();
    let plane = ControlPlane::start();
    let dir = tempfile::tempdir().unwrap();
    let (client, _pump) = connected_client(&plane, dir.path());

    plane.hang_up();
    let snapshot = client
        .status()
        .wait_for(|s| s.state == State::Backoff, Duration::from_secs(5))
        .unwrap();
    assert_eq!(snapshot.retry_count, 1);
    assert_eq!(snapshot.next_delay, Some(Duration::from_secs(2)));
    assert!(!client.is_connected());
    assert!(matches!(
        client.handle().call_tool("sqlite", json!({})),
        Err(mcp_link::Error::NotConnected)
    ));

    assert!(
        client
            .status()
            .wait_for(|s| s.state == State::Connected, Duration::from_secs(10))
            .is_some()
    );
    assert_eq!(plane.posts_for("tools/list").len(), 2);

    client.stop();
    assert_eq!(client.state(), State::Stopped);
}
