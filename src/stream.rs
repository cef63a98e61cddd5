//! The event-stream connection to the control plane.
//!
//! [`open`] issues the long-lived GET, waits for the `endpoint` event that
//! names the session's message endpoint, and starts the reader thread. From
//! then on the reader is the only consumer of the stream:
//!
//! - `data:` lines carrying a `reverse` object are server-initiated calls and
//!   go, in order, to [`LiveSession::next_reverse_call`];
//! - `data:` lines carrying an `id` are responses and go to the correlator;
//! - everything else is ignored.
//!
//! When the reader exits (end of stream, read error, or teardown) it drops
//! its end of the reverse-call channel. That disconnect is the one signal the
//! rest of the client uses to decide the connection is gone.

use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::handshake::ServerEndpoint;
use crate::http::{self, Body, Closer, Url};
use crate::jrpc::{Request, Response};
use crate::tools::ToolResult;
use serde_json::{Value, json};
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

/// One line of an event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseLine<'a> {
    Event(&'a str),
    Data(&'a str),
    Comment,
    Blank,
    Other,
}

/// Classifies a single stream line; the line terminator is optional.
///
/// ```
/// use mcp_link::stream::{parse_line, SseLine};
///
/// assert_eq!(parse_line("event: endpoint\r\n"), SseLine::Event("endpoint"));
/// assert_eq!(parse_line("data: {\"id\":1}\n"), SseLine::Data("{\"id\":1}"));
/// assert_eq!(parse_line(": ping"), SseLine::Comment);
/// assert_eq!(parse_line("\r\n"), SseLine::Blank);
/// ```
pub fn parse_line(line: &str) -> SseLine<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        SseLine::Blank
    } else if line.starts_with(':') {
        SseLine::Comment
    } else if let Some(kind) = line.strip_prefix("event:") {
        SseLine::Event(kind.trim())
    } else if let Some(data) = line.strip_prefix("data:") {
        SseLine::Data(data.strip_prefix(' ').unwrap_or(data))
    } else {
        SseLine::Other
    }
}

/// The substring after `session_id=`, up to the next `&`.
///
/// ```
/// use mcp_link::stream::extract_session_id;
///
/// assert_eq!(extract_session_id("/messages/?session_id=abc"), Some("abc"));
/// assert_eq!(extract_session_id("/m?session_id=abc&x=1"), Some("abc"));
/// assert_eq!(extract_session_id("/messages/"), None);
/// ```
pub fn extract_session_id(endpoint: &str) -> Option<&str> {
    let (_, rest) = endpoint.split_once("session_id=")?;
    let id = rest.split('&').next().unwrap_or(rest);
    if id.is_empty() { None } else { Some(id) }
}

/// A call the server makes into this client.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct ReverseCall {
    #[serde(default)]
    pub tool: String,
    /// Echoed back as the id of the `tools/reply`.
    #[serde(default)]
    pub call_id: Value,
    #[serde(default)]
    pub input: Value,
}

#[derive(serde::Deserialize)]
struct ReverseEnvelope {
    reverse: ReverseCall,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reverse(ReverseCall),
    Response { id: String, message: Value },
    Ignored,
}

/// Sorts the payload of a `data:` line.
pub fn classify(data: &str) -> Inbound {
    let Ok(message) = serde_json::from_str::<Value>(data) else {
        return Inbound::Ignored;
    };
    if message.get("reverse").is_some() {
        return match serde_json::from_value::<ReverseEnvelope>(message) {
            Ok(envelope) => Inbound::Reverse(envelope.reverse),
            Err(_) => Inbound::Ignored,
        };
    }
    let id = match message.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Inbound::Ignored,
    };
    Inbound::Response { id, message }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub connect_timeout: Duration,
    pub handshake_lines: usize,
    pub post_timeout: Duration,
    pub join_timeout: Duration,
}

impl From<&ClientConfig> for StreamOptions {
    fn from(config: &ClientConfig) -> Self {
        StreamOptions {
            connect_timeout: config.connect_timeout,
            handshake_lines: config.handshake_lines,
            post_timeout: config.request_timeout,
            join_timeout: config.join_timeout,
        }
    }
}

/// State shared between the reader thread and request senders.
#[derive(Debug)]
pub struct Session {
    session_id: String,
    message_endpoint: Url,
    endpoint: ServerEndpoint,
    correlator: Correlator,
    closer: Closer,
    closing: AtomicBool,
    post_timeout: Duration,
}

impl Session {
    /// The id the server handed out in its endpoint event.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Where requests and replies are POSTed.
    pub fn message_endpoint(&self) -> &Url {
        &self.message_endpoint
    }

    /// Sends a correlated request and waits up to `timeout` for its response.
    pub fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Response<Value>> {
        self.correlator
            .send(method, params, timeout, |request| self.post(request))
    }

    /// Answers a reverse call.
    pub fn reply(&self, call_id: &Value, result: &ToolResult) -> Result<()> {
        let request = Request::new("tools/reply", Some(json!({ "result": result })), call_id.clone());
        self.post(&request)
    }

    fn post(&self, request: &Request) -> Result<()> {
        let body = serde_json::to_vec(request)?;
        let status = http::post_json(
            &self.message_endpoint,
            &self.endpoint.credential,
            &body,
            self.post_timeout,
        )?;
        if status != 202 {
            return Err(Error::SubmissionRejected(status));
        }
        Ok(())
    }

    /// True once [`close`](Session::close) has run; a dropped stream is then expected.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Shuts the stream down and fails every pending request.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.closer.close();
        self.correlator.fail_all();
    }
}

/// A session plus the threads and channels that keep it alive.
#[derive(Debug)]
pub struct LiveSession {
    session: Arc<Session>,
    reader: Option<JoinHandle<()>>,
    reverse_calls: Receiver<ReverseCall>,
    join_timeout: Duration,
}

impl LiveSession {
    /// The shared half, handed to callers making outgoing requests.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Waits up to `timeout` for the next reverse call.
    ///
    /// `Ok(None)` means nothing arrived; [`Error::ConnectionLost`] means the
    /// reader has exited.
    pub fn next_reverse_call(&self, timeout: Duration) -> Result<Option<ReverseCall>> {
        match self.reverse_calls.recv_timeout(timeout) {
            Ok(call) => Ok(Some(call)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionLost),
        }
    }

    /// Closes the stream and joins the reader. Safe to call more than once.
    pub fn teardown(&mut self) {
        self.session.close();
        if let Some(reader) = self.reader.take() {
            crate::sys::join_with_timeout(reader, self.join_timeout);
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn read_endpoint_event(body: &mut Body, max_lines: usize) -> Result<String> {
    let mut event_type: Option<String> = None;
    let mut raw = Vec::new();
    for _ in 0..max_lines {
        raw.clear();
        if body.read_until(b'\n', &mut raw).map_err(http::Error::from)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw);
        match parse_line(&line) {
            SseLine::Event(kind) => event_type = Some(kind.to_owned()),
            SseLine::Data(data)
                if event_type.as_deref() == Some("endpoint") || data.contains("session_id=") =>
            {
                return Ok(data.trim().to_owned());
            }
            SseLine::Blank => event_type = None,
            _ => {}
        }
    }
    Err(Error::StreamHandshakeFailed(format!(
        "no endpoint event within {max_lines} lines"
    )))
}

/// Opens the event stream and completes the stream handshake.
pub fn open(endpoint: &ServerEndpoint, options: &StreamOptions) -> Result<LiveSession> {
    let url = Url::parse(&endpoint.url)?;
    let mut stream = http::connect(&url, options.connect_timeout)?;
    http::write_request(
        &mut stream,
        "GET",
        &url,
        &[
            ("Accept", "text/event-stream"),
            ("Cache-Control", "no-cache"),
            ("Authorization", &endpoint.credential),
        ],
        None,
    )?;
    let closer = stream.closer()?;
    let mut reader = BufReader::new(stream);
    let head = http::read_head(&mut reader)?;
    if !head.is_success() {
        return Err(Error::StreamHandshakeFailed(format!(
            "status {} {}",
            head.status, head.reason
        )));
    }
    let mut body = http::body_reader(&head, reader);
    let message_path = read_endpoint_event(&mut body, options.handshake_lines)?;
    let session_id = extract_session_id(&message_path)
        .ok_or_else(|| {
            Error::StreamHandshakeFailed(format!("endpoint {message_path:?} has no session_id"))
        })?
        .to_owned();
    let message_endpoint = url.resolve(&message_path)?;
    // the stream may be quiet for long stretches once established
    closer.set_read_timeout(None)?;

    logwise::info_sync!(
        "Stream open, session {session} posting to {endpoint}",
        session = logwise::privacy::LogIt(&session_id),
        endpoint = logwise::privacy::LogIt(&message_endpoint.path)
    );

    let session = Arc::new(Session {
        session_id,
        message_endpoint,
        endpoint: endpoint.clone(),
        correlator: Correlator::new(),
        closer,
        closing: AtomicBool::new(false),
        post_timeout: options.post_timeout,
    });
    let (sender, reverse_calls) = std::sync::mpsc::channel();
    let reader = {
        let session = session.clone();
        std::thread::Builder::new()
            .name("mcp_link::reader".to_owned())
            .spawn(move || read_events(body, &session, sender))
            .map_err(http::Error::from)?
    };
    Ok(LiveSession {
        session,
        reader: Some(reader),
        reverse_calls,
        join_timeout: options.join_timeout,
    })
}

fn read_events(mut body: Body, session: &Session, reverse: Sender<ReverseCall>) {
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match body.read_until(b'\n', &mut raw) {
            Ok(0) => {
                if !session.is_closing() {
                    logwise::warn_sync!("Event stream closed by the server");
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if !session.is_closing() {
                    logwise::warn_sync!(
                        "Event stream read failed: {e}",
                        e = logwise::privacy::LogIt(&e)
                    );
                }
                break;
            }
        }
        let line = String::from_utf8_lossy(&raw);
        if let SseLine::Data(data) = parse_line(&line) {
            match classify(data) {
                Inbound::Reverse(call) => {
                    if reverse.send(call).is_err() {
                        break;
                    }
                }
                Inbound::Response { id, message } => {
                    if !session.correlator.deliver(&id, message) {
                        logwise::info_sync!(
                            "Dropping response {id} with no waiting request",
                            id = logwise::privacy::LogIt(&id)
                        );
                    }
                }
                Inbound::Ignored => {}
            }
        }
        if session.is_closing() {
            break;
        }
    }
    session.correlator.fail_all();
}
