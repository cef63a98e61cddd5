//! Native helper handshake.
//!
//! The control plane ships a small helper binary (located through
//! [`crate::discovery`]) that prints one length-prefixed message describing
//! where the server lives and which credential to present.
//!
//! # Protocol
//!
//! The helper writes a single frame to its stdout:
//! - 4 bytes: payload length (little-endian u32)
//! - N bytes: UTF-8 JSON payload
//!
//! The payload looks like this:
//!
//! ```json
//! {"mcpServers": {"aura": {"url": "https://127.0.0.1:31173/sse",
//!                          "headers": {"Authorization": "Bearer abc"}}}}
//! ```
//!
//! # Decoding
//!
//! Helpers in the wild sometimes exit before flushing the whole payload. Decoding
//! therefore happens in tiers:
//! 1. strict UTF-8 followed by JSON,
//! 2. lossy UTF-8 followed by JSON,
//! 3. pattern extraction of the url and credential from the raw text.
//!
//! An endpoint produced by the last tier is flagged with
//! [`ServerEndpoint::degraded`].
//!
//! # Process lifetime
//!
//! The helper never outlives [`run_helper`]. It is killed and reaped by a guard
//! on every exit path, including timeouts.

use regex::Regex;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::LazyLock;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

/// Largest payload a helper frame may announce.
pub const MAX_FRAME_LEN: u32 = 10_000_000;

/// Server name used when a degraded payload does not reveal one.
pub const FALLBACK_SERVER_NAME: &str = "extracted_server";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("helper binary {0} does not exist")]
    MissingHelper(PathBuf),
    #[error("invalid frame length {0}")]
    InvalidLength(u32),
    #[error("helper produced no frame within {0:?}")]
    Timeout(Duration),
    #[error("handshake payload could not be decoded")]
    Undecodable,
    #[error("handshake payload is missing {0}")]
    MissingField(&'static str),
}

/// Where to find the control plane and how to authenticate with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub url: String,
    /// Full `Authorization` header value, e.g. `Bearer abc`.
    pub credential: String,
    pub server_name: String,
    /// True when the endpoint was recovered from a truncated payload.
    pub degraded: bool,
}

/// Prefixes `payload` with its little-endian length.
///
/// ```
/// use mcp_link::handshake::encode_frame;
///
/// let frame = encode_frame(b"{}");
/// assert_eq!(frame, [2, 0, 0, 0, b'{', b'}']);
/// ```
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Validates a frame header, returning the payload length.
///
/// Zero and anything above [`MAX_FRAME_LEN`] are rejected.
pub fn frame_length(header: [u8; 4]) -> Result<usize, Error> {
    let len = u32::from_le_bytes(header);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(Error::InvalidLength(len));
    }
    Ok(len as usize)
}

/// Reads one frame.
///
/// The header must arrive in full. The payload is read until the announced
/// length or end of stream, whichever comes first; a short payload is handed
/// to the decoder as-is.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, Error> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = frame_length(header)?;
    let mut payload = Vec::with_capacity(len);
    reader.take(len as u64).read_to_end(&mut payload)?;
    Ok(payload)
}

#[derive(serde::Deserialize)]
struct HelperPayload {
    #[serde(rename = "mcpServers")]
    servers: BTreeMap<String, ServerEntry>,
}

#[derive(serde::Deserialize)]
struct ServerEntry {
    url: Option<String>,
    #[serde(default)]
    headers: serde_json::Map<String, serde_json::Value>,
}

fn endpoint_from_json(text: &str) -> Option<Result<ServerEndpoint, Error>> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let payload: HelperPayload = match serde_json::from_value(value) {
        Ok(payload) => payload,
        Err(_) => return Some(Err(Error::MissingField("mcpServers"))),
    };
    let Some((name, entry)) = payload.servers.into_iter().next() else {
        return Some(Err(Error::MissingField("mcpServers entry")));
    };
    let Some(url) = entry.url else {
        return Some(Err(Error::MissingField("url")));
    };
    let Some(credential) = entry
        .headers
        .get("Authorization")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
    else {
        return Some(Err(Error::MissingField("headers.Authorization")));
    };
    Some(Ok(ServerEndpoint {
        url,
        credential,
        server_name: name,
        degraded: false,
    }))
}

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""url"\s*:\s*"(https?://[^"]+)""#).expect("static pattern"));
static CREDENTIAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""Authorization"\s*:\s*"(Bearer\s+[^"]+)""#).expect("static pattern")
});
static SERVER_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""mcpServers"\s*:\s*\{\s*"([^"]+)""#).expect("static pattern")
});

/// Pulls the url and credential out of a payload that is not valid JSON.
///
/// Both must be present; otherwise there is nothing to connect with.
///
/// ```
/// use mcp_link::handshake::recover_truncated;
///
/// let text = r#"{"mcpServers": {"aura": {"url": "https://127.0.0.1:31173/sse", "headers": {"Authorization": "Bearer k1"}, "no"#;
/// let endpoint = recover_truncated(text).unwrap();
/// assert_eq!(endpoint.url, "https://127.0.0.1:31173/sse");
/// assert_eq!(endpoint.credential, "Bearer k1");
/// assert!(endpoint.degraded);
/// ```
pub fn recover_truncated(text: &str) -> Option<ServerEndpoint> {
    let url = URL_PATTERN.captures(text)?.get(1)?.as_str().to_owned();
    let credential = CREDENTIAL_PATTERN.captures(text)?.get(1)?.as_str().to_owned();
    let server_name = SERVER_NAME_PATTERN
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
        .unwrap_or_else(|| FALLBACK_SERVER_NAME.to_owned());
    Some(ServerEndpoint {
        url,
        credential,
        server_name,
        degraded: true,
    })
}

/// Decodes a helper payload into an endpoint, falling back tier by tier.
pub fn decode_endpoint(payload: &[u8]) -> Result<ServerEndpoint, Error> {
    if let Ok(text) = std::str::from_utf8(payload) {
        if let Some(result) = endpoint_from_json(text) {
            return result;
        }
    }
    let lossy = String::from_utf8_lossy(payload);
    if let Some(result) = endpoint_from_json(&lossy) {
        return result;
    }
    recover_truncated(&lossy).ok_or(Error::Undecodable)
}

/// Kills and reaps the helper when dropped.
struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        // an already-exited child reports an error here
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[cfg(windows)]
fn hide_console(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console(_command: &mut Command) {}

/// Spawns the helper and decodes its single frame.
///
/// Fails with [`Error::Timeout`] when no complete frame arrives within
/// `timeout`.
pub fn run_helper(binary: &Path, timeout: Duration) -> Result<ServerEndpoint, Error> {
    if !binary.exists() {
        return Err(Error::MissingHelper(binary.to_owned()));
    }
    let mut command = Command::new(binary);
    // the helper may treat a closed stdin as a request to exit, so keep it open
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    hide_console(&mut command);

    let mut child = ChildGuard(command.spawn()?);
    let mut stdout = child.0.stdout.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "helper stdout unavailable")
    })?;

    let (sender, receiver) = std::sync::mpsc::channel();
    std::thread::Builder::new()
        .name("mcp_link::handshake".to_owned())
        .spawn(move || {
            // the receiver may be gone after a timeout
            let _ = sender.send(read_frame(&mut stdout));
        })?;

    let payload = match receiver.recv_timeout(timeout) {
        Ok(result) => result?,
        Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => {
            return Err(Error::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "handshake reader exited without a frame",
            )));
        }
    };
    drop(child);

    let endpoint = decode_endpoint(&payload)?;
    if endpoint.degraded {
        logwise::warn_sync!(
            "Recovered endpoint {url} from a truncated handshake payload",
            url = logwise::privacy::LogIt(&endpoint.url)
        );
    } else {
        logwise::info_sync!(
            "Handshake complete for server {name} at {url}",
            name = logwise::privacy::LogIt(&endpoint.server_name),
            url = logwise::privacy::LogIt(&endpoint.url)
        );
    }
    Ok(endpoint)
}
