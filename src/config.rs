//! Client configuration.
//!
//! [`ClientConfig`] carries every tunable the client reads. The defaults are
//! exposed as constants so hosts and tests can refer to them directly.

use std::path::PathBuf;
use std::time::Duration;

/// Name of the tool this client registers when none is given.
pub const DEFAULT_TOOL_NAME: &str = "blender";
/// The control plane's dispatcher tool; registration and reverse calls go through it.
pub const DISPATCHER_TOOL: &str = "remote";
/// Scheme of the callback endpoint advertised at registration.
pub const CALLBACK_SCHEME: &str = "mcp-link";
/// Upper bound on the reconnection backoff.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Wall-clock limit for the native helper to produce its frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default wait for a correlated response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default wait for an outgoing `tools/call`.
pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a reverse call may wait for the main thread.
pub const WORK_ITEM_TIMEOUT: Duration = Duration::from_secs(120);
/// TCP connect and stream-handshake read timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Bounded wait when joining background threads during teardown.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(3);
/// Number of stream lines scanned for the `endpoint` event.
pub const HANDSHAKE_LINES: usize = 10;
/// Work items drained per main-thread tick.
pub const DRAIN_BATCH_SIZE: usize = 5;
/// Suggested interval between main-thread ticks.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for a [`crate::Client`].
///
/// ```
/// use mcp_link::config::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::new("modeler")
///     .with_description("Drives the modeling host")
///     .with_max_retry_delay(Duration::from_secs(10));
/// assert_eq!(config.tool_name, "modeler");
/// assert_eq!(config.batch_size, 5);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub tool_name: String,
    pub description: String,
    pub readme: String,
    pub dispatcher_tool: String,
    pub max_retry_delay: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub tool_call_timeout: Duration,
    pub work_item_timeout: Duration,
    pub connect_timeout: Duration,
    pub join_timeout: Duration,
    pub handshake_lines: usize,
    pub batch_size: usize,
    /// Checked before the platform manifest locations.
    pub manifest_path: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(tool_name: impl Into<String>) -> Self {
        let tool_name = tool_name.into();
        ClientConfig {
            description: format!("Remote control of the {tool_name} host application"),
            readme: format!(
                "Runs operations inside the {tool_name} host.\n\
                 Operations: execute (run code in a named context), \
                 api_call (invoke a dotted path with args/kwargs), \
                 call_tool (call another tool through the control plane)."
            ),
            tool_name,
            dispatcher_tool: DISPATCHER_TOOL.to_string(),
            max_retry_delay: MAX_RETRY_DELAY,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            tool_call_timeout: TOOL_CALL_TIMEOUT,
            work_item_timeout: WORK_ITEM_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            join_timeout: JOIN_TIMEOUT,
            handshake_lines: HANDSHAKE_LINES,
            batch_size: DRAIN_BATCH_SIZE,
            manifest_path: None,
        }
    }

    /// Text shown to agents listing the registered tool.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Longer usage notes sent with the registration.
    pub fn with_readme(mut self, readme: impl Into<String>) -> Self {
        self.readme = readme.into();
        self
    }

    /// Uses this manifest instead of searching the platform locations.
    pub fn with_manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(path.into());
        self
    }

    /// Caps the reconnect backoff.
    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// Bounds every correlated request, registration included.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// How long a reverse call may wait for the main thread.
    pub fn with_work_item_timeout(mut self, timeout: Duration) -> Self {
        self.work_item_timeout = timeout;
        self
    }

    /// Items run per tick. Zero is raised to one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// The callback endpoint advertised at registration.
    pub fn callback_endpoint(&self) -> String {
        format!("{CALLBACK_SCHEME}://{}-callback", self.tool_name)
    }

    /// The per-tool key advertised at registration.
    pub fn tool_key(&self) -> String {
        format!("{CALLBACK_SCHEME}_{}_auth_key", self.tool_name)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig::new(DEFAULT_TOOL_NAME)
    }
}
