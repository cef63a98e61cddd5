//! The client facade.
//!
//! [`Client::start`] wires the pieces together and starts the supervisor
//! thread. It hands back two values with different homes:
//!
//! - the [`Client`] (and any number of [`ClientHandle`]s) may live anywhere;
//! - the [`MainThreadPump`] owns the host capability and must stay on the
//!   host's main thread, where [`MainThreadPump::tick`] is called from the
//!   host's own loop every [`crate::config::TICK_INTERVAL`] or so.

use crate::bridge::{DrainOutcome, WorkBridge};
use crate::config::ClientConfig;
use crate::discovery;
use crate::error::{Error, Result};
use crate::handshake;
use crate::jrpc::Response;
use crate::router::{HostCapability, Router, ToolCaller};
use crate::stream::{self, LiveSession, ReverseCall, Session, StreamOptions};
use crate::supervisor::{Lifecycle, State, StopSignal, Supervisor, SupervisorStatus};
use crate::tools::{self, ToolCallParams, ToolList, ToolResult};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long the listener waits for a reverse call before rechecking the stop signal.
const LISTEN_POLL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Inner {
    config: ClientConfig,
    stop: Arc<StopSignal>,
    status: Arc<SupervisorStatus>,
    session: Mutex<Option<Arc<Session>>>,
    bridge: Arc<WorkBridge>,
}

impl Inner {
    fn current_session(&self) -> Option<Arc<Session>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_session(&self) -> Option<Arc<Session>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Publishes `session` unless a stop was requested.
    ///
    /// The check runs under the session lock, and `stop` sets its signal
    /// before taking that lock, so a session is either refused here or closed
    /// by `stop`.
    fn publish_session(&self, session: Arc<Session>) -> bool {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if self.stop.is_set() {
            return false;
        }
        *slot = Some(session);
        true
    }
}

/// A running connection to the control plane.
#[derive(Debug)]
pub struct Client {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Starts connecting in the background.
    pub fn start<H: HostCapability>(config: ClientConfig, host: H) -> Result<(Client, MainThreadPump<H>)> {
        let inner = Arc::new(Inner {
            stop: Arc::new(StopSignal::new()),
            status: Arc::new(SupervisorStatus::default()),
            session: Mutex::new(None),
            bridge: Arc::new(WorkBridge::new(config.batch_size)),
            config,
        });
        let handle = ClientHandle {
            inner: inner.clone(),
        };
        let router = Router::new(host)
            .with_caller(Arc::new(handle.clone()))
            .with_tool_call_timeout(inner.config.tool_call_timeout);
        let pump = MainThreadPump {
            router,
            bridge: inner.bridge.clone(),
            handle,
        };

        let supervisor = Supervisor::new(
            LinkLifecycle {
                inner: inner.clone(),
                live: None,
            },
            inner.stop.clone(),
            inner.status.clone(),
            inner.config.max_retry_delay,
        );
        let thread = std::thread::Builder::new()
            .name("mcp_link::supervisor".to_owned())
            .spawn(move || supervisor.run())
            .map_err(Error::ThreadSpawn)?;
        logwise::info_sync!(
            "Started client for tool {tool}",
            tool = logwise::privacy::LogIt(&inner.config.tool_name)
        );
        Ok((
            Client {
                inner,
                supervisor: Mutex::new(Some(thread)),
            },
            pump,
        ))
    }

    /// A handle for outgoing calls from any thread.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// True while registered with a live stream.
    pub fn is_connected(&self) -> bool {
        self.inner.status.is_connected()
    }

    pub fn state(&self) -> State {
        self.inner.status.state()
    }

    /// The supervisor's published state, retry count and next delay.
    pub fn status(&self) -> &SupervisorStatus {
        &self.inner.status
    }

    /// Stops the supervisor and closes the connection. Safe to call more than once.
    pub fn stop(&self) {
        self.inner.stop.set();
        if let Some(session) = self.inner.take_session() {
            session.close();
        }
        let discarded = self.inner.bridge.close();
        if discarded > 0 {
            logwise::warn_sync!(
                "Discarded {count} queued work items on stop",
                count = logwise::privacy::LogIt(&discarded)
            );
        }
        let thread = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            crate::sys::join_with_timeout(thread, self.inner.config.join_timeout);
        }
        self.inner.status.mark_stopped();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A cheap, thread-safe view of a [`Client`] for outgoing calls.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    inner: Arc<Inner>,
}

impl ClientHandle {
    pub fn is_connected(&self) -> bool {
        self.inner.status.is_connected()
    }

    /// Calls another tool through the control plane.
    pub fn call_tool(&self, name: &str, arguments: Value) -> Result<Response<Value>> {
        self.call_tool_with_timeout(name, arguments, self.inner.config.tool_call_timeout)
    }

    /// Like [`call_tool`](Self::call_tool), with an explicit deadline.
    ///
    /// Fails with [`Error::NotConnected`] when no stream is open.
    pub fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Response<Value>> {
        let session = self.inner.current_session().ok_or(Error::NotConnected)?;
        let params = serde_json::to_value(ToolCallParams {
            name: name.to_owned(),
            arguments,
        })?;
        session.request("tools/call", Some(params), timeout)
    }

    /// Runs `payload` through the router on the main thread and waits for it.
    ///
    /// Never call this from the main thread itself; it would wait for a tick
    /// that cannot happen.
    pub fn run_on_main_thread(&self, payload: Value) -> Result<ToolResult> {
        self.inner
            .bridge
            .submit(payload, self.inner.config.work_item_timeout)
    }
}

impl ToolCaller for ClientHandle {
    fn call_tool(&self, name: &str, arguments: Value, timeout: Duration) -> Result<Response<Value>> {
        self.call_tool_with_timeout(name, arguments, timeout)
    }
}

/// The main-thread half of a client.
pub struct MainThreadPump<H> {
    router: Router<H>,
    bridge: Arc<WorkBridge>,
    handle: ClientHandle,
}

impl<H: HostCapability> MainThreadPump<H> {
    /// Runs up to one batch of queued work. Call periodically from the main thread.
    pub fn tick(&mut self) -> DrainOutcome {
        let router = &mut self.router;
        self.bridge.drain(|payload| Ok(router.handle(payload)))
    }

    /// Forgets every named execution context.
    pub fn clear_contexts(&mut self) {
        self.router.contexts_mut().clear();
    }

    /// The router, for inspecting contexts or the host.
    pub fn router(&self) -> &Router<H> {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut Router<H> {
        &mut self.router
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }
}

struct LinkLifecycle {
    inner: Arc<Inner>,
    live: Option<LiveSession>,
}

impl LinkLifecycle {
    fn register(&self, session: &Session) -> Result<()> {
        let config = &self.inner.config;
        let listed = session
            .request("tools/list", None, config.request_timeout)?
            .into_result()
            .map_err(|e| Error::ToolRegistrationFailed(e.to_string()))?;
        let tools: ToolList = serde_json::from_value(listed)?;
        if !tools.contains(&config.dispatcher_tool) {
            return Err(Error::ToolRegistrationFailed(format!(
                "dispatcher tool '{}' is not offered by the server",
                config.dispatcher_tool
            )));
        }

        let reply = session
            .request(
                "tools/call",
                Some(tools::registration_params(config)),
                config.request_timeout,
            )?
            .into_result()
            .map_err(|e| Error::ToolRegistrationFailed(e.to_string()))?;
        if !tools::registration_accepted(&reply) {
            return Err(Error::ToolRegistrationFailed(format!(
                "unexpected reply {reply}"
            )));
        }
        logwise::info_sync!(
            "Registered tool {tool}",
            tool = logwise::privacy::LogIt(&config.tool_name)
        );
        Ok(())
    }

    fn answer(&self, session: &Session, call: ReverseCall) {
        let config = &self.inner.config;
        if self.inner.stop.is_set() {
            return;
        }
        if call.tool != config.tool_name {
            logwise::warn_sync!(
                "Ignoring reverse call for unknown tool {tool}",
                tool = logwise::privacy::LogIt(&call.tool)
            );
            return;
        }
        let result = self
            .inner
            .bridge
            .submit(call.input, config.work_item_timeout)
            .unwrap_or_else(ToolResult::error);
        if let Err(e) = session.reply(&call.call_id, &result) {
            logwise::warn_sync!(
                "Failed to reply to reverse call: {error}",
                error = logwise::privacy::LogIt(&e.to_string())
            );
        }
    }
}

impl Lifecycle for LinkLifecycle {
    fn connect(&mut self) -> Result<()> {
        let config = &self.inner.config;
        let (_, manifest) =
            discovery::discover(config.manifest_path.as_deref())?.ok_or(Error::DiscoveryUnavailable)?;
        let endpoint = handshake::run_helper(Path::new(&manifest.path), config.handshake_timeout)?;
        if endpoint.degraded {
            logwise::warn_sync!("Helper output was truncated; using recovered endpoint");
        }
        let live = stream::open(&endpoint, &StreamOptions::from(config))?;
        let session = live.session().clone();
        self.live = Some(live);
        if !self.inner.publish_session(session.clone()) {
            return Err(Error::Stopping);
        }
        logwise::info_sync!(
            "Stream open with session {session}",
            session = logwise::privacy::LogIt(&session.session_id())
        );
        self.register(&session)
    }

    fn listen(&mut self, stop: &StopSignal) {
        let Some(live) = &self.live else {
            return;
        };
        while !stop.is_set() {
            match live.next_reverse_call(LISTEN_POLL) {
                Ok(Some(call)) => self.answer(live.session(), call),
                Ok(None) => {}
                Err(_) => {
                    if !live.session().is_closing() {
                        logwise::warn_sync!("Event stream ended");
                    }
                    return;
                }
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut live) = self.live.take() {
            let current = self.inner.current_session();
            if current.is_some_and(|s| Arc::ptr_eq(&s, live.session())) {
                self.inner.take_session();
            }
            live.teardown();
        }
    }
}
