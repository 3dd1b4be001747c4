//! One debugging session driving one debug adapter.
//!
//! A [`DebugSession`] owns the adapter connection, the thread and source model, and the
//! per-thread cancellation bookkeeping. Adapter events are dispatched in arrival order by
//! a background loop; anything that has to wait on the adapter is spawned so the next
//! event is never held up.

mod breakpoints;
mod events;
mod requests;

pub use requests::ResolvedLocation;

use crate::breakpoints::{BreakpointId, BreakpointStore};
use crate::cancellation::CancellationScope;
use crate::config::{DebugConfiguration, ReplMode, RequestKind, SessionSettings};
use crate::debounce::Debouncer;
use crate::events::{AdapterExit, SessionEvent};
use crate::host::DebugHost;
use crate::model::{DebugThread, ResolvedSource, SessionModel};
use crate::protocol::{self, Capabilities, Source, StoppedDetails, ThreadId};
use crate::repl::{OutputQueue, Repl};
use crate::scheduler::ThreadStatusScheduler;
use crate::source::UriIdentity;
use crate::teardown::Teardown;
use crate::transport::{AdapterFactory, AdapterTransport};
use crate::{DebugError, Result};
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};

const CLIENT_ID: &str = env!("CARGO_PKG_NAME");
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Inactive,
    Initializing,
    Stopped,
    Running,
}

#[derive(Clone, Default)]
pub struct SessionOptions {
    pub parent: Option<DebugSession>,
    /// terminate, disconnect and restart are forwarded to the parent.
    pub lifecycle_managed_by_parent: bool,
    pub repl: ReplMode,
}

/// Collaborators shared by every session of one workbench.
#[derive(Clone)]
pub struct SessionContext {
    pub host: Arc<dyn DebugHost>,
    pub breakpoints: Arc<BreakpointStore>,
    pub settings: SessionSettings,
}

impl SessionContext {
    pub fn new(host: Arc<dyn DebugHost>, breakpoints: Arc<BreakpointStore>) -> Self {
        Self {
            host,
            breakpoints,
            settings: SessionSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }
}

struct AdapterHandle {
    transport: Arc<dyn AdapterTransport>,
    capabilities: Capabilities,
    ready_for_breakpoints: bool,
    /// Last `allThreadsContinued` answer, used for simulated continued events.
    all_threads_continued: bool,
    disconnect_sent: bool,
}

enum AdapterConnection {
    NoAdapter,
    Adapter(AdapterHandle),
}

struct SessionInner {
    id: String,
    name: Mutex<String>,
    configuration: Mutex<DebugConfiguration>,
    options: SessionOptions,
    settings: SessionSettings,
    host: Arc<dyn DebugHost>,
    breakpoints: Arc<BreakpointStore>,
    identity: Arc<dyn UriIdentity>,

    connection: Mutex<AdapterConnection>,
    initialized: AtomicBool,
    model: Mutex<SessionModel>,
    scheduler: ThreadStatusScheduler,
    requests: Mutex<HashMap<ThreadId, Vec<CancellationScope>>>,

    listeners: Teardown,
    fetch_threads: Debouncer,
    pass_focus: Debouncer,
    last_continued_thread: Mutex<Option<ThreadId>>,
    wait_to_resume: Mutex<Option<watch::Receiver<bool>>>,
    remembered_capabilities: Mutex<Option<Capabilities>>,

    repl: Arc<Repl>,
    output: OutputQueue,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct DebugSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("id", &self.inner.id)
            .field("name", &*self.inner.name.lock())
            .field("state", &self.state())
            .finish()
    }
}

impl DebugSession {
    pub fn new(
        id: impl Into<String>,
        configuration: DebugConfiguration,
        options: SessionOptions,
        context: SessionContext,
    ) -> Self {
        let repl = match (&options.parent, options.repl) {
            (Some(parent), ReplMode::Shared) => parent.inner.repl.clone(),
            _ => Arc::new(Repl::new()),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let settings = context.settings;
        let inner = SessionInner {
            id: id.into(),
            name: Mutex::new(configuration.name.clone()),
            configuration: Mutex::new(configuration),
            identity: context.host.uri_identity(),
            host: context.host,
            breakpoints: context.breakpoints,
            connection: Mutex::new(AdapterConnection::NoAdapter),
            initialized: AtomicBool::new(false),
            model: Mutex::new(SessionModel::new()),
            scheduler: ThreadStatusScheduler::new(),
            requests: Mutex::new(HashMap::new()),
            listeners: Teardown::new(),
            fetch_threads: Debouncer::new(settings.thread_refresh_debounce),
            pass_focus: Debouncer::new(settings.pass_focus_delay),
            last_continued_thread: Mutex::new(None),
            wait_to_resume: Mutex::new(None),
            remembered_capabilities: Mutex::new(None),
            repl,
            output: OutputQueue::new(),
            events,
            options,
            settings,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    fn from_weak(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> String {
        self.inner.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        *self.inner.name.lock() = name.clone();
        self.fire(SessionEvent::NameChanged(name));
    }

    pub fn configuration(&self) -> DebugConfiguration {
        self.inner.configuration.lock().clone()
    }

    pub fn parent(&self) -> Option<&DebugSession> {
        self.inner.options.parent.as_ref()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub fn breakpoint_store(&self) -> &Arc<BreakpointStore> {
        &self.inner.breakpoints
    }

    /// Change notifications. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Live capabilities, or the ones remembered from the last handshake once the adapter
    /// is gone.
    pub fn capabilities(&self) -> Capabilities {
        if let AdapterConnection::Adapter(handle) = &*self.inner.connection.lock() {
            return handle.capabilities.clone();
        }
        self.inner
            .remembered_capabilities
            .lock()
            .clone()
            .unwrap_or_default()
    }

    pub fn has_adapter(&self) -> bool {
        matches!(
            &*self.inner.connection.lock(),
            AdapterConnection::Adapter(_)
        )
    }

    pub fn is_ready_for_breakpoints(&self) -> bool {
        self.with_adapter(|handle| handle.ready_for_breakpoints)
            .unwrap_or(false)
    }

    pub fn state(&self) -> SessionState {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return SessionState::Initializing;
        }
        if !self.has_adapter() {
            return SessionState::Inactive;
        }
        let focused_thread = self
            .inner
            .host
            .focus()
            .filter(|focus| focus.session_id == self.inner.id)
            .and_then(|focus| focus.thread_id);
        let model = self.inner.model.lock();
        if let Some(thread) = focused_thread.and_then(|id| model.thread(id)) {
            return if thread.stopped {
                SessionState::Stopped
            } else {
                SessionState::Running
            };
        }
        if model.any_thread_stopped() {
            SessionState::Stopped
        } else {
            SessionState::Running
        }
    }

    pub fn threads(&self) -> Vec<DebugThread> {
        self.inner.model.lock().threads()
    }

    pub fn thread(&self, thread_id: ThreadId) -> Option<DebugThread> {
        self.inner.model.lock().thread(thread_id).cloned()
    }

    /// The oldest stop that has not been superseded yet.
    pub fn stopped_details(&self) -> Option<StoppedDetails> {
        self.inner.model.lock().stopped_details().cloned()
    }

    pub fn clear_threads(&self, remove: bool, reference: Option<ThreadId>) {
        self.inner.model.lock().clear_threads(remove, reference);
    }

    /// Resolves an adapter source descriptor to this session's Source for its canonical URI.
    pub fn get_source(&self, raw: &Source) -> ResolvedSource {
        self.inner
            .model
            .lock()
            .resolve_source(raw, &self.inner.id, self.inner.identity.as_ref())
    }

    pub fn source_for_uri(&self, uri: &str) -> Option<Source> {
        self.inner.model.lock().source_for_uri(uri).cloned()
    }

    /// Adapter data returned for breakpoint `id` in this session.
    pub fn debug_protocol_breakpoint(&self, id: BreakpointId) -> Option<protocol::Breakpoint> {
        self.inner.breakpoints.session_data(&self.inner.id, id)
    }

    // ---- Lifecycle ----

    pub async fn initialize(&self, factory: &dyn AdapterFactory) -> Result<()> {
        if self.has_adapter() {
            self.shutdown();
        }
        match self.initialize_adapter(factory).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(session = %self.inner.id, error = %e, "adapter initialization failed");
                self.inner.initialized.store(true, Ordering::SeqCst);
                self.fire_state_changed();
                self.shutdown();
                Err(e)
            }
        }
    }

    async fn initialize_adapter(&self, factory: &dyn AdapterFactory) -> Result<()> {
        let configuration = self.configuration();
        let transport = factory.create(&self.inner.id, &configuration)?;
        if let Err(e) = transport.start().await {
            transport.dispose();
            return Err(e);
        }
        *self.inner.connection.lock() = AdapterConnection::Adapter(AdapterHandle {
            transport: transport.clone(),
            capabilities: Capabilities::default(),
            ready_for_breakpoints: false,
            all_threads_continued: true,
            disconnect_sent: false,
        });
        self.register_listeners(transport.as_ref());

        let handshake = self.inner.settings.handshake_timeout;
        let body = tokio::time::timeout(
            handshake,
            transport.request(
                "initialize",
                initialize_arguments(&configuration.adapter_type),
                None,
            ),
        )
        .await
        .map_err(|_| DebugError::Timeout {
            command: "initialize".to_string(),
            after: handshake,
        })??;
        let capabilities: Capabilities = decode(body)?;

        transport.set_supports_cancel(capabilities.supports_cancel_request);
        self.with_adapter(|handle| handle.capabilities = capabilities.clone());
        self.inner.initialized.store(true, Ordering::SeqCst);
        self.fire_state_changed();

        self.inner
            .breakpoints
            .set_exception_filters_for_session(&self.inner.id, &capabilities.exception_breakpoint_filters);
        self.inner
            .breakpoints
            .register_breakpoint_modes(&configuration.adapter_type, &capabilities.breakpoint_modes);
        *self.inner.remembered_capabilities.lock() = Some(capabilities);
        tracing::info!(session = %self.inner.id, adapter = %configuration.adapter_type, "debug adapter initialized");
        Ok(())
    }

    fn register_listeners(&self, transport: &dyn AdapterTransport) {
        let Some(mut events) = transport.take_events() else {
            tracing::warn!(session = %self.inner.id, "adapter event stream already taken");
            return;
        };
        let weak = self.downgrade();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = DebugSession::from_weak(&weak) else {
                    break;
                };
                session.dispatch(event);
            }
        });
        self.inner.listeners.add_task(task);
    }

    pub async fn launch_or_attach(&self) -> Result<()> {
        let transport = self.adapter("launch or attach")?;
        if let Some(parent) = &self.inner.options.parent {
            if parent.state() == SessionState::Inactive {
                return Err(DebugError::ParentInactive);
            }
        }
        let configuration = self.configuration();
        let arguments = configuration.to_request_arguments(&self.inner.id);
        if let Err(e) = transport
            .request(configuration.request.command(), arguments, None)
            .await
        {
            self.shutdown();
            return Err(e);
        }
        Ok(())
    }

    /// Ends the debuggee. Prefers `terminate` for launched programs when the adapter
    /// supports it, otherwise disconnects with `terminateDebuggee`.
    pub fn terminate(&self, restart: bool) -> BoxFuture<'_, Result<()>> {
        async move {
            if !self.has_adapter() {
                self.on_adapter_exit(None);
            }
            self.cancel_all_requests();
            if let Some(parent) = self.lifecycle_parent() {
                return parent.terminate(restart).await;
            }
            let Some((transport, capabilities)) = self.adapter_and_capabilities() else {
                return Ok(());
            };
            let launched = self.inner.configuration.lock().request == RequestKind::Launch;
            if capabilities.supports_terminate_request && launched {
                transport
                    .request("terminate", json!({ "restart": restart }), None)
                    .await?;
                return Ok(());
            }
            self.disconnect_adapter(
                transport,
                json!({ "restart": restart, "terminateDebuggee": true }),
            )
            .await
        }
        .boxed()
    }

    pub fn disconnect(&self, restart: bool, suspend: bool) -> BoxFuture<'_, Result<()>> {
        async move {
            if !self.has_adapter() {
                self.on_adapter_exit(None);
            }
            self.cancel_all_requests();
            if let Some(parent) = self.lifecycle_parent() {
                return parent.disconnect(restart, suspend).await;
            }
            let Some((transport, _)) = self.adapter_and_capabilities() else {
                return Ok(());
            };
            self.disconnect_adapter(
                transport,
                json!({
                    "restart": restart,
                    "terminateDebuggee": false,
                    "suspendDebuggee": suspend,
                }),
            )
            .await
        }
        .boxed()
    }

    pub fn restart(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            let (transport, capabilities) = self
                .adapter_and_capabilities()
                .ok_or_else(|| DebugError::no_adapter("restart"))?;
            self.cancel_all_requests();
            if let Some(parent) = self.lifecycle_parent() {
                return parent.restart().await;
            }
            if !capabilities.supports_restart_request {
                return Err(DebugError::Unsupported("restart".to_string()));
            }
            let arguments = self.configuration().to_request_arguments(&self.inner.id);
            transport
                .request("restart", json!({ "arguments": arguments }), None)
                .await?;
            Ok(())
        }
        .boxed()
    }

    /// Sends `disconnect` once, then treats the adapter as gone whatever the answer.
    async fn disconnect_adapter(
        &self,
        transport: Arc<dyn AdapterTransport>,
        arguments: Value,
    ) -> Result<()> {
        let first = self
            .with_adapter(|handle| !std::mem::replace(&mut handle.disconnect_sent, true))
            .unwrap_or(false);
        if !first {
            return Ok(());
        }
        let timeout = self.inner.settings.request_timeout;
        let result = match tokio::time::timeout(
            timeout,
            transport.request("disconnect", arguments, None),
        )
        .await
        {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(DebugError::Timeout {
                command: "disconnect".to_string(),
                after: timeout,
            }),
        };
        self.on_adapter_exit(None);
        result
    }

    fn lifecycle_parent(&self) -> Option<&DebugSession> {
        if self.inner.options.lifecycle_managed_by_parent {
            self.inner.options.parent.as_ref()
        } else {
            None
        }
    }

    /// Drops the adapter connection. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.inner.listeners.clear();
        self.cancel_all_requests();
        self.inner.scheduler.cancel(None);
        let previous = std::mem::replace(
            &mut *self.inner.connection.lock(),
            AdapterConnection::NoAdapter,
        );
        if let AdapterConnection::Adapter(handle) = previous {
            release_transport(handle);
        }
        self.inner.fetch_threads.cancel();
        self.inner.pass_focus.cancel();
        self.inner.model.lock().clear_threads(true, None);
        self.fire_state_changed();
    }

    pub fn dispose(&self) {
        self.shutdown();
        self.inner.output.close();
        *self.inner.wait_to_resume.lock() = None;
    }

    fn on_adapter_exit(&self, exit: Option<AdapterExit>) {
        tracing::info!(session = %self.inner.id, ?exit, "debug adapter exited");
        self.inner.initialized.store(true, Ordering::SeqCst);
        self.inner.breakpoints.set_session_data(&self.inner.id, None);
        self.shutdown();
        self.fire(SessionEvent::AdapterEnded(exit));
    }

    // ---- Shared plumbing ----

    fn fire(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    fn fire_state_changed(&self) {
        let state = self.state();
        self.inner.host.session_state_changed(&self.inner.id, state);
        self.fire(SessionEvent::StateChanged);
    }

    fn with_adapter<R>(&self, f: impl FnOnce(&mut AdapterHandle) -> R) -> Option<R> {
        match &mut *self.inner.connection.lock() {
            AdapterConnection::NoAdapter => None,
            AdapterConnection::Adapter(handle) => Some(f(handle)),
        }
    }

    fn adapter(&self, operation: &str) -> Result<Arc<dyn AdapterTransport>> {
        self.with_adapter(|handle| handle.transport.clone())
            .ok_or_else(|| DebugError::no_adapter(operation))
    }

    fn is_attached(&self, transport: &Arc<dyn AdapterTransport>) -> bool {
        self.with_adapter(|handle| Arc::ptr_eq(&handle.transport, transport))
            .unwrap_or(false)
    }

    fn adapter_and_capabilities(&self) -> Option<(Arc<dyn AdapterTransport>, Capabilities)> {
        self.with_adapter(|handle| (handle.transport.clone(), handle.capabilities.clone()))
    }

    /// The transport, provided the adapter advertises `supported`.
    fn capable_adapter(
        &self,
        command: &str,
        supported: impl FnOnce(&Capabilities) -> bool,
    ) -> Result<Arc<dyn AdapterTransport>> {
        let (transport, capabilities) = self
            .adapter_and_capabilities()
            .ok_or_else(|| DebugError::no_adapter(command))?;
        if !supported(&capabilities) {
            return Err(DebugError::Unsupported(command.to_string()));
        }
        Ok(transport)
    }

    async fn send<T>(&self, command: &str, arguments: Value) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let transport = self.adapter(command)?;
        decode(transport.request(command, arguments, None).await?)
    }
}

fn release_transport(handle: AdapterHandle) {
    let transport = handle.transport;
    if handle.disconnect_sent {
        transport.dispose();
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(e) = transport.request("disconnect", json!({}), None).await {
                    tracing::debug!(error = %e, "disconnect during shutdown failed");
                }
                transport.dispose();
            });
        }
        Err(_) => transport.dispose(),
    }
}

/// Decodes a response body, treating an absent body as the default value.
pub(crate) fn decode<T: DeserializeOwned + Default>(body: Value) -> Result<T> {
    if body.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(body)?)
}

fn initialize_arguments(adapter_id: &str) -> Value {
    json!({
        "clientID": CLIENT_ID,
        "clientName": CLIENT_ID,
        "adapterID": adapter_id,
        "locale": "en-US",
        "pathFormat": "path",
        "linesStartAt1": true,
        "columnsStartAt1": true,
        "supportsVariableType": true,
        "supportsVariablePaging": true,
        "supportsRunInTerminalRequest": false,
        "supportsStartDebuggingRequest": false,
        "supportsProgressReporting": true,
        "supportsInvalidatedEvent": true,
        "supportsMemoryReferences": true,
        "supportsMemoryEvent": true,
        "supportsArgsCanBeInterpretedByShell": false,
    })
}
