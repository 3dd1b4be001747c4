use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use dap_session_core::{
    protocol::{SteppingGranularity, StoppedDetails, ThreadId},
    repl::ReplElement,
    source::source_uri,
    AdapterCommand, AdapterFactory, AdapterTransport, BreakpointStore, DebugConfiguration,
    DebugError, DebugHost, DebugSession, RequestKind, SessionContext, SessionEvent,
    SessionOptions, SessionSettings, SessionState, SourceBreakpointSpec, StdioTransport,
    ViewModel,
};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::{sync::Mutex, time::sleep};

const WAIT_FOR_STOPPED_TIMEOUT: Duration = Duration::from_secs(10);
const STOPPED_POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_MEMORY_MAX_COUNT: u64 = 64 * 1024;
const CONSOLE_TAIL: usize = 50;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
enum DebuggerRequest {
    #[default]
    Launch,
    Attach,
}

impl From<DebuggerRequest> for RequestKind {
    fn from(request: DebuggerRequest) -> Self {
        match request {
            DebuggerRequest::Launch => RequestKind::Launch,
            DebuggerRequest::Attach => RequestKind::Attach,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerStartParams {
    /// Adapter type sent as `adapterID`, e.g. "lldb".
    #[serde(default = "default_adapter_type")]
    adapter_type: String,
    #[serde(default)]
    request: DebuggerRequest,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    adapter_path: Option<String>,
    #[serde(default)]
    adapter_args: Vec<String>,
    /// Adapter-specific launch/attach fields such as `program` or `pid`.
    #[serde(default)]
    configuration: Option<Map<String, Value>>,
}

fn default_adapter_type() -> String {
    "lldb".to_string()
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerStopParams {
    #[serde(default)]
    terminate_debuggee: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct BreakpointSpec {
    line: i64,
    #[serde(default)]
    column: Option<i64>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    hit_condition: Option<String>,
    #[serde(default)]
    log_message: Option<String>,
}

impl From<BreakpointSpec> for SourceBreakpointSpec {
    fn from(spec: BreakpointSpec) -> Self {
        SourceBreakpointSpec {
            column: spec.column,
            condition: spec.condition,
            hit_condition: spec.hit_condition,
            log_message: spec.log_message,
            ..SourceBreakpointSpec::at_line(spec.line)
        }
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerSetBreakpointsParams {
    source_path: String,
    breakpoints: Vec<BreakpointSpec>,
    #[serde(default)]
    function_breakpoints: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerExceptionFiltersParams {
    filters: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerThreadParams {
    #[serde(default)]
    thread_id: Option<ThreadId>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerStepParams {
    #[serde(default)]
    thread_id: Option<ThreadId>,
    #[serde(default)]
    instruction: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerStackTraceParams {
    #[serde(default)]
    thread_id: Option<ThreadId>,
    #[serde(default)]
    start_frame: i64,
    #[serde(default = "default_levels")]
    levels: i64,
}

fn default_levels() -> i64 {
    20
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerScopesParams {
    frame_id: i64,
    #[serde(default)]
    thread_id: Option<ThreadId>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerVariablesParams {
    variables_reference: i64,
    #[serde(default)]
    thread_id: Option<ThreadId>,
    #[serde(default)]
    start: Option<i64>,
    #[serde(default)]
    count: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerEvaluateParams {
    expression: String,
    #[serde(default)]
    frame_id: Option<i64>,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerReadMemoryParams {
    memory_reference: String,
    #[serde(default)]
    offset: i64,
    count: u64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerWriteMemoryParams {
    memory_reference: String,
    #[serde(default)]
    offset: i64,
    data_base64: String,
    #[serde(default)]
    allow_partial: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DebuggerConsoleParams {
    command: String,
    #[serde(default)]
    frame_id: Option<i64>,
}

/// Spawns the adapter executable over stdio for every session (re)start.
struct StdioAdapterFactory {
    command: AdapterCommand,
}

impl StdioAdapterFactory {
    fn from_env(adapter_path: Option<String>, args: Vec<String>, settings: &SessionSettings) -> Result<Self, String> {
        let program = adapter_path
            .or_else(|| std::env::var("DAP_ADAPTER_PATH").ok())
            .ok_or_else(|| {
                "Missing debug adapter path. Set DAP_ADAPTER_PATH or pass adapter_path.".to_string()
            })?;
        let mut command = AdapterCommand::new(program);
        command.args = args;
        command.protocol_log = std::env::var("DAP_PROTOCOL_LOG").ok().map(PathBuf::from);
        command.request_timeout = settings.request_timeout;
        Ok(Self { command })
    }
}

impl AdapterFactory for StdioAdapterFactory {
    fn create(
        &self,
        session_id: &str,
        configuration: &DebugConfiguration,
    ) -> dap_session_core::Result<Arc<dyn AdapterTransport>> {
        tracing::info!(
            session = session_id,
            adapter = %configuration.adapter_type,
            program = %self.command.program.display(),
            "spawning debug adapter"
        );
        Ok(Arc::new(StdioTransport::new(self.command.clone())))
    }
}

#[derive(Clone)]
struct DebuggerMcpServer {
    tool_router: ToolRouter<Self>,
    host: Arc<ViewModel>,
    breakpoints: Arc<BreakpointStore>,
    settings: SessionSettings,
    session: Arc<Mutex<Option<DebugSession>>>,
    next_session: Arc<AtomicU64>,
}

fn to_mcp_error(message: impl Into<String>) -> McpError {
    McpError::internal_error(message.into(), None)
}

fn debug_error(e: DebugError) -> McpError {
    to_mcp_error(e.to_string())
}

fn detached_session_error(tool_name: &str) -> McpError {
    to_mcp_error(format!(
        "{tool_name} requires an active debug session. Call debugger_start first."
    ))
}

fn stopped_summary(details: &StoppedDetails) -> Value {
    json!({
        "reason": details.reason,
        "description": details.description,
        "text": details.text,
        "thread_id": details.thread_id,
        "all_threads_stopped": details.all_threads_stopped,
        "hit_breakpoint_ids": details.hit_breakpoint_ids,
    })
}

fn state_name(state: SessionState) -> &'static str {
    match state {
        SessionState::Inactive => "inactive",
        SessionState::Initializing => "initializing",
        SessionState::Stopped => "stopped",
        SessionState::Running => "running",
    }
}

fn file_uri(path: &str) -> String {
    let raw = dap_session_core::protocol::Source {
        path: Some(path.to_string()),
        ..Default::default()
    };
    source_uri(&raw, "")
}

fn console_tail(elements: &[ReplElement], limit: usize) -> Value {
    let start = elements.len().saturating_sub(limit);
    serde_json::to_value(&elements[start..]).unwrap_or(Value::Null)
}

/// The thread a command applies to: explicit, then focused, then last stopped.
fn resolve_thread_id(
    session: &DebugSession,
    host: &ViewModel,
    explicit_thread_id: Option<ThreadId>,
) -> Result<ThreadId, String> {
    if let Some(thread_id) = explicit_thread_id {
        return Ok(thread_id);
    }
    host.focus()
        .filter(|focus| focus.session_id == session.id())
        .and_then(|focus| focus.thread_id)
        .or_else(|| session.stopped_details().and_then(|d| d.thread_id))
        .ok_or_else(|| {
            "Missing thread_id: provide thread_id or wait for a thread to stop".to_string()
        })
}

/// Polls until some thread of the session stops again. Returns `None` on timeout.
/// Waits for `thread_id` to stop, or for any thread when none is named. Stops already
/// recorded for other threads do not count.
async fn wait_for_stop(
    session: &DebugSession,
    thread_id: Option<ThreadId>,
    wait_timeout: Duration,
) -> Option<StoppedDetails> {
    let poll = async {
        loop {
            if session.state() == SessionState::Inactive {
                return None;
            }
            let details = match thread_id {
                Some(id) => session
                    .thread(id)
                    .filter(|thread| thread.stopped)
                    .and_then(|thread| thread.stopped_details),
                None => session.stopped_details().filter(|details| {
                    details
                        .thread_id
                        .and_then(|id| session.thread(id))
                        .is_some_and(|thread| thread.stopped)
                }),
            };
            if details.is_some() {
                return details;
            }
            sleep(STOPPED_POLL_INTERVAL).await;
        }
    };
    tokio::time::timeout(wait_timeout, poll).await.ok().flatten()
}

fn spawn_event_logger(session: &DebugSession) {
    let mut events = session.subscribe();
    let session_id = session.id().to_string();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::AdapterEnded(exit)) => {
                    tracing::info!(session = %session_id, ?exit, "debug adapter ended");
                }
                Ok(event) => tracing::debug!(session = %session_id, ?event, "session event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(session = %session_id, skipped, "session event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

impl DebuggerMcpServer {
    async fn current(&self, tool_name: &str) -> Result<DebugSession, McpError> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| detached_session_error(tool_name))
    }

    async fn start_session(
        &self,
        factory: &dyn AdapterFactory,
        configuration: DebugConfiguration,
    ) -> Result<DebugSession, McpError> {
        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(|s| s.state() != SessionState::Inactive) {
            return Err(to_mcp_error(
                "A debug session is already running. Call debugger_stop before starting another.",
            ));
        }
        let id = format!("session-{}", self.next_session.fetch_add(1, Ordering::Relaxed));
        let context = SessionContext::new(self.host.clone(), self.breakpoints.clone())
            .with_settings(self.settings.clone());
        let session = DebugSession::new(id, configuration, SessionOptions::default(), context);
        spawn_event_logger(&session);

        session.initialize(factory).await.map_err(debug_error)?;
        session.launch_or_attach().await.map_err(debug_error)?;
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn step(
        &self,
        tool_name: &str,
        params: DebuggerStepParams,
        command: &'static str,
    ) -> Result<CallToolResult, McpError> {
        let session = self.current(tool_name).await?;
        let thread_id =
            resolve_thread_id(&session, &self.host, params.thread_id).map_err(to_mcp_error)?;
        let granularity = params.instruction.then_some(SteppingGranularity::Instruction);
        let result = match command {
            "stepIn" => session.step_in(thread_id, None, granularity).await,
            "stepOut" => session.step_out(thread_id, granularity).await,
            _ => session.next(thread_id, granularity).await,
        };
        result.map_err(debug_error)?;

        let stop = wait_for_stop(&session, Some(thread_id), WAIT_FOR_STOPPED_TIMEOUT).await;
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "thread_id": thread_id,
            "state": state_name(session.state()),
            "stop": stop.as_ref().map(stopped_summary),
        })))
    }
}

#[tool_router]
impl DebuggerMcpServer {
    fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
            host: Arc::new(ViewModel::new()),
            breakpoints: Arc::new(BreakpointStore::new()),
            settings: SessionSettings::from_env(),
            session: Arc::new(Mutex::new(None)),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    #[tool(description = "Start a debug session by launching or attaching through a DAP adapter")]
    async fn debugger_start(
        &self,
        params: Parameters<DebuggerStartParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let factory = StdioAdapterFactory::from_env(
            params.adapter_path.clone(),
            params.adapter_args.clone(),
            &self.settings,
        )
        .map_err(to_mcp_error)?;

        let request: RequestKind = params.request.into();
        let name = params
            .name
            .clone()
            .unwrap_or_else(|| format!("{} {}", params.adapter_type, request.command()));
        let mut configuration = DebugConfiguration::new(name, params.adapter_type.clone(), request);
        for (key, value) in params.configuration.unwrap_or_default() {
            configuration = configuration.with_field(key, value);
        }

        let session = self.start_session(&factory, configuration).await?;
        let capabilities = session.capabilities();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "session_id": session.id(),
            "name": session.name(),
            "state": state_name(session.state()),
            "capabilities": capabilities,
        })))
    }

    #[tool(description = "Stop the current debug session")]
    async fn debugger_stop(
        &self,
        params: Parameters<DebuggerStopParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let Some(session) = self.session.lock().await.take() else {
            return Err(detached_session_error("debugger_stop"));
        };

        let result = if params.terminate_debuggee {
            session.terminate(false).await
        } else {
            session.disconnect(false, false).await
        };
        session.dispose();
        if let Err(e) = &result {
            tracing::warn!(session = session.id(), error = %e, "debug session did not stop cleanly");
        }

        Ok(CallToolResult::structured(json!({
            "ok": result.is_ok(),
            "session_id": session.id(),
            "terminate_debuggee": params.terminate_debuggee,
            "error": result.err().map(|e| e.to_string()),
        })))
    }

    #[tool(description = "Replace the source breakpoints of a file, and optionally all function breakpoints")]
    async fn debugger_set_breakpoints(
        &self,
        params: Parameters<DebuggerSetBreakpointsParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.current("debugger_set_breakpoints").await?;
        let uri = file_uri(&params.source_path);

        self.breakpoints.remove_source_breakpoints(&uri);
        let ids = self.breakpoints.add_source_breakpoints(
            &uri,
            params.breakpoints.into_iter().map(Into::into).collect(),
        );
        session
            .send_breakpoints(&uri, false)
            .await
            .map_err(debug_error)?;

        let mut function_ids = Vec::new();
        if let Some(names) = params.function_breakpoints {
            self.breakpoints.remove_function_breakpoints();
            function_ids = names
                .into_iter()
                .map(|name| self.breakpoints.add_function_breakpoint(name))
                .collect();
            session
                .send_function_breakpoints()
                .await
                .map_err(debug_error)?;
        }

        let describe = |id| {
            json!({
                "id": id,
                "adapter": session.debug_protocol_breakpoint(id),
            })
        };
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "uri": uri,
            "ready": session.is_ready_for_breakpoints(),
            "source_breakpoints": ids.into_iter().map(describe).collect::<Vec<_>>(),
            "function_breakpoints": function_ids.into_iter().map(describe).collect::<Vec<_>>(),
        })))
    }

    #[tool(description = "Choose which exception filters pause execution")]
    async fn debugger_set_exception_filters(
        &self,
        params: Parameters<DebuggerExceptionFiltersParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.current("debugger_set_exception_filters").await?;
        let available = session.capabilities().exception_breakpoint_filters;

        let unknown: Vec<&String> = params
            .filters
            .iter()
            .filter(|name| !available.iter().any(|f| &f.filter == *name))
            .collect();
        if !unknown.is_empty() {
            return Err(to_mcp_error(format!(
                "Unknown exception filters {unknown:?}; adapter offers {:?}",
                available.iter().map(|f| &f.filter).collect::<Vec<_>>()
            )));
        }
        for filter in &available {
            let enabled = params.filters.contains(&filter.filter);
            self.breakpoints
                .set_exception_filter_enabled(&filter.filter, enabled, None);
        }
        session
            .send_exception_breakpoints()
            .await
            .map_err(debug_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "enabled": params.filters,
        })))
    }

    #[tool(description = "Continue execution")]
    async fn debugger_continue(
        &self,
        params: Parameters<DebuggerThreadParams>,
    ) -> Result<CallToolResult, McpError> {
        let session = self.current("debugger_continue").await?;
        let last_stop = session.stopped_details();
        let thread_id =
            resolve_thread_id(&session, &self.host, params.0.thread_id).map_err(to_mcp_error)?;

        session
            .continue_execution(thread_id)
            .await
            .map_err(debug_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": state_name(session.state()),
            "thread_id": thread_id,
            "last_stop": last_stop.as_ref().map(stopped_summary),
        })))
    }

    #[tool(description = "Step over the next line")]
    async fn debugger_step_over(
        &self,
        params: Parameters<DebuggerStepParams>,
    ) -> Result<CallToolResult, McpError> {
        self.step("debugger_step_over", params.0, "next").await
    }

    #[tool(description = "Step into function call")]
    async fn debugger_step_in(
        &self,
        params: Parameters<DebuggerStepParams>,
    ) -> Result<CallToolResult, McpError> {
        self.step("debugger_step_in", params.0, "stepIn").await
    }

    #[tool(description = "Step out of current function")]
    async fn debugger_step_out(
        &self,
        params: Parameters<DebuggerStepParams>,
    ) -> Result<CallToolResult, McpError> {
        self.step("debugger_step_out", params.0, "stepOut").await
    }

    #[tool(description = "Pause a running thread")]
    async fn debugger_pause(
        &self,
        params: Parameters<DebuggerThreadParams>,
    ) -> Result<CallToolResult, McpError> {
        let session = self.current("debugger_pause").await?;
        let thread_id = match params.0.thread_id {
            Some(id) => id,
            None => session
                .threads()
                .first()
                .map(|t| t.id)
                .ok_or_else(|| to_mcp_error("No known threads to pause; pass thread_id"))?,
        };
        session.pause(thread_id).await.map_err(debug_error)?;
        let stop = wait_for_stop(&session, Some(thread_id), WAIT_FOR_STOPPED_TIMEOUT).await;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "thread_id": thread_id,
            "state": state_name(session.state()),
            "stop": stop.as_ref().map(stopped_summary),
        })))
    }

    #[tool(description = "List known threads and their stop state")]
    async fn debugger_threads(&self) -> Result<CallToolResult, McpError> {
        let session = self.current("debugger_threads").await?;
        let threads: Vec<Value> = session
            .threads()
            .iter()
            .map(|thread| {
                json!({
                    "id": thread.id,
                    "name": thread.name,
                    "stopped": thread.stopped,
                    "stop": thread.stopped_details.as_ref().map(stopped_summary),
                    "top_frame": thread.top_stack_frame(),
                })
            })
            .collect();

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "threads": threads,
        })))
    }

    #[tool(description = "Read the call stack of a stopped thread")]
    async fn debugger_stack_trace(
        &self,
        params: Parameters<DebuggerStackTraceParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.current("debugger_stack_trace").await?;
        let thread_id =
            resolve_thread_id(&session, &self.host, params.thread_id).map_err(to_mcp_error)?;
        let response = session
            .stack_trace(thread_id, params.start_frame, params.levels)
            .await
            .map_err(debug_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "thread_id": thread_id,
            "stack_frames": response.stack_frames,
            "total_frames": response.total_frames,
        })))
    }

    #[tool(description = "List the variable scopes of a stack frame")]
    async fn debugger_scopes(
        &self,
        params: Parameters<DebuggerScopesParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.current("debugger_scopes").await?;
        let thread_id =
            resolve_thread_id(&session, &self.host, params.thread_id).map_err(to_mcp_error)?;
        let scopes = session
            .scopes(params.frame_id, thread_id)
            .await
            .map_err(debug_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "scopes": scopes,
        })))
    }

    #[tool(description = "Read variables from a variables reference")]
    async fn debugger_variables(
        &self,
        params: Parameters<DebuggerVariablesParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.current("debugger_variables").await?;
        let variables = session
            .variables(
                params.variables_reference,
                params.thread_id,
                None,
                params.start,
                params.count,
            )
            .await
            .map_err(debug_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "variables": variables,
        })))
    }

    #[tool(description = "Evaluate expression in debugger context")]
    async fn debugger_evaluate(
        &self,
        params: Parameters<DebuggerEvaluateParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.current("debugger_evaluate").await?;
        let thread_id = self
            .host
            .focus()
            .filter(|focus| focus.session_id == session.id())
            .and_then(|focus| focus.thread_id);
        let response = session
            .evaluate(
                &params.expression,
                params.frame_id,
                Some(params.context.as_deref().unwrap_or("watch")),
                thread_id,
            )
            .await
            .map_err(debug_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "result": response.result,
            "type": response.type_,
            "variables_reference": response.variables_reference,
            "memory_reference": response.memory_reference,
        })))
    }

    #[tool(description = "Read memory from target runtime")]
    async fn debugger_read_memory(
        &self,
        params: Parameters<DebuggerReadMemoryParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        if params.count > READ_MEMORY_MAX_COUNT {
            return Err(to_mcp_error(format!(
                "debugger_read_memory count {} exceeds max allowed {} bytes",
                params.count, READ_MEMORY_MAX_COUNT
            )));
        }
        let session = self.current("debugger_read_memory").await?;
        let response = session
            .read_memory(&params.memory_reference, params.offset, params.count)
            .await
            .map_err(debug_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "address": response.address,
            "count": params.count,
            "data_base64": response.data.clone().unwrap_or_default(),
            "unreadable_bytes": response.unreadable_bytes,
        })))
    }

    #[tool(description = "Write base64-encoded bytes into target memory")]
    async fn debugger_write_memory(
        &self,
        params: Parameters<DebuggerWriteMemoryParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let bytes = BASE64_STANDARD
            .decode(params.data_base64.as_bytes())
            .map_err(|e| to_mcp_error(format!("data_base64 is not valid base64: {e}")))?;
        let session = self.current("debugger_write_memory").await?;
        let response = session
            .write_memory(&params.memory_reference, params.offset, &bytes, params.allow_partial)
            .await
            .map_err(debug_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "requested": bytes.len(),
            "bytes_written": response.bytes_written,
        })))
    }

    #[tool(description = "Execute debugger console command")]
    async fn debugger_console(
        &self,
        params: Parameters<DebuggerConsoleParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.current("debugger_console").await?;
        let evaluation = session
            .add_repl_expression(params.frame_id, &params.command)
            .await;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "evaluation": evaluation,
            "console": console_tail(&session.get_repl_elements(), CONSOLE_TAIL),
        })))
    }

    #[tool(description = "Summarise the debug session: state, focus, last stop and recent console output")]
    async fn debugger_status(&self) -> Result<CallToolResult, McpError> {
        let Some(session) = self.session.lock().await.clone() else {
            return Ok(CallToolResult::structured(json!({
                "ok": true,
                "state": "detached",
                "errors": self.host.errors(),
            })));
        };
        let focus = self.host.focus().map(|focus| {
            json!({
                "session_id": focus.session_id,
                "thread_id": focus.thread_id,
                "frame": focus.frame,
            })
        });

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "session_id": session.id(),
            "name": session.name(),
            "state": state_name(session.state()),
            "ready_for_breakpoints": session.is_ready_for_breakpoints(),
            "stop": session.stopped_details().as_ref().map(stopped_summary),
            "focus": focus,
            "errors": self.host.errors(),
            "important": self.host.important_messages(),
            "console": console_tail(&session.get_repl_elements(), CONSOLE_TAIL),
        })))
    }
}

#[tool_handler]
impl ServerHandler for DebuggerMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Debugger MCP Server driving a single Debug Adapter Protocol session".into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the MCP protocol
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let server = DebuggerMcpServer::new();
    let transport = transport::stdio();

    tracing::info!("Starting Debugger MCP Server on stdio...");

    server.serve(transport).await?.waiting().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dap_session_core::events::AdapterEvent;
    use dap_session_core::testing::{FakeAdapterFactory, FakeTransport};

    fn scripted_adapter() -> Arc<FakeTransport> {
        let transport = FakeTransport::new();
        transport.respond(
            "initialize",
            json!({
                "supportsConfigurationDoneRequest": true,
                "exceptionBreakpointFilters": [
                    { "filter": "panic", "label": "Rust panic", "default": true },
                    { "filter": "cpp_throw", "label": "C++ throw" },
                ],
            }),
        );
        transport.respond("threads", json!({ "threads": [{ "id": 1, "name": "main" }] }));
        transport.respond(
            "stackTrace",
            json!({
                "stackFrames": [{ "id": 100, "name": "main", "line": 7, "column": 1 }],
                "totalFrames": 1,
            }),
        );
        transport
    }

    async fn started_server() -> (DebuggerMcpServer, DebugSession, Arc<FakeTransport>) {
        let server = DebuggerMcpServer::new();
        let transport = scripted_adapter();
        let configuration = DebugConfiguration::new("test", "lldb", RequestKind::Launch)
            .with_field("program", json!("/bin/app"));
        let session = server
            .start_session(&FakeAdapterFactory::single(transport.clone()), configuration)
            .await
            .expect("session should start");
        (server, session, transport)
    }

    #[tokio::test]
    async fn start_session_launches_and_rejects_a_second_start() {
        let (server, session, transport) = started_server().await;

        assert_eq!(session.id(), "session-1");
        assert_eq!(transport.requests_for("launch")[0]["program"], "/bin/app");

        let again = server
            .start_session(
                &FakeAdapterFactory::single(scripted_adapter()),
                DebugConfiguration::new("again", "lldb", RequestKind::Launch),
            )
            .await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn step_waits_for_the_next_stop() {
        let (server, session, transport) = started_server().await;
        transport.emit(AdapterEvent::Stopped(StoppedDetails {
            reason: "breakpoint".to_string(),
            thread_id: Some(1),
            ..StoppedDetails::default()
        }));
        assert!(wait_for_stop(&session, None, Duration::from_secs(2)).await.is_some());

        let stepper = transport.clone();
        transport.on("next", move |_| {
            // adapters answer the step before reporting where it landed
            let stepper = stepper.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(20)).await;
                stepper.emit(AdapterEvent::Stopped(StoppedDetails {
                    reason: "step".to_string(),
                    thread_id: Some(1),
                    ..StoppedDetails::default()
                }));
            });
            Ok(Value::Null)
        });
        let result = server
            .step(
                "debugger_step_over",
                DebuggerStepParams {
                    thread_id: None,
                    instruction: false,
                },
                "next",
            )
            .await
            .expect("step should succeed");

        let body = result.structured_content.expect("structured result");
        assert_eq!(body["thread_id"], 1);
        assert_eq!(body["stop"]["reason"], "step");
    }

    #[tokio::test]
    async fn step_ignores_an_earlier_stop_on_another_thread() {
        let (server, session, transport) = started_server().await;
        transport.respond(
            "threads",
            json!({ "threads": [{ "id": 1, "name": "main" }, { "id": 2, "name": "worker" }] }),
        );
        for thread_id in [2, 1] {
            transport.emit(AdapterEvent::Stopped(StoppedDetails {
                reason: "breakpoint".to_string(),
                thread_id: Some(thread_id),
                all_threads_stopped: false,
                ..StoppedDetails::default()
            }));
            assert!(wait_for_stop(&session, Some(thread_id), Duration::from_secs(2))
                .await
                .is_some());
        }

        let stepper = transport.clone();
        transport.on("next", move |_| {
            let stepper = stepper.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(20)).await;
                stepper.emit(AdapterEvent::Stopped(StoppedDetails {
                    reason: "step".to_string(),
                    thread_id: Some(1),
                    ..StoppedDetails::default()
                }));
            });
            Ok(Value::Null)
        });
        let result = server
            .step(
                "debugger_step_over",
                DebuggerStepParams {
                    thread_id: Some(1),
                    instruction: false,
                },
                "next",
            )
            .await
            .expect("step should succeed");

        let body = result.structured_content.expect("structured result");
        assert_eq!(body["stop"]["reason"], "step");
        assert_eq!(body["stop"]["thread_id"], 1);
    }

    #[tokio::test]
    async fn resolve_thread_prefers_explicit_then_focus() {
        let (server, session, transport) = started_server().await;
        assert!(resolve_thread_id(&session, &server.host, None).is_err());
        assert_eq!(resolve_thread_id(&session, &server.host, Some(9)), Ok(9));

        transport.emit(AdapterEvent::Stopped(StoppedDetails {
            reason: "pause".to_string(),
            thread_id: Some(1),
            ..StoppedDetails::default()
        }));
        wait_for_stop(&session, None, Duration::from_secs(2)).await;
        assert_eq!(resolve_thread_id(&session, &server.host, None), Ok(1));
    }

    #[tokio::test]
    async fn exception_filter_selection_is_sent_after_initialized() {
        let (server, session, transport) = started_server().await;
        transport.emit(AdapterEvent::Initialized);
        for _ in 0..200 {
            if session.is_ready_for_breakpoints() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }

        server
            .debugger_set_exception_filters(Parameters(DebuggerExceptionFiltersParams {
                filters: vec!["cpp_throw".to_string()],
            }))
            .await
            .expect("known filter");

        let sent = transport.requests_for("setExceptionBreakpoints");
        assert_eq!(sent.last().expect("request")["filters"], json!(["cpp_throw"]));

        let unknown = server
            .debugger_set_exception_filters(Parameters(DebuggerExceptionFiltersParams {
                filters: vec!["segfault".to_string()],
            }))
            .await;
        assert!(unknown.is_err());
    }

    #[test]
    fn file_uri_uses_file_scheme() {
        assert_eq!(file_uri("/src/main.rs"), "file:///src/main.rs");
    }

    #[test]
    fn console_tail_keeps_latest_elements() {
        let repl = dap_session_core::repl::Repl::new();
        for i in 0..5 {
            repl.add_input("s1", &format!("expr{i}"));
        }
        let tail = console_tail(&repl.elements(), 2);
        let tail = tail.as_array().expect("array");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1]["expression"], "expr4");
    }

    #[test]
    fn factory_requires_an_adapter_path() {
        let settings = SessionSettings::default();
        let explicit = StdioAdapterFactory::from_env(
            Some("/usr/bin/codelldb".to_string()),
            vec!["--port".to_string()],
            &settings,
        )
        .expect("explicit path");
        assert_eq!(explicit.command.program, PathBuf::from("/usr/bin/codelldb"));
        assert_eq!(explicit.command.args, vec!["--port".to_string()]);
    }

    #[test]
    fn debugger_start_params_schema_has_no_bare_true() {
        let schema = schemars::schema_for!(DebuggerStartParams);
        let json = serde_json::to_string(&schema).expect("schema serialization must succeed");
        assert!(
            !json.contains("\"configuration\":true") && !json.contains("\"configuration\": true"),
            "Schema contains bare 'true' for configuration field, which OpenCode rejects:\n{}",
            serde_json::to_string_pretty(&schema)
                .expect("pretty schema serialization must succeed")
        );
    }

    #[test]
    fn debugger_set_breakpoints_params_schema_has_no_bare_true_for_function_breakpoints() {
        let schema = schemars::schema_for!(DebuggerSetBreakpointsParams);
        let json = serde_json::to_string(&schema).expect("schema serialization must succeed");
        assert!(
            !json.contains("\"function_breakpoints\":true")
                && !json.contains("\"function_breakpoints\": true"),
            "Schema contains bare 'true' for function_breakpoints field, which OpenCode rejects:\n{}",
            serde_json::to_string_pretty(&schema)
                .expect("pretty schema serialization must succeed")
        );
    }
}
