use super::{decode, DebugSession};
use crate::cancellation::CancellationScope;
use crate::config::ReplMode;
use crate::events::{ContinuedEventBody, SessionEvent};
use crate::model::ResolvedSource;
use crate::protocol::{
    CompletionItem, CompletionsResponse, ContinueResponse, DisassembleResponse,
    DisassembledInstruction, EvaluateResponse, ExceptionInfoResponse, GotoTarget,
    GotoTargetsResponse, LoadedSourcesResponse, LocationsResponse, ReadMemoryResponse, Scope,
    ScopesResponse, SetVariableResponse, SourceResponse, StackTraceResponse, StepInTarget,
    StepInTargetsResponse, SteppingGranularity, ThreadId, Variable, VariablesResponse,
    WriteMemoryResponse,
};
use crate::repl::{ReplElement, ReplEvaluation, ReplSource, Severity};
use crate::transport::AdapterTransport;
use crate::Result;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// A `locationReference` resolved to a source position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedLocation {
    pub source: ResolvedSource,
    pub line: i64,
    pub column: Option<i64>,
    pub end_line: Option<i64>,
    pub end_column: Option<i64>,
}

/// Keeps a request's scope in the per-thread map until the request settles.
struct ThreadRequest<'a> {
    session: &'a DebugSession,
    thread_id: ThreadId,
    scope: CancellationScope,
}

impl Drop for ThreadRequest<'_> {
    fn drop(&mut self) {
        let mut requests = self.session.inner.requests.lock();
        if let Some(scopes) = requests.get_mut(&self.thread_id) {
            scopes.retain(|s| !s.same_scope(&self.scope));
            if scopes.is_empty() {
                requests.remove(&self.thread_id);
            }
        }
    }
}

impl DebugSession {
    // ---- Execution control ----

    pub async fn next(&self, thread_id: ThreadId, granularity: Option<SteppingGranularity>) -> Result<()> {
        let transport = self.adapter("next")?;
        self.step(transport, "next", thread_id, granularity, json!({}))
            .await
    }

    pub async fn step_in(
        &self,
        thread_id: ThreadId,
        target_id: Option<i64>,
        granularity: Option<SteppingGranularity>,
    ) -> Result<()> {
        let transport = self.adapter("stepIn")?;
        let arguments = match target_id {
            Some(target_id) => json!({ "targetId": target_id }),
            None => json!({}),
        };
        self.step(transport, "stepIn", thread_id, granularity, arguments)
            .await
    }

    pub async fn step_out(&self, thread_id: ThreadId, granularity: Option<SteppingGranularity>) -> Result<()> {
        let transport = self.adapter("stepOut")?;
        self.step(transport, "stepOut", thread_id, granularity, json!({}))
            .await
    }

    pub async fn step_back(&self, thread_id: ThreadId, granularity: Option<SteppingGranularity>) -> Result<()> {
        let transport = self.capable_adapter("stepBack", |c| c.supports_step_back)?;
        self.step(transport, "stepBack", thread_id, granularity, json!({}))
            .await
    }

    async fn step(
        &self,
        transport: Arc<dyn AdapterTransport>,
        command: &str,
        thread_id: ThreadId,
        granularity: Option<SteppingGranularity>,
        mut arguments: Value,
    ) -> Result<()> {
        self.set_last_stepping_granularity(thread_id, granularity);
        self.wait_for_triggered_breakpoints().await;
        arguments["threadId"] = json!(thread_id);
        if let Some(granularity) = granularity {
            arguments["granularity"] = json!(granularity);
        }
        transport.request(command, arguments, None).await?;
        self.fire_simulated_continued(thread_id, false);
        Ok(())
    }

    pub async fn continue_execution(&self, thread_id: ThreadId) -> Result<()> {
        let transport = self.adapter("continue")?;
        self.resume(transport, "continue", thread_id).await
    }

    pub async fn reverse_continue(&self, thread_id: ThreadId) -> Result<()> {
        let transport = self.capable_adapter("reverseContinue", |c| c.supports_step_back)?;
        self.resume(transport, "reverseContinue", thread_id).await
    }

    async fn resume(
        &self,
        transport: Arc<dyn AdapterTransport>,
        command: &str,
        thread_id: ThreadId,
    ) -> Result<()> {
        self.wait_for_triggered_breakpoints().await;
        let response: ContinueResponse = decode(
            transport
                .request(command, json!({ "threadId": thread_id }), None)
                .await?,
        )?;
        let all_threads = self
            .with_adapter(|handle| {
                if let Some(all) = response.all_threads_continued {
                    handle.all_threads_continued = all;
                }
                handle.all_threads_continued
            })
            .unwrap_or(true);
        self.fire_simulated_continued(thread_id, all_threads);
        Ok(())
    }

    fn fire_simulated_continued(&self, thread_id: ThreadId, all_threads_continued: bool) {
        self.handle_continued(ContinuedEventBody {
            thread_id,
            all_threads_continued: Some(all_threads_continued),
        });
    }

    fn set_last_stepping_granularity(&self, thread_id: ThreadId, granularity: Option<SteppingGranularity>) {
        if let Some(thread) = self.inner.model.lock().thread_mut(thread_id) {
            thread.last_stepping_granularity = granularity;
        }
    }

    pub async fn pause(&self, thread_id: ThreadId) -> Result<()> {
        let transport = self.adapter("pause")?;
        transport
            .request("pause", json!({ "threadId": thread_id }), None)
            .await?;
        Ok(())
    }

    pub async fn terminate_threads(&self, thread_ids: &[ThreadId]) -> Result<()> {
        let transport =
            self.capable_adapter("terminateThreads", |c| c.supports_terminate_threads_request)?;
        transport
            .request("terminateThreads", json!({ "threadIds": thread_ids }), None)
            .await?;
        Ok(())
    }

    pub async fn restart_frame(&self, frame_id: i64, thread_id: ThreadId) -> Result<()> {
        let transport = self.capable_adapter("restartFrame", |c| c.supports_restart_frame)?;
        transport
            .request("restartFrame", json!({ "frameId": frame_id }), None)
            .await?;
        self.fire_simulated_continued(thread_id, false);
        Ok(())
    }

    pub async fn goto(&self, thread_id: ThreadId, target_id: i64) -> Result<()> {
        let transport = self.capable_adapter("goto", |c| c.supports_goto_targets_request)?;
        transport
            .request("goto", json!({ "threadId": thread_id, "targetId": target_id }), None)
            .await?;
        self.fire_simulated_continued(thread_id, false);
        Ok(())
    }

    pub async fn goto_targets(&self, uri: &str, line: i64, column: Option<i64>) -> Result<Vec<GotoTarget>> {
        let transport = self.capable_adapter("gotoTargets", |c| c.supports_goto_targets_request)?;
        let source = self
            .source_for_uri(uri)
            .unwrap_or_else(|| crate::source::decode_source_uri(uri));
        let mut arguments = json!({ "source": source, "line": line });
        if let Some(column) = column {
            arguments["column"] = json!(column);
        }
        let response: GotoTargetsResponse =
            decode(transport.request("gotoTargets", arguments, None).await?)?;
        Ok(response.targets)
    }

    pub async fn step_in_targets(&self, frame_id: i64) -> Result<Vec<StepInTarget>> {
        let transport =
            self.capable_adapter("stepInTargets", |c| c.supports_step_in_targets_request)?;
        let response: StepInTargetsResponse = decode(
            transport
                .request("stepInTargets", json!({ "frameId": frame_id }), None)
                .await?,
        )?;
        Ok(response.targets)
    }

    // ---- Inspection ----

    pub async fn stack_trace(&self, thread_id: ThreadId, start_frame: i64, levels: i64) -> Result<StackTraceResponse> {
        self.stack_trace_within(thread_id, start_frame, levels, None).await
    }

    /// `stackTrace` whose request scope also ends when `parent` is cancelled.
    pub(super) async fn stack_trace_within(
        &self,
        thread_id: ThreadId,
        start_frame: i64,
        levels: i64,
        parent: Option<&CancellationScope>,
    ) -> Result<StackTraceResponse> {
        let arguments = json!({ "threadId": thread_id, "startFrame": start_frame, "levels": levels });
        decode(
            self.scoped_thread_request(thread_id, "stackTrace", arguments, parent)
                .await?,
        )
    }

    pub async fn scopes(&self, frame_id: i64, thread_id: ThreadId) -> Result<Vec<Scope>> {
        let response: ScopesResponse = decode(
            self.thread_request(Some(thread_id), "scopes", json!({ "frameId": frame_id }))
                .await?,
        )?;
        Ok(response.scopes)
    }

    pub async fn variables(
        &self,
        variables_reference: i64,
        thread_id: Option<ThreadId>,
        filter: Option<&str>,
        start: Option<i64>,
        count: Option<i64>,
    ) -> Result<Vec<Variable>> {
        let mut arguments = json!({ "variablesReference": variables_reference });
        if let Some(filter) = filter {
            arguments["filter"] = json!(filter);
        }
        if let Some(start) = start {
            arguments["start"] = json!(start);
        }
        if let Some(count) = count {
            arguments["count"] = json!(count);
        }
        let response: VariablesResponse =
            decode(self.thread_request(thread_id, "variables", arguments).await?)?;
        Ok(response.variables)
    }

    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
        context: Option<&str>,
        thread_id: Option<ThreadId>,
    ) -> Result<EvaluateResponse> {
        let mut arguments = json!({ "expression": expression });
        if let Some(frame_id) = frame_id {
            arguments["frameId"] = json!(frame_id);
        }
        if let Some(context) = context {
            arguments["context"] = json!(context);
        }
        decode(self.thread_request(thread_id, "evaluate", arguments).await?)
    }

    pub async fn exception_info(&self, thread_id: ThreadId) -> Result<ExceptionInfoResponse> {
        self.capable_adapter("exceptionInfo", |c| c.supports_exception_info_request)?;
        decode(
            self.thread_request(Some(thread_id), "exceptionInfo", json!({ "threadId": thread_id }))
                .await?,
        )
    }

    pub async fn completions(
        &self,
        frame_id: Option<i64>,
        thread_id: ThreadId,
        text: &str,
        line: i64,
        column: i64,
    ) -> Result<Vec<CompletionItem>> {
        self.capable_adapter("completions", |c| c.supports_completions_request)?;
        let mut arguments = json!({ "text": text, "line": line, "column": column });
        if let Some(frame_id) = frame_id {
            arguments["frameId"] = json!(frame_id);
        }
        let response: CompletionsResponse = decode(
            self.thread_request(Some(thread_id), "completions", arguments)
                .await?,
        )?;
        Ok(response.targets)
    }

    pub async fn set_variable(
        &self,
        variables_reference: i64,
        name: &str,
        value: &str,
    ) -> Result<SetVariableResponse> {
        let transport = self.capable_adapter("setVariable", |c| c.supports_set_variable)?;
        let arguments = json!({
            "variablesReference": variables_reference,
            "name": name,
            "value": value,
        });
        decode(transport.request("setVariable", arguments, None).await?)
    }

    pub async fn set_expression(&self, frame_id: i64, expression: &str, value: &str) -> Result<SetVariableResponse> {
        let transport = self.capable_adapter("setExpression", |c| c.supports_set_expression)?;
        let arguments = json!({ "frameId": frame_id, "expression": expression, "value": value });
        decode(transport.request("setExpression", arguments, None).await?)
    }

    pub async fn disassemble(
        &self,
        memory_reference: &str,
        offset: i64,
        instruction_offset: i64,
        instruction_count: i64,
    ) -> Result<Vec<DisassembledInstruction>> {
        let transport = self.capable_adapter("disassemble", |c| c.supports_disassemble_request)?;
        let arguments = json!({
            "memoryReference": memory_reference,
            "offset": offset,
            "instructionOffset": instruction_offset,
            "instructionCount": instruction_count,
            "resolveSymbols": true,
        });
        let response: DisassembleResponse =
            decode(transport.request("disassemble", arguments, None).await?)?;
        Ok(response.instructions)
    }

    pub async fn read_memory(&self, memory_reference: &str, offset: i64, count: u64) -> Result<ReadMemoryResponse> {
        let transport = self.capable_adapter("readMemory", |c| c.supports_read_memory_request)?;
        let arguments = json!({
            "memoryReference": memory_reference,
            "offset": offset,
            "count": count,
        });
        decode(transport.request("readMemory", arguments, None).await?)
    }

    pub async fn write_memory(
        &self,
        memory_reference: &str,
        offset: i64,
        data: &[u8],
        allow_partial: bool,
    ) -> Result<WriteMemoryResponse> {
        let transport = self.capable_adapter("writeMemory", |c| c.supports_write_memory_request)?;
        let arguments = json!({
            "memoryReference": memory_reference,
            "offset": offset,
            "data": BASE64_STANDARD.encode(data),
            "allowPartial": allow_partial,
        });
        decode(transport.request("writeMemory", arguments, None).await?)
    }

    pub async fn resolve_location_reference(&self, location_reference: i64) -> Result<ResolvedLocation> {
        let response: LocationsResponse = self
            .send("locations", json!({ "locationReference": location_reference }))
            .await?;
        Ok(ResolvedLocation {
            source: self.get_source(&response.source),
            line: response.line,
            column: response.column,
            end_line: response.end_line,
            end_column: response.end_column,
        })
    }

    /// Fetches the content of a source the adapter only knows by reference.
    pub async fn load_source(&self, uri: &str) -> Result<SourceResponse> {
        let source = self
            .source_for_uri(uri)
            .unwrap_or_else(|| crate::source::decode_source_uri(uri));
        let arguments = json!({
            "sourceReference": source.source_reference.unwrap_or(0),
            "source": source,
        });
        self.send("source", arguments).await
    }

    pub async fn loaded_sources(&self) -> Result<Vec<ResolvedSource>> {
        let transport = self.adapter("loadedSources")?;
        if !self.capabilities().supports_loaded_sources_request {
            return Ok(Vec::new());
        }
        let response: LoadedSourcesResponse =
            decode(transport.request("loadedSources", json!({}), None).await?)?;
        Ok(response
            .sources
            .iter()
            .map(|raw| self.get_source(raw))
            .collect())
    }

    pub async fn custom_request(&self, command: &str, arguments: Value) -> Result<Value> {
        let transport = self.adapter(command)?;
        transport.request(command, arguments, None).await
    }

    /// Asks the adapter to cancel a long running operation it reported progress for.
    pub async fn cancel_progress(&self, progress_id: &str) -> Result<()> {
        let transport = self.capable_adapter("cancel", |c| c.supports_cancel_request)?;
        transport
            .request("cancel", json!({ "progressId": progress_id }), None)
            .await?;
        Ok(())
    }

    /// Sends a request whose result is only meaningful while `thread_id` stays stopped.
    async fn thread_request(&self, thread_id: Option<ThreadId>, command: &str, arguments: Value) -> Result<Value> {
        match thread_id {
            Some(thread_id) => {
                self.scoped_thread_request(thread_id, command, arguments, None)
                    .await
            }
            None => self.adapter(command)?.request(command, arguments, None).await,
        }
    }

    async fn scoped_thread_request(
        &self,
        thread_id: ThreadId,
        command: &str,
        arguments: Value,
        parent: Option<&CancellationScope>,
    ) -> Result<Value> {
        let transport = self.adapter(command)?;
        let scope = parent.map_or_else(CancellationScope::new, CancellationScope::child);
        scope.check()?;
        self.inner
            .requests
            .lock()
            .entry(thread_id)
            .or_default()
            .push(scope.clone());
        let _registration = ThreadRequest {
            session: self,
            thread_id,
            scope: scope.clone(),
        };
        transport.request(command, arguments, Some(scope)).await
    }

    pub fn cancel_all_requests(&self) {
        let drained: Vec<CancellationScope> = self
            .inner
            .requests
            .lock()
            .drain()
            .flat_map(|(_, scopes)| scopes)
            .collect();
        for scope in drained {
            scope.dispose(true);
        }
    }

    pub(super) fn cancel_thread_requests(&self, thread_id: ThreadId) {
        let scopes = self.inner.requests.lock().remove(&thread_id);
        for scope in scopes.into_iter().flatten() {
            scope.dispose(true);
        }
    }

    // ---- REPL ----

    pub fn has_separate_repl(&self) -> bool {
        self.inner.options.parent.is_none() || self.inner.options.repl == ReplMode::Separate
    }

    pub fn get_repl_elements(&self) -> Vec<ReplElement> {
        self.inner.repl.elements()
    }

    pub fn remove_repl_expressions(&self) {
        if self.inner.repl.clear() {
            self.fire(SessionEvent::ReplElementsChanged);
        }
    }

    pub fn append_to_repl(&self, text: &str, severity: Severity, source: Option<ReplSource>, important: bool) {
        self.inner
            .repl
            .append_output(&self.inner.id, text, severity, source);
        if important {
            self.inner.host.important_output(text);
        }
        self.fire(SessionEvent::ReplElementsChanged);
    }

    /// Records `expression` in the console and evaluates it there.
    pub async fn add_repl_expression(&self, frame_id: Option<i64>, expression: &str) -> ReplEvaluation {
        self.inner.repl.add_input(&self.inner.id, expression);
        self.fire(SessionEvent::ReplElementsChanged);

        let evaluation = match self.evaluate(expression, frame_id, Some("repl"), None).await {
            Ok(value) => ReplEvaluation::Value(value),
            Err(e) => ReplEvaluation::Error {
                message: e.to_string(),
            },
        };
        self.inner
            .repl
            .add_result(&self.inner.id, expression, evaluation.clone());
        self.fire(SessionEvent::ReplElementsChanged);
        evaluation
    }
}
