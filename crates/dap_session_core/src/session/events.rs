use super::{decode, DebugSession};
use crate::breakpoints::{BreakpointKind, SourceBreakpointSpec};
use crate::cancellation::CancellationScope;
use crate::events::{
    AdapterEvent, BreakpointEventBody, ContinuedEventBody, InvalidatedEventBody,
    OutputEventBody, SessionEvent, TerminatedEventBody, ThreadEventBody,
};
use crate::host::{Focus, FocusOptions};
use crate::protocol::{StackFrame, StoppedDetails, ThreadId, ThreadsResponse};
use crate::repl::{ReplSource, Severity};
use crate::{DebugError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;

impl DebugSession {
    /// Applies one adapter event. Runs synchronously so per-thread bookkeeping happens in
    /// arrival order; follow-up work that needs the adapter is spawned.
    pub(super) fn dispatch(&self, event: AdapterEvent) {
        tracing::trace!(session = %self.inner.id, event = event.name(), "adapter event");
        match event {
            AdapterEvent::Initialized => self.handle_initialized(),
            AdapterEvent::Stopped(details) => self.handle_stop(details),
            AdapterEvent::Continued(body) => self.handle_continued(body),
            AdapterEvent::Thread(body) => self.handle_thread(body),
            AdapterEvent::Output(body) => self.handle_output(body),
            AdapterEvent::Breakpoint(body) => self.handle_breakpoint_event(body),
            AdapterEvent::LoadedSource(body) => {
                let source = self.get_source(&body.source);
                self.fire(SessionEvent::LoadedSource {
                    reason: body.reason,
                    source,
                });
            }
            AdapterEvent::Terminated(body) => self.handle_terminated(body),
            AdapterEvent::Exited { exit_code } => {
                tracing::info!(session = %self.inner.id, exit_code, "debuggee exited");
            }
            AdapterEvent::Capabilities(changes) => self.handle_capabilities(&changes),
            AdapterEvent::ProgressStart(body) => self.fire(SessionEvent::ProgressStart(body)),
            AdapterEvent::ProgressUpdate(body) => self.fire(SessionEvent::ProgressUpdate(body)),
            AdapterEvent::ProgressEnd(body) => self.fire(SessionEvent::ProgressEnd(body)),
            AdapterEvent::Invalidated(body) => self.handle_invalidated(body),
            AdapterEvent::Memory(body) => self.fire(SessionEvent::InvalidateMemory(body)),
            AdapterEvent::Custom { event, body } => {
                self.fire(SessionEvent::CustomEvent { event, body })
            }
            AdapterEvent::AdapterExited(exit) => self.on_adapter_exit(Some(exit)),
        }
    }

    fn handle_initialized(&self) {
        if self
            .with_adapter(|handle| handle.ready_for_breakpoints = true)
            .is_none()
        {
            return;
        }
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.send_all_breakpoints().await {
                tracing::warn!(session = %session.inner.id, error = %e, "failed to send breakpoints");
            }
            session.send_configuration_done().await;
            if let Err(e) = session.fetch_threads(None).await {
                tracing::debug!(session = %session.inner.id, error = %e, "initial thread fetch failed");
            }
            session.fire_state_changed();
        });
    }

    async fn send_configuration_done(&self) {
        let Some((transport, capabilities)) = self.adapter_and_capabilities() else {
            return;
        };
        if !capabilities.supports_configuration_done_request {
            return;
        }
        if let Err(e) = transport
            .request("configurationDone", json!({}), None)
            .await
        {
            self.inner.host.notify_error(&e.to_string());
            if let Err(e) = self.disconnect_adapter(transport, json!({})).await {
                tracing::debug!(error = %e, "disconnect after failed configurationDone");
            }
        }
    }

    pub(super) fn handle_stop(&self, details: StoppedDetails) {
        self.inner.pass_focus.cancel();
        self.inner
            .model
            .lock()
            .push_stopped_details(details.clone());
        if let Some(hit) = details
            .hit_breakpoint_ids
            .as_deref()
            .filter(|ids| !ids.is_empty())
        {
            self.enable_dependent_breakpoints(hit);
        }

        let resolver = self.clone();
        let stop = details.clone();
        let thread_ids = async move {
            if let Err(e) = resolver.fetch_threads(Some(stop.clone())).await {
                tracing::debug!(session = %resolver.inner.id, error = %e, "thread fetch for stop failed");
            }
            match stop.thread_id {
                Some(id) => vec![id],
                None => resolver.inner.model.lock().thread_ids(),
            }
        };

        let weak = self.downgrade();
        let single_thread = details.thread_id.is_some();
        let preserve_focus_hint = details.preserve_focus_hint;
        let operation = move |thread_id: ThreadId, scope: CancellationScope| {
            let weak = weak.clone();
            async move {
                if let Some(session) = DebugSession::from_weak(&weak) {
                    session
                        .process_stopped_thread(thread_id, single_thread, preserve_focus_hint, scope)
                        .await;
                }
            }
        };
        tokio::spawn(self.inner.scheduler.run(thread_ids, operation));
    }

    async fn process_stopped_thread(
        &self,
        thread_id: ThreadId,
        single_thread: bool,
        preserve_focus_hint: bool,
        scope: CancellationScope,
    ) {
        let settings = &self.inner.settings;
        let (has_lots_of_threads, thread_exists) = {
            let model = self.inner.model.lock();
            (
                single_thread && model.thread_ids().len() > settings.full_stack_thread_limit,
                model.thread(thread_id).is_some(),
            )
        };

        let focused_thread_missing = self
            .inner
            .host
            .focus()
            .filter(|focus| focus.session_id == self.inner.id)
            .and_then(|focus| focus.thread_id)
            .is_some_and(|focused| self.inner.model.lock().thread(focused).is_none());
        if focused_thread_missing {
            self.inner.host.set_focus(None, FocusOptions::default());
        }

        if thread_exists {
            if let Err(e) = self.fetch_call_stack(thread_id, 1, &scope).await {
                log_stack_failure(thread_id, &e);
            }
            if !scope.is_cancelled() {
                self.focus_stopped_thread(thread_id, focused_thread_missing, preserve_focus_hint);
            }

            if !has_lots_of_threads {
                let levels = settings.call_stack_page_size.saturating_sub(1);
                if let Err(e) = self.fetch_call_stack(thread_id, levels, &scope).await {
                    log_stack_failure(thread_id, &e);
                }
            }
            if scope.is_cancelled() {
                return;
            }
            let refocus = match self.inner.host.focus() {
                None => true,
                Some(focus) => focus.frame.as_ref().is_none_or(StackFrame::is_deemphasized),
            };
            if refocus {
                self.focus_stopped_thread(thread_id, focused_thread_missing, preserve_focus_hint);
            }
        }
        self.fire_state_changed();
    }

    /// Moves focus to the top frame of `thread_id` unless another session owns the focused
    /// frame.
    fn focus_stopped_thread(
        &self,
        thread_id: ThreadId,
        focused_thread_missing: bool,
        preserve_focus_hint: bool,
    ) {
        let Some((has_frames, top)) = self
            .inner
            .model
            .lock()
            .thread(thread_id)
            .map(|t| (!t.call_stack().is_empty(), t.top_stack_frame().cloned()))
        else {
            return;
        };
        if !(focused_thread_missing || (!preserve_focus_hint && has_frames)) {
            return;
        }
        let may_take_focus = match self.inner.host.focus() {
            Some(focus) if focus.frame.is_some() => focus.session_id == self.inner.id,
            _ => true,
        };
        if !may_take_focus {
            return;
        }
        self.inner.host.set_focus(
            Some(Focus {
                session_id: self.inner.id.clone(),
                thread_id: Some(thread_id),
                frame: top,
            }),
            FocusOptions {
                preserve_focus: !self.inner.settings.focus_editor_on_break,
                explicit: false,
            },
        );
    }

    pub(super) fn handle_continued(&self, body: ContinuedEventBody) {
        let all_threads = body.all_threads_continued != Some(false);
        let thread = (!all_threads).then_some(body.thread_id);

        match thread {
            Some(thread_id) => {
                self.inner.scheduler.cancel(Some(&[thread_id]));
                self.cancel_thread_requests(thread_id);
            }
            None => {
                self.inner.scheduler.cancel(None);
                self.cancel_all_requests();
            }
        }
        {
            let mut model = self.inner.model.lock();
            model.drop_stopped_details(thread);
            model.clear_threads(false, thread);
        }
        *self.inner.last_continued_thread.lock() = thread;

        let weak = self.downgrade();
        self.inner.pass_focus.schedule(move || async move {
            if let Some(session) = DebugSession::from_weak(&weak) {
                session.pass_focus();
            }
        });
        self.fire_state_changed();
    }

    /// Hands focus to something still stopped after this session resumed.
    fn pass_focus(&self) {
        let host = &self.inner.host;
        let anything_stopped =
            host.any_session_stopped() || self.inner.model.lock().any_thread_stopped();
        if !anything_stopped {
            return;
        }
        let focus = host.focus();
        let last_continued = *self.inner.last_continued_thread.lock();
        match last_continued {
            Some(continued) => {
                let Some(focus) = focus.filter(|f| f.session_id == self.inner.id) else {
                    return;
                };
                let model = self.inner.model.lock();
                let still_running = model.thread(continued).is_some_and(|t| !t.stopped);
                if focus.thread_id != Some(continued) || !still_running {
                    return;
                }
                let next = model
                    .stopped_details()
                    .and_then(|d| d.thread_id)
                    .and_then(|id| model.thread(id))
                    .map(|t| Focus {
                        session_id: self.inner.id.clone(),
                        thread_id: Some(t.id),
                        frame: t.top_stack_frame().cloned(),
                    });
                drop(model);
                host.set_focus(next, FocusOptions::default());
            }
            None => {
                let focused_here = focus.is_some_and(|f| f.session_id == self.inner.id);
                if focused_here && self.state() != super::SessionState::Stopped {
                    host.set_focus(None, FocusOptions::default());
                }
            }
        }
    }

    fn handle_thread(&self, body: ThreadEventBody) {
        match body.reason.as_str() {
            "started" => {
                let weak = self.downgrade();
                self.inner.fetch_threads.schedule_if_idle(move || async move {
                    if let Some(session) = DebugSession::from_weak(&weak) {
                        if let Err(e) = session.fetch_threads(None).await {
                            tracing::debug!(error = %e, "thread refresh failed");
                        }
                        session.fire_state_changed();
                    }
                });
            }
            "exited" => {
                self.inner.scheduler.cancel(Some(&[body.thread_id]));
                self.inner
                    .model
                    .lock()
                    .clear_threads(true, Some(body.thread_id));
                self.inner.pass_focus.cancel();
                let host = &self.inner.host;
                if let Some(focus) = host.focus() {
                    if focus.session_id == self.inner.id && focus.thread_id == Some(body.thread_id) {
                        host.set_focus(
                            Some(Focus {
                                session_id: focus.session_id,
                                thread_id: None,
                                frame: None,
                            }),
                            FocusOptions {
                                preserve_focus: false,
                                explicit: false,
                            },
                        );
                    }
                }
                self.fire_state_changed();
            }
            other => tracing::trace!(reason = other, thread_id = body.thread_id, "thread event ignored"),
        }
    }

    fn handle_output(&self, body: OutputEventBody) {
        if !self.has_adapter() {
            return;
        }
        let category = body.category.as_deref();
        if category == Some("telemetry") {
            tracing::debug!(output = %body.output, "adapter telemetry dropped");
            return;
        }
        let severity = Severity::from_category(category);
        let important = category == Some("important");
        let source = match (&body.source, body.line) {
            (Some(raw), Some(line)) => Some(ReplSource {
                uri: self.get_source(raw).uri,
                line,
                column: body.column.unwrap_or(1),
            }),
            _ => None,
        };

        if let Some(reference) = body.variables_reference.filter(|r| *r > 0) {
            // Start the fetch now; only the append waits for its turn in the queue.
            let fetcher = self.clone();
            let children = tokio::spawn(async move {
                fetcher.variables(reference, None, None, None, None).await
            });
            let session = self.clone();
            self.inner.output.push(async move {
                let children = match children.await {
                    Ok(Ok(children)) => children,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "failed to fetch output variables");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "output variable fetch aborted");
                        return;
                    }
                };
                let repl = &session.inner.repl;
                if let [only] = children.as_slice() {
                    let name = (!body.output.trim().is_empty()).then(|| body.output.clone());
                    repl.append_variable(&session.inner.id, name, only.clone(), severity, source);
                } else {
                    for child in children {
                        repl.append_variable(&session.inner.id, None, child, severity, source.clone());
                    }
                }
                session.fire(SessionEvent::ReplElementsChanged);
            });
            return;
        }

        let session = self.clone();
        self.inner.output.push(async move {
            let repl = &session.inner.repl;
            match body.group.as_deref() {
                Some(group @ ("start" | "startCollapsed")) => {
                    repl.start_group(&session.inner.id, &body.output, group == "startCollapsed");
                    session.fire(SessionEvent::ReplElementsChanged);
                    return;
                }
                Some("end") => {
                    repl.end_group();
                    session.fire(SessionEvent::ReplElementsChanged);
                }
                _ => {}
            }
            if !body.output.is_empty() {
                session.append_to_repl(&body.output, severity, source, important);
            }
        });
    }

    fn handle_breakpoint_event(&self, body: BreakpointEventBody) {
        let store = &self.inner.breakpoints;
        let session_id = &self.inner.id;
        let local = body
            .breakpoint
            .id
            .and_then(|adapter_id| store.find_by_adapter_id(session_id, adapter_id));

        match body.reason.as_str() {
            "new" => {
                let (Some(raw), Some(line)) = (&body.breakpoint.source, body.breakpoint.line) else {
                    return;
                };
                if local.is_some() {
                    return;
                }
                let uri = self.get_source(raw).uri;
                let spec = SourceBreakpointSpec {
                    column: body.breakpoint.column,
                    ..SourceBreakpointSpec::at_line(line)
                };
                if let [id] = store.add_source_breakpoints(&uri, vec![spec]).as_slice() {
                    store.set_session_data(session_id, Some(HashMap::from([(*id, body.breakpoint)])));
                }
            }
            "changed" => {
                let Some(id) = local else {
                    return;
                };
                let mut breakpoint = body.breakpoint;
                if let Some(existing) = store.source_breakpoint(id) {
                    if existing.spec.column.is_none() {
                        breakpoint.column = None;
                    }
                }
                store.set_session_data(session_id, Some(HashMap::from([(id, breakpoint)])));
            }
            "removed" => {
                let Some(id) = local else {
                    return;
                };
                let Some((kind, uri)) = store.remove(id) else {
                    return;
                };
                let session = self.clone();
                tokio::spawn(async move {
                    let result = match (kind, uri) {
                        (BreakpointKind::Source, Some(uri)) => session.send_breakpoints(&uri, false).await,
                        (BreakpointKind::Function, _) => session.send_function_breakpoints().await,
                        (BreakpointKind::Data, _) => session.send_data_breakpoints().await,
                        (BreakpointKind::Instruction, _) => session.send_instruction_breakpoints().await,
                        (BreakpointKind::Source, None) => Ok(()),
                    };
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "failed to resend breakpoints after removal");
                    }
                });
            }
            other => tracing::debug!(reason = other, "unknown breakpoint event reason"),
        }
    }

    fn handle_terminated(&self, body: TerminatedEventBody) {
        if let Some(restart) = body.restart.filter(|r| !r.is_null() && *r != Value::Bool(false)) {
            self.inner.host.restart_session(&self.inner.id, restart);
            return;
        }
        let Some((transport, _)) = self.adapter_and_capabilities() else {
            return;
        };
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session
                .disconnect_adapter(transport, json!({ "terminateDebuggee": false }))
                .await
            {
                tracing::debug!(error = %e, "disconnect after debuggee termination failed");
            }
        });
    }

    fn handle_capabilities(&self, changes: &Value) {
        let merged = self.with_adapter(|handle| {
            handle
                .capabilities
                .merge(changes)
                .map(|()| (handle.transport.clone(), handle.capabilities.clone()))
        });
        match merged {
            Some(Ok((transport, capabilities))) => {
                transport.set_supports_cancel(capabilities.supports_cancel_request);
                *self.inner.remembered_capabilities.lock() = Some(capabilities);
            }
            Some(Err(e)) => tracing::warn!(error = %e, "ignoring malformed capabilities event"),
            None => {}
        }
    }

    fn handle_invalidated(&self, body: InvalidatedEventBody) {
        if body.invalidates_threads() {
            self.cancel_all_requests();
            let oldest = {
                let mut model = self.inner.model.lock();
                model.clear_threads(true, None);
                model.take_oldest_stop()
            };
            if let Some(details) = oldest {
                self.handle_stop(details);
            }
        }
        self.fire_state_changed();
    }

    /// Refreshes the thread list. The stop is applied only while it is still pending, so
    /// a `continued` that arrived in the meantime wins. Answers from a transport that has
    /// since been released are dropped.
    pub(super) async fn fetch_threads(&self, stopped: Option<StoppedDetails>) -> Result<()> {
        let transport = self.adapter("threads")?;
        let response: ThreadsResponse =
            decode(transport.request("threads", json!({}), None).await?)?;
        if !self.is_attached(&transport) {
            return Ok(());
        }
        let mut model = self.inner.model.lock();
        let stopped = stopped.filter(|d| model.pending_stops().contains(d));
        model.raw_update(response.threads, stopped.as_ref());
        Ok(())
    }

    /// Appends the next `levels` frames of a stopped thread's stack.
    async fn fetch_call_stack(
        &self,
        thread_id: ThreadId,
        levels: u32,
        scope: &CancellationScope,
    ) -> Result<()> {
        let start = {
            let model = self.inner.model.lock();
            match model.thread(thread_id) {
                Some(thread) if thread.stopped => thread.call_stack().len(),
                _ => return Ok(()),
            }
        };
        let response = self
            .stack_trace_within(thread_id, start as i64, i64::from(levels), Some(scope))
            .await?;
        scope.check()?;

        let frames: Vec<StackFrame> = response
            .stack_frames
            .into_iter()
            .map(|mut frame| {
                if let Some(raw) = frame.source.take() {
                    frame.source = Some(self.get_source(&raw).raw);
                }
                frame
            })
            .collect();
        if let Some(thread) = self.inner.model.lock().thread_mut(thread_id) {
            thread.set_frames(start, frames, response.total_frames);
        }
        Ok(())
    }
}

fn log_stack_failure(thread_id: ThreadId, error: &DebugError) {
    if !error.is_cancelled() {
        tracing::debug!(thread_id, error = %error, "call stack fetch failed");
    }
}
