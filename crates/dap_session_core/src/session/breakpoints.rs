use super::{decode, DebugSession};
use crate::breakpoints::{BreakpointId, SourceBreakpoint};
use crate::protocol::{
    self, BreakpointLocation, BreakpointLocationsResponse, DataBreakpointInfoResponse, Source,
    SetBreakpointsResponse,
};
use crate::source::{decode_source_uri, normalize_drive_letter};
use crate::{DebugError, Result};
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::watch;

impl DebugSession {
    /// Sends every enabled source breakpoint for `uri`. A session that has not seen
    /// `initialized` yet skips the request.
    pub async fn send_breakpoints(&self, uri: &str, source_modified: bool) -> Result<()> {
        let transport = self.adapter("breakpoints")?;
        if !self.is_ready_for_breakpoints() {
            return Ok(());
        }
        let breakpoints = self
            .inner
            .breakpoints
            .source_breakpoints_for_session(uri, &self.inner.id);

        let mut source = self.raw_source(uri);
        if source.adapter_data.is_none() {
            source.adapter_data = breakpoints.first().and_then(|first| {
                self.inner
                    .breakpoints
                    .session_data(&self.inner.id, first.id)
                    .and_then(|bp| bp.source)
                    .and_then(|source| source.adapter_data)
                    .or_else(|| first.adapter_data.clone())
            });
        }
        if let Some(path) = source.path.take() {
            source.path = Some(normalize_drive_letter(&path));
        }

        let arguments = json!({
            "source": source,
            "lines": breakpoints.iter().map(|bp| bp.spec.line).collect::<Vec<_>>(),
            "breakpoints": breakpoints.iter().map(SourceBreakpoint::to_dap).collect::<Vec<_>>(),
            "sourceModified": source_modified,
        });
        let response: SetBreakpointsResponse =
            decode(transport.request("setBreakpoints", arguments, None).await?)?;
        // Also recorded on the breakpoint so it outlives this adapter.
        let echoed = response
            .breakpoints
            .first()
            .and_then(|bp| bp.source.as_ref())
            .and_then(|source| source.adapter_data.clone());
        if let (Some(first), Some(data)) = (breakpoints.first(), echoed) {
            self.inner.breakpoints.set_adapter_data(first.id, Some(data));
        }
        self.store_session_data(breakpoints.iter().map(|bp| bp.id), response.breakpoints);
        Ok(())
    }

    pub async fn send_function_breakpoints(&self) -> Result<()> {
        let transport = self.adapter("function breakpoints")?;
        if !self.is_ready_for_breakpoints() || !self.capabilities().supports_function_breakpoints {
            return Ok(());
        }
        let breakpoints = self.inner.breakpoints.function_breakpoints_for_session();
        let arguments = json!({
            "breakpoints": breakpoints.iter().map(|bp| bp.to_dap()).collect::<Vec<_>>(),
        });
        let response: SetBreakpointsResponse =
            decode(transport.request("setFunctionBreakpoints", arguments, None).await?)?;
        self.store_session_data(breakpoints.iter().map(|bp| bp.id), response.breakpoints);
        Ok(())
    }

    pub async fn send_data_breakpoints(&self) -> Result<()> {
        let transport = self.adapter("data breakpoints")?;
        if !self.is_ready_for_breakpoints() || !self.capabilities().supports_data_breakpoints {
            return Ok(());
        }
        let breakpoints = self.inner.breakpoints.data_breakpoints_for_session();
        let arguments = json!({
            "breakpoints": breakpoints.iter().map(|bp| bp.to_dap()).collect::<Vec<_>>(),
        });
        let response: SetBreakpointsResponse =
            decode(transport.request("setDataBreakpoints", arguments, None).await?)?;
        self.store_session_data(breakpoints.iter().map(|bp| bp.id), response.breakpoints);
        Ok(())
    }

    pub async fn send_instruction_breakpoints(&self) -> Result<()> {
        let transport = self.adapter("instruction breakpoints")?;
        if !self.is_ready_for_breakpoints()
            || !self.capabilities().supports_instruction_breakpoints
        {
            return Ok(());
        }
        let breakpoints = self.inner.breakpoints.instruction_breakpoints_for_session();
        let arguments = json!({
            "breakpoints": breakpoints.iter().map(|bp| bp.to_dap()).collect::<Vec<_>>(),
        });
        let response: SetBreakpointsResponse =
            decode(transport.request("setInstructionBreakpoints", arguments, None).await?)?;
        self.store_session_data(breakpoints.iter().map(|bp| bp.id), response.breakpoints);
        Ok(())
    }

    pub async fn send_exception_breakpoints(&self) -> Result<()> {
        let transport = self.adapter("exception breakpoints")?;
        if !self.is_ready_for_breakpoints() {
            return Ok(());
        }
        let selection = self
            .inner
            .breakpoints
            .exception_selection_for_session(&self.inner.id);
        let arguments = if self.capabilities().supports_exception_filter_options {
            json!({ "filters": [], "filterOptions": selection.filter_options })
        } else {
            json!({ "filters": selection.filters })
        };
        transport
            .request("setExceptionBreakpoints", arguments, None)
            .await?;
        Ok(())
    }

    /// Pushes the whole breakpoint store to the adapter, as done after `initialized`.
    pub async fn send_all_breakpoints(&self) -> Result<()> {
        let uris = self.inner.breakpoints.source_uris();
        let results = join_all(uris.iter().map(|uri| self.send_breakpoints(uri, false))).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        self.send_function_breakpoints().await?;
        self.send_data_breakpoints().await?;
        self.send_instruction_breakpoints().await?;
        self.send_exception_breakpoints().await
    }

    /// Distinct positions on `line` where the adapter can place a breakpoint. A missing
    /// column means the start of the line.
    pub async fn breakpoints_locations(&self, uri: &str, line: i64) -> Result<Vec<BreakpointLocation>> {
        let transport = self.adapter("breakpoints locations")?;
        if !self.capabilities().supports_breakpoint_locations_request {
            return Ok(Vec::new());
        }
        let arguments = json!({ "source": self.raw_source(uri), "line": line });
        let response: BreakpointLocationsResponse =
            decode(transport.request("breakpointLocations", arguments, None).await?)?;

        let mut positions: Vec<BreakpointLocation> = Vec::new();
        for location in response.breakpoints {
            let position = BreakpointLocation {
                line: location.line,
                column: Some(location.column.unwrap_or(1)),
                end_line: None,
                end_column: None,
            };
            if !positions.contains(&position) {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    pub async fn data_breakpoint_info(
        &self,
        name: &str,
        variables_reference: Option<i64>,
        frame_id: Option<i64>,
    ) -> Result<DataBreakpointInfoResponse> {
        let mut arguments = json!({ "name": name });
        if let Some(reference) = variables_reference {
            arguments["variablesReference"] = json!(reference);
        }
        if let Some(frame_id) = frame_id {
            arguments["frameId"] = json!(frame_id);
        }
        self.request_data_breakpoint_info(arguments, |c| c.supports_data_breakpoints)
            .await
    }

    /// Info for a data breakpoint on `bytes` bytes at a raw memory address.
    pub async fn data_bytes_breakpoint_info(
        &self,
        address: &str,
        bytes: u64,
    ) -> Result<DataBreakpointInfoResponse> {
        let arguments = json!({ "name": address, "bytes": bytes, "asAddress": true });
        self.request_data_breakpoint_info(arguments, |c| {
            c.supports_data_breakpoints && c.supports_data_breakpoint_bytes
        })
        .await
    }

    async fn request_data_breakpoint_info(
        &self,
        arguments: Value,
        supported: impl FnOnce(&protocol::Capabilities) -> bool,
    ) -> Result<DataBreakpointInfoResponse> {
        let transport = self.capable_adapter("dataBreakpointInfo", supported)?;
        if !self.is_ready_for_breakpoints() {
            return Err(DebugError::NotReadyForBreakpoints);
        }
        decode(transport.request("dataBreakpointInfo", arguments, None).await?)
    }

    /// Activates breakpoints waiting on any of `hit` and resends their sources. Resuming
    /// commands wait (bounded) for the resend to finish.
    pub(super) fn enable_dependent_breakpoints(&self, hit: &[i64]) {
        let store = &self.inner.breakpoints;
        let session_id = &self.inner.id;
        let hit: Vec<BreakpointId> = hit
            .iter()
            .filter_map(|adapter_id| store.find_by_adapter_id(session_id, *adapter_id))
            .collect();

        let mut uris: Vec<String> = Vec::new();
        for dependent in store.dependents_of(&hit) {
            if store.did_trigger(session_id, dependent) {
                continue;
            }
            if let Some(uri) = store.mark_triggered(session_id, dependent) {
                if !uris.contains(&uri) {
                    uris.push(uri);
                }
            }
        }
        if uris.is_empty() {
            return;
        }

        let (done, wait) = watch::channel(false);
        *self.inner.wait_to_resume.lock() = Some(wait);
        let session = self.clone();
        tokio::spawn(async move {
            let results = join_all(uris.iter().map(|uri| session.send_breakpoints(uri, false))).await;
            for (uri, result) in uris.iter().zip(results) {
                if let Err(e) = result {
                    tracing::warn!(uri = %uri, error = %e, "failed to install triggered breakpoints");
                }
            }
            let _ = done.send(true);
        });
    }

    /// Waits, up to the configured bound, for dependent breakpoints to reach the adapter.
    pub(super) async fn wait_for_triggered_breakpoints(&self) {
        let Some(mut wait) = self.inner.wait_to_resume.lock().clone() else {
            return;
        };
        let bound = self.inner.settings.triggered_breakpoint_max_delay;
        let finished = tokio::time::timeout(bound, async {
            let _ = wait.wait_for(|done| *done).await;
        })
        .await;
        if finished.is_err() {
            tracing::debug!(session = %self.inner.id, "resuming before triggered breakpoints were installed");
        }
    }

    fn raw_source(&self, uri: &str) -> Source {
        self.source_for_uri(uri)
            .unwrap_or_else(|| decode_source_uri(uri))
    }

    fn store_session_data(
        &self,
        ids: impl Iterator<Item = BreakpointId>,
        results: Vec<protocol::Breakpoint>,
    ) {
        let data: HashMap<BreakpointId, protocol::Breakpoint> = ids.zip(results).collect();
        self.inner
            .breakpoints
            .set_session_data(&self.inner.id, Some(data));
    }
}
