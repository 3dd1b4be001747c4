//! Breakpoint definitions shared by every session of a workbench, plus the adapter-scoped
//! data each session learns about them.
//!
//! Definitions are keyed by a locally generated [`BreakpointId`]. Whatever an adapter
//! reports back (its own id, verification, the resolved line) is only valid for the
//! `(session id, breakpoint id)` pair it arrived with and is dropped wholesale when that
//! session's adapter goes away.

use crate::protocol::{self, BreakpointMode, ExceptionBreakpointsFilter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BreakpointId(pub u64);

impl std::fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bp-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Source,
    Function,
    Data,
    Instruction,
}

fn insert_opt<T: Serialize>(map: &mut Map<String, Value>, key: &str, value: &Option<T>) {
    if let Some(value) = value {
        map.insert(key.to_string(), json!(value));
    }
}

/// Options for a new source breakpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceBreakpointSpec {
    pub line: i64,
    #[serde(default)]
    pub column: Option<i64>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    #[serde(default)]
    pub log_message: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub triggered_by: Option<BreakpointId>,
}

impl SourceBreakpointSpec {
    pub fn at_line(line: i64) -> Self {
        Self {
            line,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceBreakpoint {
    pub id: BreakpointId,
    pub uri: String,
    pub enabled: bool,
    pub spec: SourceBreakpointSpec,
    pub adapter_data: Option<Value>,
}

impl SourceBreakpoint {
    pub fn to_dap(&self) -> Value {
        let mut mapped = Map::new();
        mapped.insert("line".to_string(), json!(self.spec.line));
        insert_opt(&mut mapped, "column", &self.spec.column);
        insert_opt(&mut mapped, "condition", &self.spec.condition);
        insert_opt(&mut mapped, "hitCondition", &self.spec.hit_condition);
        insert_opt(&mut mapped, "logMessage", &self.spec.log_message);
        insert_opt(&mut mapped, "mode", &self.spec.mode);
        Value::Object(mapped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBreakpoint {
    pub id: BreakpointId,
    pub name: String,
    pub enabled: bool,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
}

impl FunctionBreakpoint {
    pub fn to_dap(&self) -> Value {
        let mut mapped = Map::new();
        mapped.insert("name".to_string(), json!(self.name));
        insert_opt(&mut mapped, "condition", &self.condition);
        insert_opt(&mut mapped, "hitCondition", &self.hit_condition);
        Value::Object(mapped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataBreakpoint {
    pub id: BreakpointId,
    pub data_id: String,
    pub description: String,
    pub access_type: Option<String>,
    pub enabled: bool,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
}

impl DataBreakpoint {
    pub fn to_dap(&self) -> Value {
        let mut mapped = Map::new();
        mapped.insert("dataId".to_string(), json!(self.data_id));
        insert_opt(&mut mapped, "accessType", &self.access_type);
        insert_opt(&mut mapped, "condition", &self.condition);
        insert_opt(&mut mapped, "hitCondition", &self.hit_condition);
        Value::Object(mapped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstructionBreakpoint {
    pub id: BreakpointId,
    pub instruction_reference: String,
    pub offset: Option<i64>,
    pub enabled: bool,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub mode: Option<String>,
}

impl InstructionBreakpoint {
    pub fn to_dap(&self) -> Value {
        let mut mapped = Map::new();
        mapped.insert(
            "instructionReference".to_string(),
            json!(self.instruction_reference),
        );
        insert_opt(&mut mapped, "offset", &self.offset);
        insert_opt(&mut mapped, "condition", &self.condition);
        insert_opt(&mut mapped, "hitCondition", &self.hit_condition);
        insert_opt(&mut mapped, "mode", &self.mode);
        Value::Object(mapped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionBreakpoint {
    pub filter: ExceptionBreakpointsFilter,
    pub enabled: bool,
    pub condition: Option<String>,
    supported_sessions: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionFilterOptions {
    pub filter_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Exception settings to send to one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExceptionSelection {
    pub filters: Vec<String>,
    pub filter_options: Vec<ExceptionFilterOptions>,
}

#[derive(Debug, Default)]
struct StoreInner {
    activated: bool,
    source: Vec<SourceBreakpoint>,
    function: Vec<FunctionBreakpoint>,
    data: Vec<DataBreakpoint>,
    instruction: Vec<InstructionBreakpoint>,
    exception: Vec<ExceptionBreakpoint>,
    modes: HashMap<String, Vec<BreakpointMode>>,
    session_data: HashMap<String, HashMap<BreakpointId, protocol::Breakpoint>>,
    triggered: HashMap<BreakpointId, HashSet<String>>,
}

impl StoreInner {
    /// Enabled, and not waiting on a trigger that has not fired in `session_id`.
    fn is_active_source(&self, bp: &SourceBreakpoint, session_id: &str) -> bool {
        bp.enabled
            && match bp.spec.triggered_by {
                None => true,
                Some(_) => self
                    .triggered
                    .get(&bp.id)
                    .is_some_and(|sessions| sessions.contains(session_id)),
            }
    }

    fn kind_of(&self, id: BreakpointId) -> Option<BreakpointKind> {
        if self.source.iter().any(|b| b.id == id) {
            Some(BreakpointKind::Source)
        } else if self.function.iter().any(|b| b.id == id) {
            Some(BreakpointKind::Function)
        } else if self.data.iter().any(|b| b.id == id) {
            Some(BreakpointKind::Data)
        } else if self.instruction.iter().any(|b| b.id == id) {
            Some(BreakpointKind::Instruction)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub struct BreakpointStore {
    next_id: AtomicU64,
    inner: Mutex<StoreInner>,
}

impl Default for BreakpointStore {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(StoreInner {
                activated: true,
                ..StoreInner::default()
            }),
        }
    }
}

impl BreakpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> BreakpointId {
        BreakpointId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn set_activated(&self, activated: bool) {
        self.inner.lock().activated = activated;
    }

    pub fn activated(&self) -> bool {
        self.inner.lock().activated
    }

    pub fn add_source_breakpoints(
        &self,
        uri: &str,
        specs: Vec<SourceBreakpointSpec>,
    ) -> Vec<BreakpointId> {
        let mut inner = self.inner.lock();
        specs
            .into_iter()
            .map(|spec| {
                let id = self.allocate_id();
                inner.source.push(SourceBreakpoint {
                    id,
                    uri: uri.to_string(),
                    enabled: true,
                    spec,
                    adapter_data: None,
                });
                id
            })
            .collect()
    }

    pub fn add_function_breakpoint(&self, name: impl Into<String>) -> BreakpointId {
        let id = self.allocate_id();
        self.inner.lock().function.push(FunctionBreakpoint {
            id,
            name: name.into(),
            enabled: true,
            condition: None,
            hit_condition: None,
        });
        id
    }

    pub fn add_data_breakpoint(
        &self,
        data_id: impl Into<String>,
        description: impl Into<String>,
        access_type: Option<String>,
    ) -> BreakpointId {
        let id = self.allocate_id();
        self.inner.lock().data.push(DataBreakpoint {
            id,
            data_id: data_id.into(),
            description: description.into(),
            access_type,
            enabled: true,
            condition: None,
            hit_condition: None,
        });
        id
    }

    pub fn add_instruction_breakpoint(
        &self,
        instruction_reference: impl Into<String>,
        offset: Option<i64>,
    ) -> BreakpointId {
        let id = self.allocate_id();
        self.inner.lock().instruction.push(InstructionBreakpoint {
            id,
            instruction_reference: instruction_reference.into(),
            offset,
            enabled: true,
            condition: None,
            hit_condition: None,
            mode: None,
        });
        id
    }

    /// Removes a breakpoint of any kind. Returns the kind and, for source breakpoints, the URI.
    pub fn remove(&self, id: BreakpointId) -> Option<(BreakpointKind, Option<String>)> {
        let mut inner = self.inner.lock();
        let kind = inner.kind_of(id)?;
        let mut uri = None;
        match kind {
            BreakpointKind::Source => {
                uri = inner.source.iter().find(|b| b.id == id).map(|b| b.uri.clone());
                inner.source.retain(|b| b.id != id);
            }
            BreakpointKind::Function => inner.function.retain(|b| b.id != id),
            BreakpointKind::Data => inner.data.retain(|b| b.id != id),
            BreakpointKind::Instruction => inner.instruction.retain(|b| b.id != id),
        }
        for data in inner.session_data.values_mut() {
            data.remove(&id);
        }
        inner.triggered.remove(&id);
        Some((kind, uri))
    }

    /// Drops every source breakpoint in `uri`, returning the removed ids.
    pub fn remove_source_breakpoints(&self, uri: &str) -> Vec<BreakpointId> {
        let ids: Vec<BreakpointId> = {
            let inner = self.inner.lock();
            inner
                .source
                .iter()
                .filter(|b| b.uri == uri)
                .map(|b| b.id)
                .collect()
        };
        ids.into_iter().filter(|id| self.remove(*id).is_some()).collect()
    }

    pub fn remove_function_breakpoints(&self) -> usize {
        let ids: Vec<BreakpointId> = self.inner.lock().function.iter().map(|b| b.id).collect();
        ids.into_iter().filter(|id| self.remove(*id).is_some()).count()
    }

    pub fn set_enabled(&self, id: BreakpointId, enabled: bool) -> bool {
        let mut inner = self.inner.lock();
        if let Some(bp) = inner.source.iter_mut().find(|b| b.id == id) {
            bp.enabled = enabled;
        } else if let Some(bp) = inner.function.iter_mut().find(|b| b.id == id) {
            bp.enabled = enabled;
        } else if let Some(bp) = inner.data.iter_mut().find(|b| b.id == id) {
            bp.enabled = enabled;
        } else if let Some(bp) = inner.instruction.iter_mut().find(|b| b.id == id) {
            bp.enabled = enabled;
        } else {
            return false;
        }
        true
    }

    pub fn kind_of(&self, id: BreakpointId) -> Option<BreakpointKind> {
        self.inner.lock().kind_of(id)
    }

    pub fn source_breakpoint(&self, id: BreakpointId) -> Option<SourceBreakpoint> {
        self.inner.lock().source.iter().find(|b| b.id == id).cloned()
    }

    /// Every URI that has at least one source breakpoint.
    pub fn source_uris(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut uris: Vec<String> = Vec::new();
        for bp in &inner.source {
            if !uris.contains(&bp.uri) {
                uris.push(bp.uri.clone());
            }
        }
        uris
    }

    /// Source breakpoints in `uri` that `session_id` should currently have installed.
    pub fn source_breakpoints_for_session(&self, uri: &str, session_id: &str) -> Vec<SourceBreakpoint> {
        let inner = self.inner.lock();
        if !inner.activated {
            return Vec::new();
        }
        inner
            .source
            .iter()
            .filter(|bp| bp.uri == uri && inner.is_active_source(bp, session_id))
            .cloned()
            .collect()
    }

    pub fn function_breakpoints_for_session(&self) -> Vec<FunctionBreakpoint> {
        let inner = self.inner.lock();
        if !inner.activated {
            return Vec::new();
        }
        inner.function.iter().filter(|b| b.enabled).cloned().collect()
    }

    pub fn data_breakpoints_for_session(&self) -> Vec<DataBreakpoint> {
        let inner = self.inner.lock();
        if !inner.activated {
            return Vec::new();
        }
        inner.data.iter().filter(|b| b.enabled).cloned().collect()
    }

    pub fn instruction_breakpoints_for_session(&self) -> Vec<InstructionBreakpoint> {
        let inner = self.inner.lock();
        if !inner.activated {
            return Vec::new();
        }
        inner.instruction.iter().filter(|b| b.enabled).cloned().collect()
    }

    /// Records the filters an adapter advertised. New filters start in their default state.
    pub fn set_exception_filters_for_session(
        &self,
        session_id: &str,
        filters: &[ExceptionBreakpointsFilter],
    ) {
        let mut inner = self.inner.lock();
        for filter in filters {
            match inner
                .exception
                .iter_mut()
                .find(|e| e.filter.filter == filter.filter)
            {
                Some(existing) => {
                    existing.supported_sessions.insert(session_id.to_string());
                }
                None => inner.exception.push(ExceptionBreakpoint {
                    filter: filter.clone(),
                    enabled: filter.default,
                    condition: None,
                    supported_sessions: BTreeSet::from([session_id.to_string()]),
                }),
            }
        }
    }

    pub fn set_exception_filter_enabled(&self, filter: &str, enabled: bool, condition: Option<String>) -> bool {
        let mut inner = self.inner.lock();
        match inner.exception.iter_mut().find(|e| e.filter.filter == filter) {
            Some(exception) => {
                exception.enabled = enabled;
                exception.condition = condition;
                true
            }
            None => false,
        }
    }

    pub fn exception_selection_for_session(&self, session_id: &str) -> ExceptionSelection {
        let inner = self.inner.lock();
        let mut selection = ExceptionSelection::default();
        if !inner.activated {
            return selection;
        }
        for exception in inner
            .exception
            .iter()
            .filter(|e| e.enabled && e.supported_sessions.contains(session_id))
        {
            selection.filters.push(exception.filter.filter.clone());
            selection.filter_options.push(ExceptionFilterOptions {
                filter_id: exception.filter.filter.clone(),
                condition: exception.condition.clone(),
                mode: None,
            });
        }
        selection
    }

    pub fn register_breakpoint_modes(&self, adapter_type: &str, modes: &[BreakpointMode]) {
        self.inner
            .lock()
            .modes
            .insert(adapter_type.to_string(), modes.to_vec());
    }

    pub fn breakpoint_modes(&self, adapter_type: &str) -> Vec<BreakpointMode> {
        self.inner
            .lock()
            .modes
            .get(adapter_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Stores adapter results for `session_id`. `None` drops everything known for that session.
    pub fn set_session_data(
        &self,
        session_id: &str,
        data: Option<HashMap<BreakpointId, protocol::Breakpoint>>,
    ) {
        let mut inner = self.inner.lock();
        match data {
            None => {
                inner.session_data.remove(session_id);
                for sessions in inner.triggered.values_mut() {
                    sessions.remove(session_id);
                }
            }
            Some(data) => {
                let entry = inner.session_data.entry(session_id.to_string()).or_default();
                for (id, breakpoint) in data {
                    entry.insert(id, breakpoint);
                }
            }
        }
    }

    pub fn session_data(&self, session_id: &str, id: BreakpointId) -> Option<protocol::Breakpoint> {
        self.inner
            .lock()
            .session_data
            .get(session_id)
            .and_then(|data| data.get(&id))
            .cloned()
    }

    /// Maps an adapter-assigned breakpoint id back to the local id for this session.
    pub fn find_by_adapter_id(&self, session_id: &str, adapter_id: i64) -> Option<BreakpointId> {
        let inner = self.inner.lock();
        inner.session_data.get(session_id).and_then(|data| {
            data.iter()
                .find(|(_, bp)| bp.id == Some(adapter_id))
                .map(|(id, _)| *id)
        })
    }

    /// Enabled breakpoints configured to activate once one of `hit` has fired.
    pub fn dependents_of(&self, hit: &[BreakpointId]) -> Vec<BreakpointId> {
        let inner = self.inner.lock();
        inner
            .source
            .iter()
            .filter(|bp| bp.enabled && bp.spec.triggered_by.is_some_and(|t| hit.contains(&t)))
            .map(|bp| bp.id)
            .collect()
    }

    /// Activates a dependent breakpoint for one session and returns its URI.
    pub fn mark_triggered(&self, session_id: &str, id: BreakpointId) -> Option<String> {
        let mut inner = self.inner.lock();
        let uri = inner.source.iter().find(|b| b.id == id)?.uri.clone();
        inner
            .triggered
            .entry(id)
            .or_default()
            .insert(session_id.to_string());
        Some(uri)
    }

    pub fn did_trigger(&self, session_id: &str, id: BreakpointId) -> bool {
        self.inner
            .lock()
            .triggered
            .get(&id)
            .is_some_and(|sessions| sessions.contains(session_id))
    }

    pub fn set_adapter_data(&self, id: BreakpointId, adapter_data: Option<Value>) {
        if let Some(bp) = self.inner.lock().source.iter_mut().find(|b| b.id == id) {
            bp.adapter_data = adapter_data;
        }
    }
}
