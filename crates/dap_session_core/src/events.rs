use crate::model::ResolvedSource;
use crate::protocol::{Breakpoint, Source, StoppedDetails, ThreadId};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuedEventBody {
    pub thread_id: ThreadId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_threads_continued: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEventBody {
    pub reason: String,
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEventBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables_reference: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointEventBody {
    pub reason: String,
    pub breakpoint: Breakpoint,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedSourceEventBody {
    pub reason: String,
    pub source: Source,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminatedEventBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStartEventBody {
    pub progress_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<i64>,
    #[serde(default)]
    pub cancellable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdateEventBody {
    pub progress_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEndEventBody {
    pub progress_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidatedEventBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub areas: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_frame_id: Option<i64>,
}

impl InvalidatedEventBody {
    /// Thread and stack state must be refetched for `threads`, `stacks` or `all` (the default).
    pub fn invalidates_threads(&self) -> bool {
        match &self.areas {
            None => true,
            Some(areas) if areas.is_empty() => true,
            Some(areas) => areas
                .iter()
                .any(|a| a == "threads" || a == "stacks" || a == "all"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEventBody {
    pub memory_reference: String,
    pub offset: i64,
    pub count: i64,
}

/// Why the adapter connection ended, when known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterExit {
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Events arriving from the debug adapter, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Initialized,
    Stopped(StoppedDetails),
    Continued(ContinuedEventBody),
    Thread(ThreadEventBody),
    Output(OutputEventBody),
    Breakpoint(BreakpointEventBody),
    LoadedSource(LoadedSourceEventBody),
    Terminated(TerminatedEventBody),
    Exited { exit_code: i64 },
    Capabilities(Value),
    ProgressStart(ProgressStartEventBody),
    ProgressUpdate(ProgressUpdateEventBody),
    ProgressEnd(ProgressEndEventBody),
    Invalidated(InvalidatedEventBody),
    Memory(MemoryEventBody),
    Custom { event: String, body: Value },
    /// Synthesised by the transport when the adapter process or connection goes away.
    AdapterExited(AdapterExit),
}

impl AdapterEvent {
    pub fn parse(event: &str, body: Value) -> Result<Self> {
        Ok(match event {
            "initialized" => Self::Initialized,
            "stopped" => Self::Stopped(serde_json::from_value(body)?),
            "continued" => Self::Continued(serde_json::from_value(body)?),
            "thread" => Self::Thread(serde_json::from_value(body)?),
            "output" => Self::Output(serde_json::from_value(body)?),
            "breakpoint" => Self::Breakpoint(serde_json::from_value(body)?),
            "loadedSource" => Self::LoadedSource(serde_json::from_value(body)?),
            "terminated" => Self::Terminated(if body.is_null() {
                TerminatedEventBody::default()
            } else {
                serde_json::from_value(body)?
            }),
            "exited" => Self::Exited {
                exit_code: body.get("exitCode").and_then(Value::as_i64).unwrap_or(0),
            },
            "capabilities" => Self::Capabilities(
                body.get("capabilities").cloned().unwrap_or(Value::Null),
            ),
            "progressStart" => Self::ProgressStart(serde_json::from_value(body)?),
            "progressUpdate" => Self::ProgressUpdate(serde_json::from_value(body)?),
            "progressEnd" => Self::ProgressEnd(serde_json::from_value(body)?),
            "invalidated" => Self::Invalidated(if body.is_null() {
                InvalidatedEventBody::default()
            } else {
                serde_json::from_value(body)?
            }),
            "memory" => Self::Memory(serde_json::from_value(body)?),
            _ => Self::Custom {
                event: event.to_string(),
                body,
            },
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Initialized => "initialized",
            Self::Stopped(_) => "stopped",
            Self::Continued(_) => "continued",
            Self::Thread(_) => "thread",
            Self::Output(_) => "output",
            Self::Breakpoint(_) => "breakpoint",
            Self::LoadedSource(_) => "loadedSource",
            Self::Terminated(_) => "terminated",
            Self::Exited { .. } => "exited",
            Self::Capabilities(_) => "capabilities",
            Self::ProgressStart(_) => "progressStart",
            Self::ProgressUpdate(_) => "progressUpdate",
            Self::ProgressEnd(_) => "progressEnd",
            Self::Invalidated(_) => "invalidated",
            Self::Memory(_) => "memory",
            Self::Custom { event, .. } => event,
            Self::AdapterExited(_) => "adapterExited",
        }
    }
}

/// Change notifications published by a session to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged,
    AdapterEnded(Option<AdapterExit>),
    CustomEvent { event: String, body: Value },
    LoadedSource { reason: String, source: ResolvedSource },
    ProgressStart(ProgressStartEventBody),
    ProgressUpdate(ProgressUpdateEventBody),
    ProgressEnd(ProgressEndEventBody),
    InvalidateMemory(MemoryEventBody),
    ReplElementsChanged,
    NameChanged(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_stopped_event() {
        let event = AdapterEvent::parse(
            "stopped",
            json!({
                "reason": "breakpoint",
                "threadId": 5,
                "allThreadsStopped": true,
                "hitBreakpointIds": [3]
            }),
        )
        .expect("stopped should parse");

        match event {
            AdapterEvent::Stopped(details) => {
                assert_eq!(details.reason, "breakpoint");
                assert_eq!(details.thread_id, Some(5));
                assert!(details.all_threads_stopped);
                assert_eq!(details.hit_breakpoint_ids, Some(vec![3]));
            }
            other => panic!("Expected Stopped, got {other:?}"),
        }
    }

    #[test]
    fn parse_terminated_without_body() {
        let event = AdapterEvent::parse("terminated", Value::Null).expect("should parse");
        assert_eq!(event, AdapterEvent::Terminated(TerminatedEventBody::default()));
    }

    #[test]
    fn unknown_events_become_custom() {
        let event = AdapterEvent::parse("rust-analyzer/hello", json!({"x": 1}))
            .expect("custom should parse");
        assert_eq!(event.name(), "rust-analyzer/hello");
        assert!(matches!(event, AdapterEvent::Custom { .. }));
    }

    #[test]
    fn malformed_known_event_is_an_error() {
        assert!(AdapterEvent::parse("thread", json!({"reason": "started"})).is_err());
    }

    #[test]
    fn invalidated_defaults_to_all_areas() {
        assert!(InvalidatedEventBody::default().invalidates_threads());
        let variables_only = InvalidatedEventBody {
            areas: Some(vec!["variables".into()]),
            ..Default::default()
        };
        assert!(!variables_only.invalidates_threads());
    }
}
