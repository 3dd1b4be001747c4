use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Timing and behaviour knobs for a debug session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Upper bound for waiting on dependent breakpoints before resuming.
    pub triggered_breakpoint_max_delay: Duration,
    pub thread_refresh_debounce: Duration,
    pub pass_focus_delay: Duration,
    /// Above this many threads only the top frame is fetched on a single-thread stop.
    pub full_stack_thread_limit: usize,
    pub call_stack_page_size: u32,
    pub focus_editor_on_break: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            triggered_breakpoint_max_delay: Duration::from_millis(1500),
            thread_refresh_debounce: Duration::from_millis(100),
            pass_focus_delay: Duration::from_millis(800),
            full_stack_thread_limit: 10,
            call_stack_page_size: 20,
            focus_editor_on_break: true,
        }
    }
}

impl SessionSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: env_millis("DAP_REQUEST_TIMEOUT_MS").unwrap_or(defaults.request_timeout),
            triggered_breakpoint_max_delay: env_millis("DAP_TRIGGERED_BREAKPOINT_DELAY_MS")
                .unwrap_or(defaults.triggered_breakpoint_max_delay),
            pass_focus_delay: env_millis("DAP_PASS_FOCUS_DELAY_MS")
                .unwrap_or(defaults.pass_focus_delay),
            ..defaults
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Launch,
    Attach,
}

impl RequestKind {
    pub fn command(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Attach => "attach",
        }
    }
}

/// A resolved launch configuration. Adapter specific fields are passed through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfiguration {
    pub name: String,
    #[serde(rename = "type")]
    pub adapter_type: String,
    pub request: RequestKind,
    #[serde(default, rename = "noDebug")]
    pub no_debug: bool,
    #[serde(default, rename = "__restart", skip_serializing_if = "Option::is_none")]
    pub restart_data: Option<Value>,
    #[serde(flatten)]
    pub adapter_fields: Map<String, Value>,
}

impl DebugConfiguration {
    pub fn new(name: impl Into<String>, adapter_type: impl Into<String>, request: RequestKind) -> Self {
        Self {
            name: name.into(),
            adapter_type: adapter_type.into(),
            request,
            no_debug: false,
            restart_data: None,
            adapter_fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.adapter_fields.insert(key.into(), value);
        self
    }

    /// Arguments for the launch/attach request, tagged with the owning session id.
    pub fn to_request_arguments(&self, session_id: &str) -> Value {
        let mut args = self.adapter_fields.clone();
        args.insert("name".to_string(), Value::String(self.name.clone()));
        args.insert("type".to_string(), Value::String(self.adapter_type.clone()));
        args.insert(
            "request".to_string(),
            Value::String(self.request.command().to_string()),
        );
        if self.no_debug {
            args.insert("noDebug".to_string(), Value::Bool(true));
        }
        if let Some(restart) = &self.restart_data {
            args.insert("__restart".to_string(), restart.clone());
        }
        args.insert(
            "__sessionId".to_string(),
            Value::String(session_id.to_string()),
        );
        Value::Object(args)
    }
}

/// Whether a child session writes into its parent's console.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplMode {
    #[default]
    Shared,
    Separate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_settings() {
        let settings = SessionSettings::default();
        assert_eq!(settings.request_timeout, Duration::from_secs(10));
        assert_eq!(settings.triggered_breakpoint_max_delay, Duration::from_millis(1500));
        assert_eq!(settings.thread_refresh_debounce, Duration::from_millis(100));
        assert_eq!(settings.pass_focus_delay, Duration::from_millis(800));
    }

    #[test]
    fn test_from_env_custom() {
        std::env::set_var("DAP_PASS_FOCUS_DELAY_MS", "250");

        let settings = SessionSettings::from_env();
        assert_eq!(settings.pass_focus_delay, Duration::from_millis(250));

        std::env::remove_var("DAP_PASS_FOCUS_DELAY_MS");
    }

    #[test]
    fn test_request_arguments_flatten_adapter_fields() {
        let config = DebugConfiguration::new("Run tests", "lldb", RequestKind::Launch)
            .with_field("program", json!("/bin/true"))
            .with_field("stopOnEntry", json!(true));

        let args = config.to_request_arguments("session-1");
        assert_eq!(args["program"], json!("/bin/true"));
        assert_eq!(args["stopOnEntry"], json!(true));
        assert_eq!(args["request"], json!("launch"));
        assert_eq!(args["__sessionId"], json!("session-1"));
        assert!(args.get("noDebug").is_none());
    }

    #[test]
    fn test_configuration_deserializes_from_launch_json_shape() {
        let config: DebugConfiguration = serde_json::from_value(json!({
            "name": "Attach",
            "type": "python",
            "request": "attach",
            "port": 5678
        }))
        .expect("configuration should parse");

        assert_eq!(config.request, RequestKind::Attach);
        assert_eq!(config.adapter_fields.get("port"), Some(&json!(5678)));
    }
}
