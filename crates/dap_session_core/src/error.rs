use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DebugError {
    #[error("No debugger available, can not send '{operation}'")]
    NoAdapter { operation: String },

    #[error("DAP request '{command}' failed: {message}")]
    Adapter { command: String, message: String },

    #[error("Timeout while waiting for DAP response to '{command}' after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Session is not ready for breakpoints")]
    NotReadyForBreakpoints,

    #[error("Parent session is inactive")]
    ParentInactive,

    #[error("Request '{0}' is not supported by the debug adapter")]
    Unsupported(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DebugError {
    pub fn no_adapter(operation: impl Into<String>) -> Self {
        Self::NoAdapter {
            operation: operation.into(),
        }
    }

    pub fn adapter(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Adapter {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
