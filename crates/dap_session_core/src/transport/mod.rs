//! The connection to a debug adapter: request/response plus an ordered event stream.

pub mod stdio;

use crate::cancellation::CancellationScope;
use crate::config::DebugConfiguration;
use crate::events::AdapterEvent;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

pub use stdio::{AdapterCommand, ProtocolLog, StdioTransport};

#[async_trait]
pub trait AdapterTransport: Send + Sync {
    /// Starts the adapter. Events become available once this returns.
    async fn start(&self) -> Result<()>;

    /// Sends `command` and resolves with the response `body` (`Value::Null` when absent).
    ///
    /// When `scope` is cancelled before the response arrives the call resolves to
    /// [`DebugError::Cancelled`](crate::DebugError::Cancelled) and, if the adapter
    /// supports it, a `cancel` request is sent for the abandoned request.
    async fn request(
        &self,
        command: &str,
        arguments: Value,
        scope: Option<CancellationScope>,
    ) -> Result<Value>;

    /// Hands out the event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<UnboundedReceiver<AdapterEvent>>;

    fn set_supports_cancel(&self, supported: bool);

    /// Releases the adapter. Safe to call more than once.
    fn dispose(&self);
}

/// Creates a fresh transport each time a session (re)initialises.
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        session_id: &str,
        configuration: &DebugConfiguration,
    ) -> Result<Arc<dyn AdapterTransport>>;
}
