//! DAP Session Core
//!
//! Drives one debugging session against an external Debug Adapter Protocol adapter:
//! adapter lifecycle, breakpoint synchronisation, thread and call stack tracking with
//! cancellation of stale per-thread work, and an ordered console transcript.

pub mod breakpoints;
pub mod cancellation;
pub mod config;
pub mod debounce;
pub mod error;
pub mod events;
pub mod host;
pub mod model;
pub mod protocol;
pub mod repl;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod teardown;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// Re-export commonly used types
pub use breakpoints::{BreakpointId, BreakpointStore, SourceBreakpointSpec};
pub use cancellation::CancellationScope;
pub use config::{DebugConfiguration, ReplMode, RequestKind, SessionSettings};
pub use error::DebugError;
pub use events::{AdapterEvent, SessionEvent};
pub use host::{DebugHost, Focus, FocusOptions, ViewModel};
pub use scheduler::ThreadStatusScheduler;
pub use session::{DebugSession, ResolvedLocation, SessionContext, SessionOptions, SessionState};
pub use transport::{AdapterCommand, AdapterFactory, AdapterTransport, StdioTransport};

/// Result type alias using DebugError
pub type Result<T> = std::result::Result<T, DebugError>;
