//! The workbench a session reports to: focus, notifications and cross-session state.

use crate::protocol::{StackFrame, ThreadId};
use crate::session::SessionState;
use crate::source::{PathIdentity, UriIdentity};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// What the user is currently looking at.
#[derive(Debug, Clone, PartialEq)]
pub struct Focus {
    pub session_id: String,
    pub thread_id: Option<ThreadId>,
    pub frame: Option<StackFrame>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FocusOptions {
    /// Move focus without revealing the frame's source.
    pub preserve_focus: bool,
    /// The user asked for this focus change directly.
    pub explicit: bool,
}

/// Side effects a session needs from its owner. All methods are synchronous and must not
/// call back into the session.
pub trait DebugHost: Send + Sync {
    fn focus(&self) -> Option<Focus>;

    /// `None` hands the choice back to the host, which may pick another stopped session
    /// or clear focus.
    fn set_focus(&self, focus: Option<Focus>, options: FocusOptions);

    fn session_state_changed(&self, session_id: &str, state: SessionState);

    fn any_session_stopped(&self) -> bool;

    fn notify_error(&self, message: &str);

    /// The adapter terminated the debuggee and asked to be restarted with `restart` data.
    fn restart_session(&self, session_id: &str, restart: Value);

    fn important_output(&self, _message: &str) {}

    fn uri_identity(&self) -> Arc<dyn UriIdentity> {
        Arc::new(PathIdentity)
    }
}

#[derive(Debug, Default)]
struct ViewState {
    focus: Option<Focus>,
    history: Vec<Option<Focus>>,
    states: HashMap<String, SessionState>,
    errors: Vec<String>,
    restarts: Vec<(String, Value)>,
    important: Vec<String>,
}

/// In-memory host that records what sessions asked of it.
#[derive(Debug, Default)]
pub struct ViewModel {
    state: Mutex<ViewState>,
}

impl ViewModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every focus change in order, including clears.
    pub fn focus_history(&self) -> Vec<Option<Focus>> {
        self.state.lock().history.clone()
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.state.lock().states.get(session_id).copied()
    }

    pub fn errors(&self) -> Vec<String> {
        self.state.lock().errors.clone()
    }

    pub fn restarts(&self) -> Vec<(String, Value)> {
        self.state.lock().restarts.clone()
    }

    pub fn important_messages(&self) -> Vec<String> {
        self.state.lock().important.clone()
    }
}

impl DebugHost for ViewModel {
    fn focus(&self) -> Option<Focus> {
        self.state.lock().focus.clone()
    }

    fn set_focus(&self, focus: Option<Focus>, _options: FocusOptions) {
        let mut state = self.state.lock();
        state.history.push(focus.clone());
        state.focus = focus;
    }

    fn session_state_changed(&self, session_id: &str, state: SessionState) {
        self.state
            .lock()
            .states
            .insert(session_id.to_string(), state);
    }

    fn any_session_stopped(&self) -> bool {
        self.state
            .lock()
            .states
            .values()
            .any(|s| *s == SessionState::Stopped)
    }

    fn notify_error(&self, message: &str) {
        tracing::warn!(message, "debug session error");
        self.state.lock().errors.push(message.to_string());
    }

    fn restart_session(&self, session_id: &str, restart: Value) {
        self.state
            .lock()
            .restarts
            .push((session_id.to_string(), restart));
    }

    fn important_output(&self, message: &str) {
        self.state.lock().important.push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_model_tracks_focus_history() {
        let view = ViewModel::new();
        let focus = Focus {
            session_id: "s1".into(),
            thread_id: Some(7),
            frame: None,
        };

        view.set_focus(Some(focus.clone()), FocusOptions::default());
        view.set_focus(None, FocusOptions::default());

        assert_eq!(view.focus(), None);
        assert_eq!(view.focus_history(), vec![Some(focus), None]);
    }

    #[test]
    fn any_session_stopped_reflects_reported_states() {
        let view = ViewModel::new();
        view.session_state_changed("s1", SessionState::Running);
        assert!(!view.any_session_stopped());

        view.session_state_changed("s2", SessionState::Stopped);
        assert!(view.any_session_stopped());
        assert_eq!(view.session_state("s2"), Some(SessionState::Stopped));
    }
}
