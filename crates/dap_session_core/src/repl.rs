//! Console transcript shared by a session (and, when merged, its children).

use crate::protocol::{EvaluateResponse, Variable};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const MAX_REPL_ELEMENTS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Severity for an adapter `output` category.
    pub fn from_category(category: Option<&str>) -> Self {
        match category {
            Some("stderr") => Self::Error,
            Some("console") => Self::Warning,
            _ => Self::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplSource {
    pub uri: String,
    pub line: i64,
    pub column: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplEvaluation {
    Value(EvaluateResponse),
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplElement {
    Output {
        id: u64,
        session_id: String,
        value: String,
        severity: Severity,
        source: Option<ReplSource>,
        depth: usize,
    },
    Variable {
        id: u64,
        session_id: String,
        name: Option<String>,
        variable: Variable,
        severity: Severity,
        source: Option<ReplSource>,
        depth: usize,
    },
    Group {
        id: u64,
        session_id: String,
        label: String,
        collapsed: bool,
        depth: usize,
    },
    Input {
        id: u64,
        session_id: String,
        expression: String,
    },
    Result {
        id: u64,
        session_id: String,
        expression: String,
        evaluation: ReplEvaluation,
    },
}

impl ReplElement {
    pub fn id(&self) -> u64 {
        match self {
            Self::Output { id, .. }
            | Self::Variable { id, .. }
            | Self::Group { id, .. }
            | Self::Input { id, .. }
            | Self::Result { id, .. } => *id,
        }
    }
}

#[derive(Debug, Default)]
struct ReplState {
    elements: Vec<ReplElement>,
    next_id: u64,
    depth: usize,
}

impl ReplState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn push(&mut self, element: ReplElement) {
        self.elements.push(element);
        if self.elements.len() > MAX_REPL_ELEMENTS {
            let excess = self.elements.len() - MAX_REPL_ELEMENTS;
            self.elements.drain(..excess);
        }
    }
}

#[derive(Debug, Default)]
pub struct Repl {
    state: Mutex<ReplState>,
}

impl Repl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elements(&self) -> Vec<ReplElement> {
        self.state.lock().elements.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends plain output. Text continues the previous output element while that one
    /// has not ended its line.
    pub fn append_output(
        &self,
        session_id: &str,
        text: &str,
        severity: Severity,
        source: Option<ReplSource>,
    ) {
        let mut state = self.state.lock();
        let depth = state.depth;
        if source.is_none() {
            if let Some(ReplElement::Output {
                session_id: last_session,
                value,
                severity: last_severity,
                source: None,
                depth: last_depth,
                ..
            }) = state.elements.last_mut()
            {
                if last_session == session_id
                    && *last_severity == severity
                    && *last_depth == depth
                    && !value.ends_with('\n')
                {
                    value.push_str(text);
                    return;
                }
            }
        }
        let id = state.allocate_id();
        state.push(ReplElement::Output {
            id,
            session_id: session_id.to_string(),
            value: text.to_string(),
            severity,
            source,
            depth,
        });
    }

    pub fn append_variable(
        &self,
        session_id: &str,
        name: Option<String>,
        variable: Variable,
        severity: Severity,
        source: Option<ReplSource>,
    ) {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        let depth = state.depth;
        state.push(ReplElement::Variable {
            id,
            session_id: session_id.to_string(),
            name,
            variable,
            severity,
            source,
            depth,
        });
    }

    pub fn start_group(&self, session_id: &str, label: &str, collapsed: bool) {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        let depth = state.depth;
        state.push(ReplElement::Group {
            id,
            session_id: session_id.to_string(),
            label: label.to_string(),
            collapsed,
            depth,
        });
        state.depth += 1;
    }

    pub fn end_group(&self) {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
    }

    pub fn add_input(&self, session_id: &str, expression: &str) {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        state.push(ReplElement::Input {
            id,
            session_id: session_id.to_string(),
            expression: expression.to_string(),
        });
    }

    pub fn add_result(&self, session_id: &str, expression: &str, evaluation: ReplEvaluation) {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        state.push(ReplElement::Result {
            id,
            session_id: session_id.to_string(),
            expression: expression.to_string(),
            evaluation,
        });
    }

    /// Drops every element. Returns whether anything was removed.
    pub fn clear(&self) -> bool {
        let mut state = self.state.lock();
        state.depth = 0;
        if state.elements.is_empty() {
            return false;
        }
        state.elements.clear();
        true
    }
}

type OutputJob = BoxFuture<'static, ()>;

/// Runs queued jobs one at a time in submission order.
///
/// Output that needs an extra fetch starts that fetch before queueing, so only the
/// append waits its turn.
#[derive(Debug, Default)]
pub struct OutputQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<OutputJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: impl Future<Output = ()> + Send + 'static) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!("output queue closed, dropping output");
            return;
        }
        let mut sender = self.sender.lock();
        let tx = sender.get_or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<OutputJob>();
            *self.worker.lock() = Some(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
            }));
            tx
        });
        if tx.send(Box::pin(job)).is_err() {
            tracing::warn!("output queue worker is gone, dropping output");
        }
    }

    /// Stops accepting jobs. Already queued jobs still run.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.sender.lock().take();
        self.worker.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[test]
    fn output_without_newline_is_continued() {
        let repl = Repl::new();
        repl.append_output("s1", "Hello ", Severity::Info, None);
        repl.append_output("s1", "world\n", Severity::Info, None);
        repl.append_output("s1", "next", Severity::Info, None);

        let elements = repl.elements();
        assert_eq!(elements.len(), 2);
        match &elements[0] {
            ReplElement::Output { value, .. } => assert_eq!(value, "Hello world\n"),
            other => panic!("Expected Output, got {other:?}"),
        }
    }

    #[test]
    fn severity_change_starts_new_element() {
        let repl = Repl::new();
        repl.append_output("s1", "out", Severity::Info, None);
        repl.append_output("s1", "err", Severity::Error, None);
        assert_eq!(repl.len(), 2);
    }

    #[test]
    fn groups_nest_following_output() {
        let repl = Repl::new();
        repl.start_group("s1", "tests", false);
        repl.append_output("s1", "inside\n", Severity::Info, None);
        repl.end_group();
        repl.append_output("s1", "outside\n", Severity::Info, None);

        let depths: Vec<usize> = repl
            .elements()
            .iter()
            .filter_map(|e| match e {
                ReplElement::Output { depth, .. } => Some(*depth),
                _ => None,
            })
            .collect();
        assert_eq!(depths, vec![1, 0]);
    }

    #[test]
    fn clear_reports_whether_anything_changed() {
        let repl = Repl::new();
        assert!(!repl.clear());
        repl.add_input("s1", "1 + 1");
        assert!(repl.clear());
        assert!(repl.is_empty());
    }

    #[tokio::test]
    async fn queue_preserves_submission_order() {
        let queue = OutputQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let slow = order.clone();
        queue.push(async move {
            let _ = release_rx.await;
            slow.lock().push("slow");
        });
        let fast = order.clone();
        queue.push(async move {
            fast.lock().push("fast");
            let _ = done_tx.send(());
        });

        tokio::task::yield_now().await;
        assert!(order.lock().is_empty(), "fast job must wait for the slow one");

        release_tx.send(()).expect("slow job waiting");
        done_rx.await.expect("fast job should run");
        assert_eq!(*order.lock(), vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn closed_queue_finishes_queued_jobs_and_refuses_new_ones() {
        let queue = OutputQueue::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        queue.push(async move {
            let _ = release_rx.await;
            let _ = done_tx.send(());
        });

        queue.close();
        let late = Arc::new(Mutex::new(false));
        let flag = late.clone();
        queue.push(async move {
            *flag.lock() = true;
        });

        release_tx.send(()).expect("queued job waiting");
        done_rx.await.expect("queued job should still run");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!*late.lock());
    }
}
