//! Per-thread serialisation of work that depends on a thread's run status.
//!
//! Stop handling fetches call stacks and moves focus; a `continued` event for the same
//! thread can arrive while that is still in flight. [`ThreadStatusScheduler`] makes sure
//! only the most recently started operation for a thread is allowed to take effect, and
//! that operations whose thread ids are still being resolved can be pre-empted before
//! they ever start.

use crate::cancellation::CancellationScope;
use crate::protocol::ThreadId;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Default)]
struct PendingCancellation {
    all: bool,
    threads: HashSet<ThreadId>,
}

impl PendingCancellation {
    fn covers(&self, thread_id: ThreadId) -> bool {
        self.all || self.threads.contains(&thread_id)
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    live: HashMap<ThreadId, CancellationScope>,
    pending: HashMap<u64, PendingCancellation>,
    next_marker: u64,
}

/// Drops the pending marker of a `run` call whose future is dropped before its ids resolve.
struct PendingMarker {
    state: Arc<Mutex<SchedulerState>>,
    marker: u64,
}

impl Drop for PendingMarker {
    fn drop(&mut self) {
        self.state.lock().pending.remove(&self.marker);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ThreadStatusScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl ThreadStatusScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a status-sensitive operation.
    ///
    /// The pending marker is recorded before this returns, so a [`cancel`](Self::cancel)
    /// issued while `thread_ids` is still resolving pre-empts the operation for the named
    /// threads. The returned future resolves once every started operation finishes.
    pub fn run<Ids, Op, Fut>(&self, thread_ids: Ids, op: Op) -> impl Future<Output = ()> + Send + 'static
    where
        Ids: Future<Output = Vec<ThreadId>> + Send + 'static,
        Op: Fn(ThreadId, CancellationScope) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let marker = {
            let mut state = self.state.lock();
            let marker = state.next_marker;
            state.next_marker += 1;
            state.pending.insert(marker, PendingCancellation::default());
            marker
        };
        let guard = PendingMarker {
            state: self.state.clone(),
            marker,
        };
        let state = self.state.clone();

        async move {
            let thread_ids = thread_ids.await;

            let started = {
                let mut locked = state.lock();
                let cancelled = locked.pending.remove(&marker).unwrap_or_default();
                let mut started = Vec::with_capacity(thread_ids.len());
                for thread_id in thread_ids {
                    if cancelled.covers(thread_id) {
                        tracing::trace!(thread_id, "status operation pre-empted before start");
                        continue;
                    }
                    let scope = CancellationScope::new();
                    if let Some(previous) = locked.live.insert(thread_id, scope.clone()) {
                        previous.dispose(true);
                    }
                    started.push((thread_id, scope));
                }
                started
            };
            drop(guard);

            join_all(started.into_iter().map(|(thread_id, scope)| {
                let operation = op(thread_id, scope.clone());
                let state = state.clone();
                async move {
                    operation.await;
                    let mut locked = state.lock();
                    if locked
                        .live
                        .get(&thread_id)
                        .is_some_and(|current| current.same_scope(&scope))
                    {
                        locked.live.remove(&thread_id);
                    }
                    scope.dispose(false);
                }
            }))
            .await;
        }
    }

    /// Cancels live operations for `thread_ids`, or for every thread when `None`, and
    /// pre-empts `run` calls whose ids have not resolved yet.
    pub fn cancel(&self, thread_ids: Option<&[ThreadId]>) {
        let mut state = self.state.lock();
        match thread_ids {
            None => {
                for (_, scope) in state.live.drain() {
                    scope.dispose(true);
                }
                for pending in state.pending.values_mut() {
                    pending.all = true;
                }
            }
            Some(thread_ids) => {
                for thread_id in thread_ids {
                    if let Some(scope) = state.live.remove(thread_id) {
                        scope.dispose(true);
                    }
                    for pending in state.pending.values_mut() {
                        pending.threads.insert(*thread_id);
                    }
                }
            }
        }
    }

    pub fn live_scope(&self, thread_id: ThreadId) -> Option<CancellationScope> {
        self.state.lock().live.get(&thread_id).cloned()
    }

    pub fn pending_runs(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{oneshot, Notify};

    fn deferred_ids() -> (oneshot::Sender<Vec<ThreadId>>, impl Future<Output = Vec<ThreadId>>) {
        let (tx, rx) = oneshot::channel();
        (tx, async move { rx.await.unwrap_or_default() })
    }

    #[tokio::test]
    async fn cancel_while_resolving_prevents_start() {
        let scheduler = ThreadStatusScheduler::new();
        let started = Arc::new(AtomicUsize::new(0));
        let (tx, ids) = deferred_ids();

        let counter = started.clone();
        let run = tokio::spawn(scheduler.run(ids, move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        scheduler.cancel(Some(&[5]));
        tx.send(vec![5, 7]).expect("receiver alive");
        run.await.expect("run should finish");

        assert_eq!(started.load(Ordering::SeqCst), 1, "only thread 7 may start");
        assert_eq!(scheduler.pending_runs(), 0);
    }

    #[tokio::test]
    async fn cancel_all_while_resolving_skips_every_thread() {
        let scheduler = ThreadStatusScheduler::new();
        let started = Arc::new(AtomicUsize::new(0));
        let (tx, ids) = deferred_ids();

        let counter = started.clone();
        let run = tokio::spawn(scheduler.run(ids, move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        scheduler.cancel(None);
        tx.send(vec![1, 2, 3]).expect("receiver alive");
        run.await.expect("run should finish");

        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn newer_run_cancels_older_operation_on_same_thread() {
        let scheduler = ThreadStatusScheduler::new();
        let release = Arc::new(Notify::new());
        let (scope_tx, scope_rx) = oneshot::channel::<CancellationScope>();
        let scope_tx = Arc::new(Mutex::new(Some(scope_tx)));

        let gate = release.clone();
        let first = tokio::spawn(scheduler.run(async { vec![5] }, move |_, scope| {
            let gate = gate.clone();
            let scope_tx = scope_tx.clone();
            async move {
                if let Some(tx) = scope_tx.lock().take() {
                    let _ = tx.send(scope);
                }
                gate.notified().await;
            }
        }));
        let first_scope = scope_rx.await.expect("first op should start");
        assert!(!first_scope.is_cancelled());

        scheduler.run(async { vec![5] }, |_, _| async {}).await;

        assert!(first_scope.is_cancelled(), "older op must be cancelled");
        release.notify_waiters();
        first.await.expect("first run should finish");
        assert!(scheduler.live_scope(5).is_none());
    }

    #[tokio::test]
    async fn cancel_live_operation_flags_its_scope() {
        let scheduler = ThreadStatusScheduler::new();
        let (scope_tx, scope_rx) = oneshot::channel::<CancellationScope>();
        let scope_tx = Arc::new(Mutex::new(Some(scope_tx)));

        let run = tokio::spawn(scheduler.run(async { vec![9] }, move |_, scope| {
            let scope_tx = scope_tx.clone();
            async move {
                let observed = scope.clone();
                if let Some(tx) = scope_tx.lock().take() {
                    let _ = tx.send(scope);
                }
                observed.cancelled().await;
            }
        }));
        let scope = scope_rx.await.expect("op should start");

        scheduler.cancel(Some(&[9]));

        assert!(scope.is_cancelled());
        assert!(scope.is_disposed());
        run.await.expect("run should finish once cancelled");
    }

    #[tokio::test]
    async fn cancel_for_other_thread_leaves_pending_run_alone() {
        let scheduler = ThreadStatusScheduler::new();
        let started = Arc::new(AtomicUsize::new(0));
        let (tx, ids) = deferred_ids();

        let counter = started.clone();
        let run = tokio::spawn(scheduler.run(ids, move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        scheduler.cancel(Some(&[42]));
        tx.send(vec![1]).expect("receiver alive");
        run.await.expect("run should finish");

        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_run_releases_pending_marker() {
        let scheduler = ThreadStatusScheduler::new();
        let (_tx, ids) = deferred_ids();

        let run = scheduler.run(ids, |_, _| async {});
        assert_eq!(scheduler.pending_runs(), 1);
        drop(run);
        assert_eq!(scheduler.pending_runs(), 0);
    }
}
