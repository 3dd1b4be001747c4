//! Cancellation handle for asynchronous work tied to a debuggee thread.

use crate::{DebugError, Result};
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;

/// Marks whether an asynchronous operation is still relevant.
///
/// Clones share state: the creator keeps one clone to cancel from outside while the
/// operation observes another. Operations check [`CancellationScope::is_cancelled`]
/// before any externally visible action.
#[derive(Debug, Clone, Default)]
pub struct CancellationScope {
    token: CancellationToken,
    disposed: Arc<AtomicBool>,
}

impl CancellationScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope that is cancelled whenever `self` is, but can also be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            disposed: Arc::default(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Releases the scope. With `cancel` set the operation is also told to stop.
    pub fn dispose(&self, cancel: bool) {
        if cancel {
            self.token.cancel();
        }
        self.disposed.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn same_scope(&self, other: &CancellationScope) -> bool {
        Arc::ptr_eq(&self.disposed, &other.disposed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(DebugError::Cancelled);
        }
        Ok(())
    }

    /// Races `fut` against cancellation of this scope.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(DebugError::Cancelled),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn clones_observe_cancellation() {
        let scope = CancellationScope::new();
        let observer = scope.clone();

        assert!(!observer.is_cancelled());
        scope.cancel();
        assert!(observer.is_cancelled());
        assert!(observer.check().is_err());
    }

    #[test]
    fn dispose_without_cancel_keeps_operation_alive() {
        let scope = CancellationScope::new();
        scope.dispose(false);

        assert!(scope.is_disposed());
        assert!(!scope.is_cancelled());

        scope.dispose(true);
        assert!(scope.is_cancelled());
    }

    #[test]
    fn same_scope_distinguishes_instances() {
        let a = CancellationScope::new();
        let b = CancellationScope::new();
        assert!(a.same_scope(&a.clone()));
        assert!(!a.same_scope(&b));
    }

    #[test]
    fn child_follows_parent_but_not_the_reverse() {
        let parent = CancellationScope::new();
        let child = parent.child();
        let sibling = parent.child();

        sibling.cancel();
        assert!(!parent.is_cancelled());
        assert!(!child.is_cancelled());
        assert!(!child.same_scope(&sibling));

        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn run_returns_cancelled_when_scope_fires_first() {
        let scope = CancellationScope::new();
        let canceller = scope.clone();

        let pending = tokio::spawn(async move {
            scope
                .run(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(1)
                })
                .await
        });
        canceller.cancel();

        let result = pending.await.expect("task should join");
        assert!(matches!(result, Err(DebugError::Cancelled)));
    }

    #[tokio::test]
    async fn run_passes_through_result() {
        let scope = CancellationScope::new();
        let value = scope.run(async { Ok(7) }).await.expect("should resolve");
        assert_eq!(value, 7);
    }
}
