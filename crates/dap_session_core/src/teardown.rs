use parking_lot::Mutex;

type Cleanup = Box<dyn FnOnce() + Send>;

/// Cleanup callbacks run once, in registration order, when the list is cleared.
///
/// Clearing is idempotent and the list can be reused afterwards, which is how a session
/// drops its adapter listeners on shutdown and registers fresh ones on re-initialise.
#[derive(Default)]
pub struct Teardown {
    callbacks: Mutex<Vec<Cleanup>>,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.callbacks.lock().push(Box::new(cleanup));
    }

    pub fn add_task(&self, task: tokio::task::JoinHandle<()>) {
        self.add(move || task.abort());
    }

    pub fn clear(&self) {
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for cleanup in callbacks {
            cleanup();
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown").field("pending", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn clear_runs_callbacks_in_order_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let teardown = Teardown::new();
        for i in 0..3 {
            let order = order.clone();
            teardown.add(move || order.lock().push(i));
        }

        teardown.clear();
        teardown.clear();

        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(teardown.is_empty());
    }

    #[test]
    fn drop_clears_pending_callbacks() {
        let hits = Arc::new(Mutex::new(0));
        {
            let teardown = Teardown::new();
            let hits = hits.clone();
            teardown.add(move || *hits.lock() += 1);
        }
        assert_eq!(*hits.lock(), 1);
    }

    #[tokio::test]
    async fn add_task_aborts_on_clear() {
        let teardown = Teardown::new();
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        let abort = task.abort_handle();
        teardown.add(move || abort.abort());
        teardown.clear();

        let err = task.await.expect_err("task should be aborted");
        assert!(err.is_cancelled());
    }
}
