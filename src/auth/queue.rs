//! One-at-a-time execution of async actions
//!
//! Each call to [`ActionQueue::serialize`] takes its place in line at call
//! time and waits for the previous action to settle before running. An action
//! that fails, panics or is dropped still releases the next one.

use std::future::Future;
use std::sync::Mutex;

use tokio::sync::oneshot;

#[derive(Default)]
pub struct ActionQueue {
    /// Completion signal of the most recently submitted action.
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after every previously submitted action has settled and
    /// resolve with its outcome.
    pub fn serialize<F, Fut, T>(&self, action: F) -> impl Future<Output = T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let previous = self
            .tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(done_rx);

        async move {
            if let Some(previous) = previous {
                // Err means the previous action was dropped mid-flight; either way it settled.
                let _ = previous.await;
            }
            let output = action().await;
            let _ = done_tx.send(());
            output
        }
    }
}
