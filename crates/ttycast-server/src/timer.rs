//! Cancellable one-shot timers.

use std::time::Duration;
use tokio::task::JoinHandle;

/// A pending timer. Dropping the handle cancels it.
#[derive(Debug)]
pub struct TimerHandle {
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Run `fire` once after `delay`.
    pub fn spawn<F>(delay: Duration, fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire();
        });
        Self { task: Some(task) }
    }

    /// A handle that never fires.
    #[cfg(test)]
    pub fn inert() -> Self {
        Self { task: None }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
