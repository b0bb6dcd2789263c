use std::future::Future;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// A live listener registered against some event source.
///
/// The listener runs as its own task. Dropping the `Subscription` (or calling
/// [`Subscription::unsubscribe`]) aborts the task, so no callback can fire
/// once the owner has let go of the handle.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Spawn `listener` on the runtime and tie its lifetime to the returned handle.
    pub fn spawn<F>(listener: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            task: Some(tokio::spawn(listener)),
        }
    }

    /// Forward every value published on `rx` to `on_event` until the source
    /// closes or the subscription is dropped. Lagged receivers skip ahead.
    pub fn forward<T, F>(mut rx: broadcast::Receiver<T>, mut on_event: F) -> Self
    where
        T: Clone + Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        Self::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(value) => on_event(value),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "listener lagged, skipping events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop listening. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        self.abort();
    }

    /// Whether the listener task is still running.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.abort();
    }
}
