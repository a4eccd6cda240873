use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::types::{CoreError, Result};

/// Completion handle of a task submitted to a [`TaskPool`](super::TaskPool).
///
/// Await it from async code or call [`blocking_wait`](Self::blocking_wait)
/// from a plain thread. A task dropped before it ran (forced pool shutdown)
/// resolves to [`CoreError::TaskCancelled`].
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self { rx }
    }

    /// A handle that is already resolved with [`CoreError::NotAccepting`].
    pub(crate) fn rejected() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(CoreError::NotAccepting));
        Self { rx }
    }

    /// Blocks the current thread until the task finishes.
    ///
    /// Panics when called from within an async execution context.
    pub fn blocking_wait(self) -> Result<T> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(CoreError::TaskCancelled))
    }

    /// Returns the result if the task already finished.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CoreError::TaskCancelled)),
        }
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<T> {
        tokio::time::timeout(timeout, self)
            .await
            .unwrap_or(Err(CoreError::Timeout(timeout)))
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CoreError::TaskCancelled)))
    }
}
