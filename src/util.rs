//! Small task and future helpers used across the crate.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::JoinHandle;

/// A join handle that owns the task it is running, and aborts it when dropped.
#[derive(Debug, derive_more::From)]
pub struct AbortingJoinHandle<T> {
    handle: JoinHandle<T>,
}

impl<T> AbortingJoinHandle<T> {
    /// Abort the underlying task immediately.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl<T> Future for AbortingJoinHandle<T> {
    type Output = std::result::Result<T, tokio::task::JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

impl<T> Drop for AbortingJoinHandle<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Aborts a task on drop without owning its output.
///
/// Handy to bundle into client handles whose actor must die with the last
/// clone of the handle.
#[derive(Debug)]
pub struct CancelOnDrop {
    /// Name of the task, used in the drop log line.
    name: &'static str,
    handle: tokio::task::AbortHandle,
}

impl CancelOnDrop {
    /// Create a new guard for the task behind `handle`.
    pub fn new(name: &'static str, handle: tokio::task::AbortHandle) -> Self {
        CancelOnDrop { name, handle }
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.handle.abort();
        tracing::debug!("{} completed", self.name);
    }
}

/// Resolves to pending if the inner is `None`.
#[derive(Debug)]
pub struct MaybeFuture<T> {
    /// Future to be polled.
    pub inner: Option<T>,
}

// NOTE: explicit implementation to bypass derive unnecessary bounds
impl<T> Default for MaybeFuture<T> {
    fn default() -> Self {
        MaybeFuture { inner: None }
    }
}

impl<T: Future + Unpin> Future for MaybeFuture<T> {
    type Output = T::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.inner {
            Some(ref mut t) => Pin::new(t).poll(cx),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_aborting_join_handle_drops_task() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle: AbortingJoinHandle<()> = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            tx.send(()).ok();
        })
        .into();
        drop(handle);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.await.is_err());
    }
}
