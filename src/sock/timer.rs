//! A cancellable deadline that runs a future when it fires.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

/// A timer that drives a future after a delay.
///
/// Dropping the timer before the deadline cancels it.
#[derive(Debug)]
pub struct Timer {
    t: JoinHandle<()>,
}

impl Timer {
    /// Runs `f` after `d` has elapsed.
    pub fn after<F>(d: Duration, f: F) -> Self
    where
        F: Future<Output = ()> + Send + Sync + 'static,
    {
        let t = tokio::task::spawn(async move {
            time::sleep(d).await;
            f.await
        });

        Timer { t }
    }

    /// Cancels the timer. A timer that already fired is unaffected.
    pub fn abort(&self) {
        self.t.abort();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timer_fires() {
        let (s, r) = tokio::sync::oneshot::channel();
        let _timer = Timer::after(Duration::from_millis(5), async move {
            s.send(()).ok();
        });
        r.await.expect("timer did not fire");
    }

    #[tokio::test]
    async fn test_timer_abort() {
        let (s, r) = tokio::sync::oneshot::channel::<()>();
        let timer = Timer::after(Duration::from_millis(20), async move {
            s.send(()).ok();
        });
        timer.abort();
        assert!(r.await.is_err());
    }

    #[tokio::test]
    async fn test_timer_drop_cancels() {
        let (s, r) = tokio::sync::oneshot::channel::<()>();
        let timer = Timer::after(Duration::from_millis(20), async move {
            s.send(()).ok();
        });
        drop(timer);
        assert!(r.await.is_err());
    }
}
