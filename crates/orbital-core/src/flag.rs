use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

struct Shared {
    state: AtomicBool,
    notify: Notify,
}

/// A single-shot, re-armable wakeup signal shared between a main loop and
/// whoever wants to nudge it early (a data store event, a shutdown request).
#[derive(Clone)]
pub struct WakeupFlag(Arc<Shared>);

impl WakeupFlag {
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            state: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    /// Set the flag and wake any current waiter.
    pub fn raise(&self) {
        self.0.state.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.0.state.load(Ordering::Acquire)
    }

    /// Clear the flag so a subsequent `wait()` parks again.
    pub fn rearm(&self) {
        self.0.state.store(false, Ordering::Release);
    }

    pub fn wait(&self) -> WakeupFuture<'_> {
        // Early check since there is no reason to create a Notified if it is not
        // necessary. We still need to check again after constructing the Notified
        // to avoid missing a raise() that happens in between.
        if self.is_raised() {
            return WakeupFuture(None);
        }

        let notified = self.0.notify.notified();

        if self.is_raised() {
            WakeupFuture(None)
        } else {
            WakeupFuture(Some(notified))
        }
    }
}

impl Default for WakeupFlag {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WakeupFuture<'a>(Option<Notified<'a>>);

impl Future for WakeupFuture<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: project Pin<&mut Self> -> Option<Pin<&mut Notified>>
        let notified = unsafe {
            let this = Pin::get_unchecked_mut(self);
            this.0.as_mut().map(|v| Pin::new_unchecked(v))
        };

        match notified {
            Some(notified) => notified.poll(cx),
            None => Poll::Ready(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_once_raised() {
        let flag = WakeupFlag::new();
        flag.raise();
        tokio::time::timeout(Duration::from_millis(50), flag.wait())
            .await
            .expect("wait() should resolve immediately when already raised");
    }

    #[tokio::test]
    async fn rearm_causes_wait_to_park_again() {
        let flag = WakeupFlag::new();
        flag.raise();
        flag.rearm();
        assert!(!flag.is_raised());

        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        flag.raise();
        handle.await.unwrap();
    }
}
