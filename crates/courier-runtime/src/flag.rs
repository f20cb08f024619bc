use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Shared {
    raised: AtomicBool,
    notify: Notify,
}

/// A one-shot async stop signal shared by every long-running component.
///
/// Raising the flag is idempotent and wakes every waiter; the flag never
/// resets. Checked at every suspension point that should not outlive a
/// shutdown (or, per task, a lost lease).
#[derive(Clone)]
pub struct StopFlag(Arc<Shared>);

impl StopFlag {
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            raised: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn raise(&self) {
        self.0.raised.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.0.raised.load(Ordering::Acquire)
    }

    /// Resolves once the flag is raised. Safe to race against `raise`: the
    /// flag is re-checked after registering with the notifier, so a raise
    /// between the check and the await is never lost.
    pub async fn wait(&self) {
        loop {
            if self.is_raised() {
                return;
            }

            let notified = self.0.notify.notified();
            if self.is_raised() {
                return;
            }

            notified.await;
        }
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Raises the flag when dropped, so that one component exiting (normally or
/// by panic) takes its siblings down with it.
pub struct StopGuard {
    flag: StopFlag,
}

impl StopGuard {
    pub fn new(flag: &StopFlag) -> Self {
        Self { flag: flag.clone() }
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if !self.flag.is_raised() {
            tracing::warn!("component exited without the stop flag being raised");
        }

        self.flag.raise();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wait_resolves_after_raise() {
        let flag = StopFlag::new();
        assert!(!flag.is_raised());

        let waiter = tokio::spawn({
            let flag = flag.clone();
            async move { flag.wait().await }
        });

        flag.raise();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
        assert!(flag.is_raised());
    }

    #[tokio::test]
    async fn wait_resolves_immediately_when_already_raised() {
        let flag = StopFlag::new();
        flag.raise();
        flag.wait().await;
    }

    #[tokio::test]
    async fn guard_raises_on_drop() {
        let flag = StopFlag::new();
        drop(StopGuard::new(&flag));
        assert!(flag.is_raised());
    }
}
