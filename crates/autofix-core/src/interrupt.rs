//! Cooperative interrupt facility.
//!
//! The flag is advisory: long operations poll [`InterruptController::is_interrupted`]
//! at well-defined points (between stages, between retries, while waiting) and
//! end early. Requesting an interrupt never kills an in-progress subprocess;
//! it sets the flag and makes the registered cleanup list runnable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::Result;

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupState {
    Idle,
    Running,
    Done,
}

struct Inner {
    interrupted: AtomicBool,
    cleanups: Mutex<Vec<CleanupFn>>,
    state: Mutex<CleanupState>,
    done: Notify,
}

/// Shared handle to the interrupt flag and cleanup registry. Cloning is cheap
/// and all clones observe the same state.
#[derive(Clone)]
pub struct InterruptController {
    inner: Arc<Inner>,
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                interrupted: AtomicBool::new(false),
                cleanups: Mutex::new(Vec::new()),
                state: Mutex::new(CleanupState::Idle),
                done: Notify::new(),
            }),
        }
    }

    /// Whether an interrupt has been requested.
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Request an interrupt. Only the first call transitions the flag.
    pub fn request_interrupt(&self) {
        if !self.inner.interrupted.swap(true, Ordering::SeqCst) {
            debug!("interrupt requested");
        }
    }

    /// Register a cleanup callback. Callbacks run in registration order
    /// when [`run_cleanup`](Self::run_cleanup) is first invoked.
    pub fn on_cleanup<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: CleanupFn = Box::new(move || Box::pin(f()));
        self.inner
            .cleanups
            .lock()
            .expect("cleanup list lock poisoned")
            .push(boxed);
    }

    /// Run every registered cleanup exactly once, in registration order.
    ///
    /// Callback errors are logged and swallowed so one failing cleanup never
    /// prevents the rest from running. Concurrent and repeated invocations
    /// wait for the first run to finish instead of re-running anything.
    pub async fn run_cleanup(&self) {
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            match *state {
                CleanupState::Done => return,
                CleanupState::Running => {
                    drop(state);
                    self.wait_for_cleanup().await;
                    return;
                }
                CleanupState::Idle => *state = CleanupState::Running,
            }
        }

        let callbacks: Vec<CleanupFn> = std::mem::take(
            &mut *self
                .inner
                .cleanups
                .lock()
                .expect("cleanup list lock poisoned"),
        );

        debug!(count = callbacks.len(), "running interrupt cleanups");
        for (idx, callback) in callbacks.into_iter().enumerate() {
            if let Err(e) = callback().await {
                warn!(idx, error = %e, "interrupt cleanup failed");
            }
        }

        *self.inner.state.lock().expect("state lock poisoned") = CleanupState::Done;
        self.inner.done.notify_waiters();
    }

    /// Wait until the first [`run_cleanup`](Self::run_cleanup) run completes.
    pub async fn wait_for_cleanup(&self) {
        loop {
            let notified = self.inner.done.notified();
            if *self.inner.state.lock().expect("state lock poisoned") == CleanupState::Done {
                return;
            }
            notified.await;
        }
    }

    /// Clear the flag, the callback list, and the run-once latch.
    pub fn reset(&self) {
        self.inner.interrupted.store(false, Ordering::SeqCst);
        self.inner
            .cleanups
            .lock()
            .expect("cleanup list lock poisoned")
            .clear();
        *self.inner.state.lock().expect("state lock poisoned") = CleanupState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn request_is_idempotent() {
        let ctl = InterruptController::new();
        assert!(!ctl.is_interrupted());
        ctl.request_interrupt();
        ctl.request_interrupt();
        assert!(ctl.is_interrupted());
    }

    #[tokio::test]
    async fn cleanups_run_once_in_registration_order() {
        let ctl = InterruptController::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            ctl.on_cleanup(move || async move {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }

        ctl.run_cleanup().await;
        ctl.run_cleanup().await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn cleanup_errors_are_swallowed() {
        let ctl = InterruptController::new();
        let ran = Arc::new(AtomicUsize::new(0));

        ctl.on_cleanup(|| async {
            Err(crate::AutofixError::Queue("boom".into()))
        });
        let ran2 = Arc::clone(&ran);
        ctl.on_cleanup(move || async move {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        ctl.run_cleanup().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_for_cleanup_unblocks_after_run() {
        let ctl = InterruptController::new();
        ctl.on_cleanup(|| async { Ok(()) });

        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.wait_for_cleanup().await })
        };

        // Give the waiter a chance to park first.
        tokio::task::yield_now().await;
        ctl.run_cleanup().await;
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn reset_allows_reuse() {
        let ctl = InterruptController::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        ctl.on_cleanup(move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        ctl.request_interrupt();
        ctl.run_cleanup().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        ctl.reset();
        assert!(!ctl.is_interrupted());

        let c = Arc::clone(&count);
        ctl.on_cleanup(move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        ctl.run_cleanup().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
