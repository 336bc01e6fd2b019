use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

/// Cooperative cancellation flag with a backstop timer.
///
/// Workers poll [`CancelToken::is_cancelled`] between units of work. A cancel request
/// also schedules its callback to fire after a timeout, so callers waiting on the callback
/// are released even when no worker ever observes the flag. The callback fires at most once.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    callback: Mutex<Option<CancelCallback>>,
    backstop: Mutex<Option<JoinHandle<()>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called from within a tokio runtime for the backstop to be armed.
    pub fn request_cancel<F>(&self, on_cancel: F, timeout: Duration)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Ok(mut guard) = self.inner.callback.lock() {
            *guard = Some(Box::new(on_cancel));
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!("cancel requested outside a runtime; backstop not armed");
                return;
            }
        };
        let token = self.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::warn!(
                "cancel backstop elapsed after {:?}; firing cancel callback",
                timeout
            );
            token.fire();
        });
        if let Ok(mut guard) = self.inner.backstop.lock() {
            if let Some(previous) = guard.replace(handle) {
                previous.abort();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fire the pending callback now and disarm the backstop.
    pub fn on_cancel(&self) {
        self.disarm();
        self.fire();
    }

    /// Clear the flag, disarm the backstop and forget the pending callback.
    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::SeqCst);
        self.disarm();
        if let Ok(mut guard) = self.inner.callback.lock() {
            guard.take();
        }
    }

    fn disarm(&self) {
        if let Ok(mut guard) = self.inner.backstop.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    fn fire(&self) {
        let callback = self
            .inner
            .callback
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(callback) = callback {
            callback();
        }
    }
}
