use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::app::error::AppError;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    cv: Condvar,
}

/// Clonable cancellation signal shared between a caller and the work it started.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut guard = match self.inner.cancelled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = true;
        self.inner.cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        match self.inner.cancelled.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn check(&self, trace_id: &str) -> Result<(), AppError> {
        if self.is_cancelled() {
            Err(AppError::cancelled(trace_id))
        } else {
            Ok(())
        }
    }

    /// Sleeps for up to `timeout`. Returns `true` if woken by cancellation.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = match self.inner.cancelled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*guard {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.inner.cv.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}
