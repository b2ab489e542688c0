//! Bounded polling and cancellable sleeps.
//!
//! Every place the library blocks (authorization and order status, DNS propagation,
//! renewal jitter, ARI suggested time, deploy hook) goes through this module so that a
//! single [`Cancel`] handle aborts them all.
//!
//! [`Cancel`]: struct.Cancel.html
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Cancellation signal shared between a running operation and whoever wants to stop it.
///
/// Clones refer to the same signal.
#[derive(Clone, Default)]
pub struct Cancel {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Cancel {
    pub fn new() -> Self {
        Cancel::default()
    }

    /// Cancel all current and future waits on this handle.
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `dur` unless cancelled first, in which case `Error::Cancelled` is returned
    /// as soon as the signal arrives.
    pub fn sleep(&self, dur: Duration) -> Result<()> {
        let (lock, cvar) = &*self.inner;
        // `None` is further away than the clock can express, only cancelling ends it.
        let deadline = Instant::now().checked_add(dur);
        let mut cancelled = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return Err(Error::Cancelled);
            }
            // spurious wakeups just go around the loop again.
            cancelled = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }
                    cvar.wait_timeout(cancelled, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => cvar.wait(cancelled).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

impl std::fmt::Debug for Cancel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Cancel({})", self.is_cancelled())
    }
}

/// Call `f` every `interval` until it returns `Some`, an error, or `timeout` has passed.
///
/// `what` names the thing being waited for in the resulting `Error::Timeout`.
pub fn poll<T, F>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    cancel: &Cancel,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(t) = f()? {
            return Ok(t);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            debug!("{}: gave up after {:?}", what, elapsed);
            return Err(Error::Timeout {
                what: what.to_string(),
                elapsed,
            });
        }
        cancel.sleep(interval.min(timeout - elapsed))?;
    }
}
