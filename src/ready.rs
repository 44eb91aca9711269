//! One-shot initialization shared between every caller.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, trace};

use crate::{Error, Result};

type InitFuture = Shared<BoxFuture<'static, std::result::Result<(), Arc<Error>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    NotReady,
    InProgress,
    Ready,
}

enum GateState {
    NotReady,
    InProgress(InitFuture),
    Ready,
}

/// Runs an initialization sequence at most once.
///
/// Callers arriving while the sequence is in flight wait on the same shared
/// future, so all of them observe the single outcome. Once the sequence has
/// succeeded the gate is open for good. A failed sequence is not re-run:
/// the failure is kept and handed to every later caller as well.
pub struct ReadinessGate {
    state: Mutex<GateState>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> ReadinessGate {
        ReadinessGate {
            state: Mutex::new(GateState::NotReady),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // The state is only ever swapped whole, a panicking holder cannot leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ReadinessState {
        match &*self.lock() {
            GateState::NotReady => ReadinessState::NotReady,
            GateState::InProgress(_) => ReadinessState::InProgress,
            GateState::Ready => ReadinessState::Ready,
        }
    }

    /// Wait until the gate is open, starting `init` if nobody has yet.
    pub async fn ensure_ready<F, Fut>(&self, init: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let pending = {
            let mut state = self.lock();
            match &*state {
                GateState::Ready => {
                    trace!("Already ready");
                    return Ok(());
                }
                GateState::InProgress(pending) => {
                    debug!("Initialization in progress, waiting for it");
                    pending.clone()
                }
                GateState::NotReady => {
                    debug!("Starting initialization");
                    let pending = init().map(|r| r.map_err(Arc::new)).boxed().shared();
                    *state = GateState::InProgress(pending.clone());
                    pending
                }
            }
        };

        match pending.await {
            Ok(()) => {
                let mut state = self.lock();
                if !matches!(*state, GateState::Ready) {
                    debug!("Initialization complete");
                    *state = GateState::Ready;
                }
                Ok(())
            }
            Err(e) => Err(Error::Init(e)),
        }
    }
}

/// Fixed interval retries with an upper bound on attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            interval: Duration::from_millis(50),
        }
    }
}

/// Run `op` until it succeeds or the policy runs out of attempts.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(e),
                })
            }
            Err(e) => {
                debug!(what, attempt, err = %e, "Not available yet, retrying");
                attempt += 1;
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}
