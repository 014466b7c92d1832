//! Lazy one-time node activation.
//!
//! Every public tree operation passes this gate before touching node state.
//! Exactly one caller performs the priming work (backend read-with-watch,
//! state initialization, engine registration); concurrent first-touchers
//! block until the primer finishes. A failed priming resets the gate so the
//! next touch retries instead of caching the failure.

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Unbound,
    Activating,
    Active,
}

#[derive(Debug)]
pub(crate) struct ActivationGate {
    state: Mutex<GateState>,
    notify: Notify,
}

impl Default for ActivationGate {
    fn default() -> Self {
        Self {
            state: Mutex::new(GateState::Unbound),
            notify: Notify::new(),
        }
    }
}

impl ActivationGate {
    /// Runs `prime` exactly once across all concurrent callers. Late
    /// arrivals await the winner; if the winner fails, the next waiter
    /// becomes the new primer.
    pub(crate) async fn ensure<F, Fut>(&self, prime: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut prime = Some(prime);
        loop {
            // Register for wakeup before inspecting state, so a transition
            // between unlock and await cannot be missed.
            let notified = self.notify.notified();
            let must_wait = {
                let mut state = self.state.lock();
                match *state {
                    GateState::Active => return Ok(()),
                    GateState::Unbound => {
                        *state = GateState::Activating;
                        false
                    }
                    GateState::Activating => true,
                }
            };
            if must_wait {
                notified.await;
                continue;
            }

            // This caller won the gate. The closure is consumed at most once:
            // the winning branch is reachable a single time per call.
            let prime = match prime.take() {
                Some(p) => p,
                None => unreachable!("activation primer already consumed"),
            };
            let result = prime().await;
            {
                let mut state = self.state.lock();
                *state = match result {
                    Ok(()) => GateState::Active,
                    Err(_) => GateState::Unbound,
                };
            }
            self.notify.notify_waiters();
            return result;
        }
    }
}
