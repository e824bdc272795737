//! Concurrency limiter for probe subprocesses.
//!
//! Two semaphore layers: one global counting semaphore plus one semaphore per
//! M3U account. A probe acquires global first, then its account; the permits
//! release in reverse order when the [`ProbePermit`] drops, on every exit
//! path. An account capacity of 0 means unlimited and is represented by the
//! absence of a semaphore.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::models::M3uAccount;
use crate::{Error, Result};

struct LimiterState {
    global: Option<Arc<Semaphore>>,
    accounts: HashMap<i64, Arc<Semaphore>>,
}

/// RAII permit held for the duration of one probe.
///
/// Field order matters: the account permit is declared first so it drops
/// before the global one, releasing in reverse acquisition order.
pub struct ProbePermit {
    _account: Option<OwnedSemaphorePermit>,
    _global: Option<OwnedSemaphorePermit>,
}

/// Global + per-account probe admission control
pub struct ConcurrencyLimiter {
    state: RwLock<LimiterState>,
}

impl ConcurrencyLimiter {
    /// Create a limiter. `global_limit = None` disables the global cap.
    #[must_use]
    pub fn new(global_limit: Option<usize>, accounts: &[M3uAccount]) -> Self {
        Self {
            state: RwLock::new(Self::build_state(global_limit, accounts)),
        }
    }

    fn build_state(global_limit: Option<usize>, accounts: &[M3uAccount]) -> LimiterState {
        let global = global_limit
            .filter(|&limit| limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let accounts = accounts
            .iter()
            .filter(|account| account.max_concurrent_streams > 0)
            .map(|account| {
                (
                    account.id,
                    Arc::new(Semaphore::new(account.max_concurrent_streams)),
                )
            })
            .collect();
        LimiterState { global, accounts }
    }

    /// Rebuild the semaphores after an account-set or limit change.
    ///
    /// New acquisitions see the fresh capacities immediately; in-flight
    /// permit holders keep their grip on the old semaphores and drain
    /// naturally.
    pub fn reconfigure(&self, global_limit: Option<usize>, accounts: &[M3uAccount]) {
        let new_state = Self::build_state(global_limit, accounts);
        *self.state.write() = new_state;
        debug!(
            global_limit = ?global_limit,
            accounts = accounts.len(),
            "Rebuilt concurrency limiter"
        );
    }

    fn semaphores(&self, account_id: Option<i64>) -> (Option<Arc<Semaphore>>, Option<Arc<Semaphore>>) {
        let state = self.state.read();
        let account = account_id.and_then(|id| state.accounts.get(&id).cloned());
        (state.global.clone(), account)
    }

    /// Acquire a permit for a probe of a stream owned by `account_id`.
    /// Blocks without timeout; global first, then account.
    pub async fn acquire(&self, account_id: Option<i64>) -> Result<ProbePermit> {
        let (global, account) = self.semaphores(account_id);

        let global_permit = match global {
            Some(semaphore) => Some(
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Internal("global probe semaphore closed".to_string()))?,
            ),
            None => None,
        };
        let account_permit = match account {
            Some(semaphore) => Some(
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Internal("account probe semaphore closed".to_string()))?,
            ),
            None => None,
        };

        Ok(ProbePermit {
            _account: account_permit,
            _global: global_permit,
        })
    }

    /// Bounded-wait acquisition: returns `Ok(None)` instead of blocking
    /// forever when the permit cannot be obtained within `wait`.
    pub async fn acquire_timeout(
        &self,
        account_id: Option<i64>,
        wait: Duration,
    ) -> Result<Option<ProbePermit>> {
        match tokio::time::timeout(wait, self.acquire(account_id)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}
