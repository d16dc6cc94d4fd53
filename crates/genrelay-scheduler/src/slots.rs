//! Concurrency slots: a global cap plus a per-provider cap.
//!
//! A task runs only while holding one permit from each. The per-provider
//! permit is acquired first, so waiters for the same provider are served in
//! FIFO order; there is no ordering guarantee across providers. Per-provider
//! semaphores are created lazily and their cap is fixed at first use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The caller's token fired while waiting for a slot.
#[derive(Debug, thiserror::Error)]
#[error("slot wait cancelled")]
pub struct SlotWaitCancelled;

/// Both permits for one running task. Dropping releases the slot and wakes
/// the next eligible waiter.
pub struct SlotPermit {
    _provider: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

pub struct SlotManager {
    global: Arc<Semaphore>,
    providers: std::sync::Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SlotManager {
    pub fn new(global_max_concurrent: u32) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_max_concurrent as usize)),
            providers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn provider_semaphore(&self, provider: &str, max_concurrent: u32) -> Arc<Semaphore> {
        let mut providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        providers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(max_concurrent as usize)))
            .clone()
    }

    /// Acquire a slot for `provider`, waiting until both the provider cap and
    /// the global cap permit it. Returns the permit and the time spent
    /// waiting.
    pub async fn acquire(
        &self,
        provider: &str,
        max_concurrent: u32,
        cancel: &CancellationToken,
    ) -> Result<(SlotPermit, Duration), SlotWaitCancelled> {
        if cancel.is_cancelled() {
            return Err(SlotWaitCancelled);
        }

        let started = Instant::now();
        let provider_sem = self.provider_semaphore(provider, max_concurrent);

        let provider_permit = tokio::select! {
            permit = provider_sem.acquire_owned() => {
                permit.map_err(|_| SlotWaitCancelled)?
            }
            _ = cancel.cancelled() => return Err(SlotWaitCancelled),
        };
        let global_permit = tokio::select! {
            permit = Arc::clone(&self.global).acquire_owned() => {
                permit.map_err(|_| SlotWaitCancelled)?
            }
            _ = cancel.cancelled() => return Err(SlotWaitCancelled),
        };

        Ok((
            SlotPermit {
                _provider: provider_permit,
                _global: global_permit,
            },
            started.elapsed(),
        ))
    }
}
