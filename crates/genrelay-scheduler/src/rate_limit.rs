//! Per-provider sliding-window rate limiting.
//!
//! Each provider has an ordered window of admission timestamps guarded by an
//! async mutex. The mutex is held across the wait so two callers can never
//! both observe a free slot and both admit themselves; the new timestamp is
//! recorded before the lock is released.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use genrelay_config::RateLimitConfig;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Admission was abandoned because the caller's token fired.
#[derive(Debug, thiserror::Error)]
#[error("rate-limit wait cancelled")]
pub struct AdmissionCancelled;

struct ProviderWindow {
    limit: RateLimitConfig,
    admitted: Mutex<VecDeque<Instant>>,
}

/// Keyed store of provider windows, created lazily on first use.
pub struct RateLimiter {
    safety_buffer: Duration,
    providers: std::sync::Mutex<HashMap<String, Arc<ProviderWindow>>>,
}

impl RateLimiter {
    pub fn new(safety_buffer: Duration) -> Self {
        Self {
            safety_buffer,
            providers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn window_for(&self, provider: &str, limit: RateLimitConfig) -> Arc<ProviderWindow> {
        let mut providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        providers
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderWindow {
                    limit,
                    admitted: Mutex::new(VecDeque::new()),
                })
            })
            .clone()
    }

    /// Wait until the provider's window has capacity, then record this
    /// admission. Returns the time spent waiting.
    ///
    /// Cancellation during the wait returns without recording a timestamp.
    pub async fn admit(
        &self,
        provider: &str,
        limit: RateLimitConfig,
        cancel: &CancellationToken,
    ) -> Result<Duration, AdmissionCancelled> {
        if cancel.is_cancelled() {
            return Err(AdmissionCancelled);
        }

        let window = self.window_for(provider, limit);
        let started = Instant::now();

        let mut admitted = tokio::select! {
            guard = window.admitted.lock() => guard,
            _ = cancel.cancelled() => return Err(AdmissionCancelled),
        };

        loop {
            let now = Instant::now();
            let span = window.limit.window();
            while let Some(&oldest) = admitted.front() {
                if now.duration_since(oldest) >= span {
                    admitted.pop_front();
                } else {
                    break;
                }
            }

            if admitted.len() < window.limit.max_requests as usize {
                admitted.push_back(now);
                return Ok(started.elapsed());
            }

            // Window full: sleep until the oldest admission leaves the
            // window, plus a buffer so we never race the provider's clock.
            let oldest = admitted[0];
            let wake = oldest + span + self.safety_buffer;
            debug!(
                provider,
                wait_ms = wake.duration_since(now).as_millis() as u64,
                "rate limit window full, waiting"
            );
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = cancel.cancelled() => return Err(AdmissionCancelled),
            }
        }
    }
}
