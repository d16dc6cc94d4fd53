//! Task admission and execution for provider calls.
//!
//! `schedule()` runs one closure through three ordered suspension points:
//! rate-limit admission, concurrency-slot wait, then execution under a
//! timeout composed with the caller's cancellation token. The scheduler
//! classifies only timeouts and cancellations; every other failure is passed
//! through opaque for the retry layer to categorize.

mod rate_limit;
mod slots;

pub use rate_limit::{AdmissionCancelled, RateLimiter};
pub use slots::{SlotManager, SlotPermit, SlotWaitCancelled};

use std::sync::Arc;
use std::time::Duration;

use genrelay_config::RelayConfig;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Scheduling hint recorded with the task; admission order itself is FIFO
/// per provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// Options for one scheduled task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub provider: String,
    pub priority: TaskPriority,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    /// Caller-supplied id for log correlation.
    pub task_id: Option<String>,
}

impl TaskSpec {
    pub fn new(provider: impl Into<String>, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            provider: provider.into(),
            priority: TaskPriority::Normal,
            timeout,
            cancel,
            task_id: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Terminal failure of a scheduled task.
///
/// Only `TimedOut` and `Cancelled` are classified here; `Failed` carries the
/// raw error untouched so categorization happens exactly once, downstream.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    #[error("task cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Result of one scheduled task, with wait-phase timings.
#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub result: Result<T, TaskError>,
    pub execution_ms: u64,
    pub rate_limit_wait_ms: u64,
    pub slot_wait_ms: u64,
}

impl<T> TaskOutcome<T> {
    fn short_circuit(error: TaskError, rate_limit_wait: Duration, slot_wait: Duration) -> Self {
        Self {
            result: Err(error),
            execution_ms: 0,
            rate_limit_wait_ms: rate_limit_wait.as_millis() as u64,
            slot_wait_ms: slot_wait.as_millis() as u64,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.result, Err(TaskError::TimedOut(_)))
    }

    pub fn cancelled(&self) -> bool {
        matches!(self.result, Err(TaskError::Cancelled))
    }
}

/// Admits tasks against rate and concurrency budgets and runs them under a
/// timeout. One instance is shared by all callers; per-provider state is
/// created lazily.
pub struct Scheduler {
    config: Arc<RelayConfig>,
    rate: RateLimiter,
    slots: SlotManager,
}

impl Scheduler {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        let rate = RateLimiter::new(config.safety_buffer());
        let slots = SlotManager::new(config.global_max_concurrent);
        Self {
            config,
            rate,
            slots,
        }
    }

    /// Run `execute` once through rate-limit admission, slot acquisition and
    /// timeout-bounded execution.
    ///
    /// The closure receives a child token that fires when either the timeout
    /// elapses or the caller's token cancels.
    pub async fn schedule<T, F, Fut>(&self, spec: TaskSpec, execute: F) -> TaskOutcome<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let limits = self.config.provider_limits(&spec.provider);

        if spec.cancel.is_cancelled() {
            return TaskOutcome::short_circuit(TaskError::Cancelled, Duration::ZERO, Duration::ZERO);
        }

        // 1. Rate-limit admission.
        let rate_limit_wait = match self
            .rate
            .admit(&spec.provider, limits.rate_limit, &spec.cancel)
            .await
        {
            Ok(waited) => waited,
            Err(AdmissionCancelled) => {
                return TaskOutcome::short_circuit(
                    TaskError::Cancelled,
                    Duration::ZERO,
                    Duration::ZERO,
                );
            }
        };

        // 2. Concurrency slot.
        let (permit, slot_wait) = match self
            .slots
            .acquire(&spec.provider, limits.max_concurrent, &spec.cancel)
            .await
        {
            Ok(acquired) => acquired,
            Err(SlotWaitCancelled) => {
                return TaskOutcome::short_circuit(
                    TaskError::Cancelled,
                    rate_limit_wait,
                    Duration::ZERO,
                );
            }
        };

        trace!(
            provider = %spec.provider,
            priority = spec.priority.as_str(),
            task_id = spec.task_id.as_deref().unwrap_or("-"),
            rate_limit_wait_ms = rate_limit_wait.as_millis() as u64,
            slot_wait_ms = slot_wait.as_millis() as u64,
            "task admitted"
        );

        // 3. Execute under timeout + cancellation. The timeout branch wins
        // the race even when the aborted call surfaces its own error.
        let child = spec.cancel.child_token();
        let started = Instant::now();
        let result = tokio::select! {
            _ = tokio::time::sleep(spec.timeout) => {
                child.cancel();
                debug!(provider = %spec.provider, timeout_ms = spec.timeout.as_millis() as u64, "task timed out");
                Err(TaskError::TimedOut(spec.timeout))
            }
            _ = spec.cancel.cancelled() => {
                child.cancel();
                Err(TaskError::Cancelled)
            }
            res = execute(child.clone()) => res.map_err(TaskError::Failed),
        };
        let execution_ms = started.elapsed().as_millis() as u64;
        drop(permit);

        TaskOutcome {
            result,
            execution_ms,
            rate_limit_wait_ms: rate_limit_wait.as_millis() as u64,
            slot_wait_ms: slot_wait.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genrelay_config::{ProviderLimits, RateLimitConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config_with(provider: &str, limits: ProviderLimits, global: u32) -> Arc<RelayConfig> {
        let mut config = RelayConfig {
            global_max_concurrent: global,
            rate_limit_safety_buffer_ms: 50,
            ..Default::default()
        };
        config.providers.insert(provider.to_string(), limits);
        Arc::new(config)
    }

    fn spec(provider: &str, timeout_ms: u64) -> TaskSpec {
        TaskSpec::new(
            provider,
            Duration::from_millis(timeout_ms),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_reports_timings() {
        let scheduler = Scheduler::new(Arc::new(RelayConfig::default()));
        let outcome = scheduler
            .schedule(spec("p", 1000), |_cancel| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(7u32)
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 7);
        assert_eq!(outcome.execution_ms, 30);
        assert_eq!(outcome.rate_limit_wait_ms, 0);
        assert_eq!(outcome.slot_wait_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_beats_slow_call() {
        let scheduler = Scheduler::new(Arc::new(RelayConfig::default()));
        let outcome: TaskOutcome<()> = scheduler
            .schedule(spec("p", 100), |_cancel| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(outcome.timed_out());
        assert_eq!(outcome.execution_ms, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wins_over_abort_shaped_error() {
        // A call that notices the timeout token and errors out must still be
        // reported as TimedOut, not as a generic failure.
        let scheduler = Scheduler::new(Arc::new(RelayConfig::default()));
        let outcome: TaskOutcome<()> = scheduler
            .schedule(spec("p", 100), |cancel| async move {
                cancel.cancelled().await;
                anyhow::bail!("request aborted")
            })
            .await;

        assert!(outcome.timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start() {
        let scheduler = Scheduler::new(Arc::new(RelayConfig::default()));
        let mut task = spec("p", 1000);
        task.cancel.cancel();

        let executed = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&executed);
        let outcome: TaskOutcome<()> = scheduler
            .schedule(task, move |_cancel| async move {
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(outcome.cancelled());
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_execution() {
        let scheduler = Arc::new(Scheduler::new(Arc::new(RelayConfig::default())));
        let cancel = CancellationToken::new();
        let mut task = spec("p", 60_000);
        task.cancel = cancel.clone();

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler
                    .schedule(task, |_c| async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(1u8)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let outcome = handle.await.unwrap();
        assert!(outcome.cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_scenario_two_per_second() {
        // maxRequests=2, windowMs=1000: of three calls submitted together,
        // two start immediately and the third at ~window + safety buffer.
        let limits = ProviderLimits {
            max_concurrent: 3,
            rate_limit: RateLimitConfig {
                max_requests: 2,
                window_ms: 1000,
            },
        };
        let scheduler = Arc::new(Scheduler::new(config_with("p", limits, 6)));

        let t0 = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                scheduler
                    .schedule(spec("p", 60_000), |_c| async { Ok(Instant::now()) })
                    .await
            }));
        }

        let mut starts = Vec::new();
        for h in handles {
            starts.push(h.await.unwrap().result.unwrap());
        }
        starts.sort();

        assert_eq!(starts[0].duration_since(t0), Duration::ZERO);
        assert_eq!(starts[1].duration_since(t0), Duration::ZERO);
        assert_eq!(starts[2].duration_since(t0), Duration::from_millis(1050));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_released_after_failure() {
        let limits = ProviderLimits {
            max_concurrent: 1,
            rate_limit: RateLimitConfig {
                max_requests: 100,
                window_ms: 1000,
            },
        };
        let scheduler = Scheduler::new(config_with("p", limits, 6));

        let outcome: TaskOutcome<()> = scheduler
            .schedule(spec("p", 1000), |_c| async { anyhow::bail!("boom") })
            .await;
        assert!(matches!(outcome.result, Err(TaskError::Failed(_))));

        // The failed task's slot must be free again.
        let outcome = scheduler
            .schedule(spec("p", 1000), |_c| async { Ok(2u8) })
            .await;
        assert_eq!(outcome.result.unwrap(), 2);
        assert_eq!(outcome.slot_wait_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_error_passes_through() {
        let scheduler = Scheduler::new(Arc::new(RelayConfig::default()));
        let outcome: TaskOutcome<()> = scheduler
            .schedule(spec("p", 1000), |_c| async {
                anyhow::bail!("HTTP 503 Service Unavailable")
            })
            .await;

        match outcome.result {
            Err(TaskError::Failed(e)) => {
                assert_eq!(e.to_string(), "HTTP 503 Service Unavailable");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
