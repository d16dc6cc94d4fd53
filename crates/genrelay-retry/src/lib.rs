//! Bounded retry around scheduled provider calls.
//!
//! Every attempt goes back through the scheduler so retries re-queue behind
//! rate limits and concurrency caps instead of squatting on a slot; backoff
//! sleeps happen here, outside the scheduler. This is also the single place
//! where raw failures are classified into the taxonomy.

mod backoff;
mod classify;
mod repair;

pub use backoff::backoff_delay;
pub use classify::{Classification, ErrorClassifier, PatternClassifier};
pub use repair::{RepairKind, repair_hint, repair_hint_for, repair_kind_for};

use std::sync::Arc;
use std::time::Duration;

use genrelay_config::RetryConfig;
use genrelay_core::{AttemptOutcome, AttemptTelemetry, ErrorCategory, GenError, ProviderModel};
use genrelay_scheduler::{Scheduler, TaskError, TaskSpec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Options for one retry-wrapped logical operation.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub target: ProviderModel,
    pub stage: Option<String>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub config: RetryConfig,
}

/// Per-attempt context handed to the executing closure.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Parse failures seen so far in this operation.
    pub parse_attempts: u32,
    /// Active from the attempt after the second parse failure.
    pub repair_mode: bool,
    pub repair_hint: Option<String>,
    pub previous_error: Option<GenError>,
}

/// Result of a retry-wrapped operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, GenError>,
    pub total_attempts: u32,
    /// Classified error of each failed attempt, in order.
    pub attempt_errors: Vec<GenError>,
    /// Telemetry per attempt (numbers local to this operation).
    pub attempts: Vec<AttemptTelemetry>,
    pub cancelled: bool,
    pub timed_out: bool,
}

/// Wraps operations in a bounded retry loop over a shared scheduler.
pub struct RetryManager {
    scheduler: Arc<Scheduler>,
    classifier: Box<dyn ErrorClassifier>,
}

impl RetryManager {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            classifier: Box::new(PatternClassifier),
        }
    }

    pub fn with_classifier(
        scheduler: Arc<Scheduler>,
        classifier: Box<dyn ErrorClassifier>,
    ) -> Self {
        Self {
            scheduler,
            classifier,
        }
    }

    /// Run `execute` until it succeeds, a non-retryable failure occurs, or a
    /// retry bound is exhausted. `on_attempt` sees the classified error (or
    /// `None` on success) after every attempt, in attempt order.
    pub async fn with_retry<T, F, Fut>(
        &self,
        opts: RetryOptions,
        mut on_attempt: impl FnMut(Option<&GenError>),
        mut execute: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(RetryContext, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt: u32 = 0;
        let mut parse_attempts: u32 = 0;
        let mut transient_failures: u32 = 0;
        let mut repair_mode = false;
        let mut repair_hint_text: Option<String> = None;
        let mut previous_error: Option<GenError> = None;
        let mut attempt_errors: Vec<GenError> = Vec::new();
        let mut attempts: Vec<AttemptTelemetry> = Vec::new();

        loop {
            attempt += 1;
            let context = RetryContext {
                attempt,
                parse_attempts,
                repair_mode,
                repair_hint: repair_hint_text.clone(),
                previous_error: previous_error.clone(),
            };

            let spec = TaskSpec::new(
                opts.target.provider.clone(),
                opts.timeout,
                opts.cancel.clone(),
            );
            let outcome = self
                .scheduler
                .schedule(spec, |token| execute(context, token))
                .await;

            let (telemetry_outcome, error) = match outcome.result {
                Ok(value) => {
                    on_attempt(None);
                    attempts.push(AttemptTelemetry {
                        target: opts.target.clone(),
                        attempt,
                        outcome: AttemptOutcome::Success,
                        duration_ms: outcome.execution_ms,
                        rate_limit_wait_ms: outcome.rate_limit_wait_ms,
                        slot_wait_ms: outcome.slot_wait_ms,
                    });
                    return RetryOutcome {
                        result: Ok(value),
                        total_attempts: attempt,
                        attempt_errors,
                        attempts,
                        cancelled: false,
                        timed_out: false,
                    };
                }
                Err(task_error) => {
                    let classified = self.classify(task_error, &opts);
                    (
                        AttemptOutcome::Error {
                            category: classified.category,
                        },
                        classified,
                    )
                }
            };

            on_attempt(Some(&error));
            attempts.push(AttemptTelemetry {
                target: opts.target.clone(),
                attempt,
                outcome: telemetry_outcome,
                duration_ms: outcome.execution_ms,
                rate_limit_wait_ms: outcome.rate_limit_wait_ms,
                slot_wait_ms: outcome.slot_wait_ms,
            });
            attempt_errors.push(error.clone());

            let give_up = |error: GenError, attempt_errors: Vec<GenError>, attempts| {
                let cancelled = error.category == ErrorCategory::Cancelled;
                let timed_out = error.category == ErrorCategory::Timeout;
                RetryOutcome {
                    result: Err(error),
                    total_attempts: attempt,
                    attempt_errors,
                    attempts,
                    cancelled,
                    timed_out,
                }
            };

            if !error.is_retryable() {
                return give_up(error, attempt_errors, attempts);
            }

            match error.category {
                ErrorCategory::RetryableParse => {
                    parse_attempts += 1;
                    if parse_attempts > opts.config.max_parse_retries {
                        debug!(model = %opts.target, parse_attempts, "parse retries exhausted");
                        return give_up(error, attempt_errors, attempts);
                    }
                    // The second parse failure switches the next attempt into
                    // repair mode with a targeted hint.
                    if parse_attempts >= 2 {
                        let (kind, hint) = repair_hint_for(&error.message);
                        debug!(model = %opts.target, ?kind, "activating repair mode");
                        repair_mode = true;
                        repair_hint_text = Some(hint.to_string());
                    }
                    previous_error = Some(error);
                    // Parse retries go straight back through the scheduler.
                }
                ErrorCategory::Timeout | ErrorCategory::RetryableTransient => {
                    transient_failures += 1;
                    if transient_failures > opts.config.max_transient_retries {
                        debug!(model = %opts.target, transient_failures, "transient retries exhausted");
                        return give_up(error, attempt_errors, attempts);
                    }
                    let delay =
                        backoff_delay(&opts.config, transient_failures, error.retry_after);
                    debug!(
                        model = %opts.target,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "backing off before retry"
                    );
                    previous_error = Some(error);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = opts.cancel.cancelled() => {
                            let cancelled_error = GenError::new(
                                ErrorCategory::Cancelled,
                                opts.target.clone(),
                                "cancelled during backoff",
                            );
                            return give_up(cancelled_error, attempt_errors, attempts);
                        }
                    }
                }
                // Unreachable: every other category is non-retryable.
                _ => return give_up(error, attempt_errors, attempts),
            }
        }
    }

    /// Classify a scheduler failure. Timeouts and cancellations are already
    /// classified; a typed `GenError` in the chain wins over the heuristics.
    fn classify(&self, task_error: TaskError, opts: &RetryOptions) -> GenError {
        let error = match task_error {
            TaskError::TimedOut(after) => GenError::new(
                ErrorCategory::Timeout,
                opts.target.clone(),
                format!("attempt timed out after {}ms", after.as_millis()),
            ),
            TaskError::Cancelled => GenError::new(
                ErrorCategory::Cancelled,
                opts.target.clone(),
                "cancelled by caller",
            ),
            TaskError::Failed(raw) => match raw.downcast_ref::<GenError>() {
                Some(typed) => typed.clone(),
                None => {
                    let classification = self.classifier.classify(&raw);
                    let mut error = GenError::new(
                        classification.category,
                        opts.target.clone(),
                        format!("{raw:#}"),
                    );
                    if let Some(delay) = classification.retry_after {
                        error = error.with_retry_after(delay);
                    }
                    error
                }
            },
        };
        match &opts.stage {
            Some(stage) if error.stage.is_none() => error.with_stage(stage.clone()),
            _ => error,
        }
    }
}
