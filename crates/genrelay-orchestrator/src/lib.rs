//! The single entry point for resilient provider calls.
//!
//! One logical call walks a stage's candidate route: check the circuit, run
//! the candidate under the retry manager (which schedules every attempt),
//! feed each attempt outcome back to the breaker, and fall back down the
//! route when a candidate fails permanently. Telemetry for the whole walk is
//! aggregated and handed to registered sinks.

mod facade;
mod provider;

pub use facade::{GenerateOptions, OrchestratorFacade};
pub use provider::{CallParams, Provider, ProviderRegistry, ProviderRequest, ProviderResponse};

use std::sync::Arc;
use std::time::Duration;

use genrelay_breaker::CircuitBreaker;
use genrelay_config::{ConfigError, RelayConfig};
use genrelay_core::{
    AttemptOutcome, AttemptTelemetry, CallTelemetry, ErrorCategory, GenError, ProviderModel,
    TelemetrySink,
};
use genrelay_retry::{RetryContext, RetryManager, RetryOptions};
use genrelay_router::FallbackRouter;
use genrelay_scheduler::Scheduler;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Options for one logical call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub stage: String,
    /// Per-attempt timeout; defaults to the configured attempt timeout.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl CallOptions {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of one logical call plus everything observed while making it.
#[derive(Debug)]
pub struct CallOutcome<T> {
    pub result: Result<T, GenError>,
    pub telemetry: CallTelemetry,
}

pub struct Orchestrator {
    config: Arc<RelayConfig>,
    retry: RetryManager,
    breaker: Arc<CircuitBreaker>,
    router: FallbackRouter,
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl Orchestrator {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&config)));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker));
        let router = FallbackRouter::new(Arc::clone(&config), Arc::clone(&breaker));
        Self {
            retry: RetryManager::new(scheduler),
            breaker,
            router,
            sinks: Vec::new(),
            config,
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }

    pub fn config(&self) -> &Arc<RelayConfig> {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run one logical call over the stage's candidate route.
    ///
    /// `execute` performs a single attempt against the given candidate; it is
    /// invoked once per attempt with the current retry context and a token
    /// that fires on timeout or caller cancellation. Fails fast with a
    /// `ConfigError` when the stage has no usable route.
    pub async fn call<T, F, Fut>(
        &self,
        opts: CallOptions,
        mut execute: F,
    ) -> Result<CallOutcome<T>, ConfigError>
    where
        F: FnMut(ProviderModel, RetryContext, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut session = self.router.create_session(&opts.stage)?;
        let mut telemetry = CallTelemetry::new(&opts.stage);
        let started = Instant::now();
        let timeout = opts.timeout.unwrap_or_else(|| self.config.attempt_timeout());
        let mut last_error: Option<GenError> = None;

        let final_result = loop {
            let Some(candidate) = self.router.next(&mut session, last_error.take()) else {
                break Err(self.exhausted_error(&session));
            };
            let key = candidate.target.key();

            if !self.breaker.can_execute(&key) {
                debug!(stage = %opts.stage, candidate = %candidate.target, "circuit open, skipping");
                telemetry.total_attempts += 1;
                telemetry.attempts.push(AttemptTelemetry {
                    target: candidate.target.clone(),
                    attempt: telemetry.total_attempts,
                    outcome: AttemptOutcome::CircuitOpen,
                    duration_ms: 0,
                    rate_limit_wait_ms: 0,
                    slot_wait_ms: 0,
                });
                continue;
            }

            let retry_opts = RetryOptions {
                target: candidate.target.clone(),
                stage: Some(opts.stage.clone()),
                timeout,
                cancel: opts.cancel.clone(),
                config: self.config.retry,
            };
            let outcome = self
                .retry
                .with_retry(
                    retry_opts,
                    |error| {
                        self.breaker
                            .record_outcome(&key, error.map(|e| &e.category));
                    },
                    |context, token| execute(candidate.target.clone(), context, token),
                )
                .await;

            for mut attempt in outcome.attempts {
                telemetry.total_attempts += 1;
                attempt.attempt = telemetry.total_attempts;
                telemetry.attempts.push(attempt);
            }

            match outcome.result {
                Ok(value) => break Ok(value),
                Err(error) => {
                    warn!(
                        stage = %opts.stage,
                        candidate = %candidate.target,
                        category = error.category.as_str(),
                        attempts = outcome.total_attempts,
                        "candidate failed"
                    );
                    telemetry.cancelled |= outcome.cancelled;
                    telemetry.timed_out |= outcome.timed_out;
                    last_error = Some(error);
                }
            }
        };

        telemetry.providers_tried = distinct_providers(&session.tried);
        telemetry.fallback_occurred = session.fallback_occurred;
        telemetry.total_ms = started.elapsed().as_millis() as u64;
        if let Err(error) = &final_result {
            telemetry.cancelled |= error.category == ErrorCategory::Cancelled;
            telemetry.timed_out |= error.category == ErrorCategory::Timeout;
        }
        info!(
            stage = %opts.stage,
            success = final_result.is_ok(),
            attempts = telemetry.total_attempts,
            providers = telemetry.providers_tried,
            total_ms = telemetry.total_ms,
            "call finished"
        );
        self.deliver(&telemetry);

        Ok(CallOutcome {
            result: final_result,
            telemetry,
        })
    }

    fn exhausted_error(&self, session: &genrelay_router::FallbackSession) -> GenError {
        if let Some(error) = session.last_error.clone() {
            return error;
        }
        // Nothing was ever attempted: every candidate's circuit was open.
        let target = session
            .candidates()
            .first()
            .cloned()
            .unwrap_or_else(|| ProviderModel::new("none", "none"));
        GenError::new(
            ErrorCategory::NonRetryable,
            target,
            format!(
                "no candidate available: every candidate of {} skipped (circuit open)",
                session.candidates().len()
            ),
        )
        .with_stage(session.stage())
    }

    fn deliver(&self, telemetry: &CallTelemetry) {
        for sink in &self.sinks {
            sink.on_telemetry(telemetry);
        }
    }
}

fn distinct_providers(tried: &[ProviderModel]) -> u32 {
    let mut seen: Vec<&str> = Vec::new();
    for candidate in tried {
        if !seen.contains(&candidate.provider.as_str()) {
            seen.push(&candidate.provider);
        }
    }
    seen.len() as u32
}
