use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::candidate::ProviderModel;

/// Failure taxonomy for provider calls.
///
/// Classification happens once, at the retry-manager boundary. The scheduler
/// only ever produces `Timeout` and `Cancelled`; everything else is derived
/// from the raw provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid or expired credentials. Never retried, never flags health.
    Auth,
    /// Request refused by the provider's safety layer.
    Safety,
    /// Any other permanent failure (bad request, unsupported model, ...).
    NonRetryable,
    /// Quota or rate-limit rejection from the provider side.
    Quota,
    /// The caller's cancellation token fired.
    Cancelled,
    /// The per-attempt timeout fired.
    Timeout,
    /// Transient failure (5xx, connection reset) worth retrying with backoff.
    RetryableTransient,
    /// Structured output was malformed or truncated; retried in repair mode.
    RetryableParse,
}

impl ErrorCategory {
    /// Whether the retry manager may attempt this call again at all.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RetryableTransient | Self::RetryableParse
        )
    }

    /// Whether this outcome counts toward circuit-breaker health.
    ///
    /// Auth and safety rejections say nothing about provider availability,
    /// and a parse failure is a model-output problem, not an outage. Repeated
    /// timeouts, 5xx responses, and quota rejections do mark a provider
    /// unhealthy.
    pub fn counts_for_breaker(&self) -> bool {
        matches!(self, Self::Quota | Self::Timeout | Self::RetryableTransient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Safety => "safety",
            Self::NonRetryable => "non_retryable",
            Self::Quota => "quota",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::RetryableTransient => "retryable_transient",
            Self::RetryableParse => "retryable_parse",
        }
    }
}

/// A fully classified provider-call error with call-site context attached.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{}] {}:{} failed: {message}", category.as_str(), target.provider, target.model)]
pub struct GenError {
    pub category: ErrorCategory,
    pub target: ProviderModel,
    /// Generation stage this call belonged to, when known.
    pub stage: Option<String>,
    pub message: String,
    /// Provider-supplied retry-after hint; overrides computed backoff.
    pub retry_after: Option<Duration>,
}

impl GenError {
    pub fn new(
        category: ErrorCategory,
        target: ProviderModel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            target,
            stage: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}
