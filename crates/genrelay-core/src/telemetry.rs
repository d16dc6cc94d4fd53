//! Per-call telemetry accumulated by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::candidate::ProviderModel;
use crate::error::ErrorCategory;

/// Outcome of a single attempt within a logical call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AttemptOutcome {
    Success,
    /// Candidate skipped because its circuit was open; zero duration.
    CircuitOpen,
    Error { category: ErrorCategory },
}

/// One attempt record, in attempt order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptTelemetry {
    pub target: ProviderModel,
    /// 1-based attempt number within the whole logical call.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    /// Time spent waiting for rate-limit admission before this attempt.
    pub rate_limit_wait_ms: u64,
    /// Time spent waiting for a concurrency slot before this attempt.
    pub slot_wait_ms: u64,
}

/// Telemetry for one logical orchestrated call, across all candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTelemetry {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub total_attempts: u32,
    pub providers_tried: u32,
    pub attempts: Vec<AttemptTelemetry>,
    pub fallback_occurred: bool,
    pub cancelled: bool,
    pub timed_out: bool,
    pub total_ms: u64,
    /// Token usage reported by the provider on the successful attempt.
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl CallTelemetry {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            started_at: Utc::now(),
            total_attempts: 0,
            providers_tried: 0,
            attempts: Vec::new(),
            fallback_occurred: false,
            cancelled: false,
            timed_out: false,
            total_ms: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.attempts
            .last()
            .is_some_and(|a| a.outcome == AttemptOutcome::Success)
    }
}

/// Fire-and-forget observer for completed call telemetry.
///
/// Delivery order matches call completion order; implementations must not
/// block the calling task.
pub trait TelemetrySink: Send + Sync {
    fn on_telemetry(&self, telemetry: &CallTelemetry);
}
