//! Candidate selection and fallback across provider/model routes.
//!
//! Each generation stage has an ordered candidate list. A session walks that
//! list for one logical call: primary first, then the next untried candidate
//! whenever a failure category makes switching providers worthwhile.
//! Candidates whose circuit is open are skipped without being counted as
//! tried.

use std::sync::Arc;

use genrelay_breaker::CircuitBreaker;
use genrelay_config::{ConfigError, RelayConfig};
use genrelay_core::{ErrorCategory, GenError, ProviderModel};
use tracing::debug;

/// One logical call's walk over a stage's candidate list.
#[derive(Debug)]
pub struct FallbackSession {
    stage: String,
    candidates: Vec<ProviderModel>,
    next_index: usize,
    /// Candidates actually handed out, in order.
    pub tried: Vec<ProviderModel>,
    pub last_error: Option<GenError>,
    pub fallback_occurred: bool,
}

impl FallbackSession {
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn candidates(&self) -> &[ProviderModel] {
        &self.candidates
    }
}

/// Why a candidate was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// First candidate of the route.
    Primary,
    /// Previous candidate failed with this category.
    FallbackFromError(ErrorCategory),
    /// Previous candidate was skipped without an attempt (open circuit).
    AdvancedPastSkipped,
}

/// The candidate to try next.
#[derive(Debug, Clone)]
pub struct NextCandidate {
    pub target: ProviderModel,
    pub is_fallback: bool,
    pub reason: SelectionReason,
    /// Open-circuit candidates passed over to reach this one.
    pub skipped_open: u32,
}

/// Decides whether to stay on a candidate or advance down the route.
pub struct FallbackRouter {
    config: Arc<RelayConfig>,
    breaker: Arc<CircuitBreaker>,
}

impl FallbackRouter {
    pub fn new(config: Arc<RelayConfig>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { config, breaker }
    }

    /// Start a session over the stage's route (or the default route).
    pub fn create_session(&self, stage: &str) -> Result<FallbackSession, ConfigError> {
        let candidates = self.config.route_for_stage(stage)?;
        Ok(FallbackSession {
            stage: stage.to_string(),
            candidates,
            next_index: 0,
            tried: Vec::new(),
            last_error: None,
            fallback_occurred: false,
        })
    }

    /// Whether `error` justifies moving to another candidate. Auth and safety
    /// failures are caller problems that no other provider will fix, and a
    /// cancelled call must not restart anywhere.
    pub fn should_fallback(&self, error: &GenError) -> bool {
        !matches!(
            error.category,
            ErrorCategory::Auth | ErrorCategory::Safety | ErrorCategory::Cancelled
        )
    }

    /// Next candidate to try, or `None` when the route is exhausted or the
    /// last error rules out fallback. The first call returns the primary
    /// unconditionally; later calls skip candidates whose circuit is open.
    pub fn next(
        &self,
        session: &mut FallbackSession,
        last_error: Option<GenError>,
    ) -> Option<NextCandidate> {
        if let Some(error) = last_error {
            let fallback_ok = self.should_fallback(&error);
            session.last_error = Some(error);
            if !fallback_ok {
                debug!(
                    stage = %session.stage,
                    category = session.last_error.as_ref().map(|e| e.category.as_str()),
                    "terminal failure, not falling back"
                );
                return None;
            }
        }

        let first_call = session.tried.is_empty();
        let mut skipped_open = 0u32;

        while session.next_index < session.candidates.len() {
            let target = session.candidates[session.next_index].clone();
            session.next_index += 1;

            if !first_call && self.breaker.is_open(&target.key()) {
                debug!(stage = %session.stage, target = %target, "skipping open circuit");
                skipped_open += 1;
                continue;
            }

            let is_fallback = !first_call;
            if is_fallback {
                session.fallback_occurred = true;
            }
            let reason = if first_call {
                SelectionReason::Primary
            } else if let Some(error) = &session.last_error {
                SelectionReason::FallbackFromError(error.category)
            } else {
                SelectionReason::AdvancedPastSkipped
            };
            session.tried.push(target.clone());
            return Some(NextCandidate {
                target,
                is_fallback,
                reason,
                skipped_open,
            });
        }

        debug!(stage = %session.stage, skipped_open, "route exhausted");
        None
    }
}
