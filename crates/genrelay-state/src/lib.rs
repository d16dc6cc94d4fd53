//! Build state tracking with idempotent artifact persistence.
//!
//! A build is a multi-stage job where each stage makes one or more
//! orchestrated calls and persists generated artifacts ("seeds"). The
//! manager keeps the in-memory state, records every artifact under a durable
//! idempotency key before counting it, and persists progress on a coalesced
//! schedule so a crash loses at most one throttle interval of bookkeeping,
//! never an artifact.

mod recovery;
mod store;

pub use recovery::{RecoveryAnalysis, StageRecovery, analyze, find_resumable};
pub use store::{DocumentStore, FsStore, MemoryStore};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use genrelay_core::CallTelemetry;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};
use ulid::Ulid;

/// Lifecycle of one stage within a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Infrastructure,
    Generating,
    Persisting,
    Completed,
    Failed,
}

impl StageStatus {
    /// Position in the forward-only lifecycle. Status may only move to a
    /// higher rank, except through an explicit stage retry.
    fn rank(self) -> u8 {
        match self {
            StageStatus::Pending => 0,
            StageStatus::Infrastructure => 1,
            StageStatus::Generating => 2,
            StageStatus::Persisting => 3,
            StageStatus::Completed => 4,
            StageStatus::Failed => 5,
        }
    }
}

/// Overall build status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    pub seeds_expected: u32,
    pub seeds_persisted: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted record of one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildState {
    pub build_id: String,
    pub world_id: String,
    pub status: BuildStatus,
    pub terminal: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stages: BTreeMap<String, StageState>,
    pub total_calls: u64,
    pub total_attempts: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl BuildState {
    pub fn new(build_id: impl Into<String>, world_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            build_id: build_id.into(),
            world_id: world_id.into(),
            status: BuildStatus::Running,
            terminal: false,
            started_at: now,
            updated_at: now,
            stages: BTreeMap::new(),
            total_calls: 0,
            total_attempts: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }

    pub fn add_stage(&mut self, name: impl Into<String>, seeds_expected: u32) {
        self.stages.insert(
            name.into(),
            StageState {
                status: StageStatus::Pending,
                seeds_expected,
                seeds_persisted: 0,
                error: None,
            },
        );
    }

    /// Idempotency key for one artifact of one stage.
    pub fn seed_key(&self, stage: &str, index: u32) -> String {
        format!("{}:{stage}:{index}", self.build_id)
    }
}

/// Aggregated provider usage for one build.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TelemetrySummary {
    pub total_calls: u64,
    pub total_attempts: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

struct Inner {
    state: BuildState,
    last_persist: Option<Instant>,
}

/// Owns one build's state and its persistence schedule.
pub struct BuildStateManager {
    store: Arc<dyn DocumentStore>,
    persist_interval: Duration,
    inner: Mutex<Inner>,
}

impl BuildStateManager {
    /// Start a new build with the given stages, force-flushing the initial
    /// state so a crash right after start is still discoverable.
    pub fn create(
        store: Arc<dyn DocumentStore>,
        world_id: impl Into<String>,
        stages: &[(&str, u32)],
        persist_interval: Duration,
    ) -> Result<Self> {
        let mut state = BuildState::new(Ulid::new().to_string(), world_id);
        for (name, seeds_expected) in stages {
            state.add_stage(*name, *seeds_expected);
        }
        info!(build_id = %state.build_id, world_id = %state.world_id, "starting build");
        store.persist(&state)?;
        Ok(Self {
            store,
            persist_interval,
            inner: Mutex::new(Inner {
                state,
                last_persist: Some(Instant::now()),
            }),
        })
    }

    /// Resume a previously persisted build.
    pub fn restore(
        store: Arc<dyn DocumentStore>,
        build_id: &str,
        persist_interval: Duration,
    ) -> Result<Option<Self>> {
        let Some(state) = store.load_build_state(build_id)? else {
            return Ok(None);
        };
        info!(build_id = %state.build_id, "restored build state");
        Ok(Some(Self {
            store,
            persist_interval,
            inner: Mutex::new(Inner {
                state,
                last_persist: None,
            }),
        }))
    }

    pub fn build_id(&self) -> String {
        self.lock().state.build_id.clone()
    }

    pub fn snapshot(&self) -> BuildState {
        self.lock().state.clone()
    }

    /// Move a stage forward in its lifecycle. Regressions are rejected; use
    /// [`reset_stage_for_retry`](Self::reset_stage_for_retry) to rerun a stage.
    pub fn update_progress(&self, stage: &str, status: StageStatus) -> Result<()> {
        {
            let mut inner = self.lock();
            let current = stage_mut(&mut inner.state, stage)?;
            if status.rank() < current.status.rank() {
                bail!(
                    "stage '{stage}' cannot move from {:?} to {status:?}",
                    current.status
                );
            }
            current.status = status;
            touch(&mut inner);
        }
        self.persist_throttled()
    }

    pub fn mark_infrastructure_persisted(&self, stage: &str) -> Result<()> {
        self.update_progress(stage, StageStatus::Infrastructure)
    }

    /// Durably record one generated artifact.
    ///
    /// `write_artifact` runs only when the key has never been recorded;
    /// replaying an already-recorded seed is a no-op and returns `false`.
    /// The key is recorded after a successful write, so a crash between the
    /// two re-runs the write on recovery (writes must themselves be
    /// idempotent or harmless to repeat).
    pub fn record_seed(
        &self,
        stage: &str,
        index: u32,
        write_artifact: impl FnOnce() -> Result<()>,
    ) -> Result<bool> {
        let key = {
            let inner = self.lock();
            inner.state.seed_key(stage, index)
        };
        if self.store.has_idempotency_key(&key)? {
            debug!(%key, "seed already persisted, skipping");
            return Ok(false);
        }
        write_artifact()?;
        self.store.record_idempotency_key(&key)?;
        {
            let mut inner = self.lock();
            let stage_state = stage_mut(&mut inner.state, stage)?;
            stage_state.seeds_persisted += 1;
            touch(&mut inner);
        }
        self.persist_throttled()?;
        Ok(true)
    }

    /// Mark every seed of a stage durable and the stage complete.
    pub fn mark_seeds_persisted(&self, stage: &str) -> Result<()> {
        self.update_progress(stage, StageStatus::Completed)
    }

    pub fn mark_pool_failed(&self, stage: &str, error: impl Into<String>) -> Result<()> {
        {
            let mut inner = self.lock();
            let stage_state = stage_mut(&mut inner.state, stage)?;
            stage_state.status = StageStatus::Failed;
            stage_state.error = Some(error.into());
            touch(&mut inner);
        }
        self.persist_throttled()
    }

    /// Put a stage back to pending so it can be rerun. Persisted seed counts
    /// are kept; recovery skips seeds that are already durable.
    pub fn reset_stage_for_retry(&self, stage: &str) -> Result<()> {
        {
            let mut inner = self.lock();
            let stage_state = stage_mut(&mut inner.state, stage)?;
            stage_state.status = StageStatus::Pending;
            stage_state.error = None;
            touch(&mut inner);
        }
        self.flush()
    }

    pub fn mark_completed(&self) -> Result<()> {
        self.finish(BuildStatus::Completed)
    }

    pub fn mark_cancelled(&self) -> Result<()> {
        self.finish(BuildStatus::Cancelled)
    }

    pub fn mark_failed(&self) -> Result<()> {
        self.finish(BuildStatus::Failed)
    }

    /// Fold one finished call's telemetry into the build counters.
    pub fn record_call_telemetry(&self, telemetry: &CallTelemetry) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.state.total_calls += 1;
            inner.state.total_attempts += u64::from(telemetry.total_attempts);
            inner.state.prompt_tokens += telemetry.prompt_tokens;
            inner.state.completion_tokens += telemetry.completion_tokens;
            touch(&mut inner);
        }
        self.persist_throttled()
    }

    pub fn telemetry_summary(&self) -> TelemetrySummary {
        let inner = self.lock();
        TelemetrySummary {
            total_calls: inner.state.total_calls,
            total_attempts: inner.state.total_attempts,
            prompt_tokens: inner.state.prompt_tokens,
            completion_tokens: inner.state.completion_tokens,
        }
    }

    /// Persist immediately regardless of the throttle.
    pub fn flush(&self) -> Result<()> {
        let state = {
            let mut inner = self.lock();
            inner.last_persist = Some(Instant::now());
            inner.state.clone()
        };
        self.store.persist(&state)
    }

    /// Remove all durable traces of this build after explicit cleanup.
    pub fn clear(&self) -> Result<()> {
        let build_id = self.build_id();
        self.store.clear_job(&build_id)
    }

    fn finish(&self, status: BuildStatus) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.state.status = status;
            inner.state.terminal = true;
            touch(&mut inner);
        }
        info!(build_id = %self.build_id(), ?status, "build finished");
        // Terminal transitions are always force-flushed.
        self.flush()
    }

    /// Persist only if the throttle interval has elapsed since the last
    /// write; otherwise leave the state dirty for a later flush.
    fn persist_throttled(&self) -> Result<()> {
        let state = {
            let mut inner = self.lock();
            let due = inner
                .last_persist
                .is_none_or(|at| at.elapsed() >= self.persist_interval);
            if !due {
                return Ok(());
            }
            inner.last_persist = Some(Instant::now());
            inner.state.clone()
        };
        self.store.persist(&state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn stage_mut<'a>(state: &'a mut BuildState, stage: &str) -> Result<&'a mut StageState> {
    match state.stages.get_mut(stage) {
        Some(s) => Ok(s),
        None => bail!("unknown stage '{stage}'"),
    }
}

fn touch(inner: &mut Inner) {
    inner.state.updated_at = Utc::now();
}
