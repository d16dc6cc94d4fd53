//! Crash-recovery analysis for interrupted builds.
//!
//! The persisted state document can lag the durable idempotency-key store by
//! up to one throttle interval, so recovery trusts the key store for artifact
//! counts and uses the state document only for stage structure.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::info;

use crate::store::DocumentStore;
use crate::{BuildState, StageStatus};

/// How far one stage got before the crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRecovery {
    Completed,
    /// Some seeds are durable; rerun the stage skipping those.
    PartiallySeeded,
    NotStarted,
}

/// Recovery plan for one interrupted build.
#[derive(Debug)]
pub struct RecoveryAnalysis {
    pub build_id: String,
    pub stages: BTreeMap<String, StageRecovery>,
    /// Stages that still need work, in stage order.
    pub incomplete_pools: Vec<String>,
    /// Durable seed count per stage, from the key store.
    pub persisted_seed_counts: BTreeMap<String, u32>,
}

impl RecoveryAnalysis {
    pub fn is_complete(&self) -> bool {
        self.incomplete_pools.is_empty()
    }
}

/// Compare a persisted build state against the durable key store.
///
/// A stage counts as completed when its status says so or when every
/// expected seed has a durable key; everything else is rerun, skipping seeds
/// that are already durable.
pub fn analyze(store: &dyn DocumentStore, state: &BuildState) -> Result<RecoveryAnalysis> {
    let mut stages = BTreeMap::new();
    let mut incomplete_pools = Vec::new();
    let mut persisted_seed_counts = BTreeMap::new();

    for (name, stage) in &state.stages {
        let mut durable = 0u32;
        for index in 0..stage.seeds_expected {
            if store.has_idempotency_key(&state.seed_key(name, index))? {
                durable += 1;
            }
        }
        persisted_seed_counts.insert(name.clone(), durable);

        let recovery = if stage.status == StageStatus::Completed
            || (stage.seeds_expected > 0 && durable == stage.seeds_expected)
        {
            StageRecovery::Completed
        } else if durable > 0 {
            StageRecovery::PartiallySeeded
        } else {
            StageRecovery::NotStarted
        };
        if recovery != StageRecovery::Completed {
            incomplete_pools.push(name.clone());
        }
        stages.insert(name.clone(), recovery);
    }

    info!(
        build_id = %state.build_id,
        incomplete = incomplete_pools.len(),
        total = state.stages.len(),
        "recovery analysis"
    );
    Ok(RecoveryAnalysis {
        build_id: state.build_id.clone(),
        stages,
        incomplete_pools,
        persisted_seed_counts,
    })
}

/// All non-terminal builds in the store, each with its recovery plan.
pub fn find_resumable(store: &dyn DocumentStore) -> Result<Vec<(BuildState, RecoveryAnalysis)>> {
    let mut resumable = Vec::new();
    for state in store.list_incomplete_builds()? {
        let analysis = analyze(store, &state)?;
        resumable.push((state, analysis));
    }
    Ok(resumable)
}
