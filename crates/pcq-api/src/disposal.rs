//! Retention sweep for questionnaires that were never linked to a case.
//!
//! One run walks `enabled -> leader -> query -> log -> (dry run | delete)` and keeps
//! no state between runs. Deletes go one record at a time and re-check the case
//! linkage, so a record linked after the query survives the sweep.

use std::sync::Arc;

use anyhow::{Context, Result};
use pcq_core::{DisposalCandidate, DisposerConfig, LeadershipTracker, PcqError, PcqId};
use pcq_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const DISABLED_MESSAGE: &str = "PCQ disposer is disabled";
pub const NOT_LEADER_MESSAGE: &str = "Not the cluster leader, skipping PCQ disposal";
pub const DELETING_MESSAGE: &str = "Deleting PCQ records";

/// The two storage operations a sweep needs.
pub trait RetentionStore {
    /// # Errors
    /// Returns an error when the store cannot be queried.
    fn find_eligible_for_disposal(&self, cutoff: OffsetDateTime) -> Result<Vec<DisposalCandidate>>;

    /// Delete `pcq_id` only while it is still unlinked; returns rows removed.
    ///
    /// # Errors
    /// Returns an error when the store cannot be written.
    fn delete_if_unlinked(&mut self, pcq_id: &PcqId) -> Result<usize>;
}

impl RetentionStore for SqliteStore {
    fn find_eligible_for_disposal(&self, cutoff: OffsetDateTime) -> Result<Vec<DisposalCandidate>> {
        SqliteStore::find_eligible_for_disposal(self, cutoff)
    }

    fn delete_if_unlinked(&mut self, pcq_id: &PcqId) -> Result<usize> {
        SqliteStore::delete_if_unlinked(self, pcq_id)
    }
}

impl<T: RetentionStore + ?Sized> RetentionStore for &mut T {
    fn find_eligible_for_disposal(&self, cutoff: OffsetDateTime) -> Result<Vec<DisposalCandidate>> {
        (**self).find_eligible_for_disposal(cutoff)
    }

    fn delete_if_unlinked(&mut self, pcq_id: &PcqId) -> Result<usize> {
        (**self).delete_if_unlinked(pcq_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DisposalOutcome {
    Disabled,
    NotLeader,
    DryRun {
        candidates: Vec<PcqId>,
    },
    Completed {
        candidates: Vec<PcqId>,
        deleted: usize,
        /// Candidates that were linked or already gone by the time of their delete.
        skipped: Vec<PcqId>,
    },
}

impl DisposalOutcome {
    #[must_use]
    pub fn deleted(&self) -> usize {
        match self {
            Self::Completed { deleted, .. } => *deleted,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DisposalEngine {
    config: DisposerConfig,
    leadership: Arc<LeadershipTracker>,
}

impl DisposalEngine {
    #[must_use]
    pub fn new(config: DisposerConfig, leadership: Arc<LeadershipTracker>) -> Self {
        Self { config, leadership }
    }

    #[must_use]
    pub fn config(&self) -> DisposerConfig {
        self.config
    }

    /// Run one sweep against `store` using the current time.
    ///
    /// # Errors
    /// Returns [`PcqError::DisposalFailure`] (with the store error as its source) when the
    /// query or a delete fails. Records deleted before the failure stay deleted.
    pub fn dispose_pcq<S: RetentionStore>(&self, store: S) -> Result<DisposalOutcome> {
        self.dispose_pcq_at(store, OffsetDateTime::now_utc())
    }

    /// Run one sweep as of `now`.
    ///
    /// # Errors
    /// See [`DisposalEngine::dispose_pcq`].
    pub fn dispose_pcq_at<S: RetentionStore>(
        &self,
        store: S,
        now: OffsetDateTime,
    ) -> Result<DisposalOutcome> {
        self.dispose_pcq_with(|| Ok(store), now)
    }

    /// Run one sweep, obtaining the store only once the enable and leadership gates pass.
    ///
    /// # Errors
    /// Returns [`PcqError::DisposalFailure`] when the retention cutoff is out of range or
    /// `open_store` fails, or see [`DisposalEngine::dispose_pcq`].
    pub fn dispose_pcq_with<S, F>(
        &self,
        open_store: F,
        now: OffsetDateTime,
    ) -> Result<DisposalOutcome>
    where
        S: RetentionStore,
        F: FnOnce() -> Result<S>,
    {
        if !self.config.enabled {
            tracing::info!("{DISABLED_MESSAGE}");
            return Ok(DisposalOutcome::Disabled);
        }

        if !self.leadership.is_leader() {
            tracing::info!("{NOT_LEADER_MESSAGE}");
            return Ok(DisposalOutcome::NotLeader);
        }

        let out_of_range = PcqError::DisposalFailure("retention cutoff out of range".to_string());
        let cutoff = self.config.cutoff(now).context(out_of_range)?;
        let open_failed = PcqError::DisposalFailure("failed to open store".to_string());
        let mut store = open_store().context(open_failed)?;
        tracing::info!(
            retention_days = self.config.retention_days,
            dry_run = self.config.dry_run,
            %cutoff,
            "Looking for PCQ records without a case completed before the retention cutoff"
        );

        let query_failed = PcqError::DisposalFailure("eligibility query failed".to_string());
        let eligible = store
            .find_eligible_for_disposal(cutoff)
            .context(query_failed)?;

        let candidates = eligible
            .into_iter()
            .map(|candidate| candidate.pcq_id)
            .collect::<Vec<_>>();
        for pcq_id in &candidates {
            tracing::info!("PCQ id: {pcq_id}");
        }

        if self.config.dry_run {
            tracing::info!(
                "PCQ disposer dry run: {} record(s) eligible, no records removed",
                candidates.len()
            );
            return Ok(DisposalOutcome::DryRun { candidates });
        }

        tracing::info!("{DELETING_MESSAGE}");
        let mut deleted = 0;
        let mut skipped = Vec::new();
        for pcq_id in &candidates {
            let removed = store.delete_if_unlinked(pcq_id).with_context(|| {
                PcqError::DisposalFailure(format!(
                    "delete of pcq record {pcq_id} failed after {deleted} deletion(s)"
                ))
            })?;
            if removed == 0 {
                tracing::warn!(
                    pcq_id = %pcq_id,
                    "PCQ record was linked or removed before deletion, skipping"
                );
                skipped.push(pcq_id.clone());
            }
            deleted += removed;
        }

        tracing::info!("Deleted {deleted} PCQ record(s)");
        Ok(DisposalOutcome::Completed {
            candidates,
            deleted,
            skipped,
        })
    }
}
