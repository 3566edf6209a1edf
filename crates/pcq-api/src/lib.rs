use std::path::PathBuf;

use anyhow::Result;
use pcq_core::{
    ensure_migrations_applied, AnswerUpdate, FieldKey, PcqError, PcqId, QuestionnaireRecord,
};
use pcq_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};

pub mod disposal;
pub mod job;

pub use disposal::{DisposalEngine, DisposalOutcome, RetentionStore};
pub use job::{run_disposal_job, JobReport, JobTrigger};
pub use pcq_store_sqlite::SchemaStatus;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_scripts: Vec<String>,
    pub applied_scripts: Vec<String>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkCaseResult {
    pub pcq_id: PcqId,
    pub case_id: String,
    pub linked: bool,
}

/// Refuse to hand out a store whose schema has unapplied migrations.
///
/// # Errors
/// Returns [`PcqError::MigrationPending`] naming the first pending script, or an error when
/// migration metadata cannot be read.
pub fn ensure_schema_current(store: &SqliteStore) -> Result<()> {
    let migrations = store.migration_descriptors()?;
    if let Err(err) = ensure_migrations_applied(&migrations) {
        tracing::error!(error = %err, "schema has unapplied migrations; refusing to start");
        return Err(err.into());
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PcqApi {
    db_path: PathBuf,
}

impl PcqApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    /// Open the store after checking that every migration has been applied.
    ///
    /// # Errors
    /// Returns [`PcqError::MigrationPending`] or an error when the database cannot be opened.
    pub fn open_checked_store(&self) -> Result<SqliteStore> {
        let store = SqliteStore::open(&self.db_path)?;
        ensure_schema_current(&store)?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        SqliteStore::open(&self.db_path)?.schema_status()
    }

    /// Apply pending migrations, or report the planned scripts in dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_scripts: before.pending_scripts,
                applied_scripts: Vec::new(),
                up_to_date: None,
            });
        }

        let applied_scripts = store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: after.current_version,
            target_version: after.target_version,
            would_apply_scripts: before.pending_scripts,
            applied_scripts,
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when validation, sealing, or persistence fails.
    pub fn save_answers(&self, record: &QuestionnaireRecord, key: &FieldKey) -> Result<()> {
        let mut store = self.open_checked_store()?;
        store.save(record, key)
    }

    /// Fetch a record that is expected to exist.
    ///
    /// # Errors
    /// Returns [`PcqError::NotFound`] when absent and [`PcqError::DecryptionFailed`] when
    /// `key` does not open the protected field.
    pub fn get_answers(&self, pcq_id: &PcqId, key: &FieldKey) -> Result<QuestionnaireRecord> {
        let store = self.open_checked_store()?;
        match store.get(pcq_id, key)? {
            Some(record) => Ok(record),
            None => Err(PcqError::NotFound(pcq_id.to_string()).into()),
        }
    }

    /// # Errors
    /// Returns an error when lookup or decryption fails.
    pub fn find_by_dcn_number(
        &self,
        dcn_number: &str,
        key: &FieldKey,
    ) -> Result<Vec<QuestionnaireRecord>> {
        let store = self.open_checked_store()?;
        store.find_by_dcn_number(dcn_number, key)
    }

    /// # Errors
    /// Returns an error when lookup or decryption fails.
    pub fn find_by_case_id(
        &self,
        case_id: &str,
        key: &FieldKey,
    ) -> Result<Vec<QuestionnaireRecord>> {
        let store = self.open_checked_store()?;
        store.find_by_case_id(case_id, key)
    }

    /// # Errors
    /// Returns an error when lookup or decryption fails.
    pub fn list_without_case(
        &self,
        limit: u32,
        key: &FieldKey,
    ) -> Result<Vec<QuestionnaireRecord>> {
        let store = self.open_checked_store()?;
        store.list_without_case(limit, key)
    }

    /// Link a record to a case. An already-linked or missing record is reported, not an error.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn link_case(&self, pcq_id: &PcqId, case_id: &str) -> Result<LinkCaseResult> {
        let mut store = self.open_checked_store()?;
        let changed = store.update_case(pcq_id, case_id)?;
        if changed == 0 {
            tracing::info!(pcq_id = %pcq_id, "no unlinked pcq record to link");
        }
        Ok(LinkCaseResult {
            pcq_id: pcq_id.clone(),
            case_id: case_id.to_string(),
            linked: changed > 0,
        })
    }

    /// Apply a newer answer set.
    ///
    /// # Errors
    /// Returns [`PcqError::StaleWrite`] when the stored answers are already as new or newer,
    /// and [`PcqError::NotFound`] when the record does not exist.
    pub fn submit_answers(&self, pcq_id: &PcqId, update: &AnswerUpdate) -> Result<()> {
        let mut store = self.open_checked_store()?;
        if store.update_answers(pcq_id, update)? > 0 {
            return Ok(());
        }

        if store.exists(pcq_id)? {
            tracing::info!(pcq_id = %pcq_id, "discarding superseded pcq submission");
            return Err(PcqError::StaleWrite(pcq_id.to_string()).into());
        }
        Err(PcqError::NotFound(pcq_id.to_string()).into())
    }

    /// Re-seal one record's protected field under a new key.
    ///
    /// # Errors
    /// Returns [`PcqError::NotFound`] when absent, or an error when `old_key` is wrong.
    pub fn reseal(&self, pcq_id: &PcqId, old_key: &FieldKey, new_key: &FieldKey) -> Result<()> {
        let mut store = self.open_checked_store()?;
        if store.reseal(pcq_id, old_key, new_key)? == 0 {
            return Err(PcqError::NotFound(pcq_id.to_string()).into());
        }
        Ok(())
    }

    /// Administrative single-record delete. Returns rows removed (0 when already absent).
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_record(&self, pcq_id: &PcqId) -> Result<usize> {
        let mut store = self.open_checked_store()?;
        let deleted = store.delete(pcq_id)?;
        tracing::info!(pcq_id = %pcq_id, deleted, "administrative pcq delete");
        Ok(deleted)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_records(&self) -> Result<usize> {
        self.open_checked_store()?.count()
    }
}
