use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pcq_core::{
    normalize_timestamp, AnswerUpdate, Channel, DisposalCandidate, FieldKey, MigrationDescriptor,
    MigrationState, PcqAnswers, PcqError, PcqId, QuestionnaireRecord,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

mod cipher;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  script TEXT NOT NULL,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS protected_characteristics (
  pcq_id TEXT PRIMARY KEY,
  case_id TEXT,
  party_id TEXT NOT NULL,
  channel INTEGER NOT NULL CHECK (channel IN (1, 2)),
  completed_date TEXT NOT NULL,
  last_updated_timestamp TEXT NOT NULL,
  service_id TEXT NOT NULL,
  actor TEXT NOT NULL,
  version_number INTEGER NOT NULL CHECK (version_number >= 1),
  dcn_number TEXT,
  form_id TEXT,
  dob_provided INTEGER,
  language_main INTEGER,
  language_other TEXT,
  english_language_level INTEGER,
  sex INTEGER,
  gender_different INTEGER,
  gender_other TEXT,
  sexuality INTEGER,
  sexuality_other TEXT,
  marriage INTEGER,
  ethnicity INTEGER,
  ethnicity_other TEXT,
  religion INTEGER,
  religion_other TEXT,
  disability_conditions INTEGER,
  disability_impact INTEGER,
  pregnancy INTEGER,
  CHECK (last_updated_timestamp >= completed_date)
);

CREATE INDEX IF NOT EXISTS idx_pcq_case_id ON protected_characteristics(case_id);
CREATE INDEX IF NOT EXISTS idx_pcq_dcn_number ON protected_characteristics(dcn_number);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_pcq_unlinked_completed
  ON protected_characteristics(completed_date)
  WHERE case_id IS NULL;
";

/// Known schema migrations in application order.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "V001__create_protected_characteristics.sql", MIGRATION_001_SQL),
    (2, "V002__add_unlinked_completed_index.sql", MIGRATION_002_SQL),
];

const RECORD_COLUMNS: &str = "pcq_id, case_id, party_id, channel, completed_date,
    last_updated_timestamp, service_id, actor, version_number, dcn_number, form_id,
    dob_provided, language_main, language_other, english_language_level, sex,
    gender_different, gender_other, sexuality, sexuality_other, marriage, ethnicity,
    ethnicity_other, religion, religion_other, disability_conditions, disability_impact,
    pregnancy";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub pending_scripts: Vec<String>,
}

impl SqliteStore {
    /// Open a SQLite-backed questionnaire store and configure required runtime pragmas.
    ///
    /// Opening never creates or alters schema; see [`SqliteStore::migrate`].
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// List every known migration with its applied/pending state, in application order.
    ///
    /// Read-only: a database without migration bookkeeping reports everything pending.
    ///
    /// # Errors
    /// Returns an error when migration metadata cannot be read.
    pub fn migration_descriptors(&self) -> Result<Vec<MigrationDescriptor>> {
        let applied = applied_versions(&self.conn)?;
        Ok(MIGRATIONS
            .iter()
            .map(|(version, script, _)| MigrationDescriptor {
                version: *version,
                script: (*script).to_string(),
                state: if applied.contains(version) {
                    MigrationState::Applied
                } else {
                    MigrationState::Pending
                },
            })
            .collect())
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let descriptors = self.migration_descriptors()?;
        let current_version = descriptors
            .iter()
            .take_while(|migration| migration.state == MigrationState::Applied)
            .map(|migration| migration.version)
            .last()
            .unwrap_or(0);
        let (pending_versions, pending_scripts): (Vec<i64>, Vec<String>) = descriptors
            .iter()
            .filter(|migration| migration.state == MigrationState::Pending)
            .map(|migration| (migration.version, migration.script.clone()))
            .unzip();

        Ok(SchemaStatus {
            current_version,
            target_version: latest_schema_version(),
            pending_versions,
            pending_scripts,
        })
    }

    /// Apply all pending migrations in order, each in its own transaction.
    ///
    /// Reserved for the out-of-band migration command; running services only check.
    ///
    /// # Errors
    /// Returns an error when bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<Vec<String>> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let applied = applied_versions(&self.conn)?;
        let mut newly_applied = Vec::new();

        for (version, script, sql) in MIGRATIONS {
            if applied.contains(version) {
                continue;
            }

            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start transaction for {script}"))?;
            tx.execute_batch(sql)
                .with_context(|| format!("failed to apply {script}"))?;
            tx.execute(
                "INSERT INTO schema_migrations(version, script, applied_at) VALUES (?1, ?2, ?3)",
                params![version, script, db_timestamp(OffsetDateTime::now_utc())?],
            )
            .with_context(|| format!("failed to record migration {script}"))?;
            tx.commit()
                .with_context(|| format!("failed to commit {script}"))?;

            tracing::info!(version, script, "applied schema migration");
            newly_applied.push((*script).to_string());
        }

        Ok(newly_applied)
    }

    /// Persist one new record, sealing the protected field with `key`.
    ///
    /// Saving an identifier that already exists is rejected; nothing is overwritten.
    ///
    /// # Errors
    /// Returns [`PcqError::Validation`] for invalid or duplicate records, or an error when
    /// sealing or persistence fails.
    pub fn save(&mut self, record: &QuestionnaireRecord, key: &FieldKey) -> Result<()> {
        record.validate()?;

        let sealed_party_id = cipher::seal_field(key, &record.pcq_id, &record.party_id)?;
        let answers = &record.answers;

        let tx = self
            .conn
            .transaction()
            .context("failed to start transaction")?;
        if record_exists(&tx, &record.pcq_id)? {
            let message = format!("pcq record already exists: {}", record.pcq_id);
            return Err(PcqError::Validation(message).into());
        }

        tx.execute(
            &format!(
                "INSERT INTO protected_characteristics({RECORD_COLUMNS}) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                    ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28
                )"
            ),
            params![
                record.pcq_id.as_str(),
                record.case_id,
                sealed_party_id,
                record.channel.as_i64(),
                db_timestamp(record.completed_date)?,
                db_timestamp(record.last_updated_timestamp)?,
                record.service_id,
                record.actor,
                record.version_number,
                record.dcn_number,
                record.form_id,
                answers.dob_provided,
                answers.language_main,
                answers.language_other,
                answers.english_language_level,
                answers.sex,
                answers.gender_different,
                answers.gender_other,
                answers.sexuality,
                answers.sexuality_other,
                answers.marriage,
                answers.ethnicity,
                answers.ethnicity_other,
                answers.religion,
                answers.religion_other,
                answers.disability_conditions,
                answers.disability_impact,
                answers.pregnancy,
            ],
        )
        .context("failed to insert pcq record")?;

        tx.commit().context("failed to commit pcq record")?;
        Ok(())
    }

    /// Load one record and open its protected field with `key`.
    ///
    /// # Errors
    /// Returns [`PcqError::DecryptionFailed`] when `key` does not open the stored value,
    /// or an error when the row cannot be read.
    pub fn get(&self, pcq_id: &PcqId, key: &FieldKey) -> Result<Option<QuestionnaireRecord>> {
        let filter = "WHERE pcq_id = ?1";
        let mut records = self.query_records(filter, params![pcq_id.as_str()], key)?;
        Ok(records.pop())
    }

    /// # Errors
    /// Returns an error when the existence check fails.
    pub fn exists(&self, pcq_id: &PcqId) -> Result<bool> {
        record_exists(&self.conn, pcq_id)
    }

    /// Records carrying an externally generated document control number.
    ///
    /// # Errors
    /// Returns [`PcqError::DecryptionFailed`] when `key` does not open a matching row.
    pub fn find_by_dcn_number(
        &self,
        dcn_number: &str,
        key: &FieldKey,
    ) -> Result<Vec<QuestionnaireRecord>> {
        self.query_records(
            "WHERE dcn_number = ?1 ORDER BY completed_date DESC, pcq_id ASC",
            params![dcn_number],
            key,
        )
    }

    /// Records already linked to `case_id`.
    ///
    /// # Errors
    /// Returns [`PcqError::DecryptionFailed`] when `key` does not open a matching row.
    pub fn find_by_case_id(
        &self,
        case_id: &str,
        key: &FieldKey,
    ) -> Result<Vec<QuestionnaireRecord>> {
        self.query_records(
            "WHERE case_id = ?1 ORDER BY completed_date DESC, pcq_id ASC",
            params![case_id],
            key,
        )
    }

    /// Oldest unlinked records first, for collaborators attempting case matching.
    ///
    /// # Errors
    /// Returns [`PcqError::DecryptionFailed`] when `key` does not open a returned row.
    pub fn list_without_case(
        &self,
        limit: u32,
        key: &FieldKey,
    ) -> Result<Vec<QuestionnaireRecord>> {
        self.query_records(
            "WHERE case_id IS NULL ORDER BY completed_date ASC, pcq_id ASC LIMIT ?1",
            params![limit],
            key,
        )
    }

    /// Link an unlinked record to `case_id`. Returns the number of rows changed (0 or 1).
    ///
    /// `last_updated_timestamp` becomes the later of its stored value and now, so a
    /// record completed in the future keeps its timestamps ordered.
    ///
    /// # Errors
    /// Returns [`PcqError::Validation`] for a blank case id, or an error when the update fails.
    pub fn update_case(&mut self, pcq_id: &PcqId, case_id: &str) -> Result<usize> {
        if case_id.trim().is_empty() {
            return Err(PcqError::Validation("case_id MUST be non-empty".to_string()).into());
        }

        let now = db_timestamp(OffsetDateTime::now_utc())?;
        let changed = self
            .conn
            .execute(
                "UPDATE protected_characteristics
                 SET case_id = ?2,
                     last_updated_timestamp = MAX(last_updated_timestamp, ?3)
                 WHERE pcq_id = ?1 AND case_id IS NULL",
                params![pcq_id.as_str(), case_id, now],
            )
            .context("failed to link case to pcq record")?;
        Ok(changed)
    }

    /// Replace answers only when the stored `completed_date` is strictly older than the
    /// update's. Returns 0 when the stored answers are the same age or newer.
    ///
    /// # Errors
    /// Returns [`PcqError::Validation`] for an invalid update, or an error when the write fails.
    pub fn update_answers(&mut self, pcq_id: &PcqId, update: &AnswerUpdate) -> Result<usize> {
        update.validate()?;
        let answers = &update.answers;

        let changed = self
            .conn
            .execute(
                "UPDATE protected_characteristics
                 SET channel = ?2,
                     completed_date = ?3,
                     last_updated_timestamp = ?4,
                     version_number = ?5,
                     dob_provided = ?6,
                     language_main = ?7,
                     language_other = ?8,
                     english_language_level = ?9,
                     sex = ?10,
                     gender_different = ?11,
                     gender_other = ?12,
                     sexuality = ?13,
                     sexuality_other = ?14,
                     marriage = ?15,
                     ethnicity = ?16,
                     ethnicity_other = ?17,
                     religion = ?18,
                     religion_other = ?19,
                     disability_conditions = ?20,
                     disability_impact = ?21,
                     pregnancy = ?22
                 WHERE pcq_id = ?1 AND completed_date < ?3",
                params![
                    pcq_id.as_str(),
                    update.channel.as_i64(),
                    db_timestamp(update.completed_date)?,
                    db_timestamp(update.last_updated_at(OffsetDateTime::now_utc()))?,
                    update.version_number,
                    answers.dob_provided,
                    answers.language_main,
                    answers.language_other,
                    answers.english_language_level,
                    answers.sex,
                    answers.gender_different,
                    answers.gender_other,
                    answers.sexuality,
                    answers.sexuality_other,
                    answers.marriage,
                    answers.ethnicity,
                    answers.ethnicity_other,
                    answers.religion,
                    answers.religion_other,
                    answers.disability_conditions,
                    answers.disability_impact,
                    answers.pregnancy,
                ],
            )
            .context("failed to update pcq answers")?;
        Ok(changed)
    }

    /// Re-seal the protected field of one record under `new_key`.
    ///
    /// # Errors
    /// Returns [`PcqError::DecryptionFailed`] when `old_key` does not open the stored value.
    pub fn reseal(
        &mut self,
        pcq_id: &PcqId,
        old_key: &FieldKey,
        new_key: &FieldKey,
    ) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start transaction")?;
        let sealed = tx
            .query_row(
                "SELECT party_id FROM protected_characteristics WHERE pcq_id = ?1",
                params![pcq_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to load protected field")?;
        let Some(sealed) = sealed else {
            return Ok(0);
        };

        let party_id = cipher::open_field(old_key, pcq_id, &sealed)?;
        let resealed = cipher::seal_field(new_key, pcq_id, &party_id)?;
        let changed = tx
            .execute(
                "UPDATE protected_characteristics SET party_id = ?2 WHERE pcq_id = ?1",
                params![pcq_id.as_str(), resealed],
            )
            .context("failed to reseal protected field")?;
        tx.commit().context("failed to commit reseal")?;
        Ok(changed)
    }

    /// Permanently delete one record. Deleting an absent record returns 0.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete(&mut self, pcq_id: &PcqId) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM protected_characteristics WHERE pcq_id = ?1",
                params![pcq_id.as_str()],
            )
            .context("failed to delete pcq record")
    }

    /// Delete one record only while it is still unlinked.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete_if_unlinked(&mut self, pcq_id: &PcqId) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM protected_characteristics WHERE pcq_id = ?1 AND case_id IS NULL",
                params![pcq_id.as_str()],
            )
            .context("failed to delete unlinked pcq record")
    }

    /// Unlinked records completed strictly before `cutoff`, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn find_eligible_for_disposal(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<DisposalCandidate>> {
        let mut stmt = self.conn.prepare(
            "SELECT pcq_id, service_id, completed_date, last_updated_timestamp
             FROM protected_characteristics
             WHERE case_id IS NULL AND completed_date < ?1
             ORDER BY completed_date ASC, pcq_id ASC",
        )?;
        let mut rows = stmt.query(params![db_timestamp(cutoff)?])?;
        let mut candidates = Vec::new();

        while let Some(row) = rows.next()? {
            candidates.push(DisposalCandidate {
                pcq_id: PcqId::new(row.get::<_, String>(0)?)?,
                service_id: row.get(1)?,
                completed_date: parse_db_timestamp(&row.get::<_, String>(2)?)?,
                last_updated_timestamp: parse_db_timestamp(&row.get::<_, String>(3)?)?,
            });
        }

        Ok(candidates)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM protected_characteristics",
                [],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count pcq records")?;
        usize::try_from(count).context("pcq record count out of range")
    }

    fn query_records<P: rusqlite::Params>(
        &self,
        filter: &str,
        params: P,
        key: &FieldKey,
    ) -> Result<Vec<QuestionnaireRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM protected_characteristics {filter}");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params)?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            records.push(record_from_row(row, key)?);
        }

        Ok(records)
    }
}

fn record_from_row(row: &Row<'_>, key: &FieldKey) -> Result<QuestionnaireRecord> {
    let pcq_id = PcqId::new(row.get::<_, String>(0)?)?;
    let sealed_party_id: String = row.get(2)?;
    let party_id = cipher::open_field(key, &pcq_id, &sealed_party_id)?;
    let channel_raw: i64 = row.get(3)?;

    Ok(QuestionnaireRecord {
        case_id: row.get(1)?,
        party_id,
        channel: Channel::parse(channel_raw)
            .ok_or_else(|| anyhow!("unknown channel: {channel_raw}"))?,
        completed_date: parse_db_timestamp(&row.get::<_, String>(4)?)?,
        last_updated_timestamp: parse_db_timestamp(&row.get::<_, String>(5)?)?,
        service_id: row.get(6)?,
        actor: row.get(7)?,
        version_number: row.get::<_, u32>(8)?,
        dcn_number: row.get(9)?,
        form_id: row.get(10)?,
        answers: PcqAnswers {
            dob_provided: row.get(11)?,
            language_main: row.get(12)?,
            language_other: row.get(13)?,
            english_language_level: row.get(14)?,
            sex: row.get(15)?,
            gender_different: row.get(16)?,
            gender_other: row.get(17)?,
            sexuality: row.get(18)?,
            sexuality_other: row.get(19)?,
            marriage: row.get(20)?,
            ethnicity: row.get(21)?,
            ethnicity_other: row.get(22)?,
            religion: row.get(23)?,
            religion_other: row.get(24)?,
            disability_conditions: row.get(25)?,
            disability_impact: row.get(26)?,
            pregnancy: row.get(27)?,
        },
        pcq_id,
    })
}

fn latest_schema_version() -> i64 {
    MIGRATIONS
        .iter()
        .map(|(version, _, _)| *version)
        .max()
        .unwrap_or(0)
}

fn record_exists(conn: &Connection, pcq_id: &PcqId) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM protected_characteristics WHERE pcq_id = ?1)",
            params![pcq_id.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if pcq record exists: {pcq_id}"))?;
    Ok(exists == 1)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn applied_versions(conn: &Connection) -> Result<BTreeSet<i64>> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(BTreeSet::new());
    }

    let mut stmt = conn
        .prepare("SELECT version FROM schema_migrations ORDER BY version ASC")
        .context("failed to read applied migrations")?;
    let mut rows = stmt.query([])?;
    let mut versions = BTreeSet::new();
    while let Some(row) = rows.next()? {
        versions.insert(row.get::<_, i64>(0)?);
    }
    Ok(versions)
}

/// Fixed-width UTC text so lexical order in SQL matches chronological order.
fn db_timestamp(value: OffsetDateTime) -> Result<String> {
    normalize_timestamp(value)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .context("failed to format stored timestamp")
}

fn parse_db_timestamp(value: &str) -> Result<OffsetDateTime> {
    PrimitiveDateTime::parse(
        value,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"),
    )
    .map(PrimitiveDateTime::assume_utc)
    .with_context(|| format!("invalid stored timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::Duration;

    use super::*;

    fn fixture_now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_760_000_000)
    }

    fn key(byte: u8) -> FieldKey {
        FieldKey::from_bytes([byte; 32])
    }

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn mk_record(
        raw_id: &str,
        case_id: Option<&str>,
        completed: OffsetDateTime,
    ) -> QuestionnaireRecord {
        QuestionnaireRecord {
            pcq_id: match PcqId::new(raw_id) {
                Ok(id) => id,
                Err(err) => panic!("invalid fixture id {raw_id}: {err}"),
            },
            case_id: case_id.map(str::to_string),
            party_id: format!("party-of-{raw_id}"),
            channel: Channel::Online,
            completed_date: completed,
            last_updated_timestamp: completed,
            service_id: "PROBATE".to_string(),
            actor: "APPLICANT".to_string(),
            version_number: 1,
            dcn_number: None,
            form_id: Some("PA1A".to_string()),
            answers: PcqAnswers {
                language_main: Some(1),
                sex: Some(2),
                religion_other: Some("free text".to_string()),
                ..PcqAnswers::default()
            },
        }
    }

    fn id(raw: &str) -> PcqId {
        match PcqId::new(raw) {
            Ok(id) => id,
            Err(err) => panic!("invalid fixture id {raw}: {err}"),
        }
    }

    fn pcq_error(err: &anyhow::Error) -> Option<&PcqError> {
        err.downcast_ref::<PcqError>()
    }

    #[test]
    fn fresh_database_reports_every_migration_pending_without_mutating() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;

        let descriptors = store.migration_descriptors()?;
        assert_eq!(descriptors.len(), 2);
        assert!(descriptors
            .iter()
            .all(|migration| migration.state == MigrationState::Pending));
        assert_eq!(
            descriptors[0].script,
            "V001__create_protected_characteristics.sql"
        );
        assert!(!table_exists(&store.conn, "schema_migrations")?);
        assert!(!table_exists(&store.conn, "protected_characteristics")?);

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 0);
        assert_eq!(status.target_version, 2);
        assert_eq!(status.pending_versions, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn partially_migrated_database_reports_remaining_script() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;
        store.conn.execute(
            "INSERT INTO schema_migrations(version, script, applied_at) VALUES (1, ?1, ?2)",
            params![MIGRATIONS[0].1, db_timestamp(fixture_now())?],
        )?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(
            status.pending_scripts,
            vec!["V002__add_unlinked_completed_index.sql"]
        );
        Ok(())
    }

    #[test]
    fn migrate_applies_all_scripts_once() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let applied = store.migrate()?;
        assert_eq!(applied.len(), 2);
        assert!(store.migrate()?.is_empty());

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 2);
        assert!(status.pending_versions.is_empty());
        assert!(store
            .migration_descriptors()?
            .iter()
            .all(|migration| migration.state == MigrationState::Applied));
        Ok(())
    }

    #[test]
    fn save_then_get_round_trips_the_protected_field() -> Result<()> {
        let mut store = migrated_store()?;
        let record = mk_record("pcq-round-trip", None, fixture_now());
        store.save(&record, &key(1))?;

        let loaded = store.get(&record.pcq_id, &key(1))?;
        assert_eq!(loaded, Some(record));
        Ok(())
    }

    #[test]
    fn protected_field_is_never_stored_in_clear_text() -> Result<()> {
        let mut store = migrated_store()?;
        let record = mk_record("pcq-sealed", None, fixture_now());
        store.save(&record, &key(1))?;

        let stored: String = store.conn.query_row(
            "SELECT party_id FROM protected_characteristics WHERE pcq_id = ?1",
            params![record.pcq_id.as_str()],
            |row| row.get(0),
        )?;
        assert_ne!(stored, record.party_id);
        assert!(!stored.contains(&record.party_id));
        Ok(())
    }

    #[test]
    fn wrong_key_read_is_a_decryption_failure_not_a_miss() -> Result<()> {
        let mut store = migrated_store()?;
        let record = mk_record("pcq-wrong-key", None, fixture_now());
        store.save(&record, &key(1))?;

        let err = match store.get(&record.pcq_id, &key(9)) {
            Ok(loaded) => panic!("wrong key must not load a record: {loaded:?}"),
            Err(err) => err,
        };
        assert_eq!(
            pcq_error(&err),
            Some(&PcqError::DecryptionFailed("pcq-wrong-key".to_string()))
        );
        Ok(())
    }

    #[test]
    fn missing_record_reads_as_none() -> Result<()> {
        let store = migrated_store()?;
        assert_eq!(store.get(&id("absent"), &key(1))?, None);
        Ok(())
    }

    #[test]
    fn duplicate_identifier_is_rejected() -> Result<()> {
        let mut store = migrated_store()?;
        let record = mk_record("pcq-dup", None, fixture_now());
        store.save(&record, &key(1))?;

        let Err(err) = store.save(&record, &key(1)) else {
            panic!("duplicate save must fail");
        };
        assert!(matches!(pcq_error(&err), Some(PcqError::Validation(_))));
        assert_eq!(store.count()?, 1);
        Ok(())
    }

    #[test]
    fn find_by_dcn_number_decrypts_every_match() -> Result<()> {
        let mut store = migrated_store()?;
        let mut first = mk_record("pcq-dcn-1", None, fixture_now());
        first.dcn_number = Some("DCN-100".to_string());
        first.channel = Channel::Paper;
        let mut second = mk_record("pcq-dcn-2", None, fixture_now() - Duration::days(1));
        second.dcn_number = Some("DCN-100".to_string());
        let other = mk_record("pcq-dcn-3", None, fixture_now());
        for record in [&first, &second, &other] {
            store.save(record, &key(3))?;
        }

        let found = store.find_by_dcn_number("DCN-100", &key(3))?;
        assert_eq!(found, vec![first, second]);
        assert!(store.find_by_dcn_number("DCN-404", &key(3))?.is_empty());
        assert!(store.find_by_dcn_number("DCN-100", &key(4)).is_err());
        Ok(())
    }

    #[test]
    fn update_case_links_only_unlinked_records() -> Result<()> {
        let mut store = migrated_store()?;
        let record = mk_record("pcq-link", None, fixture_now());
        store.save(&record, &key(1))?;

        assert_eq!(store.update_case(&record.pcq_id, "1111222233334444")?, 1);
        assert_eq!(store.update_case(&record.pcq_id, "5555666677778888")?, 0);
        assert_eq!(store.update_case(&id("absent"), "1111222233334444")?, 0);

        let loaded = store.get(&record.pcq_id, &key(1))?;
        let Some(loaded) = loaded else {
            panic!("linked record should still exist");
        };
        assert_eq!(loaded.case_id.as_deref(), Some("1111222233334444"));
        assert_eq!(loaded.party_id, record.party_id);
        assert!(loaded.last_updated_timestamp >= loaded.completed_date);

        let linked = store.find_by_case_id("1111222233334444", &key(1))?;
        assert_eq!(linked.len(), 1);
        Ok(())
    }

    #[test]
    fn linking_a_future_dated_record_keeps_timestamps_ordered() -> Result<()> {
        let mut store = migrated_store()?;
        let completed = normalize_timestamp(OffsetDateTime::now_utc() + Duration::days(30));
        let record = mk_record("pcq-future", None, completed);
        store.save(&record, &key(1))?;

        assert_eq!(store.update_case(&record.pcq_id, "1111222233334444")?, 1);

        let Some(loaded) = store.get(&record.pcq_id, &key(1))? else {
            panic!("linked record should still exist");
        };
        assert_eq!(loaded.case_id.as_deref(), Some("1111222233334444"));
        assert_eq!(loaded.last_updated_timestamp, completed);
        assert!(loaded.last_updated_timestamp >= loaded.completed_date);
        Ok(())
    }

    #[test]
    fn update_answers_applies_only_newer_submissions() -> Result<()> {
        let mut store = migrated_store()?;
        let completed = fixture_now() - Duration::days(10);
        let record = mk_record("pcq-answers", None, completed);
        store.save(&record, &key(1))?;

        let newer = AnswerUpdate {
            channel: Channel::Paper,
            completed_date: completed + Duration::days(1),
            version_number: 2,
            answers: PcqAnswers {
                sex: Some(1),
                ..PcqAnswers::default()
            },
        };
        assert_eq!(store.update_answers(&record.pcq_id, &newer)?, 1);

        let same_age = AnswerUpdate {
            answers: PcqAnswers::default(),
            ..newer.clone()
        };
        assert_eq!(store.update_answers(&record.pcq_id, &same_age)?, 0);

        let older = AnswerUpdate {
            completed_date: completed,
            ..newer.clone()
        };
        assert_eq!(store.update_answers(&record.pcq_id, &older)?, 0);

        let Some(loaded) = store.get(&record.pcq_id, &key(1))? else {
            panic!("updated record should still exist");
        };
        assert_eq!(loaded.answers, newer.answers);
        assert_eq!(loaded.channel, Channel::Paper);
        assert_eq!(loaded.version_number, 2);
        assert_eq!(loaded.completed_date, newer.completed_date);
        assert_eq!(loaded.party_id, record.party_id);
        assert!(loaded.last_updated_timestamp >= loaded.completed_date);
        Ok(())
    }

    #[test]
    fn reseal_moves_the_protected_field_to_a_new_key() -> Result<()> {
        let mut store = migrated_store()?;
        let record = mk_record("pcq-rekey", None, fixture_now());
        store.save(&record, &key(1))?;

        assert_eq!(store.reseal(&record.pcq_id, &key(1), &key(2))?, 1);
        assert!(store.get(&record.pcq_id, &key(1)).is_err());
        let loaded = store.get(&record.pcq_id, &key(2))?;
        assert_eq!(loaded.map(|loaded| loaded.party_id), Some(record.party_id));
        assert_eq!(store.reseal(&id("absent"), &key(1), &key(2))?, 0);
        Ok(())
    }

    #[test]
    fn delete_is_idempotent() -> Result<()> {
        let mut store = migrated_store()?;
        let record = mk_record("pcq-delete", Some("1234"), fixture_now());
        store.save(&record, &key(1))?;

        assert_eq!(store.delete(&record.pcq_id)?, 1);
        assert_eq!(store.delete(&record.pcq_id)?, 0);
        assert_eq!(store.count()?, 0);
        Ok(())
    }

    #[test]
    fn delete_if_unlinked_spares_linked_records() -> Result<()> {
        let mut store = migrated_store()?;
        let linked = mk_record("pcq-linked", Some("1234"), fixture_now());
        let unlinked = mk_record("pcq-unlinked", None, fixture_now());
        store.save(&linked, &key(1))?;
        store.save(&unlinked, &key(1))?;

        assert_eq!(store.delete_if_unlinked(&linked.pcq_id)?, 0);
        assert_eq!(store.delete_if_unlinked(&unlinked.pcq_id)?, 1);
        assert_eq!(store.delete_if_unlinked(&unlinked.pcq_id)?, 0);
        assert_eq!(store.count()?, 1);
        Ok(())
    }

    #[test]
    fn eligible_records_are_unlinked_and_strictly_before_cutoff() -> Result<()> {
        let mut store = migrated_store()?;
        let cutoff = fixture_now() - Duration::days(183);
        let year_before = cutoff - Duration::days(366);
        let just_before = cutoff - Duration::microseconds(1);
        let records = [
            mk_record("linked-old", Some("1234"), year_before),
            mk_record("unlinked-old", None, year_before),
            mk_record("unlinked-at-cutoff", None, cutoff),
            mk_record("unlinked-just-before", None, just_before),
            mk_record("unlinked-new", None, fixture_now()),
        ];
        for record in &records {
            store.save(record, &key(1))?;
        }

        let eligible = store
            .find_eligible_for_disposal(cutoff)?
            .into_iter()
            .map(|candidate| candidate.pcq_id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(eligible, vec!["unlinked-old", "unlinked-just-before"]);
        Ok(())
    }

    #[test]
    fn list_without_case_returns_oldest_unlinked_first() -> Result<()> {
        let mut store = migrated_store()?;
        let newest = mk_record("newest", None, fixture_now());
        let oldest = mk_record("oldest", None, fixture_now() - Duration::days(3));
        let linked = mk_record("linked", Some("42"), fixture_now() - Duration::days(9));
        for record in [&newest, &oldest, &linked] {
            store.save(record, &key(1))?;
        }

        let unlinked = store
            .list_without_case(10, &key(1))?
            .into_iter()
            .map(|record| record.pcq_id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(unlinked, vec!["oldest", "newest"]);
        assert_eq!(store.list_without_case(1, &key(1))?.len(), 1);
        Ok(())
    }

    #[test]
    fn stored_timestamps_sort_chronologically() -> Result<()> {
        let earlier = fixture_now();
        let later = earlier + Duration::microseconds(500);
        assert!(db_timestamp(earlier)? < db_timestamp(later)?);
        assert_eq!(parse_db_timestamp(&db_timestamp(later)?)?, later);
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn eligibility_matches_linkage_and_age(
            specs in proptest::collection::vec((any::<bool>(), 0_i64..800), 1..20)
        ) {
            let run = || -> Result<(Vec<String>, Vec<String>)> {
                let mut store = migrated_store()?;
                let cutoff = fixture_now() - Duration::days(183);
                let mut expected = Vec::new();
                for (index, (linked, age_days)) in specs.iter().enumerate() {
                    let raw_id = format!("pcq-{index:03}");
                    let completed = fixture_now() - Duration::days(*age_days);
                    let case_id = linked.then_some("9999");
                    store.save(&mk_record(&raw_id, case_id, completed), &key(1))?;
                    if !linked && completed < cutoff {
                        expected.push(raw_id);
                    }
                }
                let mut actual = store
                    .find_eligible_for_disposal(cutoff)?
                    .into_iter()
                    .map(|candidate| candidate.pcq_id.to_string())
                    .collect::<Vec<_>>();
                actual.sort();
                Ok((expected, actual))
            };
            let (expected, actual) = match run() {
                Ok(result) => result,
                Err(err) => panic!("store run failed: {err:#}"),
            };
            prop_assert_eq!(expected, actual);
        }
    }
}
