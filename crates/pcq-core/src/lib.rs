use std::fmt::{Debug, Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub mod leadership;

pub use leadership::{LeadershipContext, LeadershipEvent, LeadershipState, LeadershipTracker};

/// Days an unlinked questionnaire is retained before it becomes eligible for disposal.
pub const DEFAULT_RETENTION_DAYS: u32 = 183;

/// Longest accepted retention window, one hundred years.
pub const MAX_RETENTION_DAYS: u32 = 36_525;

pub const FIELD_KEY_LEN: usize = 32;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PcqError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("pcq record not found: {0}")]
    NotFound(String),
    #[error("failed to decrypt protected field of pcq record {0}")]
    DecryptionFailed(String),
    #[error("submission superseded: pcq record {0} already holds newer answers")]
    StaleWrite(String),
    #[error("migration pending: {0}")]
    MigrationPending(String),
    #[error("pcq disposal failed: {0}")]
    DisposalFailure(String),
}

/// Caller-generated identifier of one questionnaire record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PcqId(String);

impl PcqId {
    /// Wrap a caller-supplied identifier.
    ///
    /// # Errors
    /// Returns [`PcqError::Validation`] when the identifier is blank.
    pub fn new(raw: impl Into<String>) -> Result<Self, PcqError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(PcqError::Validation("pcq_id MUST be non-empty".to_string()));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PcqId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Symmetric key for the protected field. Supplied per call and never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Eq, PartialEq)]
pub struct FieldKey([u8; FIELD_KEY_LEN]);

impl FieldKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; FIELD_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode a hex-encoded 32-byte key.
    ///
    /// # Errors
    /// Returns [`PcqError::Validation`] when the input is not hex or has the wrong length.
    pub fn from_hex(encoded: &str) -> Result<Self, PcqError> {
        let mut bytes = hex::decode(encoded.trim())
            .map_err(|_| PcqError::Validation("field key MUST be hex encoded".to_string()))?;
        if bytes.len() != FIELD_KEY_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(PcqError::Validation(format!(
                "field key MUST decode to exactly {FIELD_KEY_LEN} bytes (got {len})"
            )));
        }
        let mut key = [0_u8; FIELD_KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FIELD_KEY_LEN] {
        &self.0
    }
}

impl Debug for FieldKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("FieldKey(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Online,
    Paper,
}

impl Channel {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Online => 1,
            Self::Paper => 2,
        }
    }

    #[must_use]
    pub fn parse(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Online),
            2 => Some(Self::Paper),
            _ => None,
        }
    }
}

/// Answer values. Coded answers are small integers; `*_other` carry free text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PcqAnswers {
    pub dob_provided: Option<i64>,
    pub language_main: Option<i64>,
    pub language_other: Option<String>,
    pub english_language_level: Option<i64>,
    pub sex: Option<i64>,
    pub gender_different: Option<i64>,
    pub gender_other: Option<String>,
    pub sexuality: Option<i64>,
    pub sexuality_other: Option<String>,
    pub marriage: Option<i64>,
    pub ethnicity: Option<i64>,
    pub ethnicity_other: Option<String>,
    pub religion: Option<i64>,
    pub religion_other: Option<String>,
    pub disability_conditions: Option<i64>,
    pub disability_impact: Option<i64>,
    pub pregnancy: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionnaireRecord {
    pub pcq_id: PcqId,
    pub case_id: Option<String>,
    /// Protected field. Sealed with a [`FieldKey`] before it reaches storage.
    pub party_id: String,
    pub channel: Channel,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated_timestamp: OffsetDateTime,
    pub service_id: String,
    pub actor: String,
    pub version_number: u32,
    pub dcn_number: Option<String>,
    pub form_id: Option<String>,
    pub answers: PcqAnswers,
}

impl QuestionnaireRecord {
    /// Validate write-time invariants.
    ///
    /// # Errors
    /// Returns [`PcqError::Validation`] describing the first violated invariant.
    pub fn validate(&self) -> Result<(), PcqError> {
        if self.pcq_id.as_str().trim().is_empty() {
            return Err(PcqError::Validation("pcq_id MUST be non-empty".to_string()));
        }

        if self.party_id.trim().is_empty() {
            return Err(PcqError::Validation("party_id MUST be provided".to_string()));
        }

        if self.service_id.trim().is_empty() {
            return Err(PcqError::Validation("service_id MUST be provided".to_string()));
        }

        if self.version_number == 0 {
            return Err(PcqError::Validation("version_number MUST be >= 1".to_string()));
        }

        if let Some(case_id) = &self.case_id {
            if case_id.trim().is_empty() {
                return Err(PcqError::Validation(
                    "case_id MUST be non-empty when present".to_string(),
                ));
            }
        }

        if self.last_updated_timestamp < self.completed_date {
            return Err(PcqError::Validation(
                "last_updated_timestamp MUST NOT precede completed_date".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.case_id.is_some()
    }
}

/// Structured replacement for a positional conditional update.
///
/// Applies only while the stored `completed_date` is strictly older than
/// `completed_date` here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerUpdate {
    pub channel: Channel,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_date: OffsetDateTime,
    pub version_number: u32,
    pub answers: PcqAnswers,
}

impl AnswerUpdate {
    /// # Errors
    /// Returns [`PcqError::Validation`] when the version number is zero.
    pub fn validate(&self) -> Result<(), PcqError> {
        if self.version_number == 0 {
            return Err(PcqError::Validation("version_number MUST be >= 1".to_string()));
        }
        Ok(())
    }

    /// Timestamp written alongside the update; never earlier than the new completion date.
    #[must_use]
    pub fn last_updated_at(&self, now: OffsetDateTime) -> OffsetDateTime {
        normalize_timestamp(now.max(self.completed_date))
    }
}

/// Key-free projection of a record eligible for disposal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisposalCandidate {
    pub pcq_id: PcqId,
    pub service_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated_timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisposerConfig {
    pub enabled: bool,
    pub dry_run: bool,
    pub retention_days: u32,
}

impl Default for DisposerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: false,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl DisposerConfig {
    /// Records last updated before this instant are eligible for disposal.
    ///
    /// # Errors
    /// Returns [`PcqError::Validation`] when `retention_days` exceeds
    /// [`MAX_RETENTION_DAYS`] or the window reaches before the earliest representable date.
    pub fn cutoff(&self, now: OffsetDateTime) -> Result<OffsetDateTime, PcqError> {
        let days = self.retention_days;
        if days > MAX_RETENTION_DAYS {
            return Err(PcqError::Validation(format!(
                "retention_days MUST be <= {MAX_RETENTION_DAYS} (got {days})"
            )));
        }
        let window = Duration::days(i64::from(days));
        now.checked_sub(window).ok_or_else(|| {
            PcqError::Validation(format!(
                "retention of {days} days reaches before the earliest representable date"
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Applied,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationDescriptor {
    pub version: i64,
    pub script: String,
    pub state: MigrationState,
}

/// Refuse to proceed while any migration is pending. Never applies anything.
///
/// `migrations` must be in application order; the first pending script is reported.
///
/// # Errors
/// Returns [`PcqError::MigrationPending`] naming the first pending script.
pub fn ensure_migrations_applied(migrations: &[MigrationDescriptor]) -> Result<(), PcqError> {
    for migration in migrations {
        if migration.state == MigrationState::Pending {
            return Err(PcqError::MigrationPending(migration.script.clone()));
        }
    }
    Ok(())
}

/// Normalize to UTC at microsecond precision, the resolution persisted by stores.
#[must_use]
pub fn normalize_timestamp(value: OffsetDateTime) -> OffsetDateTime {
    let utc = value.to_offset(UtcOffset::UTC);
    let micros = utc.microsecond();
    utc.replace_microsecond(micros).unwrap_or(utc)
}
