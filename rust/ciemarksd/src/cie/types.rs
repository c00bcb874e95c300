use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Serialize, Serializer};
use serde_json::json;
use std::fmt;

/// The five fixed CIE slots of a semester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssessmentSlot {
    Cie1,
    Cie2,
    Cie3,
    Cie4,
    Cie5,
}

impl AssessmentSlot {
    pub const ALL: [AssessmentSlot; 5] = [
        AssessmentSlot::Cie1,
        AssessmentSlot::Cie2,
        AssessmentSlot::Cie3,
        AssessmentSlot::Cie4,
        AssessmentSlot::Cie5,
    ];

    /// Accepts the canonical names only (`CIE1`..`CIE5`, ASCII case-insensitive).
    /// Spellings like `CIE-1` or `cie 1` are rejected rather than normalised.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|slot| slot.as_str().eq_ignore_ascii_case(raw))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cie1 => "CIE1",
            Self::Cie2 => "CIE2",
            Self::Cie3 => "CIE3",
            Self::Cie4 => "CIE4",
            Self::Cie5 => "CIE5",
        }
    }
}

impl fmt::Display for AssessmentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AssessmentSlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl ToSql for AssessmentSlot {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AssessmentSlot {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        AssessmentSlot::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown slot {s}").into()))
    }
}

/// Per-record review status as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkStatus {
    Pending,
    Submitted,
    Approved,
    Rejected,
}

impl MarkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "SUBMITTED" => Some(Self::Submitted),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl Serialize for MarkStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl ToSql for MarkStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MarkStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        MarkStatus::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown mark status {s}").into()))
    }
}

/// An entered score. "Not yet entered" is modelled as `Option<Score>::None`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    Marks(f64),
    /// Student was absent; counts as zero in totals.
    Absent,
}

impl Score {
    pub fn counted_value(self) -> f64 {
        match self {
            Score::Marks(v) => v,
            Score::Absent => 0.0,
        }
    }

    pub(crate) fn from_columns(score: Option<f64>, absent: bool) -> Option<Self> {
        if absent {
            return Some(Score::Absent);
        }
        score.map(Score::Marks)
    }

    pub(crate) fn to_columns(score: Option<Score>) -> (Option<f64>, i64) {
        match score {
            Some(Score::Marks(v)) => (Some(v), 0),
            Some(Score::Absent) => (None, 1),
            None => (None, 0),
        }
    }
}

impl Serialize for Score {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Score::Marks(v) => serializer.serialize_f64(*v),
            Score::Absent => serializer.serialize_str("AB"),
        }
    }
}

/// Identity of a bundle: every record sharing (subject, slot).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleKey {
    pub subject_id: String,
    pub slot: AssessmentSlot,
}

impl BundleKey {
    pub fn new(subject_id: impl Into<String>, slot: AssessmentSlot) -> Self {
        Self {
            subject_id: subject_id.into(),
            slot,
        }
    }

    pub fn details(&self) -> serde_json::Value {
        json!({
            "subjectId": self.subject_id,
            "slot": self.slot.as_str(),
        })
    }
}

impl fmt::Display for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject_id, self.slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    NotOpened,
    AwaitingReview,
    Approved,
}

impl LockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotOpened => "not opened",
            Self::AwaitingReview => "awaiting review",
            Self::Approved => "approved",
        }
    }
}

impl fmt::Display for LockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived lock state of a bundle. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateStatus {
    Editable,
    Locked(LockReason),
}

impl AggregateStatus {
    pub fn is_editable(self) -> bool {
        matches!(self, AggregateStatus::Editable)
    }

    pub fn lock_reason(self) -> Option<LockReason> {
        match self {
            AggregateStatus::Editable => None,
            AggregateStatus::Locked(reason) => Some(reason),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AggregateStatus::Editable => "EDITABLE",
            AggregateStatus::Locked(_) => "LOCKED",
        }
    }

    pub fn to_json(self) -> serde_json::Value {
        json!({
            "status": self.label(),
            "locked": !self.is_editable(),
            "reason": self.lock_reason().map(LockReason::as_str),
        })
    }
}

/// Display stage; distinguishes a rejected draft from a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleStage {
    Unopened,
    Draft,
    Rejected,
    Submitted,
    Approved,
}

impl BundleStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unopened => "unopened",
            Self::Draft => "draft",
            Self::Rejected => "rejected",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Opened,
    Submitted,
    Approved,
    Rejected,
    Unlocked,
}

impl TransitionKind {
    /// Past-tense name used on notifications.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Unlocked => "unlocked",
        }
    }

    /// Verb recorded in the audit journal.
    pub fn action(self) -> &'static str {
        match self {
            Self::Opened => "open",
            Self::Submitted => "submit",
            Self::Approved => "approve",
            Self::Rejected => "reject",
            Self::Unlocked => "unlock",
        }
    }
}

impl Serialize for TransitionKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Instructor entering scores.
    Faculty,
    /// Department reviewer.
    Hod,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "faculty" => Some(Self::Faculty),
            "hod" => Some(Self::Hod),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Faculty => "faculty",
            Self::Hod => "hod",
        }
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// The caller of a mutating operation. Authentication happens upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: Role,
    pub department: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRecord {
    pub id: String,
    pub student_id: String,
    pub reg_no: Option<String>,
    pub student_name: Option<String>,
    pub subject_id: String,
    pub slot: AssessmentSlot,
    pub score: Option<Score>,
    pub status: MarkStatus,
    pub attendance_pct: Option<f64>,
    pub rejected_at: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One row of an upsert batch, already validated for shape at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreEntry {
    pub student_id: String,
    pub subject_id: String,
    pub slot: AssessmentSlot,
    pub score: Option<Score>,
    pub attendance_pct: Option<f64>,
}

impl ScoreEntry {
    pub fn bundle_key(&self) -> BundleKey {
        BundleKey::new(self.subject_id.clone(), self.slot)
    }
}
