use super::access;
use super::aggregate::{self, SubjectLockSummary};
use super::audit;
use super::error::CieError;
use super::gate;
use super::roster::{self, Student, Subject};
use super::types::{
    Actor, AggregateStatus, AssessmentSlot, BundleKey, LockReason, MarkRecord, MarkStatus, Score,
    ScoreEntry,
};
use crate::config::CieConfig;
use crate::db;
use rusqlite::{Connection, Row};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

const RECORD_COLUMNS: &str = "m.id, m.student_id, s.reg_no, s.name, m.subject_id, m.slot, m.score,
     m.absent, m.status, m.attendance_pct, m.rejected_at, m.rejection_reason,
     m.created_at, m.updated_at";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MarkRecord> {
    let score: Option<f64> = row.get(6)?;
    let absent: i64 = row.get(7)?;
    Ok(MarkRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        reg_no: row.get(2)?,
        student_name: row.get(3)?,
        subject_id: row.get(4)?,
        slot: row.get(5)?,
        score: Score::from_columns(score, absent != 0),
        status: row.get(8)?,
        attendance_pct: row.get(9)?,
        rejected_at: row.get(10)?,
        rejection_reason: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

/// Every record of the bundle, null scores included.
pub fn get_by_bundle(conn: &Connection, key: &BundleKey) -> Result<Vec<MarkRecord>, CieError> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS}
         FROM cie_marks m
         LEFT JOIN students s ON s.id = m.student_id
         WHERE m.subject_id = ? AND m.slot = ?
         ORDER BY s.reg_no, m.student_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((&key.subject_id, key.slot), record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn bundle_statuses(conn: &Connection, key: &BundleKey) -> Result<Vec<MarkStatus>, CieError> {
    let mut stmt = conn.prepare("SELECT status FROM cie_marks WHERE subject_id = ? AND slot = ?")?;
    let rows = stmt
        .query_map((&key.subject_id, key.slot), |r| r.get::<_, MarkStatus>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn bundle_status(conn: &Connection, key: &BundleKey) -> Result<AggregateStatus, CieError> {
    Ok(aggregate::aggregate_status(bundle_statuses(conn, key)?))
}

pub fn validate_score(
    key: &BundleKey,
    student_id: &str,
    score: Option<Score>,
    max_marks: f64,
    allow_absent: bool,
) -> Result<(), CieError> {
    let invalid = |message: String| CieError::Validation {
        key: Some(key.clone()),
        message,
        details: Some(json!({ "studentId": student_id })),
    };
    match score {
        None => Ok(()),
        Some(Score::Absent) if allow_absent => Ok(()),
        Some(Score::Absent) => Err(invalid("absent marker is disabled".to_string())),
        Some(Score::Marks(v)) if !v.is_finite() || v < 0.0 => {
            Err(invalid(format!("score must be a non-negative number, got {}", v)))
        }
        Some(Score::Marks(v)) if v > max_marks => {
            Err(invalid(format!("score {} exceeds max marks {}", v, max_marks)))
        }
        Some(Score::Marks(_)) => Ok(()),
    }
}

fn validate_attendance(key: &BundleKey, entry: &ScoreEntry) -> Result<(), CieError> {
    match entry.attendance_pct {
        Some(p) if !p.is_finite() || !(0.0..=100.0).contains(&p) => Err(CieError::Validation {
            key: Some(key.clone()),
            message: format!("attendancePct must be within 0..=100, got {}", p),
            details: Some(json!({ "studentId": entry.student_id })),
        }),
        _ => Ok(()),
    }
}

/// Checks every entry of one bundle against the subject's limits.
pub(crate) fn validate_entries(
    key: &BundleKey,
    subject: &Subject,
    cfg: &CieConfig,
    entries: &[&ScoreEntry],
) -> Result<(), CieError> {
    for e in entries {
        validate_score(key, &e.student_id, e.score, subject.max_marks, cfg.allow_absent_marker)?;
        validate_attendance(key, e)?;
    }
    Ok(())
}

/// Writes entries for one bundle. Callers hold the bundle's write transaction
/// and have already checked the gate. Returns (written, phantom student ids).
pub(crate) fn write_entries(
    conn: &Connection,
    key: &BundleKey,
    roster: &HashSet<String>,
    entries: &[&ScoreEntry],
) -> Result<(usize, Vec<String>), CieError> {
    let now = db::now_utc();
    let mut written = 0;
    let mut phantoms = Vec::new();
    for e in entries {
        if !roster.contains(&e.student_id) {
            phantoms.push(e.student_id.clone());
            continue;
        }
        let (score, absent) = Score::to_columns(e.score);
        conn.execute(
            "INSERT INTO cie_marks(
                id, student_id, subject_id, slot, score, absent, status,
                attendance_pct, created_at, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, 'PENDING', ?, ?, ?)
             ON CONFLICT(student_id, subject_id, slot) DO UPDATE SET
               score = excluded.score,
               absent = excluded.absent,
               attendance_pct = COALESCE(excluded.attendance_pct, cie_marks.attendance_pct),
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                &e.student_id,
                &key.subject_id,
                key.slot,
                score,
                absent,
                e.attendance_pct,
                &now,
                &now,
            ),
        )?;
        written += 1;
    }
    if !phantoms.is_empty() {
        tracing::warn!(bundle = %key, count = phantoms.len(), "ignored entries for students outside the roster");
    }
    Ok((written, phantoms))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOutcome {
    pub subject_id: String,
    pub slot: AssessmentSlot,
    pub created: usize,
    pub total: usize,
}

/// Opens an assessment for entry: every rostered student without a record
/// gets a PENDING record with a null score.
pub fn open_bundle(
    conn: &Connection,
    cfg: &CieConfig,
    actor: &Actor,
    key: &BundleKey,
) -> Result<OpenOutcome, CieError> {
    let subject = roster::get_subject(conn, &key.subject_id)?;
    access::require_entry_actor(actor, &subject, key, cfg)?;

    let tx = db::begin_immediate(conn)?;
    match bundle_status(&tx, key)? {
        AggregateStatus::Editable | AggregateStatus::Locked(LockReason::NotOpened) => {}
        AggregateStatus::Locked(reason) => return Err(CieError::locked(key, reason)),
    }
    let students = roster::roster(&tx, &key.subject_id)?;
    if students.is_empty() {
        return Err(CieError::validation(Some(key), "subject has no enrolled students"));
    }
    let now = db::now_utc();
    let mut created = 0;
    for s in &students {
        created += tx.execute(
            "INSERT OR IGNORE INTO cie_marks(
                id, student_id, subject_id, slot, score, absent, status, created_at, updated_at
             ) VALUES(?, ?, ?, ?, NULL, 0, 'PENDING', ?, ?)",
            (Uuid::new_v4().to_string(), &s.id, &key.subject_id, key.slot, &now, &now),
        )?;
    }
    let total = bundle_statuses(&tx, key)?.len();
    if created > 0 {
        audit::append(&tx, key, "open", &actor.id, None, created, &now)?;
    }
    tx.commit()?;

    tracing::info!(bundle = %key, actor = %actor.id, created, total, "bundle opened");
    Ok(OpenOutcome {
        subject_id: key.subject_id.clone(),
        slot: key.slot,
        created,
        total,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoredEntry {
    pub student_id: String,
    pub subject_id: String,
    pub slot: AssessmentSlot,
    pub reason: &'static str,
}

#[derive(Debug)]
pub struct BundleOutcome {
    pub key: BundleKey,
    pub result: Result<usize, CieError>,
}

#[derive(Debug, Default)]
pub struct UpsertReport {
    pub bundles: Vec<BundleOutcome>,
    pub ignored: Vec<IgnoredEntry>,
}

impl UpsertReport {
    pub fn written(&self) -> usize {
        self.bundles.iter().filter_map(|b| b.result.as_ref().ok()).sum()
    }

    pub fn all_ok(&self) -> bool {
        self.bundles.iter().all(|b| b.result.is_ok())
    }

    pub fn to_json(&self) -> serde_json::Value {
        let bundles: Vec<serde_json::Value> = self
            .bundles
            .iter()
            .map(|b| match &b.result {
                Ok(written) => json!({
                    "subjectId": b.key.subject_id,
                    "slot": b.key.slot.as_str(),
                    "ok": true,
                    "written": written,
                }),
                Err(e) => json!({
                    "subjectId": b.key.subject_id,
                    "slot": b.key.slot.as_str(),
                    "ok": false,
                    "error": {
                        "code": e.code(),
                        "message": e.to_string(),
                        "details": e.details(),
                    },
                }),
            })
            .collect();
        json!({
            "written": self.written(),
            "allOk": self.all_ok(),
            "bundles": bundles,
            "ignored": self.ignored,
        })
    }
}

/// Groups entries by bundle, keeping first-appearance order.
fn group_by_bundle(entries: &[ScoreEntry]) -> Vec<(BundleKey, Vec<&ScoreEntry>)> {
    let mut groups: Vec<(BundleKey, Vec<&ScoreEntry>)> = Vec::new();
    let mut index: HashMap<BundleKey, usize> = HashMap::new();
    for e in entries {
        let key = e.bundle_key();
        match index.get(&key) {
            Some(&i) => groups[i].1.push(e),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![e]));
            }
        }
    }
    groups
}

/// Each bundle in the batch commits or fails on its own; one locked bundle
/// does not block writes to another.
pub fn upsert_batch(
    conn: &Connection,
    cfg: &CieConfig,
    actor: &Actor,
    entries: &[ScoreEntry],
) -> Result<UpsertReport, CieError> {
    if entries.len() > cfg.max_batch_entries {
        return Err(CieError::Validation {
            key: None,
            message: format!(
                "batch exceeds max entries: {} > {}",
                entries.len(),
                cfg.max_batch_entries
            ),
            details: Some(json!({ "maxBatchEntries": cfg.max_batch_entries })),
        });
    }

    let mut report = UpsertReport::default();
    for (key, group) in group_by_bundle(entries) {
        let result = upsert_bundle(conn, cfg, actor, &key, &group).map(|(written, phantoms)| {
            report.ignored.extend(phantoms.into_iter().map(|student_id| IgnoredEntry {
                student_id,
                subject_id: key.subject_id.clone(),
                slot: key.slot,
                reason: "not_in_roster",
            }));
            written
        });
        match &result {
            Ok(written) => tracing::info!(bundle = %key, actor = %actor.id, written, "scores saved"),
            Err(e) => tracing::warn!(bundle = %key, actor = %actor.id, error = %e, "scores rejected"),
        }
        report.bundles.push(BundleOutcome { key, result });
    }
    Ok(report)
}

fn upsert_bundle(
    conn: &Connection,
    cfg: &CieConfig,
    actor: &Actor,
    key: &BundleKey,
    entries: &[&ScoreEntry],
) -> Result<(usize, Vec<String>), CieError> {
    let subject = roster::get_subject(conn, &key.subject_id)?;
    access::require_entry_actor(actor, &subject, key, cfg)?;

    let tx = db::begin_immediate(conn)?;
    gate::ensure_editable(&tx, key)?;
    validate_entries(key, &subject, cfg, entries)?;
    let roster = roster::roster_ids(&tx, &key.subject_id)?;
    let out = write_entries(&tx, key, &roster, entries)?;
    tx.commit()?;
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct BundleView {
    pub subject: Subject,
    pub slot: AssessmentSlot,
    pub status: AggregateStatus,
    pub records: Vec<MarkRecord>,
}

impl BundleView {
    pub fn to_json(&self) -> serde_json::Value {
        let has_rejection = self.records.iter().any(|r| r.rejected_at.is_some());
        let stage = aggregate::bundle_stage(self.status, has_rejection);
        let missing = self.records.iter().filter(|r| r.score.is_none()).count();
        let mut out = self.status.to_json();
        out["subjectId"] = json!(self.subject.id);
        out["subjectCode"] = json!(self.subject.code);
        out["subjectName"] = json!(self.subject.name);
        out["maxMarks"] = json!(self.subject.max_marks);
        out["slot"] = json!(self.slot.as_str());
        out["stage"] = json!(stage.as_str());
        out["recordCount"] = json!(self.records.len());
        out["missingScores"] = json!(missing);
        out["records"] = json!(self.records);
        out
    }
}

/// Records plus the derived status, read as one snapshot.
pub fn bundle_view(conn: &Connection, key: &BundleKey) -> Result<BundleView, CieError> {
    let subject = roster::get_subject(conn, &key.subject_id)?;
    let tx = conn.unchecked_transaction()?;
    let records = get_by_bundle(&tx, key)?;
    tx.commit()?;
    let status = aggregate::aggregate_status(records.iter().map(|r| r.status));
    Ok(BundleView {
        subject,
        slot: key.slot,
        status,
        records,
    })
}

pub fn subject_status(conn: &Connection, subject_id: &str) -> Result<SubjectLockSummary, CieError> {
    roster::get_subject(conn, subject_id)?;
    let mut stmt = conn.prepare("SELECT slot, status FROM cie_marks WHERE subject_id = ?")?;
    let rows = stmt
        .query_map([subject_id], |r| {
            Ok((r.get::<_, AssessmentSlot>(0)?, r.get::<_, MarkStatus>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(aggregate::subject_summary(subject_id, rows))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectTotal {
    pub subject_id: String,
    pub subject_code: String,
    pub subject_name: String,
    pub slots: usize,
    pub total: f64,
    pub absent_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentMarks {
    pub student: Student,
    pub records: Vec<MarkRecord>,
    pub subjects: Vec<SubjectTotal>,
}

/// What a student may see: approved records only. Absent counts as zero.
pub fn approved_for_student(conn: &Connection, student_id: &str) -> Result<StudentMarks, CieError> {
    let student = roster::get_student(conn, student_id)?;
    let sql = format!(
        "SELECT {RECORD_COLUMNS}
         FROM cie_marks m
         LEFT JOIN students s ON s.id = m.student_id
         WHERE m.student_id = ? AND m.status = 'APPROVED'
         ORDER BY m.subject_id, m.slot"
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map([student_id], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut totals: BTreeMap<String, (f64, usize, usize)> = BTreeMap::new();
    for r in &records {
        let entry = totals.entry(r.subject_id.clone()).or_insert((0.0, 0, 0));
        entry.1 += 1;
        if let Some(score) = r.score {
            entry.0 += score.counted_value();
            if score == Score::Absent {
                entry.2 += 1;
            }
        }
    }
    let mut subjects = Vec::with_capacity(totals.len());
    for (subject_id, (total, slots, absent_count)) in totals {
        let subject = roster::get_subject(conn, &subject_id)?;
        subjects.push(SubjectTotal {
            subject_id,
            subject_code: subject.code,
            subject_name: subject.name,
            slots,
            total,
            absent_count,
        });
    }
    Ok(StudentMarks {
        student,
        records,
        subjects,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReview {
    pub subject: Subject,
    pub slot: AssessmentSlot,
    pub record_count: usize,
    pub submitted_by: Option<String>,
    pub records: Vec<MarkRecord>,
}

/// Bundles whose aggregate is "awaiting review", optionally for one department.
pub fn pending_reviews(conn: &Connection, department: Option<&str>) -> Result<Vec<PendingReview>, CieError> {
    let mut stmt = conn.prepare(
        "SELECT m.subject_id, m.slot, m.status
         FROM cie_marks m
         JOIN subjects sub ON sub.id = m.subject_id
         WHERE (?1 IS NULL OR sub.department = ?1)",
    )?;
    let rows = stmt
        .query_map([department], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, AssessmentSlot>(1)?,
                r.get::<_, MarkStatus>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut bundles: BTreeMap<BundleKey, Vec<MarkStatus>> = BTreeMap::new();
    for (subject_id, slot, status) in rows {
        bundles
            .entry(BundleKey::new(subject_id, slot))
            .or_default()
            .push(status);
    }

    let mut out = Vec::new();
    for (key, statuses) in bundles {
        if aggregate::aggregate_status(statuses) != AggregateStatus::Locked(LockReason::AwaitingReview) {
            continue;
        }
        let subject = roster::get_subject(conn, &key.subject_id)?;
        let records = get_by_bundle(conn, &key)?;
        out.push(PendingReview {
            subject,
            slot: key.slot,
            record_count: records.len(),
            submitted_by: audit::last_actor(conn, &key, "submit")?,
            records,
        });
    }
    Ok(out)
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn unopened_bundle_rejects_writes() {
        let f = fixture();
        let key = BundleKey::new(f.subject.id.clone(), AssessmentSlot::Cie1);
        assert_eq!(
            bundle_status(&f.conn, &key).expect("status"),
            AggregateStatus::Locked(LockReason::NotOpened)
        );
        let report = upsert_batch(
            &f.conn,
            &f.cfg,
            &faculty("fac-1"),
            &[entry(&f.students[0], &f.subject, AssessmentSlot::Cie1, Some(Score::Marks(10.0)))],
        )
        .expect("upsert");
        let err = report.bundles[0].result.as_ref().expect_err("locked");
        assert_eq!(err.code(), "bundle_locked");
        assert!(get_by_bundle(&f.conn, &key).expect("records").is_empty());
    }

    #[test]
    fn open_creates_null_records_for_roster() {
        let f = fixture();
        let key = BundleKey::new(f.subject.id.clone(), AssessmentSlot::Cie2);
        let out = open_bundle(&f.conn, &f.cfg, &faculty("fac-1"), &key).expect("open");
        assert_eq!(out.created, 3);
        let records = get_by_bundle(&f.conn, &key).expect("records");
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.score.is_none() && r.status == MarkStatus::Pending));
        assert_eq!(bundle_status(&f.conn, &key).expect("status"), AggregateStatus::Editable);
        assert!(gate::edit_allowed(&f.conn, &key).expect("gate"));

        let again = open_bundle(&f.conn, &f.cfg, &faculty("fac-1"), &key).expect("reopen");
        assert_eq!(again.created, 0);
        assert_eq!(again.total, 3);
    }

    #[test]
    fn phantom_students_never_create_records() {
        let f = fixture();
        let key = BundleKey::new(f.subject.id.clone(), AssessmentSlot::Cie1);
        open_bundle(&f.conn, &f.cfg, &faculty("fac-1"), &key).expect("open");

        let mut ghost = entry(&f.students[0], &f.subject, AssessmentSlot::Cie1, Some(Score::Marks(5.0)));
        ghost.student_id = "ghost-student".into();
        let report = upsert_batch(
            &f.conn,
            &f.cfg,
            &faculty("fac-1"),
            &[
                entry(&f.students[0], &f.subject, AssessmentSlot::Cie1, Some(Score::Marks(12.0))),
                ghost,
            ],
        )
        .expect("upsert");
        assert!(report.all_ok());
        assert_eq!(report.written(), 1);
        assert_eq!(report.ignored.len(), 1);
        assert_eq!(report.ignored[0].student_id, "ghost-student");
        assert_eq!(get_by_bundle(&f.conn, &key).expect("records").len(), 3);
    }

    #[test]
    fn invalid_score_rejects_whole_sub_batch() {
        let f = fixture();
        let key = BundleKey::new(f.subject.id.clone(), AssessmentSlot::Cie1);
        open_bundle(&f.conn, &f.cfg, &faculty("fac-1"), &key).expect("open");

        let report = upsert_batch(
            &f.conn,
            &f.cfg,
            &faculty("fac-1"),
            &[
                entry(&f.students[0], &f.subject, AssessmentSlot::Cie1, Some(Score::Marks(12.0))),
                entry(&f.students[1], &f.subject, AssessmentSlot::Cie1, Some(Score::Marks(51.0))),
            ],
        )
        .expect("upsert");
        let err = report.bundles[0].result.as_ref().expect_err("invalid");
        assert_eq!(err.code(), "validation_error");
        assert!(get_by_bundle(&f.conn, &key)
            .expect("records")
            .iter()
            .all(|r| r.score.is_none()));
    }

    #[test]
    fn one_locked_bundle_does_not_block_another() {
        let f = fixture();
        let open_key = BundleKey::new(f.subject.id.clone(), AssessmentSlot::Cie1);
        open_bundle(&f.conn, &f.cfg, &faculty("fac-1"), &open_key).expect("open");

        let report = upsert_batch(
            &f.conn,
            &f.cfg,
            &faculty("fac-1"),
            &[
                entry(&f.students[0], &f.subject, AssessmentSlot::Cie1, Some(Score::Absent)),
                entry(&f.students[0], &f.subject, AssessmentSlot::Cie4, Some(Score::Marks(9.0))),
            ],
        )
        .expect("upsert");
        assert!(report.bundles[0].result.is_ok());
        assert!(report.bundles[1].result.is_err());
        assert!(!report.all_ok());
        let json = report.to_json();
        assert_eq!(json["bundles"][1]["error"]["details"]["reason"], "not opened");

        let records = get_by_bundle(&f.conn, &open_key).expect("records");
        let first = records
            .iter()
            .find(|r| r.student_id == f.students[0].id)
            .expect("record");
        assert_eq!(first.score, Some(Score::Absent));
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let mut f = fixture();
        f.cfg.max_batch_entries = 1;
        let e = entry(&f.students[0], &f.subject, AssessmentSlot::Cie1, None);
        let err = upsert_batch(&f.conn, &f.cfg, &faculty("fac-1"), &[e.clone(), e])
            .expect_err("too many");
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn wrong_instructor_is_unauthorized() {
        let f = fixture();
        let key = BundleKey::new(f.subject.id.clone(), AssessmentSlot::Cie1);
        let err = open_bundle(&f.conn, &f.cfg, &faculty("fac-9"), &key).expect_err("unauthorized");
        assert_eq!(err.code(), "unauthorized");
    }
}
