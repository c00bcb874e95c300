//! Bundle state machine: submit, approve, reject, unlock.
//!
//! Each transition is one `BEGIN IMMEDIATE` transaction that reads the
//! aggregate, checks the precondition, rewrites every record of the bundle and
//! appends to the audit journal. Notifications go out only after commit.

use super::access;
use super::audit;
use super::error::CieError;
use super::notify::{self, Notifier};
use super::roster::{self, Subject};
use super::store::{self, IgnoredEntry};
use super::types::{Actor, AggregateStatus, AssessmentSlot, BundleKey, LockReason, ScoreEntry, TransitionKind};
use crate::config::CieConfig;
use crate::db;
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOutcome {
    pub subject_id: String,
    pub slot: AssessmentSlot,
    pub transition: TransitionKind,
    pub record_count: usize,
    /// Pending edits saved as part of a submit.
    pub written: usize,
    pub ignored: Vec<IgnoredEntry>,
    pub audit_hash: String,
    pub notified: usize,
    #[serde(skip)]
    pub status: AggregateStatus,
}

impl TransitionOutcome {
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = json!(self);
        out["aggregate"] = self.status.to_json();
        out
    }
}

pub struct Lifecycle<'a> {
    conn: &'a Connection,
    cfg: &'a CieConfig,
    notifier: &'a dyn Notifier,
}

impl<'a> Lifecycle<'a> {
    pub fn new(conn: &'a Connection, cfg: &'a CieConfig, notifier: &'a dyn Notifier) -> Self {
        Self { conn, cfg, notifier }
    }

    /// Saves `pending` edits and submits the bundle in one step. Every record
    /// must carry a score afterwards; Absent counts as entered.
    pub fn submit(
        &self,
        actor: &Actor,
        key: &BundleKey,
        pending: &[ScoreEntry],
    ) -> Result<TransitionOutcome, CieError> {
        let subject = roster::get_subject(self.conn, &key.subject_id)?;
        access::require_entry_actor(actor, &subject, key, self.cfg)?;
        if let Some(stray) = pending.iter().find(|e| &e.bundle_key() != key) {
            return Err(CieError::Validation {
                key: Some(key.clone()),
                message: "pending edits must target the submitted bundle".to_string(),
                details: Some(json!({ "studentId": stray.student_id })),
            });
        }
        let pending: Vec<&ScoreEntry> = pending.iter().collect();

        let tx = db::begin_immediate(self.conn)?;
        if let AggregateStatus::Locked(reason) = store::bundle_status(&tx, key)? {
            return Err(CieError::locked(key, reason));
        }
        store::validate_entries(key, &subject, self.cfg, &pending)?;

        let roster = roster::roster_ids(&tx, &key.subject_id)?;
        let (written, phantoms) = if pending.is_empty() {
            (0, Vec::new())
        } else {
            store::write_entries(&tx, key, &roster, &pending)?
        };

        // Records of students who left the roster can no longer be scored,
        // so they do not hold the bundle back.
        let (missing, withdrawn): (Vec<String>, Vec<String>) = store::get_by_bundle(&tx, key)?
            .into_iter()
            .filter(|r| r.score.is_none())
            .map(|r| r.student_id)
            .partition(|id| roster.contains(id));
        if !missing.is_empty() {
            return Err(CieError::Validation {
                key: Some(key.clone()),
                message: format!("bundle is incomplete: {} record(s) missing a score", missing.len()),
                details: Some(json!({ "missing": missing, "withdrawn": withdrawn })),
            });
        }
        if !withdrawn.is_empty() {
            tracing::info!(bundle = %key, count = withdrawn.len(), "submitting without scores for withdrawn students");
        }

        let ignored = phantoms
            .into_iter()
            .map(|student_id| IgnoredEntry {
                student_id,
                subject_id: key.subject_id.clone(),
                slot: key.slot,
                reason: "not_in_roster",
            })
            .collect();
        let mut outcome = self.commit(tx, TransitionKind::Submitted, key, &subject, actor, None)?;
        outcome.written = written;
        outcome.ignored = ignored;
        Ok(outcome)
    }

    pub fn approve(&self, actor: &Actor, key: &BundleKey) -> Result<TransitionOutcome, CieError> {
        let subject = roster::get_subject(self.conn, &key.subject_id)?;
        access::require_reviewer(actor, &subject, key)?;

        let tx = db::begin_immediate(self.conn)?;
        require_locked(&tx, key, LockReason::AwaitingReview)?;
        self.commit(tx, TransitionKind::Approved, key, &subject, actor, None)
    }

    /// Sends a submitted bundle back for editing. Scores are kept.
    pub fn reject(&self, actor: &Actor, key: &BundleKey, reason: &str) -> Result<TransitionOutcome, CieError> {
        let subject = roster::get_subject(self.conn, &key.subject_id)?;
        access::require_reviewer(actor, &subject, key)?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(CieError::validation(Some(key), "reject requires a reason"));
        }

        let tx = db::begin_immediate(self.conn)?;
        require_locked(&tx, key, LockReason::AwaitingReview)?;
        self.commit(tx, TransitionKind::Rejected, key, &subject, actor, Some(reason))
    }

    /// Reopens an approved bundle. The only way out of APPROVED.
    pub fn unlock(
        &self,
        actor: &Actor,
        key: &BundleKey,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome, CieError> {
        let subject = roster::get_subject(self.conn, &key.subject_id)?;
        access::require_reviewer(actor, &subject, key)?;
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());

        let tx = db::begin_immediate(self.conn)?;
        require_locked(&tx, key, LockReason::Approved)?;
        self.commit(tx, TransitionKind::Unlocked, key, &subject, actor, reason)
    }

    fn commit(
        &self,
        tx: Transaction<'_>,
        kind: TransitionKind,
        key: &BundleKey,
        subject: &Subject,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome, CieError> {
        let now = db::now_utc();
        let record_count = apply_status(&tx, kind, key, reason, &now)?;
        let audit_hash = audit::append(&tx, key, kind.action(), &actor.id, reason, record_count, &now)?;
        let entry_actor = match kind {
            TransitionKind::Submitted => Some(actor.id.clone()),
            _ => audit::last_actor(&tx, key, TransitionKind::Submitted.action())?,
        };
        let status = store::bundle_status(&tx, key)?;
        tx.commit()?;

        tracing::info!(
            bundle = %key,
            transition = kind.as_str(),
            actor = %actor.id,
            records = record_count,
            "bundle transition committed"
        );

        let notifications = if self.cfg.notifications_enabled {
            notify::for_transition(kind, key, subject, &actor.id, entry_actor, reason)
        } else {
            Vec::new()
        };
        let notified = notify::dispatch(self.notifier, &notifications);

        Ok(TransitionOutcome {
            subject_id: key.subject_id.clone(),
            slot: key.slot,
            transition: kind,
            record_count,
            written: 0,
            ignored: Vec::new(),
            audit_hash,
            notified,
            status,
        })
    }
}

/// Review transitions need a specific lock. A different lock surfaces as
/// `BundleLocked`; an editable bundle is a plain validation failure.
fn require_locked(conn: &Connection, key: &BundleKey, expected: LockReason) -> Result<(), CieError> {
    match store::bundle_status(conn, key)? {
        AggregateStatus::Locked(reason) if reason == expected => Ok(()),
        AggregateStatus::Locked(reason) => Err(CieError::locked(key, reason)),
        AggregateStatus::Editable => Err(CieError::Validation {
            key: Some(key.clone()),
            message: format!("bundle is editable; expected it to be locked ({})", expected),
            details: Some(json!({ "expected": expected.as_str() })),
        }),
    }
}

fn apply_status(
    conn: &Connection,
    kind: TransitionKind,
    key: &BundleKey,
    reason: Option<&str>,
    now: &str,
) -> Result<usize, CieError> {
    let params = (&key.subject_id, key.slot, now);
    let n = match kind {
        TransitionKind::Submitted => conn.execute(
            "UPDATE cie_marks
             SET status = 'SUBMITTED', rejected_at = NULL, rejection_reason = NULL, updated_at = ?3
             WHERE subject_id = ?1 AND slot = ?2",
            params,
        )?,
        TransitionKind::Approved => conn.execute(
            "UPDATE cie_marks SET status = 'APPROVED', updated_at = ?3
             WHERE subject_id = ?1 AND slot = ?2",
            params,
        )?,
        TransitionKind::Rejected => conn.execute(
            "UPDATE cie_marks
             SET status = 'PENDING', rejected_at = ?3, rejection_reason = ?4, updated_at = ?3
             WHERE subject_id = ?1 AND slot = ?2",
            (&key.subject_id, key.slot, now, reason),
        )?,
        TransitionKind::Unlocked => conn.execute(
            "UPDATE cie_marks SET status = 'PENDING', updated_at = ?3
             WHERE subject_id = ?1 AND slot = ?2",
            params,
        )?,
        TransitionKind::Opened => {
            return Err(CieError::validation(Some(key), "open is not a review transition"));
        }
    };
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cie::notify::{OutboxNotifier, SilentNotifier};
    use crate::cie::store::testutil::*;
    use crate::cie::types::{MarkStatus, Role, Score};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn fill(f: &Fixture, slot: AssessmentSlot, scores: &[f64]) -> Vec<ScoreEntry> {
        f.students
            .iter()
            .zip(scores)
            .map(|(s, v)| entry(s, &f.subject, slot, Some(Score::Marks(*v))))
            .collect()
    }

    fn opened(f: &Fixture, slot: AssessmentSlot) -> BundleKey {
        let key = BundleKey::new(f.subject.id.clone(), slot);
        store::open_bundle(&f.conn, &f.cfg, &faculty("fac-1"), &key).expect("open");
        key
    }

    #[test]
    fn full_lifecycle_scenario() {
        let f = fixture();
        let notifier = OutboxNotifier::new(&f.conn);
        let lc = Lifecycle::new(&f.conn, &f.cfg, &notifier);
        let key = opened(&f, AssessmentSlot::Cie1);
        let fac = faculty("fac-1");

        let report = store::upsert_batch(&f.conn, &f.cfg, &fac, &fill(&f, AssessmentSlot::Cie1, &[10.0, 20.0, 30.0]))
            .expect("upsert");
        assert!(report.all_ok());
        assert_eq!(store::bundle_status(&f.conn, &key).expect("status"), AggregateStatus::Editable);

        let out = lc.submit(&fac, &key, &[]).expect("submit");
        assert_eq!(out.record_count, 3);
        assert_eq!(out.notified, 1);

        let report = store::upsert_batch(&f.conn, &f.cfg, &fac, &fill(&f, AssessmentSlot::Cie1, &[11.0, 20.0, 30.0]))
            .expect("upsert");
        let err = report.bundles[0].result.as_ref().expect_err("locked");
        assert_eq!(err.to_string(), format!("bundle {} is locked: awaiting review", key));

        lc.approve(&hod("hod-1"), &key).expect("approve");
        assert_eq!(
            store::bundle_status(&f.conn, &key).expect("status"),
            AggregateStatus::Locked(LockReason::Approved)
        );

        let out = lc.unlock(&hod("hod-1"), &key, Some("recheck")).expect("unlock");
        assert_eq!(out.status, AggregateStatus::Editable);
        assert_eq!(out.notified, 2);

        let report = store::upsert_batch(&f.conn, &f.cfg, &fac, &fill(&f, AssessmentSlot::Cie1, &[12.0, 20.0, 30.0]))
            .expect("upsert");
        assert!(report.all_ok());
        assert_eq!(store::bundle_status(&f.conn, &key).expect("status"), AggregateStatus::Editable);

        let actions: Vec<String> = audit::history(&f.conn, &key)
            .expect("history")
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, ["open", "submit", "approve", "unlock"]);
        assert!(audit::verify_chain(&f.conn).expect("verify").intact);

        let fac_inbox = notify::list(&f.conn, Role::Faculty, Some("fac-1"), None, false).expect("inbox");
        assert_eq!(fac_inbox.len(), 2);
    }

    #[test]
    fn second_submit_is_locked() {
        let f = fixture();
        let lc = Lifecycle::new(&f.conn, &f.cfg, &SilentNotifier);
        let key = opened(&f, AssessmentSlot::Cie2);
        let fac = faculty("fac-1");
        lc.submit(&fac, &key, &fill(&f, AssessmentSlot::Cie2, &[1.0, 2.0, 3.0])).expect("submit");
        let err = lc.submit(&fac, &key, &[]).expect_err("resubmit");
        assert_eq!(err.code(), "bundle_locked");
        assert_eq!(err.details().expect("details")["reason"], "awaiting review");
    }

    #[test]
    fn incomplete_bundle_cannot_be_submitted() {
        let f = fixture();
        let lc = Lifecycle::new(&f.conn, &f.cfg, &SilentNotifier);
        let key = opened(&f, AssessmentSlot::Cie1);
        let fac = faculty("fac-1");
        let partial = vec![
            entry(&f.students[0], &f.subject, AssessmentSlot::Cie1, Some(Score::Marks(9.0))),
            entry(&f.students[1], &f.subject, AssessmentSlot::Cie1, Some(Score::Absent)),
        ];
        let err = lc.submit(&fac, &key, &partial).expect_err("incomplete");
        assert_eq!(err.code(), "validation_error");
        assert!(err.to_string().contains("incomplete"));
        assert_eq!(err.details().expect("details")["missing"], json!([f.students[2].id]));

        // The pending edits rolled back with the failed submit.
        let records = store::get_by_bundle(&f.conn, &key).expect("records");
        assert!(records.iter().all(|r| r.score.is_none() && r.status == MarkStatus::Pending));
    }

    #[test]
    fn withdrawn_student_does_not_block_submit() {
        let f = fixture();
        let lc = Lifecycle::new(&f.conn, &f.cfg, &SilentNotifier);
        let key = opened(&f, AssessmentSlot::Cie1);
        roster::withdraw(&f.conn, &f.subject.id, &[f.students[2].id.clone()]).expect("withdraw");

        let out = lc
            .submit(&faculty("fac-1"), &key, &fill(&f, AssessmentSlot::Cie1, &[10.0, 20.0, 30.0]))
            .expect("submit");
        assert_eq!(out.written, 2);
        assert_eq!(out.ignored.len(), 1);
        assert_eq!(out.ignored[0].student_id, f.students[2].id);
        assert_eq!(out.record_count, 3);
        assert_eq!(out.status, AggregateStatus::Locked(LockReason::AwaitingReview));
    }

    #[test]
    fn incomplete_error_separates_withdrawn_students() {
        let f = fixture();
        let lc = Lifecycle::new(&f.conn, &f.cfg, &SilentNotifier);
        let key = opened(&f, AssessmentSlot::Cie2);
        roster::withdraw(&f.conn, &f.subject.id, &[f.students[2].id.clone()]).expect("withdraw");

        let partial = vec![entry(&f.students[0], &f.subject, AssessmentSlot::Cie2, Some(Score::Marks(9.0)))];
        let err = lc.submit(&faculty("fac-1"), &key, &partial).expect_err("incomplete");
        let details = err.details().expect("details");
        assert_eq!(details["missing"], json!([f.students[1].id]));
        assert_eq!(details["withdrawn"], json!([f.students[2].id]));
    }

    #[test]
    fn locked_bundle_reports_lock_before_score_errors() {
        let f = fixture();
        let lc = Lifecycle::new(&f.conn, &f.cfg, &SilentNotifier);
        let key = opened(&f, AssessmentSlot::Cie3);
        let fac = faculty("fac-1");
        lc.submit(&fac, &key, &fill(&f, AssessmentSlot::Cie3, &[1.0, 2.0, 3.0])).expect("submit");

        let over = fill(&f, AssessmentSlot::Cie3, &[999.0, 2.0, 3.0]);
        let err = lc.submit(&fac, &key, &over).expect_err("locked");
        assert_eq!(err.code(), "bundle_locked");
        assert_eq!(err.details().expect("details")["reason"], "awaiting review");

        let report = store::upsert_batch(&f.conn, &f.cfg, &fac, &over).expect("upsert");
        let err = report.bundles[0].result.as_ref().expect_err("locked");
        assert_eq!(err.code(), "bundle_locked");
    }

    #[test]
    fn reject_keeps_scores_and_marks_history() {
        let f = fixture();
        let lc = Lifecycle::new(&f.conn, &f.cfg, &SilentNotifier);
        let key = opened(&f, AssessmentSlot::Cie3);
        let fac = faculty("fac-1");
        lc.submit(&fac, &key, &fill(&f, AssessmentSlot::Cie3, &[10.0, 20.0, 30.0])).expect("submit");

        let err = lc.reject(&hod("hod-1"), &key, "  ").expect_err("empty reason");
        assert_eq!(err.code(), "validation_error");

        lc.reject(&hod("hod-1"), &key, "totals look off").expect("reject");
        let records = store::get_by_bundle(&f.conn, &key).expect("records");
        assert!(records.iter().all(|r| r.status == MarkStatus::Pending));
        assert!(records.iter().all(|r| r.rejection_reason.as_deref() == Some("totals look off")));
        let mut scores: Vec<f64> = records.iter().filter_map(|r| r.score).map(Score::counted_value).collect();
        scores.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(scores, [10.0, 20.0, 30.0]);
        assert_eq!(store::bundle_view(&f.conn, &key).expect("view").to_json()["stage"], "rejected");

        lc.submit(&fac, &key, &[]).expect("resubmit");
        assert!(store::get_by_bundle(&f.conn, &key)
            .expect("records")
            .iter()
            .all(|r| r.rejected_at.is_none()));
        assert_eq!(store::bundle_view(&f.conn, &key).expect("view").to_json()["stage"], "submitted");
    }

    #[test]
    fn preconditions_map_to_specific_errors() {
        let f = fixture();
        let lc = Lifecycle::new(&f.conn, &f.cfg, &SilentNotifier);
        let key = opened(&f, AssessmentSlot::Cie4);

        let err = lc.approve(&hod("hod-1"), &key).expect_err("editable");
        assert_eq!(err.code(), "validation_error");
        let err = lc.unlock(&hod("hod-1"), &key, None).expect_err("editable");
        assert_eq!(err.code(), "validation_error");

        let unopened = BundleKey::new(f.subject.id.clone(), AssessmentSlot::Cie5);
        let err = lc.approve(&hod("hod-1"), &unopened).expect_err("not opened");
        assert_eq!(err.details().expect("details")["reason"], "not opened");

        lc.submit(&faculty("fac-1"), &key, &fill(&f, AssessmentSlot::Cie4, &[5.0, 5.0, 5.0]))
            .expect("submit");
        let err = lc.unlock(&hod("hod-1"), &key, None).expect_err("awaiting review");
        assert_eq!(err.code(), "bundle_locked");
        let err = lc.approve(&faculty("fac-1"), &key).expect_err("role");
        assert_eq!(err.code(), "unauthorized");
    }

    #[test]
    fn concurrent_approvals_commit_once() {
        let f = fixture();
        let key = opened(&f, AssessmentSlot::Cie1);
        Lifecycle::new(&f.conn, &f.cfg, &SilentNotifier)
            .submit(&faculty("fac-1"), &key, &fill(&f, AssessmentSlot::Cie1, &[10.0, 20.0, 30.0]))
            .expect("submit");

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["hod-1", "hod-2"]
            .into_iter()
            .map(|id| {
                let barrier = Arc::clone(&barrier);
                let path = f.dir.path().to_path_buf();
                let key = key.clone();
                let cfg = f.cfg.clone();
                thread::spawn(move || {
                    let conn = db::open_db(&path).expect("open_db");
                    barrier.wait();
                    Lifecycle::new(&conn, &cfg, &SilentNotifier)
                        .approve(&hod(id), &key)
                        .map_err(|e| (e.code(), e.details()))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().expect("join")).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let (code, details) = results
            .into_iter()
            .find_map(Result::err)
            .expect("one failure");
        assert_eq!(code, "bundle_locked");
        assert_eq!(details.expect("details")["reason"], "approved");
        assert_eq!(
            audit::history(&f.conn, &key)
                .expect("history")
                .iter()
                .filter(|e| e.action == "approve")
                .count(),
            1
        );
    }

    #[test]
    fn disabled_notifications_emit_nothing() {
        let mut f = fixture();
        f.cfg.notifications_enabled = false;
        let notifier = OutboxNotifier::new(&f.conn);
        let lc = Lifecycle::new(&f.conn, &f.cfg, &notifier);
        let key = opened(&f, AssessmentSlot::Cie1);
        let out = lc
            .submit(&faculty("fac-1"), &key, &fill(&f, AssessmentSlot::Cie1, &[1.0, 2.0, 3.0]))
            .expect("submit");
        assert_eq!(out.notified, 0);
        assert!(notify::list(&f.conn, Role::Hod, None, None, false).expect("list").is_empty());
    }
}
