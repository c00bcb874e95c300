//! Derives the lock state of a bundle from its records' statuses.
//!
//! Precedence, first match wins:
//! 1. no records            -> locked, "not opened"
//! 2. any APPROVED          -> locked, "approved"
//! 3. any SUBMITTED         -> locked, "awaiting review"
//! 4. all PENDING/REJECTED  -> editable
//!
//! A single submitted or approved record locks the whole bundle, so a
//! diverged bundle (e.g. a late-enrolled PENDING student next to SUBMITTED
//! peers) still reports one consistent state. Every gate and status report
//! goes through [`aggregate_status`].

use super::types::{AggregateStatus, AssessmentSlot, BundleStage, LockReason, MarkStatus};
use serde_json::json;

pub fn aggregate_status<I>(statuses: I) -> AggregateStatus
where
    I: IntoIterator<Item = MarkStatus>,
{
    let mut any = false;
    let mut submitted = false;
    for status in statuses {
        any = true;
        match status {
            MarkStatus::Approved => return AggregateStatus::Locked(LockReason::Approved),
            MarkStatus::Submitted => submitted = true,
            MarkStatus::Pending | MarkStatus::Rejected => {}
        }
    }

    if !any {
        AggregateStatus::Locked(LockReason::NotOpened)
    } else if submitted {
        AggregateStatus::Locked(LockReason::AwaitingReview)
    } else {
        AggregateStatus::Editable
    }
}

pub fn bundle_stage(status: AggregateStatus, has_rejection_marker: bool) -> BundleStage {
    match status {
        AggregateStatus::Locked(LockReason::NotOpened) => BundleStage::Unopened,
        AggregateStatus::Locked(LockReason::AwaitingReview) => BundleStage::Submitted,
        AggregateStatus::Locked(LockReason::Approved) => BundleStage::Approved,
        AggregateStatus::Editable if has_rejection_marker => BundleStage::Rejected,
        AggregateStatus::Editable => BundleStage::Draft,
    }
}

/// Aggregate for every slot of one subject.
#[derive(Debug, Clone)]
pub struct SubjectLockSummary {
    pub subject_id: String,
    pub slots: Vec<(AssessmentSlot, AggregateStatus)>,
}

impl SubjectLockSummary {
    pub fn fully_locked(&self) -> bool {
        self.slots.iter().all(|(_, s)| !s.is_editable())
    }

    pub fn editable_slots(&self) -> Vec<AssessmentSlot> {
        self.slots
            .iter()
            .filter(|(_, s)| s.is_editable())
            .map(|(slot, _)| *slot)
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let slots: Vec<serde_json::Value> = self
            .slots
            .iter()
            .map(|(slot, status)| {
                let mut v = status.to_json();
                v["slot"] = json!(slot.as_str());
                v
            })
            .collect();
        json!({
            "subjectId": self.subject_id,
            "fullyLocked": self.fully_locked(),
            "partiallyEditable": !self.fully_locked(),
            "editableSlots": self.editable_slots().iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            "slots": slots,
        })
    }
}

/// Builds the per-slot summary from `(slot, status)` rows of one subject.
/// Slots with no rows come out as "not opened".
pub fn subject_summary<I>(subject_id: &str, rows: I) -> SubjectLockSummary
where
    I: IntoIterator<Item = (AssessmentSlot, MarkStatus)>,
{
    let mut per_slot: Vec<Vec<MarkStatus>> = vec![Vec::new(); AssessmentSlot::ALL.len()];
    for (slot, status) in rows {
        if let Some(i) = AssessmentSlot::ALL.iter().position(|s| *s == slot) {
            per_slot[i].push(status);
        }
    }
    let slots = AssessmentSlot::ALL
        .into_iter()
        .zip(per_slot)
        .map(|(slot, statuses)| (slot, aggregate_status(statuses)))
        .collect();
    SubjectLockSummary {
        subject_id: subject_id.to_string(),
        slots,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MarkStatus::*;

    #[test]
    fn empty_bundle_is_not_opened() {
        assert_eq!(
            aggregate_status(Vec::<MarkStatus>::new()),
            AggregateStatus::Locked(LockReason::NotOpened)
        );
    }

    #[test]
    fn all_pending_or_rejected_is_editable() {
        assert_eq!(aggregate_status([Pending, Pending]), AggregateStatus::Editable);
        assert_eq!(aggregate_status([Pending, Rejected]), AggregateStatus::Editable);
    }

    #[test]
    fn single_submitted_locks_everything() {
        assert_eq!(
            aggregate_status([Pending, Submitted, Pending]),
            AggregateStatus::Locked(LockReason::AwaitingReview)
        );
    }

    #[test]
    fn approved_wins_over_submitted() {
        assert_eq!(
            aggregate_status([Submitted, Approved, Pending]),
            AggregateStatus::Locked(LockReason::Approved)
        );
    }

    #[test]
    fn stage_tracks_rejection_only_while_editable() {
        assert_eq!(bundle_stage(AggregateStatus::Editable, true), BundleStage::Rejected);
        assert_eq!(bundle_stage(AggregateStatus::Editable, false), BundleStage::Draft);
        assert_eq!(
            bundle_stage(AggregateStatus::Locked(LockReason::AwaitingReview), true),
            BundleStage::Submitted
        );
    }

    #[test]
    fn subject_is_partially_editable_until_every_slot_locks() {
        let summary = subject_summary(
            "s1",
            [
                (AssessmentSlot::Cie1, Approved),
                (AssessmentSlot::Cie2, Pending),
            ],
        );
        assert!(!summary.fully_locked());
        assert_eq!(summary.editable_slots(), vec![AssessmentSlot::Cie2]);
        assert_eq!(
            summary.slots[4].1,
            AggregateStatus::Locked(LockReason::NotOpened)
        );

        let locked = subject_summary(
            "s1",
            AssessmentSlot::ALL.into_iter().map(|slot| (slot, Submitted)),
        );
        assert!(locked.fully_locked());
        assert!(locked.editable_slots().is_empty());
        assert_eq!(locked.to_json()["fullyLocked"], true);
    }
}
