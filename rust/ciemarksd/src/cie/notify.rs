//! Transition notifications. Delivery belongs to an external collaborator;
//! the core only hands events to a [`Notifier`] after the transition commits.

use super::error::CieError;
use super::roster::Subject;
use super::types::{AssessmentSlot, BundleKey, Role, TransitionKind};
use crate::db;
use rusqlite::{Connection, Row};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub role: Role,
    /// `None` addresses everyone holding the role (within `department`, if set).
    pub actor_id: Option<String>,
    pub department: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub recipient: Recipient,
    pub key: BundleKey,
    pub kind: TransitionKind,
    pub reason: Option<String>,
    pub title: String,
    pub message: String,
}

pub trait Notifier {
    fn emit(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the `notifications` outbox table.
pub struct OutboxNotifier<'c> {
    conn: &'c Connection,
}

impl<'c> OutboxNotifier<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl Notifier for OutboxNotifier<'_> {
    fn emit(&self, n: &Notification) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO notifications(
                id, recipient_role, recipient_id, department, subject_id, slot,
                kind, reason, title, message, created_at, is_read
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
            (
                Uuid::new_v4().to_string(),
                n.recipient.role.as_str(),
                &n.recipient.actor_id,
                &n.recipient.department,
                &n.key.subject_id,
                n.key.slot,
                n.kind.as_str(),
                &n.reason,
                &n.title,
                &n.message,
                db::now_utc(),
            ),
        )?;
        Ok(())
    }
}

/// Drops everything. Lets tests drive transitions without an outbox.
#[cfg(test)]
pub struct SilentNotifier;

#[cfg(test)]
impl Notifier for SilentNotifier {
    fn emit(&self, _notification: &Notification) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fire-and-forget: failures are logged and never reach the caller.
pub fn dispatch(notifier: &dyn Notifier, notifications: &[Notification]) -> usize {
    let mut delivered = 0;
    for n in notifications {
        match notifier.emit(n) {
            Ok(()) => delivered += 1,
            Err(e) => tracing::warn!(
                bundle = %n.key,
                kind = n.kind.as_str(),
                error = %e,
                "notification emit failed"
            ),
        }
    }
    delivered
}

fn reviewer(subject: &Subject) -> Recipient {
    Recipient {
        role: Role::Hod,
        actor_id: None,
        department: Some(subject.department.clone()),
    }
}

fn entry_actor(subject: &Subject, entry_actor_id: Option<String>) -> Recipient {
    Recipient {
        role: Role::Faculty,
        actor_id: entry_actor_id.or_else(|| subject.instructor_id.clone()),
        department: Some(subject.department.clone()),
    }
}

/// Events for one transition, addressed per kind:
/// submit -> reviewer; approve/reject -> entry actor; unlock -> both.
pub fn for_transition(
    kind: TransitionKind,
    key: &BundleKey,
    subject: &Subject,
    actor_id: &str,
    entry_actor_id: Option<String>,
    reason: Option<&str>,
) -> Vec<Notification> {
    let slot = key.slot.as_str();
    let make = |recipient: Recipient, title: String, message: String| Notification {
        recipient,
        key: key.clone(),
        kind,
        reason: reason.map(str::to_string),
        title,
        message,
    };
    match kind {
        TransitionKind::Opened => Vec::new(),
        TransitionKind::Submitted => vec![make(
            reviewer(subject),
            format!("Marks Submitted: {}", subject.name),
            format!("Faculty {} has submitted {} marks for approval.", actor_id, slot),
        )],
        TransitionKind::Approved => vec![make(
            entry_actor(subject, entry_actor_id),
            format!("Marks Approved: {}", subject.name),
            format!("Your {} marks have been approved.", slot),
        )],
        TransitionKind::Rejected => vec![make(
            entry_actor(subject, entry_actor_id),
            format!("Marks Rejected: {}", subject.name),
            format!(
                "Your {} marks were rejected: {}. Please review and resubmit.",
                slot,
                reason.unwrap_or("no reason given")
            ),
        )],
        TransitionKind::Unlocked => {
            let why = reason.map(|r| format!(" Reason: {}.", r)).unwrap_or_default();
            vec![
                make(
                    entry_actor(subject, entry_actor_id),
                    format!("Marks Unlocked: {}", subject.name),
                    format!("{} marks are open for editing again.{}", slot, why),
                ),
                make(
                    reviewer(subject),
                    format!("Marks Unlocked: {}", subject.name),
                    format!("{} unlocked approved {} marks.{}", actor_id, slot, why),
                ),
            ]
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredNotification {
    pub id: String,
    pub recipient_role: String,
    pub recipient_id: Option<String>,
    pub department: Option<String>,
    pub subject_id: String,
    pub slot: AssessmentSlot,
    pub kind: String,
    pub reason: Option<String>,
    pub title: String,
    pub message: String,
    pub created_at: String,
    pub read: bool,
}

fn stored_from_row(row: &Row<'_>) -> rusqlite::Result<StoredNotification> {
    let read: i64 = row.get(11)?;
    Ok(StoredNotification {
        id: row.get(0)?,
        recipient_role: row.get(1)?,
        recipient_id: row.get(2)?,
        department: row.get(3)?,
        subject_id: row.get(4)?,
        slot: row.get(5)?,
        kind: row.get(6)?,
        reason: row.get(7)?,
        title: row.get(8)?,
        message: row.get(9)?,
        created_at: row.get(10)?,
        read: read != 0,
    })
}

/// Outbox rows visible to a recipient: role-wide rows plus rows addressed to
/// `actor_id`, narrowed to `department` when given.
pub fn list(
    conn: &Connection,
    role: Role,
    actor_id: Option<&str>,
    department: Option<&str>,
    unread_only: bool,
) -> Result<Vec<StoredNotification>, CieError> {
    let mut stmt = conn.prepare(
        "SELECT id, recipient_role, recipient_id, department, subject_id, slot,
                kind, reason, title, message, created_at, is_read
         FROM notifications
         WHERE recipient_role = ?1
           AND (recipient_id IS NULL OR recipient_id = ?2)
           AND (?3 IS NULL OR department IS NULL OR department = ?3 COLLATE NOCASE)
           AND (?4 = 0 OR is_read = 0)
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt
        .query_map(
            (role.as_str(), actor_id, department, if unread_only { 1 } else { 0 }),
            stored_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn mark_read(conn: &Connection, id: &str) -> Result<(), CieError> {
    let n = conn.execute("UPDATE notifications SET is_read = 1 WHERE id = ?", [id])?;
    if n == 0 {
        return Err(CieError::NotFound {
            what: "notification",
            id: id.to_string(),
        });
    }
    Ok(())
}
