use super::error::CieError;
use super::roster::Subject;
use super::types::{Actor, BundleKey, Role};
use crate::config::CieConfig;

/// Entry-side writes (open, upsert, submit) need the faculty role and, when
/// the subject has an assigned instructor, must come from that instructor.
pub fn require_entry_actor(
    actor: &Actor,
    subject: &Subject,
    key: &BundleKey,
    cfg: &CieConfig,
) -> Result<(), CieError> {
    if actor.role != Role::Faculty {
        return Err(CieError::unauthorized(
            Some(key),
            format!("{} role cannot enter marks", actor.role.as_str()),
        ));
    }
    if cfg.enforce_instructor {
        if let Some(instructor) = subject.instructor_id.as_deref() {
            if instructor != actor.id {
                return Err(CieError::unauthorized(
                    Some(key),
                    format!("subject {} is assigned to another instructor", subject.code),
                ));
            }
        }
    }
    Ok(())
}

/// Review transitions need the hod role; a reviewer scoped to a department
/// may only act on that department's subjects.
pub fn require_reviewer(actor: &Actor, subject: &Subject, key: &BundleKey) -> Result<(), CieError> {
    if actor.role != Role::Hod {
        return Err(CieError::unauthorized(
            Some(key),
            format!("{} role cannot review marks", actor.role.as_str()),
        ));
    }
    if let Some(dept) = actor.department.as_deref() {
        if !dept.eq_ignore_ascii_case(&subject.department) {
            return Err(CieError::unauthorized(
                Some(key),
                format!("reviewer for {} cannot act on {} subjects", dept, subject.department),
            ));
        }
    }
    Ok(())
}
