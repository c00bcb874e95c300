use crate::cie::error::CieError;
use crate::cie::types::{Actor, AssessmentSlot, BundleKey, Role, Score, ScoreEntry};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<CieError> for HandlerErr {
    fn from(e: CieError) -> Self {
        if let CieError::Db(inner) = &e {
            tracing::error!(error = %inner, "database error");
        }
        Self {
            code: e.code(),
            message: e.to_string(),
            details: e.details(),
        }
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!(error = ?e, "infrastructure error");
        Self {
            code: "db_query_failed",
            message: format!("{e:#}"),
            details: None,
        }
    }
}

/// Shared tail of every handler: map the outcome onto the response envelope.
pub fn respond(req: &Request, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn optional_bool(params: &Value, key: &str, default: bool) -> Result<bool, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn string_list(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(items) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("{} must be an array", key)));
    };
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain strings", key)))
        })
        .collect()
}

pub fn parse_role(raw: &str) -> Result<Role, HandlerErr> {
    Role::parse(raw).ok_or_else(|| HandlerErr::bad_params("role must be one of: faculty, hod"))
}

pub fn parse_actor(params: &Value) -> Result<Actor, HandlerErr> {
    let Some(actor) = params.get("actor").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("missing actor"));
    };
    let id = required_str(actor, "id").map_err(|_| HandlerErr::bad_params("missing actor.id"))?;
    let role = parse_role(&required_str(actor, "role").map_err(|_| HandlerErr::bad_params("missing actor.role"))?)?;
    let department = optional_str(actor, "department")?;
    Ok(Actor { id, role, department })
}

/// Unknown slot names are a domain validation failure, not a shape problem.
pub fn parse_slot(v: Option<&Value>) -> Result<AssessmentSlot, HandlerErr> {
    let Some(raw) = v.and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing slot"));
    };
    AssessmentSlot::parse(raw).ok_or_else(|| HandlerErr {
        code: "validation_error",
        message: format!("unknown assessment slot: {}", raw),
        details: Some(json!({ "slot": raw, "allowed": ["CIE1", "CIE2", "CIE3", "CIE4", "CIE5"] })),
    })
}

pub fn parse_bundle_key(params: &Value) -> Result<BundleKey, HandlerErr> {
    let subject_id = required_str(params, "subjectId")?;
    let slot = parse_slot(params.get("slot"))?;
    Ok(BundleKey::new(subject_id, slot))
}

pub fn parse_score(v: Option<&Value>) -> Result<Option<Score>, HandlerErr> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(|f| Some(Score::Marks(f)))
            .ok_or_else(|| HandlerErr::bad_params("score must be a finite number")),
        Some(Value::String(s))
            if s.eq_ignore_ascii_case("AB") || s.eq_ignore_ascii_case("ABSENT") =>
        {
            Ok(Some(Score::Absent))
        }
        Some(other) => Err(HandlerErr {
            code: "validation_error",
            message: "score must be a number, null, or \"AB\"".to_string(),
            details: Some(json!({ "score": other })),
        }),
    }
}

fn optional_pct(v: Option<&Value>) -> Result<Option<f64>, HandlerErr> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params("attendancePct must be a number")),
    }
}

/// Parses `params.entries`. Entries may omit `subjectId`/`slot` when
/// `default_key` supplies them.
pub fn parse_entries(params: &Value, default_key: Option<&BundleKey>) -> Result<Vec<ScoreEntry>, HandlerErr> {
    let Some(items) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("entries must be an array"));
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let with_index = |mut e: HandlerErr| {
            let mut details = e.details.take().unwrap_or_else(|| json!({}));
            details["index"] = json!(i);
            e.details = Some(details);
            e
        };
        if !item.is_object() {
            return Err(with_index(HandlerErr::bad_params("entry must be an object")));
        }
        let student_id = required_str(item, "studentId").map_err(with_index)?;
        let (subject_id, slot) = match default_key {
            Some(key) if item.get("subjectId").is_none() && item.get("slot").is_none() => {
                (key.subject_id.clone(), key.slot)
            }
            _ => {
                let key = parse_bundle_key(item).map_err(with_index)?;
                (key.subject_id, key.slot)
            }
        };
        out.push(ScoreEntry {
            student_id,
            subject_id,
            slot,
            score: parse_score(item.get("score")).map_err(with_index)?,
            attendance_pct: optional_pct(item.get("attendancePct")).map_err(with_index)?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_accepts_null_number_and_absent_marker() {
        assert_eq!(parse_score(None).expect("none"), None);
        assert_eq!(parse_score(Some(&json!(null))).expect("null"), None);
        assert_eq!(parse_score(Some(&json!(17.5))).expect("n"), Some(Score::Marks(17.5)));
        assert_eq!(parse_score(Some(&json!("ab"))).expect("ab"), Some(Score::Absent));
        assert_eq!(parse_score(Some(&json!("Absent"))).expect("absent"), Some(Score::Absent));
        assert_eq!(parse_score(Some(&json!("12"))).expect_err("string").code, "validation_error");
    }

    #[test]
    fn bad_slot_is_validation_error() {
        let e = parse_bundle_key(&json!({ "subjectId": "s1", "slot": "CIE-1" })).expect_err("slot");
        assert_eq!(e.code, "validation_error");
        let e = parse_bundle_key(&json!({ "subjectId": "s1" })).expect_err("missing");
        assert_eq!(e.code, "bad_params");
    }

    #[test]
    fn entries_inherit_default_bundle() {
        let key = BundleKey::new("s1", AssessmentSlot::Cie2);
        let entries = parse_entries(
            &json!({ "entries": [{ "studentId": "st1", "score": 4 }] }),
            Some(&key),
        )
        .expect("entries");
        assert_eq!(entries[0].bundle_key(), key);

        let e = parse_entries(&json!({ "entries": [{ "studentId": "st1", "slot": "CIE9", "subjectId": "s1" }] }), None)
            .expect_err("bad slot");
        assert_eq!(e.code, "validation_error");
        assert_eq!(e.details.expect("details")["index"], 0);
    }

    #[test]
    fn actor_requires_known_role() {
        let a = parse_actor(&json!({ "actor": { "id": "u1", "role": "HOD", "department": "CSE" } }))
            .expect("actor");
        assert_eq!(a.role, Role::Hod);
        assert!(parse_actor(&json!({ "actor": { "id": "u1", "role": "student" } })).is_err());
        assert!(parse_actor(&json!({})).is_err());
    }
}
