use crate::cie::gate;
use crate::cie::store;
use crate::ipc::helpers::{db_conn, parse_actor, parse_bundle_key, parse_entries, required_str, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn marks_open(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let actor = parse_actor(params)?;
    let key = parse_bundle_key(params)?;
    let outcome = store::open_bundle(conn, &state.config, &actor, &key)?;
    Ok(json!(outcome))
}

/// Each bundle in the batch succeeds or fails on its own. When every bundle
/// failed the call itself fails with the first bundle's error, so a
/// single-bundle write against a locked bundle reads as `bundle_locked`.
fn marks_upsert(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let actor = parse_actor(params)?;
    let entries = parse_entries(params, None)?;
    let mut report = store::upsert_batch(conn, &state.config, &actor, &entries)?;

    let all_failed = !report.bundles.is_empty() && report.bundles.iter().all(|b| b.result.is_err());
    if all_failed {
        let summary = report.to_json();
        let first = report.bundles.remove(0);
        if let Err(e) = first.result {
            let mut failure = HandlerErr::from(e);
            let mut details = failure.details.take().unwrap_or_else(|| json!({}));
            details["bundles"] = summary["bundles"].clone();
            failure.details = Some(details);
            return Err(failure);
        }
    }
    Ok(report.to_json())
}

fn marks_bundle_get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let key = parse_bundle_key(params)?;
    let view = store::bundle_view(conn, &key)?;
    let mut out = view.to_json();
    out["editAllowed"] = json!(view.status.is_editable());
    Ok(out)
}

fn marks_edit_allowed(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let key = parse_bundle_key(params)?;
    Ok(json!({
        "subjectId": key.subject_id,
        "slot": key.slot.as_str(),
        "editAllowed": gate::edit_allowed(conn, &key)?,
    }))
}

fn marks_subject_status(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let subject_id = required_str(params, "subjectId")?;
    Ok(store::subject_status(conn, &subject_id)?.to_json())
}

fn marks_student_approved(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(params, "studentId")?;
    Ok(json!(store::approved_for_student(conn, &student_id)?))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: fn(&AppState, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "marks.open" => marks_open,
        "marks.upsert" => marks_upsert,
        "marks.bundle.get" => marks_bundle_get,
        "marks.editAllowed" => marks_edit_allowed,
        "marks.subject.status" => marks_subject_status,
        "marks.student.approved" => marks_student_approved,
        _ => return None,
    };
    Some(respond(req, handler(state, &req.params)))
}
