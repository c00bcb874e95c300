use crate::cie::audit;
use crate::cie::lifecycle::Lifecycle;
use crate::cie::notify::OutboxNotifier;
use crate::cie::store;
use crate::ipc::helpers::{
    db_conn, optional_str, parse_actor, parse_bundle_key, parse_entries, required_str, respond,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

fn run<T>(
    state: &AppState,
    conn: &Connection,
    f: impl FnOnce(Lifecycle<'_>) -> Result<T, crate::cie::error::CieError>,
) -> Result<T, HandlerErr> {
    let outbox = OutboxNotifier::new(conn);
    Ok(f(Lifecycle::new(conn, &state.config, &outbox))?)
}

fn cie_submit(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let actor = parse_actor(params)?;
    let key = parse_bundle_key(params)?;
    let pending = match params.get("entries") {
        None | Some(Value::Null) => Vec::new(),
        Some(_) => parse_entries(params, Some(&key))?,
    };
    let outcome = run(state, conn, |lc| lc.submit(&actor, &key, &pending))?;
    Ok(outcome.to_json())
}

fn cie_approve(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let actor = parse_actor(params)?;
    let key = parse_bundle_key(params)?;
    let outcome = run(state, conn, |lc| lc.approve(&actor, &key))?;
    Ok(outcome.to_json())
}

fn cie_reject(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let actor = parse_actor(params)?;
    let key = parse_bundle_key(params)?;
    let reason = required_str(params, "reason")?;
    let outcome = run(state, conn, |lc| lc.reject(&actor, &key, &reason))?;
    Ok(outcome.to_json())
}

fn cie_unlock(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let actor = parse_actor(params)?;
    let key = parse_bundle_key(params)?;
    let reason = optional_str(params, "reason")?;
    let outcome = run(state, conn, |lc| lc.unlock(&actor, &key, reason.as_deref()))?;
    Ok(outcome.to_json())
}

fn cie_reviews_pending(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let department = optional_str(params, "department")?;
    let reviews = store::pending_reviews(conn, department.as_deref())?;
    Ok(json!({ "reviews": reviews }))
}

fn cie_history(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let key = parse_bundle_key(params)?;
    let entries = audit::history(conn, &key)?;
    Ok(json!({ "subjectId": key.subject_id, "slot": key.slot, "entries": entries }))
}

fn cie_audit_verify(state: &AppState, _params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let report = audit::verify_chain(conn)?;
    if !report.intact {
        tracing::warn!(broken_at_seq = ?report.broken_at_seq, "audit chain broken");
    }
    Ok(json!(report))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: fn(&AppState, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "cie.submit" => cie_submit,
        "cie.approve" => cie_approve,
        "cie.reject" => cie_reject,
        "cie.unlock" => cie_unlock,
        "cie.reviews.pending" => cie_reviews_pending,
        "cie.history" => cie_history,
        "cie.audit.verify" => cie_audit_verify,
        _ => return None,
    };
    Some(respond(req, handler(state, &req.params)))
}
