use crate::cie::notify;
use crate::ipc::helpers::{db_conn, optional_bool, optional_str, parse_role, required_str, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn notifications_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let role = parse_role(&required_str(params, "role")?)?;
    let actor_id = optional_str(params, "actorId")?;
    let department = optional_str(params, "department")?;
    let unread_only = optional_bool(params, "unreadOnly", false)?;
    let items = notify::list(conn, role, actor_id.as_deref(), department.as_deref(), unread_only)?;
    Ok(json!({ "notifications": items }))
}

fn notifications_mark_read(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let id = required_str(params, "id")?;
    notify::mark_read(conn, &id)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: fn(&AppState, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "notifications.list" => notifications_list,
        "notifications.markRead" => notifications_mark_read,
        _ => return None,
    };
    Some(respond(req, handler(state, &req.params)))
}
