use crate::cie::roster::{self, NewStudent, NewSubject};
use crate::ipc::helpers::{
    db_conn, optional_str, required_str, respond, string_list, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn subjects_create(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let max_marks = match params.get("maxMarks") {
        None | Some(Value::Null) => state.config.max_marks_default,
        Some(v) => v
            .as_f64()
            .ok_or_else(|| HandlerErr::bad_params("maxMarks must be a number"))?,
    };
    let subject = roster::create_subject(
        conn,
        NewSubject {
            code: required_str(params, "code")?,
            name: required_str(params, "name")?,
            department: required_str(params, "department")?,
            max_marks,
            instructor_id: optional_str(params, "instructorId")?,
        },
    )?;
    tracing::info!(subject = %subject.id, code = %subject.code, "subject created");
    Ok(json!({ "subject": subject }))
}

fn subjects_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let department = optional_str(params, "department")?;
    let subjects = roster::list_subjects(conn, department.as_deref())?;
    Ok(json!({ "subjects": subjects }))
}

fn students_create(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student = roster::create_student(
        conn,
        NewStudent {
            reg_no: required_str(params, "regNo")?,
            name: required_str(params, "name")?,
            department: optional_str(params, "department")?,
        },
    )?;
    Ok(json!({ "student": student }))
}

fn students_list(state: &AppState, _params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    Ok(json!({ "students": roster::list_students(conn)? }))
}

fn students_set_active(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = required_str(params, "studentId")?;
    let Some(active) = params.get("active").and_then(|v| v.as_bool()) else {
        return Err(HandlerErr::bad_params("active must be boolean"));
    };
    roster::set_student_active(conn, &student_id, active)?;
    Ok(json!({ "ok": true }))
}

fn roster_enroll(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let subject_id = required_str(params, "subjectId")?;
    let ids = string_list(params, "studentIds")?;
    let summary = roster::enroll(conn, &subject_id, &ids)?;
    Ok(json!(summary))
}

fn roster_withdraw(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let subject_id = required_str(params, "subjectId")?;
    let ids = string_list(params, "studentIds")?;
    let summary = roster::withdraw(conn, &subject_id, &ids)?;
    Ok(json!(summary))
}

fn roster_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let subject_id = required_str(params, "subjectId")?;
    let subject = roster::get_subject(conn, &subject_id)?;
    let students = roster::roster(conn, &subject_id)?;
    Ok(json!({ "subject": subject, "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: fn(&AppState, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "subjects.create" => subjects_create,
        "subjects.list" => subjects_list,
        "students.create" => students_create,
        "students.list" => students_list,
        "students.setActive" => students_set_active,
        "roster.enroll" => roster_enroll,
        "roster.withdraw" => roster_withdraw,
        "roster.list" => roster_list,
        _ => return None,
    };
    Some(respond(req, handler(state, &req.params)))
}
