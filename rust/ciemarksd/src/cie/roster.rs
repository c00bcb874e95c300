use super::error::CieError;
use crate::db;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub code: String,
    pub name: String,
    pub department: String,
    pub max_marks: f64,
    pub instructor_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub reg_no: String,
    pub name: String,
    pub department: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct NewSubject {
    pub code: String,
    pub name: String,
    pub department: String,
    pub max_marks: f64,
    pub instructor_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub reg_no: String,
    pub name: String,
    pub department: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollSummary {
    pub changed: usize,
    pub unchanged: usize,
    pub unknown_student_ids: Vec<String>,
}

fn subject_from_row(row: &Row<'_>) -> rusqlite::Result<Subject> {
    Ok(Subject {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        department: row.get(3)?,
        max_marks: row.get(4)?,
        instructor_id: row.get(5)?,
    })
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    let active: i64 = row.get(4)?;
    Ok(Student {
        id: row.get(0)?,
        reg_no: row.get(1)?,
        name: row.get(2)?,
        department: row.get(3)?,
        active: active != 0,
    })
}

pub fn create_subject(conn: &Connection, new: NewSubject) -> Result<Subject, CieError> {
    let code = new.code.trim().to_string();
    let name = new.name.trim().to_string();
    let department = new.department.trim().to_string();
    if code.is_empty() || name.is_empty() || department.is_empty() {
        return Err(CieError::validation(None, "code/name/department must not be empty"));
    }
    if !new.max_marks.is_finite() || new.max_marks <= 0.0 {
        return Err(CieError::validation(None, "maxMarks must be > 0"));
    }
    let taken = conn
        .query_row("SELECT 1 FROM subjects WHERE code = ?", [&code], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some();
    if taken {
        return Err(CieError::validation(None, format!("subject code already exists: {code}")));
    }

    let subject = Subject {
        id: Uuid::new_v4().to_string(),
        code,
        name,
        department,
        max_marks: new.max_marks,
        instructor_id: new.instructor_id.filter(|s| !s.trim().is_empty()),
    };
    conn.execute(
        "INSERT INTO subjects(id, code, name, department, max_marks, instructor_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &subject.id,
            &subject.code,
            &subject.name,
            &subject.department,
            subject.max_marks,
            &subject.instructor_id,
            db::now_utc(),
        ),
    )?;
    Ok(subject)
}

pub fn get_subject(conn: &Connection, subject_id: &str) -> Result<Subject, CieError> {
    conn.query_row(
        "SELECT id, code, name, department, max_marks, instructor_id FROM subjects WHERE id = ?",
        [subject_id],
        subject_from_row,
    )
    .optional()?
    .ok_or_else(|| CieError::NotFound {
        what: "subject",
        id: subject_id.to_string(),
    })
}

pub fn list_subjects(conn: &Connection, department: Option<&str>) -> Result<Vec<Subject>, CieError> {
    let mut stmt = conn.prepare(
        "SELECT id, code, name, department, max_marks, instructor_id
         FROM subjects
         WHERE (?1 IS NULL OR department = ?1)
         ORDER BY code",
    )?;
    let rows = stmt
        .query_map([department], subject_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn create_student(conn: &Connection, new: NewStudent) -> Result<Student, CieError> {
    let reg_no = new.reg_no.trim().to_string();
    let name = new.name.trim().to_string();
    if reg_no.is_empty() || name.is_empty() {
        return Err(CieError::validation(None, "regNo/name must not be empty"));
    }
    let taken = conn
        .query_row("SELECT 1 FROM students WHERE reg_no = ?", [&reg_no], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some();
    if taken {
        return Err(CieError::validation(None, format!("regNo already exists: {reg_no}")));
    }

    let student = Student {
        id: Uuid::new_v4().to_string(),
        reg_no,
        name,
        department: new.department.filter(|s| !s.trim().is_empty()),
        active: true,
    };
    conn.execute(
        "INSERT INTO students(id, reg_no, name, department, active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (
            &student.id,
            &student.reg_no,
            &student.name,
            &student.department,
            db::now_utc(),
        ),
    )?;
    Ok(student)
}

pub fn get_student(conn: &Connection, student_id: &str) -> Result<Student, CieError> {
    conn.query_row(
        "SELECT id, reg_no, name, department, active FROM students WHERE id = ?",
        [student_id],
        student_from_row,
    )
    .optional()?
    .ok_or_else(|| CieError::NotFound {
        what: "student",
        id: student_id.to_string(),
    })
}

pub fn list_students(conn: &Connection) -> Result<Vec<Student>, CieError> {
    let mut stmt = conn.prepare(
        "SELECT id, reg_no, name, department, active FROM students ORDER BY reg_no",
    )?;
    let rows = stmt
        .query_map([], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn set_student_active(conn: &Connection, student_id: &str, active: bool) -> Result<(), CieError> {
    let n = conn.execute(
        "UPDATE students SET active = ? WHERE id = ?",
        (if active { 1 } else { 0 }, student_id),
    )?;
    if n == 0 {
        return Err(CieError::NotFound {
            what: "student",
            id: student_id.to_string(),
        });
    }
    Ok(())
}

pub fn enroll(
    conn: &Connection,
    subject_id: &str,
    student_ids: &[String],
) -> Result<EnrollSummary, CieError> {
    get_subject(conn, subject_id)?;
    let tx = conn.unchecked_transaction()?;
    let mut summary = EnrollSummary::default();
    for student_id in student_ids {
        let exists = tx
            .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| r.get::<_, i64>(0))
            .optional()?
            .is_some();
        if !exists {
            summary.unknown_student_ids.push(student_id.clone());
            continue;
        }
        let n = tx.execute(
            "INSERT OR IGNORE INTO enrollments(subject_id, student_id, enrolled_at) VALUES(?, ?, ?)",
            (subject_id, student_id, db::now_utc()),
        )?;
        if n > 0 {
            summary.changed += 1;
        } else {
            summary.unchanged += 1;
        }
    }
    tx.commit()?;
    Ok(summary)
}

/// Removes roster membership only; existing mark records stay as history.
pub fn withdraw(
    conn: &Connection,
    subject_id: &str,
    student_ids: &[String],
) -> Result<EnrollSummary, CieError> {
    get_subject(conn, subject_id)?;
    let tx = conn.unchecked_transaction()?;
    let mut summary = EnrollSummary::default();
    for student_id in student_ids {
        let n = tx.execute(
            "DELETE FROM enrollments WHERE subject_id = ? AND student_id = ?",
            (subject_id, student_id),
        )?;
        if n > 0 {
            summary.changed += 1;
        } else {
            summary.unchanged += 1;
        }
    }
    tx.commit()?;
    Ok(summary)
}

/// Active students enrolled in the subject.
pub fn roster(conn: &Connection, subject_id: &str) -> Result<Vec<Student>, CieError> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.reg_no, s.name, s.department, s.active
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.subject_id = ? AND s.active = 1
         ORDER BY s.reg_no",
    )?;
    let rows = stmt
        .query_map([subject_id], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn roster_ids(conn: &Connection, subject_id: &str) -> Result<HashSet<String>, CieError> {
    Ok(roster(conn, subject_id)?.into_iter().map(|s| s.id).collect())
}
