#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_ciemarksd");
    let mut child = Command::new(exe)
        .env("CIEMARKSD_LOG", "off")
        .env_remove("CIEMARKSD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn ciemarksd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(serde_json::Value::Null)
}

/// Returns the `error` object of a failed response.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error object")
}

pub fn faculty(id: &str) -> serde_json::Value {
    json!({ "id": id, "role": "faculty" })
}

pub fn hod(id: &str) -> serde_json::Value {
    json!({ "id": id, "role": "hod", "department": "CSE" })
}

pub struct Seeded {
    pub subject_id: String,
    pub student_ids: Vec<String>,
}

/// Selects `workspace`, then creates one CSE subject taught by `fac-1` with
/// `students` enrolled students. Uses request ids prefixed with `seed-`.
pub fn seed_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
    students: usize,
) -> Seeded {
    let _ = request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let subject = request_ok(
        stdin,
        reader,
        "seed-subject",
        "subjects.create",
        json!({
            "code": "CS301",
            "name": "Operating Systems",
            "department": "CSE",
            "instructorId": "fac-1"
        }),
    );
    let subject_id = subject["subject"]["id"]
        .as_str()
        .expect("subject id")
        .to_string();

    let mut student_ids = Vec::with_capacity(students);
    for i in 0..students {
        let created = request_ok(
            stdin,
            reader,
            &format!("seed-student-{}", i),
            "students.create",
            json!({ "regNo": format!("1CS{:02}", i + 1), "name": format!("Student {}", i + 1) }),
        );
        student_ids.push(
            created["student"]["id"]
                .as_str()
                .expect("student id")
                .to_string(),
        );
    }
    let enrolled = request_ok(
        stdin,
        reader,
        "seed-enroll",
        "roster.enroll",
        json!({ "subjectId": subject_id, "studentIds": student_ids }),
    );
    assert_eq!(enrolled["changed"].as_u64(), Some(students as u64));

    Seeded {
        subject_id,
        student_ids,
    }
}

/// Upsert entries for every seeded student in one slot.
pub fn scores(seeded: &Seeded, slot: &str, values: &[serde_json::Value]) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = seeded
        .student_ids
        .iter()
        .zip(values)
        .map(|(student_id, score)| {
            json!({
                "studentId": student_id,
                "subjectId": seeded.subject_id,
                "slot": slot,
                "score": score
            })
        })
        .collect();
    json!(entries)
}
