use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_presenciad");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn presenciad");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        id,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn seed_student(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let _ = request_ok(
        stdin,
        reader,
        "seed-subject",
        "subjects.create",
        json!({ "id": "BAS-105", "name": "Basic Science" }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "seed-student",
        "users.create",
        json!({
            "uid": "s-1",
            "role": "student",
            "name": "Asha Rao",
            "email": "asha@example.edu",
            "course": "BCA",
            "year": "1",
            "section": "A",
            "roll": "1"
        }),
    );
}

#[test]
fn submission_validation_rejects_bad_input_before_any_write() {
    let workspace = temp_dir("presencia-submit-validation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_student(&mut stdin, &mut reader);

    let base = json!({
        "studentId": "s-1",
        "subjectId": "BAS-105",
        "date": "2025-11-10",
        "lectureNumber": 1,
        "reason": "Present but marked absent"
    });

    let mut future = base.clone();
    let tomorrow = chrono::Local::now().date_naive() + chrono::Days::new(1);
    future["date"] = json!(tomorrow.format("%Y-%m-%d").to_string());
    let resp = request(&mut stdin, &mut reader, "2", "corrections.submit", future);
    assert_eq!(error_code(&resp), "bad_params");

    let mut bad_lecture = base.clone();
    bad_lecture["lectureNumber"] = json!(5);
    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "corrections.submit",
        bad_lecture,
    );
    assert_eq!(error_code(&resp), "bad_params");

    let mut bad_reason = base.clone();
    bad_reason["reason"] = json!("Felt like it");
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "corrections.submit",
        bad_reason,
    );
    assert_eq!(error_code(&resp), "bad_params");

    let mut missing_subject = base.clone();
    missing_subject
        .as_object_mut()
        .expect("object")
        .remove("subjectId");
    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "corrections.submit",
        missing_subject,
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "corrections.submit",
        json!({
            "studentId": "nobody",
            "subjectId": "BAS-105",
            "date": "2025-11-10",
            "reason": "Present but marked absent"
        }),
    );
    assert_eq!(error_code(&resp), "not_found");

    // Nothing was persisted by any of the refused submissions.
    {
        use rusqlite::Connection;
        let conn =
            Connection::open(workspace.join("presencia.sqlite3")).expect("open db");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM corrections", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn one_pending_dispute_per_lecture_slot() {
    let workspace = temp_dir("presencia-dup-pending");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_student(&mut stdin, &mut reader);

    let submit = json!({
        "studentId": "s-1",
        "subjectId": "BAS-105",
        "date": "2025-11-10",
        "lectureNumber": 1,
        "reason": "Present but marked absent"
    });
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "corrections.submit",
        submit.clone(),
    );
    let correction_id = first["id"].as_str().expect("id").to_string();

    let duplicate = request(
        &mut stdin,
        &mut reader,
        "3",
        "corrections.submit",
        submit.clone(),
    );
    assert_eq!(error_code(&duplicate), "duplicate_request");

    // A different lecture slot is a different dispute.
    let mut other_slot = submit.clone();
    other_slot["lectureNumber"] = json!(2);
    let _ = request_ok(&mut stdin, &mut reader, "4", "corrections.submit", other_slot);

    // Once the first is decided, the slot can be disputed again.
    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "corrections.decide",
        json!({ "correctionId": correction_id, "decision": "Rejected", "decidedBy": "t-1" }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "6", "corrections.submit", submit);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn approval_requires_an_absent_lecture_record() {
    let workspace = temp_dir("presencia-approve-guards");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_student(&mut stdin, &mut reader);

    // Dispute a lecture nobody ever marked.
    let orphan = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "corrections.submit",
        json!({
            "studentId": "s-1",
            "subjectId": "BAS-105",
            "date": "2025-11-10",
            "lectureNumber": 1,
            "reason": "Technical marking issue"
        }),
    );
    let orphan_id = orphan["id"].as_str().expect("id").to_string();
    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "corrections.decide",
        json!({
            "correctionId": orphan_id,
            "decision": "Approved",
            "decidedBy": "t-1",
            "deciderName": "Prof. Verma"
        }),
    );
    assert_eq!(error_code(&resp), "not_found");
    // The failed approval left the correction pending and wrote nothing.
    {
        use rusqlite::Connection;
        let conn =
            Connection::open(workspace.join("presencia.sqlite3")).expect("open db");
        let status: String = conn
            .query_row(
                "SELECT status FROM corrections WHERE id = ?",
                [&orphan_id],
                |r| r.get(0),
            )
            .expect("status");
        assert_eq!(status, "Pending");
        let summaries: i64 = conn
            .query_row("SELECT COUNT(*) FROM attendance_summaries", [], |r| r.get(0))
            .expect("count");
        assert_eq!(summaries, 0);
    }

    // A lecture already marked present cannot be "corrected" again.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.markLecture",
        json!({
            "classId": "BCA-1-A",
            "subjectId": "BAS-105",
            "studentId": "s-1",
            "date": "2025-11-11",
            "lectureNumber": 1,
            "present": true,
            "markedBy": "t-1"
        }),
    );
    let satisfied = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "corrections.submit",
        json!({
            "studentId": "s-1",
            "subjectId": "BAS-105",
            "date": "2025-11-11",
            "lectureNumber": 1,
            "reason": "Present but marked absent"
        }),
    );
    let satisfied_id = satisfied["id"].as_str().expect("id").to_string();
    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "corrections.decide",
        json!({
            "correctionId": satisfied_id,
            "decision": "Approved",
            "decidedBy": "t-1",
            "deciderName": "Prof. Verma"
        }),
    );
    assert_eq!(error_code(&resp), "already_satisfied");
    {
        use rusqlite::Connection;
        let conn =
            Connection::open(workspace.join("presencia.sqlite3")).expect("open db");
        let (attended, total): (i64, i64) = conn
            .query_row(
                "SELECT attended, total FROM attendance_summaries
                 WHERE student_id = 's-1' AND subject_id = 'BAS-105'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("summary");
        assert_eq!((attended, total), (1, 1));
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
