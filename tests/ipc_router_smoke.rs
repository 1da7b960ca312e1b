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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("presencia-router-smoke");
    let csv_out = workspace.join("smoke-report.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "config.update",
        json!({ "courses": ["BCA"], "years": ["1"], "sections": ["A"] }),
    );
    let _ = request(&mut stdin, &mut reader, "4", "config.get", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({ "id": "BAS-105", "name": "Basic Science" }),
    );
    let _ = request(&mut stdin, &mut reader, "6", "subjects.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "users.create",
        json!({
            "uid": "t-1",
            "role": "teacher",
            "name": "Prof. Verma",
            "email": "verma@example.edu",
            "subjectId": "BAS-105",
            "classIds": ["BCA-1-A"]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "users.create",
        json!({
            "uid": "s-1",
            "role": "student",
            "name": "Asha Rao",
            "email": "asha@example.edu",
            "father": "K Rao",
            "course": "BCA",
            "year": "1",
            "section": "A",
            "roll": "1"
        }),
    );
    let _ = request(&mut stdin, &mut reader, "9", "users.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "profile.open",
        json!({ "uid": "s-1" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.submitBatch",
        json!({
            "classId": "BCA-1-A",
            "subjectId": "BAS-105",
            "markedBy": "t-1",
            "date": "2025-11-10",
            "lectureCount": 1,
            "entries": [{ "studentId": "s-1", "present": false }]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
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
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "attendance.studentSummary",
        json!({ "studentId": "s-1" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "attendance.history",
        json!({ "classId": "BCA-1-A", "subjectId": "BAS-105" }),
    );
    let submitted = request(
        &mut stdin,
        &mut reader,
        "15",
        "corrections.submit",
        json!({
            "studentId": "s-1",
            "subjectId": "BAS-105",
            "date": "2025-11-10",
            "lectureNumber": 1,
            "reason": "Present but marked absent"
        }),
    );
    let correction_id = submitted
        .get("result")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("correction id")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "corrections.listForStudent",
        json!({ "studentId": "s-1" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "corrections.list",
        json!({ "subjectId": "BAS-105" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "corrections.decide",
        json!({
            "correctionId": correction_id,
            "decision": "Approved",
            "decidedBy": "t-1",
            "deciderName": "Prof. Verma"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "reports.classOverview",
        json!({ "course": "BCA", "year": "1", "section": "A" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "20",
        "reports.exportClassCsv",
        json!({
            "course": "BCA",
            "year": "1",
            "section": "A",
            "outPath": csv_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "users.update",
        json!({ "uid": "s-1", "patch": { "roll": "2" } }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "users.delete",
        json!({ "uid": "s-1" }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
