use chrono::{Duration, SecondsFormat, Utc};
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

fn request_ok(
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn ts(ago: Duration) -> String {
    (Utc::now() - ago).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn seed_correction(
    conn: &rusqlite::Connection,
    id: &str,
    date: &str,
    status: &str,
    submitted_at: &str,
    status_updated_at: Option<&str>,
) {
    conn.execute(
        "INSERT INTO corrections(
            id, student_id, roll, name, class_id, subject_id, subject_name,
            date, lecture_number, reason, notes, proof, status,
            submitted_at, status_updated_at)
         VALUES(?, 's-1', '1', 'Asha Rao', 'BCA-1-A', 'BAS-105', 'Basic Science',
            ?, 1, 'Present but marked absent', NULL, NULL, ?, ?, ?)",
        rusqlite::params![id, date, status, submitted_at, status_updated_at],
    )
    .expect("seed correction");
}

#[test]
fn students_see_only_the_three_day_window_staff_see_everything() {
    let workspace = temp_dir("presencia-visibility");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    {
        let conn =
            rusqlite::Connection::open(workspace.join("presencia.sqlite3")).expect("open db");
        // Never adjudicated and long stale: the clock falls back to the
        // submission time, so it is hidden.
        seed_correction(
            &conn,
            "c-stale-pending",
            "2025-11-01",
            "Pending",
            &ts(Duration::days(10)),
            None,
        );
        // Adjudicated two days ago: still inside the window even though the
        // submission itself is old.
        seed_correction(
            &conn,
            "c-fresh-decision",
            "2025-11-02",
            "Approved",
            &ts(Duration::days(20)),
            Some(&ts(Duration::days(2))),
        );
        // Adjudicated four days ago: expired.
        seed_correction(
            &conn,
            "c-old-decision",
            "2025-11-03",
            "Rejected",
            &ts(Duration::days(8)),
            Some(&ts(Duration::days(4))),
        );
        // Submitted an hour ago: fresh.
        seed_correction(
            &conn,
            "c-new",
            "2025-11-04",
            "Pending",
            &ts(Duration::hours(1)),
            Some(&ts(Duration::hours(1))),
        );
    }

    let visible = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "corrections.listForStudent",
        json!({ "studentId": "s-1" }),
    );
    let ids: Vec<&str> = visible["corrections"]
        .as_array()
        .expect("corrections")
        .iter()
        .filter_map(|c| c["id"].as_str())
        .collect();
    // Newest pivot first, expired ones gone.
    assert_eq!(ids, vec!["c-new", "c-fresh-decision"]);

    // Staff listings are not subject to the window.
    let all = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "corrections.list",
        json!({ "subjectId": "BAS-105" }),
    );
    assert_eq!(all["corrections"].as_array().expect("corrections").len(), 4);

    let pending_only = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "corrections.list",
        json!({ "subjectId": "BAS-105", "status": "Pending" }),
    );
    assert_eq!(
        pending_only["corrections"]
            .as_array()
            .expect("corrections")
            .len(),
        2
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
