use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, Local, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde_json::{json, Value};
use uuid::Uuid;

/// Canonical correction reasons, as offered by the submission form.
const REASONS: &[&str] = &[
    "Present but marked absent",
    "Entered late but attended",
    "Technical marking issue",
    "Participating in other college activity",
];

const MAX_LECTURE_NUMBER: i64 = 3;

/// Approval touches a contended summary row; retry a few times when another
/// writer holds the file lock past the connection's busy timeout.
const APPROVE_ATTEMPTS: u32 = 3;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_err(e: impl std::fmt::Display) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone)]
struct CorrectionRow {
    id: String,
    student_id: String,
    roll: Option<String>,
    name: Option<String>,
    class_id: String,
    subject_id: String,
    subject_name: Option<String>,
    date: String,
    lecture_number: i64,
    reason: String,
    notes: Option<String>,
    proof: Option<String>,
    status: String,
    submitted_at: Option<String>,
    status_updated_at: Option<String>,
}

const CORRECTION_COLUMNS: &str = "id, student_id, roll, name, class_id, subject_id, subject_name, \
     date, lecture_number, reason, notes, proof, status, submitted_at, status_updated_at";

fn row_to_correction(r: &rusqlite::Row<'_>) -> rusqlite::Result<CorrectionRow> {
    Ok(CorrectionRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        roll: r.get(2)?,
        name: r.get(3)?,
        class_id: r.get(4)?,
        subject_id: r.get(5)?,
        subject_name: r.get(6)?,
        date: r.get(7)?,
        lecture_number: r.get(8)?,
        reason: r.get(9)?,
        notes: r.get(10)?,
        proof: r.get(11)?,
        status: r.get(12)?,
        submitted_at: r.get(13)?,
        status_updated_at: r.get(14)?,
    })
}

fn pivot_of(row: &CorrectionRow) -> DateTime<Utc> {
    let submitted = parse_ts(row.submitted_at.as_deref()).unwrap_or_else(Utc::now);
    calc::pivot_date(parse_ts(row.status_updated_at.as_deref()), submitted)
}

fn correction_json(row: &CorrectionRow) -> Value {
    json!({
        "id": row.id,
        "studentId": row.student_id,
        "roll": row.roll,
        "name": row.name,
        "classId": row.class_id,
        "subjectId": row.subject_id,
        "subjectName": row.subject_name,
        "date": row.date,
        "lectureNumber": row.lecture_number,
        "reason": row.reason,
        "notes": row.notes,
        "proof": row.proof,
        "status": row.status,
        "submittedAt": row.submitted_at,
        "statusUpdatedAt": row.status_updated_at,
        "pivotDate": pivot_of(row).to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

fn corrections_submit(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date_raw = get_required_str(params, "date")?;
    let reason = get_required_str(params, "reason")?;

    let date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "date must be YYYY-MM-DD".to_string(),
        details: None,
    })?;
    // Day granularity in the submitter's local calendar.
    if date > Local::now().date_naive() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "date cannot be in the future".to_string(),
            details: None,
        });
    }
    let lecture_number = params
        .get("lectureNumber")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    if !(1..=MAX_LECTURE_NUMBER).contains(&lecture_number) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("lectureNumber must be between 1 and {}", MAX_LECTURE_NUMBER),
            details: None,
        });
    }
    if !REASONS.contains(&reason.as_str()) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("unknown reason: {}", reason),
            details: Some(json!({ "allowed": REASONS })),
        });
    }

    let student: Option<(String, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT name, roll, class_id FROM users WHERE id = ? AND role = 'student'",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((name, roll, class_id)) = student else {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("no student profile for uid {}", student_id),
            details: None,
        });
    };
    let Some(class_id) = class_id else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "student profile has no class assigned".to_string(),
            details: None,
        });
    };

    // Display name: the student's own summary first, then the master list.
    let subject_name: Option<String> = conn
        .query_row(
            "SELECT COALESCE(s.subject_name, subj.name)
             FROM (SELECT ? AS sid) k
             LEFT JOIN attendance_summaries s
               ON s.student_id = ? AND s.subject_id = k.sid
             LEFT JOIN subjects subj ON subj.id = k.sid",
            (&subject_id, &student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?
        .flatten();

    // One open dispute per lecture slot.
    let pending_exists = conn
        .query_row(
            "SELECT 1 FROM corrections
             WHERE student_id = ? AND subject_id = ? AND date = ?
               AND lecture_number = ? AND status = 'Pending'",
            rusqlite::params![student_id, subject_id, date_raw, lecture_number],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err)?
        .is_some();
    if pending_exists {
        return Err(HandlerErr {
            code: "duplicate_request",
            message: "a pending correction already exists for this lecture".to_string(),
            details: None,
        });
    }

    let now = now_rfc3339();
    let row = CorrectionRow {
        id: Uuid::new_v4().to_string(),
        student_id,
        roll,
        name: Some(name),
        class_id,
        subject_id,
        subject_name,
        date: date_raw,
        lecture_number,
        reason,
        notes: params
            .get("notes")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        proof: params
            .get("proof")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        status: "Pending".to_string(),
        submitted_at: Some(now.clone()),
        status_updated_at: Some(now),
    };

    let inserted = conn.execute(
        &format!(
            "INSERT INTO corrections({}) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            CORRECTION_COLUMNS
        ),
        rusqlite::params![
            row.id,
            row.student_id,
            row.roll,
            row.name,
            row.class_id,
            row.subject_id,
            row.subject_name,
            row.date,
            row.lecture_number,
            row.reason,
            row.notes,
            row.proof,
            row.status,
            row.submitted_at,
            row.status_updated_at,
        ],
    );
    if let Err(e) = inserted {
        // The partial unique index backstops the pre-check under concurrency.
        if let rusqlite::Error::SqliteFailure(f, _) = &e {
            if f.code == ErrorCode::ConstraintViolation {
                return Err(HandlerErr {
                    code: "duplicate_request",
                    message: "a pending correction already exists for this lecture".to_string(),
                    details: None,
                });
            }
        }
        return Err(HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "corrections" })),
        });
    }

    Ok(correction_json(&row))
}

fn corrections_list_for_student(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM corrections WHERE student_id = ?",
            CORRECTION_COLUMNS
        ))
        .map_err(db_err)?;
    let mut rows = stmt
        .query_map([&student_id], row_to_correction)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    // Stale requests fall off the student's view; adjudication restarts the
    // clock via the pivot date.
    let now = Utc::now();
    rows.retain(|row| calc::visible_to_student(pivot_of(row), now));
    rows.sort_by_key(|row| std::cmp::Reverse(pivot_of(row)));

    let out: Vec<Value> = rows.iter().map(correction_json).collect();
    Ok(json!({ "corrections": out }))
}

fn corrections_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut sql = format!("SELECT {} FROM corrections WHERE 1=1", CORRECTION_COLUMNS);
    let mut args: Vec<String> = Vec::new();
    for (key, column) in [
        ("classId", "class_id"),
        ("subjectId", "subject_id"),
        ("status", "status"),
    ] {
        if let Some(v) = params.get(key).and_then(|v| v.as_str()) {
            let v = v.trim();
            if v.is_empty() {
                continue;
            }
            if key == "status" && !["Pending", "Approved", "Rejected"].contains(&v) {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("unknown status: {}", v),
                    details: None,
                });
            }
            sql.push_str(&format!(" AND {} = ?", column));
            args.push(v.to_string());
        }
    }
    sql.push_str(" ORDER BY submitted_at DESC");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), row_to_correction)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let out: Vec<Value> = rows.iter().map(correction_json).collect();
    Ok(json!({ "corrections": out }))
}

fn load_correction(conn: &Connection, id: &str) -> Result<Option<CorrectionRow>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {} FROM corrections WHERE id = ?", CORRECTION_COLUMNS),
        [id],
        row_to_correction,
    )
    .optional()
}

fn corrections_reject(conn: &Connection, correction_id: &str) -> Result<Value, HandlerErr> {
    let Some(mut row) = load_correction(conn, correction_id).map_err(db_err)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("no correction with id {}", correction_id),
            details: None,
        });
    };
    if row.status != "Pending" {
        return Err(HandlerErr {
            code: "already_decided",
            message: format!("correction is already {}", row.status),
            details: None,
        });
    }

    let now = now_rfc3339();
    conn.execute(
        "UPDATE corrections SET status = 'Rejected', status_updated_at = ?
         WHERE id = ? AND status = 'Pending'",
        (&now, correction_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "corrections" })),
    })?;

    row.status = "Rejected".to_string();
    row.status_updated_at = Some(now);
    Ok(correction_json(&row))
}

/// One approval attempt inside a write transaction. The outer Err carries
/// SQLite failures (possibly a lock timeout worth retrying); the inner Err
/// carries guard refusals that must not be retried.
fn approve_once(
    conn: &mut Connection,
    correction_id: &str,
    decider_name: &str,
) -> Result<Result<Value, HandlerErr>, rusqlite::Error> {
    // Take the write lock up front so the guard reads cannot be invalidated
    // between read and write by another connection.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(mut row) = load_correction(&tx, correction_id)? else {
        return Ok(Err(HandlerErr {
            code: "not_found",
            message: format!("no correction with id {}", correction_id),
            details: None,
        }));
    };

    let record: Option<bool> = tx
        .query_row(
            "SELECT present FROM attendance_records
             WHERE date = ? AND subject_id = ? AND student_id = ? AND lecture_number = ?",
            rusqlite::params![row.date, row.subject_id, row.student_id, row.lecture_number],
            |r| Ok(r.get::<_, i64>(0)? != 0),
        )
        .optional()?;
    let Some(present) = record else {
        return Ok(Err(HandlerErr {
            code: "not_found",
            message: "no lecture record found for that date and lecture number".to_string(),
            details: Some(json!({
                "hint": "verify the teacher marked attendance for that subject, date and lecture"
            })),
        }));
    };
    if present {
        // Redundant approval; nothing to reconcile and nothing is mutated.
        return Ok(Err(HandlerErr {
            code: "already_satisfied",
            message: "student is already marked present for that lecture".to_string(),
            details: None,
        }));
    }
    if row.status != "Pending" {
        return Ok(Err(HandlerErr {
            code: "already_decided",
            message: format!("correction is already {}", row.status),
            details: None,
        }));
    }

    // Three-way reconciliation: record, summary, correction — all or nothing.
    tx.execute(
        "UPDATE attendance_records SET present = 1, notes = ?
         WHERE date = ? AND subject_id = ? AND student_id = ? AND lecture_number = ?",
        rusqlite::params![
            format!("Approved correction by {}", decider_name),
            row.date,
            row.subject_id,
            row.student_id,
            row.lecture_number,
        ],
    )?;
    // The lecture was already counted; only attended moves.
    let summary_rows = tx.execute(
        "UPDATE attendance_summaries SET attended = attended + 1
         WHERE student_id = ? AND subject_id = ?",
        (&row.student_id, &row.subject_id),
    )?;
    if summary_rows == 0 {
        // A record without its aggregate means the store is inconsistent;
        // refuse rather than invent a summary row.
        return Ok(Err(HandlerErr {
            code: "integrity_error",
            message: "attendance summary missing for this student and subject".to_string(),
            details: None,
        }));
    }
    let now = now_rfc3339();
    tx.execute(
        "UPDATE corrections SET status = 'Approved', status_updated_at = ?
         WHERE id = ?",
        (&now, correction_id),
    )?;
    tx.commit()?;

    row.status = "Approved".to_string();
    row.status_updated_at = Some(now);
    Ok(Ok(correction_json(&row)))
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked
    )
}

fn corrections_approve(
    conn: &mut Connection,
    correction_id: &str,
    decider_name: &str,
) -> Result<Value, HandlerErr> {
    let mut delay = std::time::Duration::from_millis(25);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match approve_once(conn, correction_id, decider_name) {
            Ok(outcome) => return outcome,
            Err(e) if is_busy(&e) && attempt < APPROVE_ATTEMPTS => {
                log::warn!(
                    "approval of {} hit a lock (attempt {}), retrying",
                    correction_id,
                    attempt
                );
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => {
                return Err(HandlerErr {
                    code: "db_tx_failed",
                    message: e.to_string(),
                    details: None,
                })
            }
        }
    }
}

fn corrections_decide(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let correction_id = match get_required_str(&req.params, "correctionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let decision = match get_required_str(&req.params, "decision") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let decider_name = req
        .params
        .get("deciderName")
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("staff")
        .to_string();

    let result = match decision.as_str() {
        "Rejected" => corrections_reject(conn, &correction_id),
        "Approved" => corrections_approve(conn, &correction_id, &decider_name),
        other => Err(HandlerErr {
            code: "bad_params",
            message: format!("decision must be Approved or Rejected, got {}", other),
            details: None,
        }),
    };
    match result {
        Ok(correction) => ok(&req.id, json!({ "correction": correction })),
        Err(error) => error.response(&req.id),
    }
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match corrections_submit(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_list_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match corrections_list_for_student(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match corrections_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "corrections.submit" => Some(handle_submit(state, req)),
        "corrections.listForStudent" => Some(handle_list_for_student(state, req)),
        "corrections.list" => Some(handle_list(state, req)),
        "corrections.decide" => Some(corrections_decide(state, req)),
        _ => None,
    }
}
