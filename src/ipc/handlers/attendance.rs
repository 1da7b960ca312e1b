use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

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

fn parse_date(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "date must be YYYY-MM-DD".to_string(),
        details: None,
    })
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn counts_u64(attended: i64, total: i64) -> (u64, u64) {
    (attended.max(0) as u64, total.max(0) as u64)
}

/// Standard projection block for one (attended, total) pair.
fn projection_json(attended: u64, total: u64) -> Value {
    json!({
        "attended": attended,
        "total": total,
        "percent": calc::percentage(attended, total),
        "neededFor75": calc::lectures_to_reach_75(attended, total),
        "canSkip": calc::lectures_can_skip(attended, total),
    })
}

fn resolve_subject_name(
    conn: &Connection,
    subject_id: &str,
    explicit: Option<String>,
) -> Result<Option<String>, HandlerErr> {
    if explicit.is_some() {
        return Ok(explicit);
    }
    conn.query_row(
        "SELECT name FROM subjects WHERE id = ?",
        [subject_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(db_err)
}

struct LectureMark<'a> {
    date: &'a str,
    subject_id: &'a str,
    class_id: &'a str,
    student_id: &'a str,
    lecture_number: i64,
    present: bool,
    marked_by: &'a str,
    subject_name: Option<&'a str>,
}

/// Idempotent single-slot write. The record row is created at most once per
/// identity tuple; the summary increments are keyed to that creation, so a
/// repeated mark can never double-count. Existing records are left untouched
/// (only an approved correction amends them).
///
/// Returns whether a new record row was created.
fn mark_lecture(conn: &Connection, mark: &LectureMark<'_>) -> Result<bool, HandlerErr> {
    let inserted = conn
        .execute(
            "INSERT INTO attendance_records(
                date, subject_id, student_id, lecture_number,
                class_id, present, marked_by, notes)
             VALUES(?, ?, ?, ?, ?, ?, ?, NULL)
             ON CONFLICT(date, subject_id, student_id, lecture_number) DO NOTHING",
            rusqlite::params![
                mark.date,
                mark.subject_id,
                mark.student_id,
                mark.lecture_number,
                mark.class_id,
                mark.present as i64,
                mark.marked_by,
            ],
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_records" })),
        })?;
    if inserted == 0 {
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO attendance_summaries(
            student_id, subject_id, subject_name, class_id, attended, total)
         VALUES(?, ?, ?, ?, ?, 1)
         ON CONFLICT(student_id, subject_id) DO UPDATE SET
           attended = attended + excluded.attended,
           total = total + excluded.total,
           subject_name = COALESCE(excluded.subject_name, subject_name),
           class_id = excluded.class_id",
        rusqlite::params![
            mark.student_id,
            mark.subject_id,
            mark.subject_name,
            mark.class_id,
            mark.present as i64,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_summaries" })),
    })?;
    Ok(true)
}

fn attendance_mark_lecture(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let date_raw = get_required_str(params, "date")?;
    let date = parse_date(&date_raw)?;
    if date > today() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "date cannot be in the future".to_string(),
            details: None,
        });
    }
    let subject_id = get_required_str(params, "subjectId")?;
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;
    let marked_by = get_required_str(params, "markedBy")?;
    let lecture_number = params
        .get("lectureNumber")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    if lecture_number < 1 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "lectureNumber must be >= 1".to_string(),
            details: None,
        });
    }
    let Some(present) = params.get("present").and_then(|v| v.as_bool()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing present".to_string(),
            details: None,
        });
    };
    let subject_name = resolve_subject_name(
        conn,
        &subject_id,
        params
            .get("subjectName")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    )?;

    let created = mark_lecture(
        conn,
        &LectureMark {
            date: &date_raw,
            subject_id: &subject_id,
            class_id: &class_id,
            student_id: &student_id,
            lecture_number,
            present,
            marked_by: &marked_by,
            subject_name: subject_name.as_deref(),
        },
    )?;

    Ok(json!({ "created": created }))
}

fn attendance_submit_batch(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let marked_by = get_required_str(params, "markedBy")?;
    let date_raw = match params.get("date").and_then(|v| v.as_str()) {
        Some(s) => s.trim().to_string(),
        None => today().format("%Y-%m-%d").to_string(),
    };
    let date = parse_date(&date_raw)?;
    if date > today() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "date cannot be in the future".to_string(),
            details: None,
        });
    }
    let lecture_count = params
        .get("lectureCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    if !(1..=3).contains(&lecture_count) {
        return Err(HandlerErr {
            code: "bad_params",
            message: "lectureCount must be between 1 and 3".to_string(),
            details: None,
        });
    }
    let Some(entries_json) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing entries".to_string(),
            details: None,
        });
    };
    let mut entries: Vec<(String, bool)> = Vec::with_capacity(entries_json.len());
    for e in entries_json {
        let student_id = e
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let present = e.get("present").and_then(|v| v.as_bool());
        match (student_id, present) {
            (Some(s), Some(p)) => entries.push((s, p)),
            _ => {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "entries must be {studentId, present} objects".to_string(),
                    details: None,
                })
            }
        }
    }
    if entries.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "entries must not be empty".to_string(),
            details: None,
        });
    }

    let subject_name = resolve_subject_name(
        conn,
        &subject_id,
        params
            .get("subjectName")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    )?;

    // Lecture slots are explicit and append-only: the next batch for the same
    // (date, class, subject) continues after the highest slot already marked.
    let max_lecture: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(lecture_number), 0) FROM attendance_records
             WHERE date = ? AND class_id = ? AND subject_id = ?",
            (&date_raw, &class_id, &subject_id),
            |r| r.get(0),
        )
        .map_err(db_err)?;
    let start_lecture = max_lecture + 1;

    // The K x N record writes and the N summary increments land together or
    // not at all.
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let mut records_written: i64 = 0;
    for i in 0..lecture_count {
        let lecture_number = start_lecture + i;
        for (student_id, present) in &entries {
            let created = mark_lecture(
                &tx,
                &LectureMark {
                    date: &date_raw,
                    subject_id: &subject_id,
                    class_id: &class_id,
                    student_id,
                    lecture_number,
                    present: *present,
                    marked_by: &marked_by,
                    subject_name: subject_name.as_deref(),
                },
            )?;
            if created {
                records_written += 1;
            }
        }
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "date": date_raw,
        "startLecture": start_lecture,
        "lectureCount": lecture_count,
        "recordsWritten": records_written,
    }))
}

fn attendance_student_summary(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT name, class_id FROM users WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((_, class_id)) = student else {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("no profile for student {}", student_id),
            details: None,
        });
    };

    // Which teacher covers each subject for this student's class.
    let mut faculty_by_subject: HashMap<String, String> = HashMap::new();
    if let Some(class_id) = class_id.as_deref() {
        let mut stmt = conn
            .prepare(
                "SELECT u.subject_id, u.name
                 FROM users u, json_each(COALESCE(u.class_ids, '[]')) cls
                 WHERE u.role = 'teacher' AND u.subject_id IS NOT NULL AND cls.value = ?",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([class_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_err)?;
        faculty_by_subject.extend(rows);
    }

    // Summary rows, display name falling back to the master subject list and
    // finally the raw id.
    let mut stmt = conn
        .prepare(
            "SELECT s.subject_id,
                    COALESCE(s.subject_name, subj.name, s.subject_id) AS display_name,
                    s.attended, s.total
             FROM attendance_summaries s
             LEFT JOIN subjects subj ON subj.id = s.subject_id
             WHERE s.student_id = ?
             ORDER BY display_name",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut subjects = Vec::with_capacity(rows.len());
    let mut pairs = Vec::with_capacity(rows.len());
    for (subject_id, display_name, attended, total) in rows {
        let (a, t) = counts_u64(attended, total);
        pairs.push((a, t));
        let mut row = projection_json(a, t);
        row["subjectId"] = json!(subject_id);
        row["subjectName"] = json!(display_name);
        row["facultyName"] = json!(faculty_by_subject
            .get(&subject_id)
            .cloned()
            .unwrap_or_else(|| "N/A".to_string()));
        subjects.push(row);
    }

    let (overall_attended, overall_total) = calc::overall_counts(pairs);
    Ok(json!({
        "studentId": student_id,
        "subjects": subjects,
        "overall": projection_json(overall_attended, overall_total),
    }))
}

fn attendance_history(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;

    let mut stmt = conn
        .prepare(
            "SELECT student_id, date, lecture_number, present
             FROM attendance_records
             WHERE class_id = ? AND subject_id = ?
             ORDER BY date, lecture_number",
        )
        .map_err(db_err)?;
    let records = stmt
        .query_map((&class_id, &subject_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut columns: Vec<Value> = Vec::new();
    let mut seen_columns: HashSet<String> = HashSet::new();
    let mut cell_map: HashMap<(String, String), bool> = HashMap::new();
    for (student_id, date, lecture, present) in &records {
        let column_id = format!("{}_L{}", date, lecture);
        if seen_columns.insert(column_id.clone()) {
            // DD/MM (Ln) labels, matching the on-screen history header.
            let day = date.get(8..10).unwrap_or(date);
            let month = date.get(5..7).unwrap_or(date);
            let label = format!("{}/{} (L{})", day, month, lecture);
            columns.push(json!({
                "id": column_id,
                "date": date,
                "lecture": lecture,
                "label": label,
            }));
        }
        cell_map.insert((student_id.clone(), column_id), *present);
    }

    let mut stmt = conn
        .prepare(
            "SELECT u.id, u.name, u.roll,
                    COALESCE(s.attended, 0), COALESCE(s.total, 0)
             FROM users u
             LEFT JOIN attendance_summaries s
               ON s.student_id = u.id AND s.subject_id = ?
             WHERE u.role = 'student' AND u.class_id = ?",
        )
        .map_err(db_err)?;
    let mut students = stmt
        .query_map((&subject_id, &class_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    students.sort_by_key(|(_, _, roll, _, _)| {
        roll.as_deref()
            .and_then(|r| r.trim().parse::<i64>().ok())
            .unwrap_or(i64::MAX)
    });

    let rows: Vec<Value> = students
        .into_iter()
        .map(|(id, name, roll, attended, total)| {
            let mut cells = serde_json::Map::new();
            for col in &columns {
                let column_id = col["id"].as_str().unwrap_or_default().to_string();
                if let Some(present) = cell_map.get(&(id.clone(), column_id.clone())) {
                    cells.insert(column_id, json!(present));
                }
            }
            let (a, t) = counts_u64(attended, total);
            json!({
                "studentId": id,
                "name": name,
                "roll": roll,
                "cells": cells,
                "attended": a,
                "total": t,
                "percent": calc::percentage(a, t),
            })
        })
        .collect();

    Ok(json!({ "columns": columns, "rows": rows }))
}

fn handle_mark_lecture(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_mark_lecture(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_submit_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_submit_batch(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_student_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_student_summary(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_history(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.markLecture" => Some(handle_mark_lecture(state, req)),
        "attendance.submitBatch" => Some(handle_submit_batch(state, req)),
        "attendance.studentSummary" => Some(handle_student_summary(state, req)),
        "attendance.history" => Some(handle_history(state, req)),
        _ => None,
    }
}
