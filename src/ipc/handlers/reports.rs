use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashMap;

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

struct SubjectColumn {
    id: String,
    name: String,
    // Lectures held for this subject, taken as the largest total seen in the
    // class (students enrolled late can have fewer).
    lectures_held: u64,
}

struct OverviewRow {
    student_id: String,
    roll: Option<String>,
    name: String,
    father: Option<String>,
    cells: HashMap<String, (u64, u64)>,
    overall_attended: u64,
    overall_total: u64,
}

/// Pivot the per-student summaries of one class into a students x subjects
/// matrix. Columns are derived from the data: a subject appears iff at least
/// one student in the class has a summary row for it. Students missing a
/// subject render 0/0 there, never as a dropped row.
fn build_overview(
    conn: &Connection,
    class_id: &str,
) -> Result<(Vec<SubjectColumn>, Vec<OverviewRow>), HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, father, roll FROM users
             WHERE role = 'student' AND class_id = ?",
        )
        .map_err(db_err)?;
    let mut students = stmt
        .query_map([class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    students.sort_by_key(|(_, _, _, roll)| {
        roll.as_deref()
            .and_then(|r| r.trim().parse::<i64>().ok())
            .unwrap_or(i64::MAX)
    });

    let mut stmt = conn
        .prepare(
            "SELECT s.student_id, s.subject_id,
                    COALESCE(s.subject_name, subj.name, s.subject_id) AS display_name,
                    s.attended, s.total
             FROM attendance_summaries s
             LEFT JOIN subjects subj ON subj.id = s.subject_id
             WHERE s.student_id IN
               (SELECT id FROM users WHERE role = 'student' AND class_id = ?)",
        )
        .map_err(db_err)?;
    let summaries = stmt
        .query_map([class_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut columns: Vec<SubjectColumn> = Vec::new();
    let mut by_student: HashMap<String, HashMap<String, (u64, u64)>> = HashMap::new();
    for (student_id, subject_id, display_name, attended, total) in summaries {
        let attended = attended.max(0) as u64;
        let total = total.max(0) as u64;
        match columns.iter_mut().find(|c| c.id == subject_id) {
            Some(col) => col.lectures_held = col.lectures_held.max(total),
            None => columns.push(SubjectColumn {
                id: subject_id.clone(),
                name: display_name,
                lectures_held: total,
            }),
        }
        by_student
            .entry(student_id)
            .or_default()
            .insert(subject_id, (attended, total));
    }
    columns.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    let rows = students
        .into_iter()
        .map(|(student_id, name, father, roll)| {
            let cells = by_student.remove(&student_id).unwrap_or_default();
            let (overall_attended, overall_total) =
                calc::overall_counts(cells.values().copied());
            OverviewRow {
                student_id,
                roll,
                name,
                father,
                cells,
                overall_attended,
                overall_total,
            }
        })
        .collect();

    Ok((columns, rows))
}

fn class_id_from_params(params: &Value) -> Result<String, HandlerErr> {
    let course = get_required_str(params, "course")?;
    let year = get_required_str(params, "year")?;
    let section = get_required_str(params, "section")?;
    Ok(format!("{}-{}-{}", course, year, section))
}

fn reports_class_overview(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = class_id_from_params(params)?;
    let (columns, rows) = build_overview(conn, &class_id)?;

    let subjects_json: Vec<Value> = columns
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "name": c.name,
                "lecturesHeld": c.lectures_held,
            })
        })
        .collect();
    let rows_json: Vec<Value> = rows
        .iter()
        .map(|row| {
            let mut cells = serde_json::Map::new();
            for col in &columns {
                let (attended, total) = row.cells.get(&col.id).copied().unwrap_or((0, 0));
                cells.insert(
                    col.id.clone(),
                    json!({ "attended": attended, "total": total }),
                );
            }
            json!({
                "studentId": row.student_id,
                "roll": row.roll,
                "name": row.name,
                "father": row.father,
                "cells": cells,
                "overallAttended": row.overall_attended,
                "overallTotal": row.overall_total,
                "overallPercent": calc::percentage(row.overall_attended, row.overall_total),
            })
        })
        .collect();

    Ok(json!({
        "classId": class_id,
        "subjects": subjects_json,
        "rows": rows_json,
    }))
}

fn reports_export_class_csv(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = class_id_from_params(params)?;
    let out_path = get_required_str(params, "outPath")?;
    let (columns, rows) = build_overview(conn, &class_id)?;

    let mut writer = csv::Writer::from_path(&out_path).map_err(|e| HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: Some(json!({ "outPath": out_path })),
    })?;

    let mut header: Vec<String> = vec!["Roll".into(), "Name".into(), "Father".into()];
    for col in &columns {
        header.push(format!("{} (Total: {})", col.name, col.lectures_held));
    }
    header.push("Overall Attended".into());
    header.push("Overall Total".into());
    header.push("Overall %".into());

    let write_err = |e: csv::Error| HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: None,
    };
    writer.write_record(&header).map_err(write_err)?;
    for row in &rows {
        let mut record: Vec<String> = vec![
            row.roll.clone().unwrap_or_default(),
            row.name.clone(),
            row.father.clone().unwrap_or_default(),
        ];
        for col in &columns {
            let (attended, _) = row.cells.get(&col.id).copied().unwrap_or((0, 0));
            record.push(attended.to_string());
        }
        record.push(row.overall_attended.to_string());
        record.push(row.overall_total.to_string());
        record.push(
            calc::percentage(row.overall_attended, row.overall_total)
                .map(|p| format!("{:.1}", p))
                .unwrap_or_else(|| "N/A".to_string()),
        );
        writer.write_record(&record).map_err(write_err)?;
    }
    writer.flush().map_err(|e| HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "outPath": out_path,
        "rows": rows.len(),
        "subjects": columns.len(),
    }))
}

fn handle_class_overview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match reports_class_overview(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_export_class_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match reports_export_class_csv(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.classOverview" => Some(handle_class_overview(state, req)),
        "reports.exportClassCsv" => Some(handle_export_class_csv(state, req)),
        _ => None,
    }
}
