use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

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

#[derive(Debug, Clone, Copy, PartialEq)]
enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Some(Self::Student),
            "teacher" => Some(Self::Teacher),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
            Self::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone)]
struct UserRow {
    id: String,
    role: String,
    name: String,
    email: String,
    father: Option<String>,
    course: Option<String>,
    year: Option<String>,
    section: Option<String>,
    roll: Option<String>,
    class_id: Option<String>,
    subject_id: Option<String>,
    subject_name: Option<String>,
    class_ids: Option<String>,
    contact: Option<String>,
}

const USER_COLUMNS: &str = "id, role, name, email, father, course, year, section, roll, \
     class_id, subject_id, subject_name, class_ids, contact";

fn row_to_user(r: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: r.get(0)?,
        role: r.get(1)?,
        name: r.get(2)?,
        email: r.get(3)?,
        father: r.get(4)?,
        course: r.get(5)?,
        year: r.get(6)?,
        section: r.get(7)?,
        roll: r.get(8)?,
        class_id: r.get(9)?,
        subject_id: r.get(10)?,
        subject_name: r.get(11)?,
        class_ids: r.get(12)?,
        contact: r.get(13)?,
    })
}

fn class_ids_json(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

/// Numeric roll sorting; students with unparseable rolls go last.
fn roll_sort_key(roll: Option<&str>) -> i64 {
    roll.and_then(|r| r.trim().parse::<i64>().ok())
        .unwrap_or(i64::MAX)
}

fn user_json(user: &UserRow) -> Value {
    let mut out = json!({
        "uid": user.id,
        "role": user.role,
        "name": user.name,
        "email": user.email,
    });
    match Role::parse(&user.role) {
        Some(Role::Student) => {
            out["father"] = json!(user.father);
            out["course"] = json!(user.course);
            out["year"] = json!(user.year);
            out["section"] = json!(user.section);
            out["roll"] = json!(user.roll);
            out["classId"] = json!(user.class_id);
        }
        Some(Role::Teacher) => {
            out["subjectId"] = json!(user.subject_id);
            out["subjectName"] = json!(user.subject_name);
            out["classIds"] = json!(class_ids_json(user.class_ids.as_deref()));
            out["contact"] = json!(user.contact);
        }
        Some(Role::Admin) | None => {}
    }
    out
}

fn get_user(conn: &Connection, uid: &str) -> Result<Option<UserRow>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
        [uid],
        row_to_user,
    )
    .optional()
    .map_err(db_err)
}

fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
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

fn optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn subject_name_for(conn: &Connection, subject_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT name FROM subjects WHERE id = ?",
        [subject_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(db_err)
}

fn users_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let uid = required_str(params, "uid")?;
    let name = required_str(params, "name")?;
    let email = required_str(params, "email")?;
    let role_raw = required_str(params, "role")?;
    let Some(role) = Role::parse(&role_raw) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("unknown role: {}", role_raw),
            details: None,
        });
    };

    if get_user(conn, &uid)?.is_some() {
        return Err(HandlerErr {
            code: "duplicate_request",
            message: format!("a profile already exists for uid {}", uid),
            details: None,
        });
    }

    let mut user = UserRow {
        id: uid,
        role: role.as_str().to_string(),
        name,
        email,
        father: None,
        course: None,
        year: None,
        section: None,
        roll: None,
        class_id: None,
        subject_id: None,
        subject_name: None,
        class_ids: None,
        contact: None,
    };

    match role {
        Role::Student => {
            let course = required_str(params, "course")?;
            let year = required_str(params, "year")?;
            let section = required_str(params, "section")?;
            user.class_id = Some(format!("{}-{}-{}", course, year, section));
            user.course = Some(course);
            user.year = Some(year);
            user.section = Some(section);
            user.father = optional_str(params, "father");
            user.roll = optional_str(params, "roll");
        }
        Role::Teacher => {
            let subject_id = required_str(params, "subjectId")?;
            let Some(subject_name) = subject_name_for(conn, &subject_id)? else {
                return Err(HandlerErr {
                    code: "not_found",
                    message: format!("subject {} is not in the master list", subject_id),
                    details: None,
                });
            };
            user.subject_id = Some(subject_id);
            user.subject_name = Some(subject_name);
            let class_ids: Vec<String> = params
                .get("classIds")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            user.class_ids = Some(json!(class_ids).to_string());
            user.contact = optional_str(params, "contact");
        }
        Role::Admin => {}
    }

    conn.execute(
        &format!(
            "INSERT INTO users({}) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            USER_COLUMNS
        ),
        rusqlite::params![
            user.id,
            user.role,
            user.name,
            user.email,
            user.father,
            user.course,
            user.year,
            user.section,
            user.roll,
            user.class_id,
            user.subject_id,
            user.subject_name,
            user.class_ids,
            user.contact,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "users" })),
    })?;

    Ok(user_json(&user))
}

fn users_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let role_filter = optional_str(params, "role");
    if let Some(raw) = role_filter.as_deref() {
        if Role::parse(raw).is_none() {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("unknown role: {}", raw),
                details: None,
            });
        }
    }

    let mut stmt = conn
        .prepare(&format!("SELECT {} FROM users", USER_COLUMNS))
        .map_err(db_err)?;
    let mut users = stmt
        .query_map([], row_to_user)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    if let Some(role) = role_filter.as_deref().and_then(Role::parse) {
        users.retain(|u| Role::parse(&u.role) == Some(role));
    }
    for key in ["course", "year", "section"] {
        if let Some(wanted) = optional_str(params, key) {
            users.retain(|u| {
                let field = match key {
                    "course" => u.course.as_deref(),
                    "year" => u.year.as_deref(),
                    _ => u.section.as_deref(),
                };
                field == Some(wanted.as_str())
            });
        }
    }

    // Students are read in roll order, everyone else by name.
    users.sort_by(|a, b| {
        let a_student = Role::parse(&a.role) == Some(Role::Student);
        let b_student = Role::parse(&b.role) == Some(Role::Student);
        match (a_student, b_student) {
            (true, true) => roll_sort_key(a.roll.as_deref())
                .cmp(&roll_sort_key(b.roll.as_deref()))
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase())),
            (false, false) => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
        }
    });

    let rows: Vec<Value> = users.iter().map(user_json).collect();
    Ok(json!({ "users": rows }))
}

fn users_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let uid = required_str(params, "uid")?;
    let Some(mut user) = get_user(conn, &uid)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("no profile for uid {}", uid),
            details: None,
        });
    };
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing patch object".to_string(),
            details: None,
        });
    };

    for (key, value) in patch {
        let as_str = value.as_str().map(|s| s.trim().to_string());
        match key.as_str() {
            "name" => {
                user.name = as_str.filter(|s| !s.is_empty()).ok_or_else(|| HandlerErr {
                    code: "bad_params",
                    message: "name must not be empty".to_string(),
                    details: None,
                })?
            }
            "email" => {
                user.email = as_str.filter(|s| !s.is_empty()).ok_or_else(|| HandlerErr {
                    code: "bad_params",
                    message: "email must not be empty".to_string(),
                    details: None,
                })?
            }
            "father" => user.father = as_str,
            "course" => user.course = as_str,
            "year" => user.year = as_str,
            "section" => user.section = as_str,
            "roll" => user.roll = as_str,
            "contact" => user.contact = as_str,
            "subjectId" => {
                let subject_id = as_str.filter(|s| !s.is_empty()).ok_or_else(|| HandlerErr {
                    code: "bad_params",
                    message: "subjectId must not be empty".to_string(),
                    details: None,
                })?;
                let Some(subject_name) = subject_name_for(conn, &subject_id)? else {
                    return Err(HandlerErr {
                        code: "not_found",
                        message: format!("subject {} is not in the master list", subject_id),
                        details: None,
                    });
                };
                user.subject_id = Some(subject_id);
                user.subject_name = Some(subject_name);
            }
            "classIds" => {
                let ids: Vec<String> = value
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .ok_or_else(|| HandlerErr {
                        code: "bad_params",
                        message: "classIds must be an array".to_string(),
                        details: None,
                    })?;
                user.class_ids = Some(json!(ids).to_string());
            }
            "role" => {
                let raw = as_str.unwrap_or_default();
                let Some(role) = Role::parse(&raw) else {
                    return Err(HandlerErr {
                        code: "bad_params",
                        message: format!("unknown role: {}", raw),
                        details: None,
                    });
                };
                user.role = role.as_str().to_string();
            }
            other => {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("unknown patch field: {}", other),
                    details: None,
                })
            }
        }
    }

    // The composite class key is derived state; recompute after every patch.
    if Role::parse(&user.role) == Some(Role::Student) {
        user.class_id = match (&user.course, &user.year, &user.section) {
            (Some(c), Some(y), Some(s)) => Some(format!("{}-{}-{}", c, y, s)),
            _ => None,
        };
    }

    conn.execute(
        "UPDATE users SET role = ?, name = ?, email = ?, father = ?, course = ?, year = ?,
            section = ?, roll = ?, class_id = ?, subject_id = ?, subject_name = ?,
            class_ids = ?, contact = ?
         WHERE id = ?",
        rusqlite::params![
            user.role,
            user.name,
            user.email,
            user.father,
            user.course,
            user.year,
            user.section,
            user.roll,
            user.class_id,
            user.subject_id,
            user.subject_name,
            user.class_ids,
            user.contact,
            user.id,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "users" })),
    })?;

    Ok(user_json(&user))
}

fn users_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let uid = required_str(params, "uid")?;
    // Removes the profile row only; the auth record lives elsewhere.
    let changed = conn
        .execute("DELETE FROM users WHERE id = ?", [&uid])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "users" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: format!("no profile for uid {}", uid),
            details: None,
        });
    }
    Ok(json!({ "ok": true }))
}

/// Login handshake. An authenticated uid without a readable profile must not
/// reach a dashboard; the caller is told to sign the session out.
fn profile_open(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let uid = required_str(params, "uid")?;
    let Some(user) = get_user(conn, &uid)? else {
        return Err(HandlerErr {
            code: "integrity_error",
            message: format!("no profile document for authenticated uid {}", uid),
            details: Some(json!({ "forceSignOut": true })),
        });
    };
    if Role::parse(&user.role).is_none() {
        return Err(HandlerErr {
            code: "integrity_error",
            message: format!("unrecognized role tag: {}", user.role),
            details: Some(json!({ "forceSignOut": true })),
        });
    }
    Ok(json!({ "profile": user_json(&user) }))
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match users_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match users_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match users_update(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match users_delete(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_profile_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match profile_open(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        "profile.open" => Some(handle_profile_open(state, req)),
        _ => None,
    }
}
