use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

const CONFIG_KEY: &str = "config.appData";

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

fn default_config() -> Value {
    json!({
        "courses": [],
        "years": [],
        "sections": []
    })
}

fn string_array(params: &Value, key: &str) -> Result<Option<Vec<String>>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    let Some(items) = v.as_array() else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("{} must be an array of strings", key),
            details: None,
        });
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(s) = item.as_str() else {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("{} must be an array of strings", key),
                details: None,
            });
        };
        let t = s.trim();
        if t.is_empty() {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("{} entries must not be empty", key),
                details: None,
            });
        }
        out.push(t.to_string());
    }
    Ok(Some(out))
}

fn config_get(conn: &Connection) -> Result<Value, HandlerErr> {
    let stored = db::settings_get_json(conn, CONFIG_KEY).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let mut config = default_config();
    if let Some(Value::Object(map)) = stored {
        for key in ["courses", "years", "sections"] {
            if let Some(v) = map.get(key) {
                if v.is_array() {
                    config[key] = v.clone();
                }
            }
        }
    }
    Ok(config)
}

fn config_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mut config = config_get(conn)?;
    for key in ["courses", "years", "sections"] {
        if let Some(values) = string_array(params, key)? {
            config[key] = json!(values);
        }
    }
    db::settings_set_json(conn, CONFIG_KEY, &config).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "settings" })),
    })?;
    Ok(config)
}

fn subjects_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM subjects ORDER BY name")
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(json!({ "subjects": rows }))
}

fn subjects_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = params
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing id".to_string(),
            details: None,
        })?;
    let name = params
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing name".to_string(),
            details: None,
        })?;

    let exists = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if exists {
        return Err(HandlerErr {
            code: "duplicate_request",
            message: format!("subject {} already exists", id),
            details: None,
        });
    }

    conn.execute("INSERT INTO subjects(id, name) VALUES(?, ?)", (&id, &name))
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "subjects" })),
        })?;
    Ok(json!({ "subjectId": id, "name": name }))
}

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match config_get(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_config_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match config_update(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match subjects_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match subjects_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "config.get" => Some(handle_config_get(state, req)),
        "config.update" => Some(handle_config_update(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        _ => None,
    }
}
