use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("presencia.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Several daemon instances may share one workspace file.
    conn.busy_timeout(Duration::from_millis(2000))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            father TEXT,
            course TEXT,
            year TEXT,
            section TEXT,
            roll TEXT,
            class_id TEXT,
            subject_id TEXT,
            subject_name TEXT,
            class_ids TEXT,
            contact TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_class ON users(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // One row per (date, subject, student, lecture slot). The primary key is
    // the identity tuple; re-marking the same slot cannot create a second row.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            date TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            lecture_number INTEGER NOT NULL,
            class_id TEXT NOT NULL,
            present INTEGER NOT NULL,
            marked_by TEXT NOT NULL,
            notes TEXT,
            PRIMARY KEY(date, subject_id, student_id, lecture_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_class_subject
         ON attendance_records(class_id, subject_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student
         ON attendance_records(student_id, subject_id)",
        [],
    )?;

    // Materialized aggregate over attendance_records. Writers must keep it
    // consistent with commutative increments, never counter overwrites.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_summaries(
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            subject_name TEXT,
            class_id TEXT,
            attended INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(student_id, subject_id),
            CHECK(attended >= 0 AND attended <= total)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_summaries_class
         ON attendance_summaries(class_id, subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS corrections(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            roll TEXT,
            name TEXT,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            subject_name TEXT,
            date TEXT NOT NULL,
            lecture_number INTEGER NOT NULL DEFAULT 1,
            reason TEXT NOT NULL,
            notes TEXT,
            proof TEXT,
            status TEXT NOT NULL DEFAULT 'Pending'
                CHECK(status IN ('Pending','Approved','Rejected')),
            submitted_at TEXT NOT NULL,
            status_updated_at TEXT
        )",
        [],
    )?;
    ensure_corrections_status_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_corrections_student ON corrections(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_corrections_scope
         ON corrections(subject_id, class_id, status)",
        [],
    )?;
    // A disputed lecture carries at most one open dispute.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_corrections_one_pending
         ON corrections(student_id, subject_id, date, lecture_number)
         WHERE status = 'Pending'",
        [],
    )?;

    Ok(conn)
}

fn ensure_corrections_status_updated_at(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces stored only submitted_at; the visibility window falls
    // back to it, so a NULL column is enough for old rows.
    if table_has_column(conn, "corrections", "status_updated_at")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE corrections ADD COLUMN status_updated_at TEXT",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    use rusqlite::OptionalExtension;
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, value.to_string()),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
