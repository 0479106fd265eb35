use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn handle_lessons_create(conn: &Connection, req: &Request) -> serde_json::Value {
    let class_group_id = match required_str(req, "classGroupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_assignment_id = match required_str(req, "teacherAssignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date = match required_str(req, "date") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let content = match required_str(req, "content") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let created_at = optional_str(req, "at").unwrap_or_else(|| chrono::Utc::now().to_rfc3339());

    let lesson_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO lesson_records(id, class_group_id, teacher_assignment_id, date, content, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &lesson_id,
            &class_group_id,
            &teacher_assignment_id,
            &date,
            &content,
            &created_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "lesson_records" })),
        );
    }

    ok(&req.id, json!({ "lessonId": lesson_id }))
}

fn handle_lessons_list(conn: &Connection, req: &Request) -> serde_json::Value {
    let class_group_id = match required_str(req, "classGroupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_assignment_id = match required_str(req, "teacherAssignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_date = optional_str(req, "startDate").unwrap_or_else(|| "0000-01-01".to_string());
    let end_date = optional_str(req, "endDate").unwrap_or_else(|| "9999-12-31".to_string());

    let mut stmt = match conn.prepare(
        "SELECT id, date, content
         FROM lesson_records
         WHERE class_group_id = ? AND teacher_assignment_id = ?
           AND date BETWEEN ? AND ?
         ORDER BY date",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(
            (&class_group_id, &teacher_assignment_id, &start_date, &end_date),
            |row| {
                let id: String = row.get(0)?;
                let date: String = row.get(1)?;
                let content: String = row.get(2)?;
                Ok(json!({ "id": id, "date": date, "content": content }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(lessons) => ok(&req.id, json!({ "lessons": lessons })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(req.method.as_str(), "lessons.create" | "lessons.list");
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    match req.method.as_str() {
        "lessons.create" => Some(handle_lessons_create(conn, req)),
        "lessons.list" => Some(handle_lessons_list(conn, req)),
        _ => None,
    }
}
