use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_insert, db_query, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn school_exists(conn: &Connection, school_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM schools WHERE id = ?", [school_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_query)
}

pub fn class_group_exists(conn: &Connection, class_group_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM class_groups WHERE id = ?",
        [class_group_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(db_query)
}

fn schools_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let school_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schools(id, name) VALUES(?, ?)",
        (&school_id, &name),
    )
    .map_err(|e| db_insert(e, "schools"))?;
    Ok(json!({ "schoolId": school_id, "name": name }))
}

fn schools_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT
               s.id,
               s.name,
               (SELECT COUNT(*) FROM academic_years y WHERE y.school_id = s.id) AS year_count,
               (SELECT COUNT(*) FROM class_groups cg WHERE cg.school_id = s.id) AS class_group_count
             FROM schools s
             ORDER BY s.name",
        )
        .map_err(db_query)?;
    let schools = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let year_count: i64 = row.get(2)?;
            let class_group_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "yearCount": year_count,
                "classGroupCount": class_group_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "schools": schools }))
}

fn class_groups_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = required_str(params, "schoolId")?;
    let year_id = required_str(params, "yearId")?;
    let name = required_str(params, "name")?;
    let grade_level = required_str(params, "gradeLevel")?;

    if !school_exists(conn, &school_id)? {
        return Err(HandlerErr::not_found("school"));
    }
    let year_matches: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM academic_years WHERE id = ? AND school_id = ?",
            (&year_id, &school_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    if year_matches.is_none() {
        return Err(HandlerErr::not_found("academic year"));
    }

    let class_group_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO class_groups(id, school_id, academic_year_id, name, grade_level)
         VALUES(?, ?, ?, ?, ?)",
        (&class_group_id, &school_id, &year_id, &name, &grade_level),
    )
    .map_err(|e| db_insert(e, "class_groups"))?;
    Ok(json!({ "classGroupId": class_group_id, "name": name }))
}

fn class_groups_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let year_id = required_str(params, "yearId")?;
    let mut stmt = conn
        .prepare(
            "SELECT
               cg.id,
               cg.name,
               cg.grade_level,
               (SELECT COUNT(*) FROM enrollments e
                 WHERE e.class_group_id = cg.id AND e.status = 'active') AS active_students
             FROM class_groups cg
             WHERE cg.academic_year_id = ?
             ORDER BY cg.name",
        )
        .map_err(db_query)?;
    let groups = stmt
        .query_map([&year_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let grade_level: String = row.get(2)?;
            let active_students: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "gradeLevel": grade_level,
                "activeStudents": active_students
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "classGroups": groups }))
}

fn teacher_assignments_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_group_id = required_str(params, "classGroupId")?;
    let teacher_name = required_str(params, "teacherName")?;
    let subject = required_str(params, "subject")?;

    if !class_group_exists(conn, &class_group_id)? {
        return Err(HandlerErr::not_found("class group"));
    }

    let assignment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teacher_assignments(id, class_group_id, teacher_name, subject)
         VALUES(?, ?, ?, ?)",
        (&assignment_id, &class_group_id, &teacher_name, &subject),
    )
    .map_err(|e| db_insert(e, "teacher_assignments"))?;
    Ok(json!({ "teacherAssignmentId": assignment_id }))
}

fn teacher_assignments_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_group_id = required_str(params, "classGroupId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, teacher_name, subject
             FROM teacher_assignments
             WHERE class_group_id = ?
             ORDER BY subject, teacher_name",
        )
        .map_err(db_query)?;
    let assignments = stmt
        .query_map([&class_group_id], |row| {
            let id: String = row.get(0)?;
            let teacher_name: String = row.get(1)?;
            let subject: String = row.get(2)?;
            Ok(json!({
                "id": id,
                "teacherName": teacher_name,
                "subject": subject
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "teacherAssignments": assignments }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "schools.create"
            | "schools.list"
            | "classGroups.create"
            | "classGroups.list"
            | "teacherAssignments.create"
            | "teacherAssignments.list"
    );
    if !handled {
        return None;
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "schools.create" => schools_create(conn, &req.params),
        "schools.list" => schools_list(conn),
        "classGroups.create" => class_groups_create(conn, &req.params),
        "classGroups.list" => class_groups_list(conn, &req.params),
        "teacherAssignments.create" => teacher_assignments_create(conn, &req.params),
        "teacherAssignments.list" => teacher_assignments_list(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
