use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    actor, db_commit, db_insert, db_query, db_tx, db_update, optional_str, required_str,
    timestamp, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::status::EnrollmentStatus;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::json;
use uuid::Uuid;

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let last_name = required_str(params, "lastName")?;
    let first_name = required_str(params, "firstName")?;
    let birth_date = optional_str(params, "birthDate")?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, last_name, first_name, birth_date) VALUES(?, ?, ?, ?)",
        (&student_id, &last_name, &first_name, &birth_date),
    )
    .map_err(|e| db_insert(e, "students"))?;
    Ok(json!({ "studentId": student_id }))
}

fn students_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, birth_date
             FROM students
             ORDER BY last_name, first_name",
        )
        .map_err(db_query)?;
    let students = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            let birth_date: Option<String> = row.get(3)?;
            Ok(json!({
                "id": id,
                "displayName": format!("{}, {}", last, first),
                "birthDate": birth_date
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "students": students }))
}

struct EnrollmentRow {
    student_id: String,
    class_group_id: String,
    status: EnrollmentStatus,
}

fn load_enrollment(conn: &Connection, enrollment_id: &str) -> Result<EnrollmentRow, HandlerErr> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT student_id, class_group_id, status FROM enrollments WHERE id = ?",
            [enrollment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_query)?;
    let Some((student_id, class_group_id, status)) = row else {
        return Err(HandlerErr::not_found("enrollment"));
    };
    let status = EnrollmentStatus::parse(&status)
        .ok_or_else(|| HandlerErr::new("db_query_failed", "bad status in enrollments"))?;
    Ok(EnrollmentRow {
        student_id,
        class_group_id,
        status,
    })
}

fn insert_movement(
    tx: &Transaction<'_>,
    enrollment_id: &str,
    kind: &str,
    from_class: Option<&str>,
    to_class: Option<&str>,
    moved_by: &str,
    moved_at: &str,
) -> Result<(), HandlerErr> {
    let movement_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO enrollment_movements(id, enrollment_id, kind, from_class_group_id, to_class_group_id, moved_by, moved_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &movement_id,
            enrollment_id,
            kind,
            from_class,
            to_class,
            moved_by,
            moved_at,
        ),
    )
    .map_err(|e| db_insert(e, "enrollment_movements"))?;
    Ok(())
}

/// Creates an enrollment, allocating `max(sequence)+1` for the
/// (school, year) pair. The transaction is IMMEDIATE so the read of the
/// current maximum happens under the write lock; two concurrent writers
/// cannot both observe the same maximum.
fn enrollments_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let school_id = required_str(params, "schoolId")?;
    let year_id = required_str(params, "yearId")?;
    let class_group_id = required_str(params, "classGroupId")?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;

    let student_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_query)?;
    if student_exists.is_none() {
        return Err(HandlerErr::not_found("student"));
    }
    let year_number: Option<i64> = conn
        .query_row(
            "SELECT year FROM academic_years WHERE id = ? AND school_id = ?",
            (&year_id, &school_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    let Some(year_number) = year_number else {
        return Err(HandlerErr::not_found("academic year"));
    };
    let class_matches: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM class_groups WHERE id = ? AND academic_year_id = ?",
            (&class_group_id, &year_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    if class_matches.is_none() {
        return Err(HandlerErr::not_found("class group"));
    }

    let tx =
        Transaction::new_unchecked(conn, TransactionBehavior::Immediate).map_err(db_tx)?;

    let sequence: i64 = tx
        .query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1
             FROM enrollments
             WHERE school_id = ? AND academic_year_id = ?",
            (&school_id, &year_id),
            |r| r.get(0),
        )
        .map_err(db_query)?;
    let enrollment_no = format!("{}{:05}", year_number, sequence);

    let enrollment_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO enrollments(id, student_id, school_id, academic_year_id, class_group_id,
            enrollment_no, sequence, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &enrollment_id,
            &student_id,
            &school_id,
            &year_id,
            &class_group_id,
            &enrollment_no,
            sequence,
            EnrollmentStatus::Active.as_str(),
            &at,
        ),
    )
    .map_err(|e| db_insert(e, "enrollments"))?;
    insert_movement(
        &tx,
        &enrollment_id,
        "enrollment",
        None,
        Some(&class_group_id),
        &actor_id,
        &at,
    )?;

    tx.commit().map_err(db_commit)?;

    Ok(json!({
        "enrollmentId": enrollment_id,
        "enrollmentNo": enrollment_no,
        "sequence": sequence,
        "status": EnrollmentStatus::Active.as_str()
    }))
}

fn enrollments_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_group_id = required_str(params, "classGroupId")?;
    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.student_id, s.last_name, s.first_name, e.enrollment_no, e.sequence, e.status
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.class_group_id = ?
             ORDER BY s.last_name, s.first_name",
        )
        .map_err(db_query)?;
    let enrollments = stmt
        .query_map([&class_group_id], |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let last: String = row.get(2)?;
            let first: String = row.get(3)?;
            let enrollment_no: String = row.get(4)?;
            let sequence: i64 = row.get(5)?;
            let status: String = row.get(6)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "displayName": format!("{}, {}", last, first),
                "enrollmentNo": enrollment_no,
                "sequence": sequence,
                "status": status
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "enrollments": enrollments }))
}

fn enrollments_reassign_class(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = required_str(params, "enrollmentId")?;
    let to_class_group_id = required_str(params, "toClassGroupId")?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;

    let enrollment = load_enrollment(conn, &enrollment_id)?;
    if enrollment.status != EnrollmentStatus::Active {
        return Err(HandlerErr::new(
            "invalid_transition",
            "only active enrollments can change class group",
        ));
    }
    if enrollment.class_group_id == to_class_group_id {
        return Err(HandlerErr::field(
            "toClassGroupId",
            "enrollment is already in that class group",
        ));
    }
    let same_year: Option<i64> = conn
        .query_row(
            "SELECT 1
             FROM class_groups a
             JOIN class_groups b ON a.academic_year_id = b.academic_year_id
             WHERE a.id = ? AND b.id = ?",
            (&enrollment.class_group_id, &to_class_group_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    if same_year.is_none() {
        return Err(HandlerErr::field(
            "toClassGroupId",
            "target class group must exist in the same academic year",
        ));
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute(
        "UPDATE enrollments SET class_group_id = ? WHERE id = ?",
        (&to_class_group_id, &enrollment_id),
    )
    .map_err(|e| db_update(e, "enrollments"))?;
    insert_movement(
        &tx,
        &enrollment_id,
        "class_reassignment",
        Some(&enrollment.class_group_id),
        Some(&to_class_group_id),
        &actor_id,
        &at,
    )?;
    tx.commit().map_err(db_commit)?;

    Ok(json!({
        "enrollmentId": enrollment_id,
        "classGroupId": to_class_group_id
    }))
}

fn enrollments_transfer(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = required_str(params, "enrollmentId")?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;
    let destination = optional_str(params, "destination")?;

    let enrollment = load_enrollment(conn, &enrollment_id)?;
    if enrollment.status != EnrollmentStatus::Active {
        return Err(HandlerErr::new(
            "invalid_transition",
            "only active enrollments can be transferred",
        ));
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute(
        "UPDATE enrollments SET status = ? WHERE id = ?",
        (EnrollmentStatus::Transferred.as_str(), &enrollment_id),
    )
    .map_err(|e| db_update(e, "enrollments"))?;
    insert_movement(
        &tx,
        &enrollment_id,
        "transfer",
        Some(&enrollment.class_group_id),
        None,
        &actor_id,
        &at,
    )?;
    db::audit_write(
        &tx,
        "enrollment",
        &enrollment_id,
        "transfer",
        &actor_id,
        &at,
        Some(&json!({ "status": "active" })),
        Some(&json!({ "status": "transferred", "destination": destination })),
    )
    .map_err(|e| db_update(e, "audit_log"))?;
    tx.commit().map_err(db_commit)?;

    Ok(json!({
        "enrollmentId": enrollment_id,
        "studentId": enrollment.student_id,
        "status": EnrollmentStatus::Transferred.as_str()
    }))
}

fn enrollments_movements(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = required_str(params, "enrollmentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT kind, from_class_group_id, to_class_group_id, moved_by, moved_at
             FROM enrollment_movements
             WHERE enrollment_id = ?
             ORDER BY moved_at",
        )
        .map_err(db_query)?;
    let movements = stmt
        .query_map([&enrollment_id], |row| {
            let kind: String = row.get(0)?;
            let from_class: Option<String> = row.get(1)?;
            let to_class: Option<String> = row.get(2)?;
            let moved_by: String = row.get(3)?;
            let moved_at: String = row.get(4)?;
            Ok(json!({
                "kind": kind,
                "fromClassGroupId": from_class,
                "toClassGroupId": to_class,
                "movedBy": moved_by,
                "movedAt": moved_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "movements": movements }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "students.create"
            | "students.list"
            | "enrollments.create"
            | "enrollments.list"
            | "enrollments.reassignClass"
            | "enrollments.transfer"
            | "enrollments.movements"
    );
    if !handled {
        return None;
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "students.create" => students_create(conn, &req.params),
        "students.list" => students_list(conn),
        "enrollments.create" => enrollments_create(conn, &req.params),
        "enrollments.list" => enrollments_list(conn, &req.params),
        "enrollments.reassignClass" => enrollments_reassign_class(conn, &req.params),
        "enrollments.transfer" => enrollments_transfer(conn, &req.params),
        "enrollments.movements" => enrollments_movements(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
