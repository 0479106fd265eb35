use crate::completeness::{self, ClosingKeys};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    actor, db_insert, db_query, db_update, optional_str, required_str, timestamp, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::status::{ClosingStatus, RectificationStatus};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct ClosingRow {
    class_group_id: String,
    teacher_assignment_id: String,
    assessment_period_id: String,
    status: ClosingStatus,
}

fn load_closing(conn: &Connection, closing_id: &str) -> Result<ClosingRow, HandlerErr> {
    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT class_group_id, teacher_assignment_id, assessment_period_id, status
             FROM period_closings
             WHERE id = ?",
            [closing_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_query)?;
    let Some((class_group_id, teacher_assignment_id, assessment_period_id, status)) = row else {
        return Err(HandlerErr::not_found("period closing"));
    };
    let status = ClosingStatus::parse(&status)
        .ok_or_else(|| HandlerErr::new("db_query_failed", "bad status in period_closings"))?;
    Ok(ClosingRow {
        class_group_id,
        teacher_assignment_id,
        assessment_period_id,
        status,
    })
}

fn guard_transition(current: ClosingStatus, target: ClosingStatus) -> Result<(), HandlerErr> {
    if !current.can_transition_to(target) {
        return Err(HandlerErr {
            code: "invalid_transition",
            message: format!(
                "transition from {} to {} is not allowed",
                current.label(),
                target.label()
            ),
            details: Some(json!({ "from": current.as_str(), "to": target.as_str() })),
        });
    }
    Ok(())
}

fn closings_open(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_group_id = required_str(params, "classGroupId")?;
    let teacher_assignment_id = required_str(params, "teacherAssignmentId")?;
    let period_id = required_str(params, "periodId")?;

    let assignment_matches: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM teacher_assignments WHERE id = ? AND class_group_id = ?",
            (&teacher_assignment_id, &class_group_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    if assignment_matches.is_none() {
        return Err(HandlerErr::not_found("teacher assignment"));
    }
    let period_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM assessment_periods WHERE id = ?",
            [&period_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    if period_exists.is_none() {
        return Err(HandlerErr::not_found("assessment period"));
    }

    let closing_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO period_closings(id, class_group_id, teacher_assignment_id, assessment_period_id, status)
         VALUES(?, ?, ?, ?, ?)",
        (
            &closing_id,
            &class_group_id,
            &teacher_assignment_id,
            &period_id,
            ClosingStatus::Pending.as_str(),
        ),
    )
    .map_err(|e| db_insert(e, "period_closings"))?;

    Ok(json!({
        "closingId": closing_id,
        "status": ClosingStatus::Pending.as_str(),
        "statusLabel": ClosingStatus::Pending.label()
    }))
}

fn closings_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let closing_id = required_str(params, "closingId")?;
    let row: Option<(
        String,
        String,
        String,
        String,
        i64,
        i64,
        i64,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    )> = conn
        .query_row(
            "SELECT class_group_id, teacher_assignment_id, assessment_period_id, status,
                    grades_complete, attendance_complete, lesson_records_complete,
                    submitted_by, submitted_at, validated_by, validated_at,
                    approved_by, approved_at, rejection_reason
             FROM period_closings
             WHERE id = ?",
            [&closing_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                    r.get(11)?,
                    r.get(12)?,
                    r.get(13)?,
                ))
            },
        )
        .optional()
        .map_err(db_query)?;

    let Some((
        class_group_id,
        teacher_assignment_id,
        period_id,
        status,
        grades_complete,
        attendance_complete,
        lesson_records_complete,
        submitted_by,
        submitted_at,
        validated_by,
        validated_at,
        approved_by,
        approved_at,
        rejection_reason,
    )) = row
    else {
        return Err(HandlerErr::not_found("period closing"));
    };
    let label = ClosingStatus::parse(&status).map(|s| s.label()).unwrap_or("");

    Ok(json!({
        "id": closing_id,
        "classGroupId": class_group_id,
        "teacherAssignmentId": teacher_assignment_id,
        "periodId": period_id,
        "status": status,
        "statusLabel": label,
        "gradesComplete": grades_complete != 0,
        "attendanceComplete": attendance_complete != 0,
        "lessonRecordsComplete": lesson_records_complete != 0,
        "submittedBy": submitted_by,
        "submittedAt": submitted_at,
        "validatedBy": validated_by,
        "validatedAt": validated_at,
        "approvedBy": approved_by,
        "approvedAt": approved_at,
        "rejectionReason": rejection_reason
    }))
}

fn closings_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let period_id = required_str(params, "periodId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, class_group_id, teacher_assignment_id, status
             FROM period_closings
             WHERE assessment_period_id = ?
             ORDER BY class_group_id, teacher_assignment_id",
        )
        .map_err(db_query)?;
    let closings = stmt
        .query_map([&period_id], |row| {
            let id: String = row.get(0)?;
            let class_group_id: String = row.get(1)?;
            let teacher_assignment_id: String = row.get(2)?;
            let status: String = row.get(3)?;
            Ok(json!({
                "id": id,
                "classGroupId": class_group_id,
                "teacherAssignmentId": teacher_assignment_id,
                "status": status
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "closings": closings }))
}

/// Submit evaluates all three completeness specifications, persists their
/// results on the closing row, and only moves Pending -> InValidation when
/// every one of them holds.
fn closings_submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let closing_id = required_str(params, "closingId")?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;

    let closing = load_closing(conn, &closing_id)?;
    guard_transition(closing.status, ClosingStatus::InValidation)?;

    let period: Option<(String, String)> = conn
        .query_row(
            "SELECT start_date, end_date FROM assessment_periods WHERE id = ?",
            [&closing.assessment_period_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_query)?;
    let Some((start_date, end_date)) = period else {
        return Err(HandlerErr::not_found("assessment period"));
    };

    // Config resolution mirrors the average calculation; a class group
    // without a config simply has no expected instrument grid.
    let config_id: Option<String> = conn
        .query_row(
            "SELECT ac.id
             FROM assessment_configs ac
             JOIN class_groups cg
               ON cg.school_id = ac.school_id
              AND cg.academic_year_id = ac.academic_year_id
              AND cg.grade_level = ac.grade_level
             WHERE cg.id = ?",
            [&closing.class_group_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;

    let report = match &config_id {
        Some(config_id) => completeness::evaluate(
            conn,
            &ClosingKeys {
                class_group_id: &closing.class_group_id,
                teacher_assignment_id: &closing.teacher_assignment_id,
                assessment_period_id: &closing.assessment_period_id,
                assessment_config_id: config_id,
            },
            &start_date,
            &end_date,
        )?,
        None => completeness::CompletenessReport {
            grades_complete: true,
            attendance_complete: completeness::attendance_complete(
                conn,
                &closing.class_group_id,
                &closing.teacher_assignment_id,
                &start_date,
                &end_date,
            )?,
            lesson_records_complete: completeness::lesson_records_complete(
                conn,
                &closing.class_group_id,
                &closing.teacher_assignment_id,
                &start_date,
                &end_date,
            )?,
        },
    };

    // The evaluation result is persisted whether or not submission goes
    // through, so a stalled closing shows which areas are holding it back.
    conn.execute(
        "UPDATE period_closings
         SET grades_complete = ?, attendance_complete = ?, lesson_records_complete = ?
         WHERE id = ?",
        (
            report.grades_complete as i64,
            report.attendance_complete as i64,
            report.lesson_records_complete as i64,
            &closing_id,
        ),
    )
    .map_err(|e| db_update(e, "period_closings"))?;

    if !report.is_satisfied() {
        let missing = report.missing_areas();
        return Err(HandlerErr {
            code: "incomplete",
            message: format!("period closing is incomplete: {}", missing.join(", ")),
            details: Some(json!({ "missing": missing })),
        });
    }

    conn.execute(
        "UPDATE period_closings
         SET status = ?, submitted_by = ?, submitted_at = ?, rejection_reason = NULL
         WHERE id = ?",
        (
            ClosingStatus::InValidation.as_str(),
            &actor_id,
            &at,
            &closing_id,
        ),
    )
    .map_err(|e| db_update(e, "period_closings"))?;
    db::audit_write(
        conn,
        "period_closing",
        &closing_id,
        "submit",
        &actor_id,
        &at,
        Some(&json!({ "status": closing.status.as_str() })),
        Some(&json!({ "status": ClosingStatus::InValidation.as_str() })),
    )
    .map_err(|e| db_update(e, "audit_log"))?;

    Ok(json!({
        "closingId": closing_id,
        "status": ClosingStatus::InValidation.as_str(),
        "statusLabel": ClosingStatus::InValidation.label(),
        "gradesComplete": report.grades_complete,
        "attendanceComplete": report.attendance_complete,
        "lessonRecordsComplete": report.lesson_records_complete
    }))
}

fn closings_reject(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let closing_id = required_str(params, "closingId")?;
    let actor_id = actor(params)?;
    let reason = required_str(params, "reason")?;
    let at = timestamp(params)?;

    let closing = load_closing(conn, &closing_id)?;
    guard_transition(closing.status, ClosingStatus::Pending)?;

    conn.execute(
        "UPDATE period_closings SET status = ?, rejection_reason = ? WHERE id = ?",
        (ClosingStatus::Pending.as_str(), &reason, &closing_id),
    )
    .map_err(|e| db_update(e, "period_closings"))?;
    db::audit_write(
        conn,
        "period_closing",
        &closing_id,
        "reject",
        &actor_id,
        &at,
        Some(&json!({ "status": closing.status.as_str() })),
        Some(&json!({ "status": "pending", "rejectionReason": reason })),
    )
    .map_err(|e| db_update(e, "audit_log"))?;

    Ok(json!({
        "closingId": closing_id,
        "status": ClosingStatus::Pending.as_str(),
        "rejectionReason": reason
    }))
}

fn closings_validate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let closing_id = required_str(params, "closingId")?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;

    let closing = load_closing(conn, &closing_id)?;
    guard_transition(closing.status, ClosingStatus::Approved)?;

    conn.execute(
        "UPDATE period_closings
         SET status = ?, validated_by = ?, validated_at = ?
         WHERE id = ?",
        (
            ClosingStatus::Approved.as_str(),
            &actor_id,
            &at,
            &closing_id,
        ),
    )
    .map_err(|e| db_update(e, "period_closings"))?;
    db::audit_write(
        conn,
        "period_closing",
        &closing_id,
        "validate",
        &actor_id,
        &at,
        Some(&json!({ "status": closing.status.as_str() })),
        Some(&json!({ "status": ClosingStatus::Approved.as_str() })),
    )
    .map_err(|e| db_update(e, "audit_log"))?;

    Ok(json!({
        "closingId": closing_id,
        "status": ClosingStatus::Approved.as_str(),
        "statusLabel": ClosingStatus::Approved.label()
    }))
}

fn closings_finalize(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let closing_id = required_str(params, "closingId")?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;

    let closing = load_closing(conn, &closing_id)?;
    guard_transition(closing.status, ClosingStatus::Closed)?;

    conn.execute(
        "UPDATE period_closings
         SET status = ?, approved_by = ?, approved_at = ?
         WHERE id = ?",
        (ClosingStatus::Closed.as_str(), &actor_id, &at, &closing_id),
    )
    .map_err(|e| db_update(e, "period_closings"))?;
    db::audit_write(
        conn,
        "period_closing",
        &closing_id,
        "finalize",
        &actor_id,
        &at,
        Some(&json!({ "status": closing.status.as_str() })),
        Some(&json!({ "status": ClosingStatus::Closed.as_str() })),
    )
    .map_err(|e| db_update(e, "audit_log"))?;

    Ok(json!({
        "closingId": closing_id,
        "status": ClosingStatus::Closed.as_str(),
        "statusLabel": ClosingStatus::Closed.label()
    }))
}

fn rectifications_request(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let closing_id = required_str(params, "closingId")?;
    let entity = required_str(params, "entity")?;
    let entity_id = required_str(params, "entityId")?;
    let field = required_str(params, "field")?;
    let old_value = optional_str(params, "oldValue")?;
    let new_value = required_str(params, "newValue")?;
    let reason = required_str(params, "reason")?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;

    let closing = load_closing(conn, &closing_id)?;
    if closing.status != ClosingStatus::Closed {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "rectifications target a closed period closing".to_string(),
            details: Some(json!({ "status": closing.status.as_str() })),
        });
    }

    let rectification_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO rectifications(id, period_closing_id, entity, entity_id, field,
            old_value, new_value, reason, status, requested_by, requested_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &rectification_id,
            &closing_id,
            &entity,
            &entity_id,
            &field,
            &old_value,
            &new_value,
            &reason,
            RectificationStatus::Requested.as_str(),
            &actor_id,
            &at,
        ),
    )
    .map_err(|e| db_insert(e, "rectifications"))?;

    Ok(json!({
        "rectificationId": rectification_id,
        "status": RectificationStatus::Requested.as_str()
    }))
}

fn rectifications_decide(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let rectification_id = required_str(params, "rectificationId")?;
    let approve = params
        .get("approve")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::field("approve", "missing approve"))?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;

    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM rectifications WHERE id = ?",
            [&rectification_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    let Some(status) = status else {
        return Err(HandlerErr::not_found("rectification"));
    };
    let current = RectificationStatus::parse(&status)
        .ok_or_else(|| HandlerErr::new("db_query_failed", "bad status in rectifications"))?;
    if current.is_decided() {
        return Err(HandlerErr::new(
            "invalid_transition",
            "rectification is already decided",
        ));
    }

    let target = if approve {
        RectificationStatus::Approved
    } else {
        RectificationStatus::Rejected
    };
    conn.execute(
        "UPDATE rectifications
         SET status = ?, decided_by = ?, decided_at = ?
         WHERE id = ?",
        (target.as_str(), &actor_id, &at, &rectification_id),
    )
    .map_err(|e| db_update(e, "rectifications"))?;
    db::audit_write(
        conn,
        "rectification",
        &rectification_id,
        "decide",
        &actor_id,
        &at,
        Some(&json!({ "status": current.as_str() })),
        Some(&json!({ "status": target.as_str() })),
    )
    .map_err(|e| db_update(e, "audit_log"))?;

    Ok(json!({
        "rectificationId": rectification_id,
        "status": target.as_str()
    }))
}

fn rectifications_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let closing_id = required_str(params, "closingId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, entity, entity_id, field, old_value, new_value, reason, status,
                    requested_by, requested_at, decided_by, decided_at
             FROM rectifications
             WHERE period_closing_id = ?
             ORDER BY requested_at",
        )
        .map_err(db_query)?;
    let rectifications = stmt
        .query_map([&closing_id], |row| {
            let id: String = row.get(0)?;
            let entity: String = row.get(1)?;
            let entity_id: String = row.get(2)?;
            let field: String = row.get(3)?;
            let old_value: Option<String> = row.get(4)?;
            let new_value: String = row.get(5)?;
            let reason: String = row.get(6)?;
            let status: String = row.get(7)?;
            let requested_by: String = row.get(8)?;
            let requested_at: String = row.get(9)?;
            let decided_by: Option<String> = row.get(10)?;
            let decided_at: Option<String> = row.get(11)?;
            Ok(json!({
                "id": id,
                "entity": entity,
                "entityId": entity_id,
                "field": field,
                "oldValue": old_value,
                "newValue": new_value,
                "reason": reason,
                "status": status,
                "requestedBy": requested_by,
                "requestedAt": requested_at,
                "decidedBy": decided_by,
                "decidedAt": decided_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "rectifications": rectifications }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "closings.open"
            | "closings.get"
            | "closings.list"
            | "closings.submit"
            | "closings.reject"
            | "closings.validate"
            | "closings.finalize"
            | "rectifications.request"
            | "rectifications.decide"
            | "rectifications.list"
    );
    if !handled {
        return None;
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "closings.open" => closings_open(conn, &req.params),
        "closings.get" => closings_get(conn, &req.params),
        "closings.list" => closings_list(conn, &req.params),
        "closings.submit" => closings_submit(conn, &req.params),
        "closings.reject" => closings_reject(conn, &req.params),
        "closings.validate" => closings_validate(conn, &req.params),
        "closings.finalize" => closings_finalize(conn, &req.params),
        "rectifications.request" => rectifications_request(conn, &req.params),
        "rectifications.decide" => rectifications_decide(conn, &req.params),
        "rectifications.list" => rectifications_list(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
