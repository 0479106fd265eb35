use crate::calc::{
    frequency_summary, leading_absent_run, AttendanceAlert, ALERT_CONSECUTIVE_ABSENCES,
    ALERT_MONTHLY_ABSENCES, CONSECUTIVE_SCAN_WINDOW,
};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    actor, db_commit, db_insert, db_query, db_tx, db_update, optional_date, optional_str,
    required_date, required_f64, required_i64, required_str, timestamp, today, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::status::AttendanceStatus;
use chrono::Datelike;
use rusqlite::{types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn attendance_configs_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = required_str(params, "schoolId")?;
    let year_id = required_str(params, "yearId")?;
    let consecutive = required_i64(params, "consecutiveAbsencesAlert")?;
    let monthly = required_i64(params, "monthlyAbsencesAlert")?;
    let period_pct = required_f64(params, "periodAbsencePercentageAlert")?;
    let annual_min = required_f64(params, "annualMinimumFrequency")?;

    if consecutive < 1 {
        return Err(HandlerErr::field(
            "consecutiveAbsencesAlert",
            "consecutiveAbsencesAlert must be at least 1",
        ));
    }
    if monthly < 1 {
        return Err(HandlerErr::field(
            "monthlyAbsencesAlert",
            "monthlyAbsencesAlert must be at least 1",
        ));
    }

    let config_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance_configs(id, school_id, academic_year_id,
            consecutive_absences_alert, monthly_absences_alert,
            period_absence_percentage_alert, annual_minimum_frequency)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(school_id, academic_year_id) DO UPDATE SET
           consecutive_absences_alert = excluded.consecutive_absences_alert,
           monthly_absences_alert = excluded.monthly_absences_alert,
           period_absence_percentage_alert = excluded.period_absence_percentage_alert,
           annual_minimum_frequency = excluded.annual_minimum_frequency",
        (
            &config_id,
            &school_id,
            &year_id,
            consecutive,
            monthly,
            period_pct,
            annual_min,
        ),
    )
    .map_err(|e| db_insert(e, "attendance_configs"))?;
    Ok(json!({ "ok": true }))
}

fn parse_status(raw: &str) -> Result<AttendanceStatus, HandlerErr> {
    AttendanceStatus::parse(raw).ok_or_else(|| {
        HandlerErr::field(
            "status",
            "status must be present, absent, justified_absence or excused",
        )
    })
}

fn upsert_record(
    conn: &Connection,
    class_group_id: &str,
    teacher_assignment_id: &str,
    student_id: &str,
    date: &str,
    status: AttendanceStatus,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO attendance_records(class_group_id, teacher_assignment_id, student_id, date, status)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(class_group_id, teacher_assignment_id, student_id, date) DO UPDATE SET
           status = excluded.status",
        (
            class_group_id,
            teacher_assignment_id,
            student_id,
            date,
            status.as_str(),
        ),
    )
    .map_err(|e| db_insert(e, "attendance_records"))?;
    Ok(())
}

fn attendance_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_group_id = required_str(params, "classGroupId")?;
    let teacher_assignment_id = required_str(params, "teacherAssignmentId")?;
    let student_id = required_str(params, "studentId")?;
    let date = required_date(params, "date")?;
    let status = parse_status(&required_str(params, "status")?)?;

    upsert_record(
        conn,
        &class_group_id,
        &teacher_assignment_id,
        &student_id,
        &date.to_string(),
        status,
    )?;
    Ok(json!({ "ok": true }))
}

fn attendance_bulk_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_group_id = required_str(params, "classGroupId")?;
    let teacher_assignment_id = required_str(params, "teacherAssignmentId")?;
    let date = required_date(params, "date")?.to_string();
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::field("entries", "missing entries"));
    };

    let mut writes: Vec<(String, AttendanceStatus)> = Vec::with_capacity(entries.len());
    for entry in entries {
        let student_id = required_str(entry, "studentId")?;
        let status = parse_status(&required_str(entry, "status")?)?;
        writes.push((student_id, status));
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    for (student_id, status) in &writes {
        upsert_record(
            &tx,
            &class_group_id,
            &teacher_assignment_id,
            student_id,
            &date,
            *status,
        )?;
    }
    tx.commit().map_err(db_commit)?;

    Ok(json!({ "ok": true, "count": writes.len() }))
}

fn attendance_frequency(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let class_group_id = required_str(params, "classGroupId")?;
    let teacher_assignment_id = optional_str(params, "teacherAssignmentId")?;
    let start_date = optional_date(params, "startDate")?.map(|d| d.to_string());
    let end_date = optional_date(params, "endDate")?.map(|d| d.to_string());

    let mut sql = String::from(
        "SELECT status FROM attendance_records WHERE student_id = ? AND class_group_id = ?",
    );
    let mut binds: Vec<Value> = vec![
        Value::Text(student_id.clone()),
        Value::Text(class_group_id.clone()),
    ];
    if let Some(ta) = &teacher_assignment_id {
        sql.push_str(" AND teacher_assignment_id = ?");
        binds.push(Value::Text(ta.clone()));
    }
    if let Some(start) = &start_date {
        sql.push_str(" AND date >= ?");
        binds.push(Value::Text(start.clone()));
    }
    if let Some(end) = &end_date {
        sql.push_str(" AND date <= ?");
        binds.push(Value::Text(end.clone()));
    }

    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let statuses = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            row.get::<_, String>(0)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let summary = frequency_summary(
        statuses
            .iter()
            .filter_map(|s| AttendanceStatus::parse(s)),
    );
    serde_json::to_value(summary).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn attendance_alerts(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let class_group_id = required_str(params, "classGroupId")?;
    let school_id = required_str(params, "schoolId")?;
    let year_id = required_str(params, "yearId")?;
    let reference = today(params)?;

    let config: Option<(i64, i64)> = conn
        .query_row(
            "SELECT consecutive_absences_alert, monthly_absences_alert
             FROM attendance_configs
             WHERE school_id = ? AND academic_year_id = ?",
            (&school_id, &year_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_query)?;

    // No config means the alert feature is off for this school/year.
    let Some((consecutive_threshold, monthly_threshold)) = config else {
        return Ok(json!({ "alerts": [] }));
    };

    let mut alerts: Vec<AttendanceAlert> = Vec::new();

    let mut stmt = conn
        .prepare(
            "SELECT status FROM attendance_records
             WHERE student_id = ? AND class_group_id = ?
             ORDER BY date DESC
             LIMIT ?",
        )
        .map_err(db_query)?;
    let recent = stmt
        .query_map(
            (&student_id, &class_group_id, CONSECUTIVE_SCAN_WINDOW),
            |row| row.get::<_, String>(0),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    let recent: Vec<AttendanceStatus> = recent
        .iter()
        .filter_map(|s| AttendanceStatus::parse(s))
        .collect();

    let run = leading_absent_run(&recent);
    if run >= consecutive_threshold {
        alerts.push(AttendanceAlert {
            alert_type: ALERT_CONSECUTIVE_ABSENCES.to_string(),
            threshold: consecutive_threshold,
            current: run,
            message: format!("{} consecutive absences recorded", run),
        });
    }

    let month_prefix = format!("{:04}-{:02}-", reference.year(), reference.month());
    let monthly_absences: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM attendance_records
             WHERE student_id = ? AND class_group_id = ?
               AND status = 'absent' AND date LIKE ? || '%'",
            (&student_id, &class_group_id, &month_prefix),
            |r| r.get(0),
        )
        .map_err(db_query)?;
    if monthly_absences >= monthly_threshold {
        alerts.push(AttendanceAlert {
            alert_type: ALERT_MONTHLY_ABSENCES.to_string(),
            threshold: monthly_threshold,
            current: monthly_absences,
            message: format!("{} absences this month", monthly_absences),
        });
    }

    let alerts = serde_json::to_value(&alerts)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(json!({ "alerts": alerts }))
}

fn justifications_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let class_group_id = required_str(params, "classGroupId")?;
    let start_date = required_date(params, "startDate")?;
    let end_date = required_date(params, "endDate")?;
    let reason = optional_str(params, "reason")?;

    if end_date < start_date {
        return Err(HandlerErr::field(
            "endDate",
            "endDate must not precede startDate",
        ));
    }

    let justification_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO absence_justifications(id, student_id, class_group_id, start_date, end_date, reason, approved)
         VALUES(?, ?, ?, ?, ?, ?, 0)",
        (
            &justification_id,
            &student_id,
            &class_group_id,
            start_date.to_string(),
            end_date.to_string(),
            &reason,
        ),
    )
    .map_err(|e| db_insert(e, "absence_justifications"))?;
    Ok(json!({ "justificationId": justification_id }))
}

/// Approval flips the flag and retroactively rewrites every Absent record
/// for the student inside the justification window, in one transaction.
fn justifications_approve(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let justification_id = required_str(params, "justificationId")?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;

    let row: Option<(String, String, String, String, i64)> = conn
        .query_row(
            "SELECT student_id, class_group_id, start_date, end_date, approved
             FROM absence_justifications
             WHERE id = ?",
            [&justification_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
        .map_err(db_query)?;
    let Some((student_id, class_group_id, start_date, end_date, approved)) = row else {
        return Err(HandlerErr::not_found("absence justification"));
    };
    if approved != 0 {
        return Err(HandlerErr::new(
            "already_approved",
            "justification is already approved",
        ));
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute(
        "UPDATE absence_justifications
         SET approved = 1, approved_by = ?, approved_at = ?
         WHERE id = ?",
        (&actor_id, &at, &justification_id),
    )
    .map_err(|e| db_update(e, "absence_justifications"))?;
    let rewritten = tx
        .execute(
            "UPDATE attendance_records
             SET status = 'justified_absence'
             WHERE student_id = ? AND class_group_id = ?
               AND status = 'absent'
               AND date BETWEEN ? AND ?",
            (&student_id, &class_group_id, &start_date, &end_date),
        )
        .map_err(|e| db_update(e, "attendance_records"))?;
    db::audit_write(
        &tx,
        "absence_justification",
        &justification_id,
        "approve",
        &actor_id,
        &at,
        Some(&json!({ "approved": false })),
        Some(&json!({ "approved": true, "rewrittenRecords": rewritten })),
    )
    .map_err(|e| db_update(e, "audit_log"))?;
    tx.commit().map_err(db_commit)?;

    Ok(json!({
        "justificationId": justification_id,
        "rewrittenRecords": rewritten
    }))
}

fn justifications_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, class_group_id, start_date, end_date, reason, approved, approved_by, approved_at
             FROM absence_justifications
             WHERE student_id = ?
             ORDER BY start_date",
        )
        .map_err(db_query)?;
    let justifications = stmt
        .query_map([&student_id], |row| {
            let id: String = row.get(0)?;
            let class_group_id: String = row.get(1)?;
            let start_date: String = row.get(2)?;
            let end_date: String = row.get(3)?;
            let reason: Option<String> = row.get(4)?;
            let approved: i64 = row.get(5)?;
            let approved_by: Option<String> = row.get(6)?;
            let approved_at: Option<String> = row.get(7)?;
            Ok(json!({
                "id": id,
                "classGroupId": class_group_id,
                "startDate": start_date,
                "endDate": end_date,
                "reason": reason,
                "approved": approved != 0,
                "approvedBy": approved_by,
                "approvedAt": approved_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "justifications": justifications }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "attendanceConfigs.set"
            | "attendance.upsert"
            | "attendance.bulkUpsert"
            | "attendance.frequency"
            | "attendance.alerts"
            | "justifications.create"
            | "justifications.approve"
            | "justifications.list"
    );
    if !handled {
        return None;
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "attendanceConfigs.set" => attendance_configs_set(conn, &req.params),
        "attendance.upsert" => attendance_upsert(conn, &req.params),
        "attendance.bulkUpsert" => attendance_bulk_upsert(conn, &req.params),
        "attendance.frequency" => attendance_frequency(conn, &req.params),
        "attendance.alerts" => attendance_alerts(conn, &req.params),
        "justifications.create" => justifications_create(conn, &req.params),
        "justifications.approve" => justifications_approve(conn, &req.params),
        "justifications.list" => justifications_list(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
