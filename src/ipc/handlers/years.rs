use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    actor, db_insert, db_query, db_update, optional_str, required_i64, required_str, timestamp,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::status::{AcademicYearStatus, AssessmentPeriodStatus, PeriodType};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn years_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = required_str(params, "schoolId")?;
    let year = required_i64(params, "year")?;
    let start_date = optional_str(params, "startDate")?;
    let end_date = optional_str(params, "endDate")?;

    if !super::schools::school_exists(conn, &school_id)? {
        return Err(HandlerErr::not_found("school"));
    }

    let year_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO academic_years(id, school_id, year, status, start_date, end_date)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &year_id,
            &school_id,
            year,
            AcademicYearStatus::Planning.as_str(),
            &start_date,
            &end_date,
        ),
    )
    .map_err(|e| db_insert(e, "academic_years"))?;

    Ok(json!({
        "yearId": year_id,
        "year": year,
        "status": AcademicYearStatus::Planning.as_str(),
        "statusLabel": AcademicYearStatus::Planning.label()
    }))
}

fn years_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = required_str(params, "schoolId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, year, status, start_date, end_date
             FROM academic_years
             WHERE school_id = ?
             ORDER BY year",
        )
        .map_err(db_query)?;
    let years = stmt
        .query_map([&school_id], |row| {
            let id: String = row.get(0)?;
            let year: i64 = row.get(1)?;
            let status: String = row.get(2)?;
            let start_date: Option<String> = row.get(3)?;
            let end_date: Option<String> = row.get(4)?;
            Ok((id, year, status, start_date, end_date))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let years: Vec<serde_json::Value> = years
        .into_iter()
        .map(|(id, year, status, start_date, end_date)| {
            let label = AcademicYearStatus::parse(&status)
                .map(|s| s.label())
                .unwrap_or("");
            json!({
                "id": id,
                "year": year,
                "status": status,
                "statusLabel": label,
                "startDate": start_date,
                "endDate": end_date
            })
        })
        .collect();
    Ok(json!({ "years": years }))
}

fn load_year_status(
    conn: &Connection,
    year_id: &str,
) -> Result<AcademicYearStatus, HandlerErr> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM academic_years WHERE id = ?",
            [year_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    let Some(status) = status else {
        return Err(HandlerErr::not_found("academic year"));
    };
    AcademicYearStatus::parse(&status)
        .ok_or_else(|| HandlerErr::new("db_query_failed", "bad status in academic_years"))
}

fn years_transition(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let year_id = required_str(params, "yearId")?;
    let target_raw = required_str(params, "status")?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;

    let current = load_year_status(conn, &year_id)?;
    let Some(target) = AcademicYearStatus::parse(&target_raw) else {
        return Err(HandlerErr::field("status", "unknown year status"));
    };
    if target == AcademicYearStatus::Closed {
        return Err(HandlerErr {
            code: "invalid_transition",
            message: "a year is closed through the closure gate, not a direct transition"
                .to_string(),
            details: Some(json!({ "from": current.as_str(), "to": target.as_str() })),
        });
    }
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

    conn.execute(
        "UPDATE academic_years SET status = ? WHERE id = ?",
        (target.as_str(), &year_id),
    )
    .map_err(|e| db_update(e, "academic_years"))?;
    db::audit_write(
        conn,
        "academic_year",
        &year_id,
        "transition",
        &actor_id,
        &at,
        Some(&json!({ "status": current.as_str() })),
        Some(&json!({ "status": target.as_str() })),
    )
    .map_err(|e| db_update(e, "audit_log"))?;

    Ok(json!({
        "yearId": year_id,
        "status": target.as_str(),
        "statusLabel": target.label()
    }))
}

/// Year closure gate. Three sequential guards, each failing fast:
/// not already closed, no period closing still open, no active student
/// missing a final result.
fn years_close(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year_id = required_str(params, "yearId")?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;

    let current = load_year_status(conn, &year_id)?;
    if current == AcademicYearStatus::Closed {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "academic year is already closed".to_string(),
            details: Some(json!({ "field": "status" })),
        });
    }

    let open_closings: i64 = conn
        .query_row(
            "SELECT COUNT(*)
             FROM period_closings pc
             JOIN class_groups cg ON cg.id = pc.class_group_id
             WHERE cg.academic_year_id = ? AND pc.status != 'closed'",
            [&year_id],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    if open_closings > 0 {
        return Err(HandlerErr {
            code: "validation_failed",
            message: format!("{} period closing(s) are not yet closed", open_closings),
            details: Some(json!({ "openClosings": open_closings })),
        });
    }

    let missing_finals: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT e.student_id)
             FROM enrollments e
             WHERE e.academic_year_id = ? AND e.status = 'active'
               AND NOT EXISTS (
                 SELECT 1 FROM final_results fr
                 WHERE fr.student_id = e.student_id
                   AND fr.academic_year_id = e.academic_year_id
               )",
            [&year_id],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    if missing_finals > 0 {
        return Err(HandlerErr {
            code: "validation_failed",
            message: format!(
                "{} active student(s) have no final result record",
                missing_finals
            ),
            details: Some(json!({ "missingFinalResults": missing_finals })),
        });
    }

    conn.execute(
        "UPDATE academic_years SET status = 'closed' WHERE id = ?",
        [&year_id],
    )
    .map_err(|e| db_update(e, "academic_years"))?;
    db::audit_write(
        conn,
        "academic_year",
        &year_id,
        "close",
        &actor_id,
        &at,
        Some(&json!({ "status": current.as_str() })),
        Some(&json!({ "status": "closed" })),
    )
    .map_err(|e| db_update(e, "audit_log"))?;

    Ok(json!({
        "yearId": year_id,
        "status": "closed",
        "statusLabel": AcademicYearStatus::Closed.label()
    }))
}

struct PeriodRow {
    period_type: PeriodType,
    number: i64,
    status: AssessmentPeriodStatus,
    start_date: String,
    end_date: String,
}

fn load_period(conn: &Connection, period_id: &str) -> Result<PeriodRow, HandlerErr> {
    let row: Option<(String, i64, String, String, String)> = conn
        .query_row(
            "SELECT period_type, number, status, start_date, end_date
             FROM assessment_periods
             WHERE id = ?",
            [period_id],
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
    let Some((period_type, number, status, start_date, end_date)) = row else {
        return Err(HandlerErr::not_found("assessment period"));
    };
    let period_type = PeriodType::parse(&period_type)
        .ok_or_else(|| HandlerErr::new("db_query_failed", "bad period_type in assessment_periods"))?;
    let status = AssessmentPeriodStatus::parse(&status)
        .ok_or_else(|| HandlerErr::new("db_query_failed", "bad status in assessment_periods"))?;
    Ok(PeriodRow {
        period_type,
        number,
        status,
        start_date,
        end_date,
    })
}

fn periods_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let year_id = required_str(params, "yearId")?;
    let type_raw = required_str(params, "periodType")?;
    let number = required_i64(params, "number")?;
    let start_date = required_str(params, "startDate")?;
    let end_date = required_str(params, "endDate")?;

    let Some(period_type) = PeriodType::parse(&type_raw) else {
        return Err(HandlerErr::field(
            "periodType",
            "periodType must be bimestral, trimestral or semestral",
        ));
    };
    if number < 1 || number > period_type.max_number() {
        return Err(HandlerErr::field(
            "number",
            format!(
                "number must be between 1 and {} for a {} period",
                period_type.max_number(),
                period_type.as_str()
            ),
        ));
    }

    let year_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM academic_years WHERE id = ?",
            [&year_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    if year_exists.is_none() {
        return Err(HandlerErr::not_found("academic year"));
    }

    let period_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assessment_periods(id, academic_year_id, period_type, number, status, start_date, end_date)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &period_id,
            &year_id,
            period_type.as_str(),
            number,
            AssessmentPeriodStatus::Open.as_str(),
            &start_date,
            &end_date,
        ),
    )
    .map_err(|e| db_insert(e, "assessment_periods"))?;

    Ok(json!({
        "periodId": period_id,
        "periodType": period_type.as_str(),
        "number": number,
        "status": AssessmentPeriodStatus::Open.as_str(),
        "statusLabel": AssessmentPeriodStatus::Open.label()
    }))
}

fn periods_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year_id = required_str(params, "yearId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, period_type, number, status, start_date, end_date
             FROM assessment_periods
             WHERE academic_year_id = ?
             ORDER BY period_type, number",
        )
        .map_err(db_query)?;
    let rows = stmt
        .query_map([&year_id], |row| {
            let id: String = row.get(0)?;
            let period_type: String = row.get(1)?;
            let number: i64 = row.get(2)?;
            let status: String = row.get(3)?;
            let start_date: String = row.get(4)?;
            let end_date: String = row.get(5)?;
            Ok((id, period_type, number, status, start_date, end_date))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let periods: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, period_type, number, status, start_date, end_date)| {
            let label = AssessmentPeriodStatus::parse(&status)
                .map(|s| s.label())
                .unwrap_or("");
            json!({
                "id": id,
                "periodType": period_type,
                "number": number,
                "status": status,
                "statusLabel": label,
                "startDate": start_date,
                "endDate": end_date
            })
        })
        .collect();
    Ok(json!({ "periods": periods }))
}

fn periods_transition(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let period_id = required_str(params, "periodId")?;
    let target_raw = required_str(params, "status")?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;

    let period = load_period(conn, &period_id)?;
    if period.status == AssessmentPeriodStatus::Closed {
        return Err(HandlerErr::new(
            "period_closed",
            "closed assessment periods are immutable",
        ));
    }
    let Some(target) = AssessmentPeriodStatus::parse(&target_raw) else {
        return Err(HandlerErr::field("status", "unknown period status"));
    };
    if !period.status.can_transition_to(target) {
        return Err(HandlerErr {
            code: "invalid_transition",
            message: format!(
                "transition from {} to {} is not allowed",
                period.status.label(),
                target.label()
            ),
            details: Some(json!({ "from": period.status.as_str(), "to": target.as_str() })),
        });
    }

    conn.execute(
        "UPDATE assessment_periods SET status = ? WHERE id = ?",
        (target.as_str(), &period_id),
    )
    .map_err(|e| db_update(e, "assessment_periods"))?;
    db::audit_write(
        conn,
        "assessment_period",
        &period_id,
        "transition",
        &actor_id,
        &at,
        Some(&json!({ "status": period.status.as_str() })),
        Some(&json!({ "status": target.as_str() })),
    )
    .map_err(|e| db_update(e, "audit_log"))?;

    Ok(json!({
        "periodId": period_id,
        "status": target.as_str(),
        "statusLabel": target.label()
    }))
}

fn periods_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let period_id = required_str(params, "periodId")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::field("patch", "missing patch object"))?;

    let period = load_period(conn, &period_id)?;
    if period.status == AssessmentPeriodStatus::Closed {
        return Err(HandlerErr::new(
            "period_closed",
            "closed assessment periods are immutable",
        ));
    }

    let patch_value = serde_json::Value::Object(patch.clone());
    let start_date =
        optional_str(&patch_value, "startDate")?.unwrap_or_else(|| period.start_date.clone());
    let end_date =
        optional_str(&patch_value, "endDate")?.unwrap_or_else(|| period.end_date.clone());
    let number = patch_value
        .get("number")
        .and_then(|v| v.as_i64())
        .unwrap_or(period.number);
    if number < 1 || number > period.period_type.max_number() {
        return Err(HandlerErr::field(
            "number",
            format!(
                "number must be between 1 and {} for a {} period",
                period.period_type.max_number(),
                period.period_type.as_str()
            ),
        ));
    }

    conn.execute(
        "UPDATE assessment_periods SET number = ?, start_date = ?, end_date = ? WHERE id = ?",
        (number, &start_date, &end_date, &period_id),
    )
    .map_err(|e| db_update(e, "assessment_periods"))?;

    Ok(json!({
        "periodId": period_id,
        "number": number,
        "startDate": start_date,
        "endDate": end_date
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "years.create"
            | "years.list"
            | "years.transition"
            | "years.close"
            | "periods.create"
            | "periods.list"
            | "periods.transition"
            | "periods.update"
    );
    if !handled {
        return None;
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "years.create" => years_create(conn, &req.params),
        "years.list" => years_list(conn, &req.params),
        "years.transition" => years_transition(conn, &req.params),
        "years.close" => years_close(conn, &req.params),
        "periods.create" => periods_create(conn, &req.params),
        "periods.list" => periods_list(conn, &req.params),
        "periods.transition" => periods_transition(conn, &req.params),
        "periods.update" => periods_update(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
