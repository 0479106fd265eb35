use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    actor, db_insert, db_query, db_update, optional_bool, optional_f64, required_str, timestamp,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::status::FinalResult;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn final_results_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let class_group_id = required_str(params, "classGroupId")?;
    let year_id = required_str(params, "yearId")?;
    let result_raw = required_str(params, "result")?;
    let overall_average = optional_f64(params, "overallAverage")?;
    let overall_frequency = optional_f64(params, "overallFrequency")?;
    let council_override = optional_bool(params, "councilOverride", false)?;
    let actor_id = actor(params)?;
    let at = timestamp(params)?;

    let Some(result) = FinalResult::parse(&result_raw) else {
        return Err(HandlerErr::field(
            "result",
            "result must be approved, retained, partial_progression, transferred or abandoned",
        ));
    };
    let enrollment_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrollments
             WHERE student_id = ? AND class_group_id = ? AND academic_year_id = ?",
            (&student_id, &class_group_id, &year_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    if enrollment_exists.is_none() {
        return Err(HandlerErr::not_found("enrollment"));
    }

    let record_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO final_results(id, student_id, class_group_id, academic_year_id, result,
            overall_average, overall_frequency, council_override)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, class_group_id, academic_year_id) DO UPDATE SET
           result = excluded.result,
           overall_average = excluded.overall_average,
           overall_frequency = excluded.overall_frequency,
           council_override = excluded.council_override",
        (
            &record_id,
            &student_id,
            &class_group_id,
            &year_id,
            result.as_str(),
            overall_average,
            overall_frequency,
            council_override as i64,
        ),
    )
    .map_err(|e| db_insert(e, "final_results"))?;
    db::audit_write(
        conn,
        "final_result",
        &format!("{}:{}", student_id, year_id),
        "set",
        &actor_id,
        &at,
        None,
        Some(&json!({
            "result": result.as_str(),
            "councilOverride": council_override
        })),
    )
    .map_err(|e| db_update(e, "audit_log"))?;

    Ok(json!({
        "studentId": student_id,
        "result": result.as_str(),
        "resultLabel": result.label()
    }))
}

fn final_results_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_group_id = required_str(params, "classGroupId")?;
    let year_id = required_str(params, "yearId")?;
    let mut stmt = conn
        .prepare(
            "SELECT fr.student_id, s.last_name, s.first_name, fr.result,
                    fr.overall_average, fr.overall_frequency, fr.council_override
             FROM final_results fr
             JOIN students s ON s.id = fr.student_id
             WHERE fr.class_group_id = ? AND fr.academic_year_id = ?
             ORDER BY s.last_name, s.first_name",
        )
        .map_err(db_query)?;
    let results = stmt
        .query_map((&class_group_id, &year_id), |row| {
            let student_id: String = row.get(0)?;
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            let result: String = row.get(3)?;
            let overall_average: Option<f64> = row.get(4)?;
            let overall_frequency: Option<f64> = row.get(5)?;
            let council_override: i64 = row.get(6)?;
            Ok((
                student_id,
                last,
                first,
                result,
                overall_average,
                overall_frequency,
                council_override,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let results: Vec<serde_json::Value> = results
        .into_iter()
        .map(
            |(student_id, last, first, result, average, frequency, council)| {
                let label = FinalResult::parse(&result).map(|r| r.label()).unwrap_or("");
                json!({
                    "studentId": student_id,
                    "displayName": format!("{}, {}", last, first),
                    "result": result,
                    "resultLabel": label,
                    "overallAverage": average,
                    "overallFrequency": frequency,
                    "councilOverride": council != 0
                })
            },
        )
        .collect();
    Ok(json!({ "finalResults": results }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "finalResults.set" | "finalResults.list"
    );
    if !handled {
        return None;
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "finalResults.set" => final_results_set(conn, &req.params),
        "finalResults.list" => final_results_list(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
