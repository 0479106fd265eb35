use crate::calc::{self, conceptual_ordinal, AverageContext};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_commit, db_insert, db_query, db_tx, optional_bool, optional_f64, optional_i64,
    optional_str, required_f64, required_i64, required_str, timestamp, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::status::{AssessmentPeriodStatus, AverageFormula, GradeType, RecoveryReplaces};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn assessment_configs_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = required_str(params, "schoolId")?;
    let year_id = required_str(params, "yearId")?;
    let grade_level = required_str(params, "gradeLevel")?;
    let grade_type_raw = required_str(params, "gradeType")?;
    let scale_min = required_f64(params, "scaleMin")?;
    let scale_max = required_f64(params, "scaleMax")?;
    let passing_grade = required_f64(params, "passingGrade")?;
    let formula_raw = required_str(params, "averageFormula")?;
    let rounding_precision = required_i64(params, "roundingPrecision")?;
    let recovery_enabled = optional_bool(params, "recoveryEnabled", false)?;
    let replaces_raw = optional_str(params, "recoveryReplaces")?
        .unwrap_or_else(|| RecoveryReplaces::Higher.as_str().to_string());

    let Some(grade_type) = GradeType::parse(&grade_type_raw) else {
        return Err(HandlerErr::field(
            "gradeType",
            "gradeType must be numeric or conceptual",
        ));
    };
    let Some(formula) = AverageFormula::parse(&formula_raw) else {
        return Err(HandlerErr::field(
            "averageFormula",
            "averageFormula must be arithmetic or weighted",
        ));
    };
    let Some(replaces) = RecoveryReplaces::parse(&replaces_raw) else {
        return Err(HandlerErr::field(
            "recoveryReplaces",
            "recoveryReplaces must be higher, average or last",
        ));
    };
    if scale_min >= scale_max {
        return Err(HandlerErr::field(
            "scaleMin",
            "scaleMin must be below scaleMax",
        ));
    }
    if passing_grade < scale_min || passing_grade > scale_max {
        return Err(HandlerErr::field(
            "passingGrade",
            "passingGrade must sit inside the grade scale",
        ));
    }
    if !(0..=4).contains(&rounding_precision) {
        return Err(HandlerErr::field(
            "roundingPrecision",
            "roundingPrecision must be between 0 and 4",
        ));
    }

    let config_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assessment_configs(id, school_id, academic_year_id, grade_level, grade_type,
            scale_min, scale_max, passing_grade, average_formula, rounding_precision,
            recovery_enabled, recovery_replaces)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(school_id, academic_year_id, grade_level) DO UPDATE SET
           grade_type = excluded.grade_type,
           scale_min = excluded.scale_min,
           scale_max = excluded.scale_max,
           passing_grade = excluded.passing_grade,
           average_formula = excluded.average_formula,
           rounding_precision = excluded.rounding_precision,
           recovery_enabled = excluded.recovery_enabled,
           recovery_replaces = excluded.recovery_replaces",
        (
            &config_id,
            &school_id,
            &year_id,
            &grade_level,
            grade_type.as_str(),
            scale_min,
            scale_max,
            passing_grade,
            formula.as_str(),
            rounding_precision,
            recovery_enabled as i64,
            replaces.as_str(),
        ),
    )
    .map_err(|e| db_insert(e, "assessment_configs"))?;

    let effective_id: String = conn
        .query_row(
            "SELECT id FROM assessment_configs
             WHERE school_id = ? AND academic_year_id = ? AND grade_level = ?",
            (&school_id, &year_id, &grade_level),
            |r| r.get(0),
        )
        .map_err(db_query)?;

    Ok(json!({ "configId": effective_id }))
}

fn assessment_configs_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = required_str(params, "schoolId")?;
    let year_id = required_str(params, "yearId")?;
    let grade_level = required_str(params, "gradeLevel")?;

    let row: Option<(String, String, f64, f64, f64, String, i64, i64, String)> = conn
        .query_row(
            "SELECT id, grade_type, scale_min, scale_max, passing_grade, average_formula,
                    rounding_precision, recovery_enabled, recovery_replaces
             FROM assessment_configs
             WHERE school_id = ? AND academic_year_id = ? AND grade_level = ?",
            (&school_id, &year_id, &grade_level),
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
                ))
            },
        )
        .optional()
        .map_err(db_query)?;

    let Some((
        id,
        grade_type,
        scale_min,
        scale_max,
        passing_grade,
        average_formula,
        rounding_precision,
        recovery_enabled,
        recovery_replaces,
    )) = row
    else {
        return Err(HandlerErr::not_found("assessment config"));
    };

    Ok(json!({
        "id": id,
        "gradeType": grade_type,
        "scaleMin": scale_min,
        "scaleMax": scale_max,
        "passingGrade": passing_grade,
        "averageFormula": average_formula,
        "roundingPrecision": rounding_precision,
        "recoveryEnabled": recovery_enabled != 0,
        "recoveryReplaces": recovery_replaces
    }))
}

fn instruments_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let config_id = required_str(params, "configId")?;
    let name = required_str(params, "name")?;
    let weight = optional_f64(params, "weight")?;
    let sort_order = optional_i64(params, "sortOrder")?.unwrap_or(0);

    if let Some(w) = weight {
        if w <= 0.0 {
            return Err(HandlerErr::field("weight", "weight must be positive"));
        }
    }
    let config_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM assessment_configs WHERE id = ?",
            [&config_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    if config_exists.is_none() {
        return Err(HandlerErr::not_found("assessment config"));
    }

    let instrument_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assessment_instruments(id, assessment_config_id, name, weight, sort_order)
         VALUES(?, ?, ?, ?, ?)",
        (&instrument_id, &config_id, &name, weight, sort_order),
    )
    .map_err(|e| db_insert(e, "assessment_instruments"))?;
    Ok(json!({ "instrumentId": instrument_id }))
}

fn instruments_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let config_id = required_str(params, "configId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, weight, sort_order
             FROM assessment_instruments
             WHERE assessment_config_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_query)?;
    let instruments = stmt
        .query_map([&config_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let weight: Option<f64> = row.get(2)?;
            let sort_order: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "weight": weight,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "instruments": instruments }))
}

struct GradeScale {
    grade_type: GradeType,
    scale_min: f64,
    scale_max: f64,
}

fn load_scale_for_class_group(
    conn: &Connection,
    class_group_id: &str,
) -> Result<GradeScale, HandlerErr> {
    let row: Option<(String, f64, f64)> = conn
        .query_row(
            "SELECT ac.grade_type, ac.scale_min, ac.scale_max
             FROM assessment_configs ac
             JOIN class_groups cg
               ON cg.school_id = ac.school_id
              AND cg.academic_year_id = ac.academic_year_id
              AND cg.grade_level = ac.grade_level
             WHERE cg.id = ?",
            [class_group_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_query)?;
    let Some((grade_type, scale_min, scale_max)) = row else {
        return Err(HandlerErr::not_found(
            "assessment config for this class group",
        ));
    };
    let grade_type = GradeType::parse(&grade_type)
        .ok_or_else(|| HandlerErr::new("db_query_failed", "bad grade_type in config"))?;
    Ok(GradeScale {
        grade_type,
        scale_min,
        scale_max,
    })
}

fn period_is_closed(conn: &Connection, period_id: &str) -> Result<bool, HandlerErr> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM assessment_periods WHERE id = ?",
            [period_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query)?;
    let Some(status) = status else {
        return Err(HandlerErr::not_found("assessment period"));
    };
    Ok(AssessmentPeriodStatus::parse(&status) == Some(AssessmentPeriodStatus::Closed))
}

struct GradeWrite {
    student_id: String,
    instrument_id: String,
    numeric_value: Option<f64>,
    conceptual_value: Option<String>,
    is_recovery: bool,
}

fn parse_grade_entry(
    scale: &GradeScale,
    entry: &serde_json::Value,
) -> Result<GradeWrite, HandlerErr> {
    let student_id = required_str(entry, "studentId")?;
    let instrument_id = required_str(entry, "instrumentId")?;
    let is_recovery = optional_bool(entry, "isRecovery", false)?;
    let numeric_value = optional_f64(entry, "numericValue")?;
    let conceptual_value = optional_str(entry, "conceptualValue")?;

    match scale.grade_type {
        GradeType::Numeric => {
            let Some(v) = numeric_value else {
                return Err(HandlerErr::field(
                    "numericValue",
                    "numericValue is required for numeric grading",
                ));
            };
            if v < scale.scale_min || v > scale.scale_max {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!(
                        "numericValue must be between {} and {}",
                        scale.scale_min, scale.scale_max
                    ),
                    details: Some(json!({ "field": "numericValue", "value": v })),
                });
            }
            if conceptual_value.is_some() {
                return Err(HandlerErr::field(
                    "conceptualValue",
                    "conceptualValue is not accepted for numeric grading",
                ));
            }
        }
        GradeType::Conceptual => {
            let Some(ref c) = conceptual_value else {
                return Err(HandlerErr::field(
                    "conceptualValue",
                    "conceptualValue is required for conceptual grading",
                ));
            };
            if conceptual_ordinal(c).is_none() {
                return Err(HandlerErr::field(
                    "conceptualValue",
                    "conceptualValue must be one of A, B, C, D, E",
                ));
            }
            if numeric_value.is_some() {
                return Err(HandlerErr::field(
                    "numericValue",
                    "numericValue is not accepted for conceptual grading",
                ));
            }
        }
    }

    Ok(GradeWrite {
        student_id,
        instrument_id,
        numeric_value,
        conceptual_value,
        is_recovery,
    })
}

fn upsert_grade(
    conn: &Connection,
    class_group_id: &str,
    teacher_assignment_id: &str,
    period_id: &str,
    write: &GradeWrite,
    at: &str,
) -> Result<(), HandlerErr> {
    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, student_id, class_group_id, teacher_assignment_id,
            assessment_period_id, assessment_instrument_id, numeric_value, conceptual_value,
            is_recovery, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, class_group_id, teacher_assignment_id,
                     assessment_period_id, assessment_instrument_id, is_recovery)
         DO UPDATE SET
           numeric_value = excluded.numeric_value,
           conceptual_value = excluded.conceptual_value,
           updated_at = excluded.updated_at",
        (
            &grade_id,
            &write.student_id,
            class_group_id,
            teacher_assignment_id,
            period_id,
            &write.instrument_id,
            write.numeric_value,
            &write.conceptual_value,
            write.is_recovery as i64,
            at,
        ),
    )
    .map_err(|e| db_insert(e, "grades"))?;
    Ok(())
}

fn grades_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_group_id = required_str(params, "classGroupId")?;
    let teacher_assignment_id = required_str(params, "teacherAssignmentId")?;
    let period_id = required_str(params, "periodId")?;
    let at = timestamp(params)?;

    if period_is_closed(conn, &period_id)? {
        return Err(HandlerErr::new(
            "period_closed",
            "grades cannot change in a closed period",
        ));
    }
    let scale = load_scale_for_class_group(conn, &class_group_id)?;
    let write = parse_grade_entry(&scale, params)?;
    upsert_grade(
        conn,
        &class_group_id,
        &teacher_assignment_id,
        &period_id,
        &write,
        &at,
    )?;
    Ok(json!({ "ok": true }))
}

fn grades_bulk_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_group_id = required_str(params, "classGroupId")?;
    let teacher_assignment_id = required_str(params, "teacherAssignmentId")?;
    let period_id = required_str(params, "periodId")?;
    let at = timestamp(params)?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::field("entries", "missing entries"));
    };

    if period_is_closed(conn, &period_id)? {
        return Err(HandlerErr::new(
            "period_closed",
            "grades cannot change in a closed period",
        ));
    }
    let scale = load_scale_for_class_group(conn, &class_group_id)?;

    let writes = entries
        .iter()
        .map(|e| parse_grade_entry(&scale, e))
        .collect::<Result<Vec<_>, _>>()?;

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    for write in &writes {
        upsert_grade(
            &tx,
            &class_group_id,
            &teacher_assignment_id,
            &period_id,
            write,
            &at,
        )?;
    }
    tx.commit().map_err(db_commit)?;

    Ok(json!({ "ok": true, "count": writes.len() }))
}

fn grades_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_group_id = required_str(params, "classGroupId")?;
    let teacher_assignment_id = required_str(params, "teacherAssignmentId")?;
    let period_id = required_str(params, "periodId")?;

    let mut stmt = conn
        .prepare(
            "SELECT student_id, assessment_instrument_id, numeric_value, conceptual_value, is_recovery
             FROM grades
             WHERE class_group_id = ? AND teacher_assignment_id = ? AND assessment_period_id = ?
             ORDER BY student_id, assessment_instrument_id, is_recovery",
        )
        .map_err(db_query)?;
    let grades = stmt
        .query_map(
            (&class_group_id, &teacher_assignment_id, &period_id),
            |row| {
                let student_id: String = row.get(0)?;
                let instrument_id: String = row.get(1)?;
                let numeric_value: Option<f64> = row.get(2)?;
                let conceptual_value: Option<String> = row.get(3)?;
                let is_recovery: i64 = row.get(4)?;
                Ok(json!({
                    "studentId": student_id,
                    "instrumentId": instrument_id,
                    "numericValue": numeric_value,
                    "conceptualValue": conceptual_value,
                    "isRecovery": is_recovery != 0
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "grades": grades }))
}

fn calc_student_average(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let class_group_id = required_str(params, "classGroupId")?;
    let teacher_assignment_id = required_str(params, "teacherAssignmentId")?;
    let period_id = required_str(params, "periodId")?;

    let ctx = AverageContext {
        conn,
        student_id: &student_id,
        class_group_id: &class_group_id,
        teacher_assignment_id: &teacher_assignment_id,
        assessment_period_id: &period_id,
    };
    let model = calc::student_period_average(&ctx)?;
    serde_json::to_value(&model)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "assessmentConfigs.set"
            | "assessmentConfigs.get"
            | "instruments.create"
            | "instruments.list"
            | "grades.upsert"
            | "grades.bulkUpsert"
            | "grades.list"
            | "calc.studentAverage"
    );
    if !handled {
        return None;
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "assessmentConfigs.set" => assessment_configs_set(conn, &req.params),
        "assessmentConfigs.get" => assessment_configs_get(conn, &req.params),
        "instruments.create" => instruments_create(conn, &req.params),
        "instruments.list" => instruments_list(conn, &req.params),
        "grades.upsert" => grades_upsert(conn, &req.params),
        "grades.bulkUpsert" => grades_bulk_upsert(conn, &req.params),
        "grades.list" => grades_list(conn, &req.params),
        "calc.studentAverage" => calc_student_average(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(value) => ok(&req.id, value),
        Err(error) => error.response(&req.id),
    })
}
