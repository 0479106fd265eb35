//! Completeness checks that gate a period closing's submission.
//!
//! Each predicate is stateless: (connection, keys, range) in, boolean out.
//! Grades are a count check against the expected student x instrument grid;
//! attendance and lesson records are coverage checks only, satisfied by the
//! first record inside the period range.

use rusqlite::Connection;
use serde::Serialize;

use crate::calc::CalcError;

#[derive(Debug, Clone, Copy)]
pub struct ClosingKeys<'a> {
    pub class_group_id: &'a str,
    pub teacher_assignment_id: &'a str,
    pub assessment_period_id: &'a str,
    pub assessment_config_id: &'a str,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletenessReport {
    pub grades_complete: bool,
    pub attendance_complete: bool,
    pub lesson_records_complete: bool,
}

impl CompletenessReport {
    pub fn is_satisfied(&self) -> bool {
        self.grades_complete && self.attendance_complete && self.lesson_records_complete
    }

    pub fn missing_areas(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if !self.grades_complete {
            out.push("grades");
        }
        if !self.attendance_complete {
            out.push("attendance");
        }
        if !self.lesson_records_complete {
            out.push("lesson_records");
        }
        out
    }
}

fn query_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

/// Expected = active students in the class group x instruments under the
/// config; actual = distinct non-recovery (student, instrument) grade rows
/// for the keys, restricted to active students. Zero instruments or zero
/// students is vacuously complete.
pub fn grades_complete(conn: &Connection, keys: &ClosingKeys<'_>) -> Result<bool, CalcError> {
    let students: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT student_id)
             FROM enrollments
             WHERE class_group_id = ? AND status = 'active'",
            [keys.class_group_id],
            |r| r.get(0),
        )
        .map_err(query_err)?;

    let instruments: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM assessment_instruments WHERE assessment_config_id = ?",
            [keys.assessment_config_id],
            |r| r.get(0),
        )
        .map_err(query_err)?;

    if students == 0 || instruments == 0 {
        return Ok(true);
    }

    let actual: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT g.student_id || ':' || g.assessment_instrument_id)
             FROM grades g
             WHERE g.class_group_id = ?
               AND g.teacher_assignment_id = ?
               AND g.assessment_period_id = ?
               AND g.is_recovery = 0
               AND g.assessment_instrument_id IN (
                 SELECT id FROM assessment_instruments WHERE assessment_config_id = ?
               )
               AND g.student_id IN (
                 SELECT student_id FROM enrollments
                 WHERE class_group_id = ? AND status = 'active'
               )",
            (
                keys.class_group_id,
                keys.teacher_assignment_id,
                keys.assessment_period_id,
                keys.assessment_config_id,
                keys.class_group_id,
            ),
            |r| r.get(0),
        )
        .map_err(query_err)?;

    Ok(actual >= students * instruments)
}

/// At least one attendance date recorded for the pair inside [start, end].
pub fn attendance_complete(
    conn: &Connection,
    class_group_id: &str,
    teacher_assignment_id: &str,
    start_date: &str,
    end_date: &str,
) -> Result<bool, CalcError> {
    conn.query_row(
        "SELECT EXISTS(
           SELECT 1 FROM attendance_records
           WHERE class_group_id = ?
             AND teacher_assignment_id = ?
             AND date BETWEEN ? AND ?
         )",
        (class_group_id, teacher_assignment_id, start_date, end_date),
        |r| r.get::<_, i64>(0),
    )
    .map(|v| v != 0)
    .map_err(query_err)
}

/// At least one lesson record for the pair inside [start, end].
pub fn lesson_records_complete(
    conn: &Connection,
    class_group_id: &str,
    teacher_assignment_id: &str,
    start_date: &str,
    end_date: &str,
) -> Result<bool, CalcError> {
    conn.query_row(
        "SELECT EXISTS(
           SELECT 1 FROM lesson_records
           WHERE class_group_id = ?
             AND teacher_assignment_id = ?
             AND date BETWEEN ? AND ?
         )",
        (class_group_id, teacher_assignment_id, start_date, end_date),
        |r| r.get::<_, i64>(0),
    )
    .map(|v| v != 0)
    .map_err(query_err)
}

pub fn evaluate(
    conn: &Connection,
    keys: &ClosingKeys<'_>,
    start_date: &str,
    end_date: &str,
) -> Result<CompletenessReport, CalcError> {
    Ok(CompletenessReport {
        grades_complete: grades_complete(conn, keys)?,
        attendance_complete: attendance_complete(
            conn,
            keys.class_group_id,
            keys.teacher_assignment_id,
            start_date,
            end_date,
        )?,
        lesson_records_complete: lesson_records_complete(
            conn,
            keys.class_group_id,
            keys.teacher_assignment_id,
            start_date,
            end_date,
        )?,
    })
}
