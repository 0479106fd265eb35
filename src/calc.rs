use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

use crate::status::{AttendanceStatus, AverageFormula, GradeType, RecoveryReplaces};

/// Round-half-up at `precision` decimal digits:
/// `Int(10^p * x + 0.5) / 10^p`
pub fn round_half_up(x: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(precision as i32);
    ((scale * x) + 0.5).floor() / scale
}

/// Ordinal points for conceptual grades, E < D < C < B < A.
pub fn conceptual_ordinal(value: &str) -> Option<f64> {
    match value.trim().to_ascii_uppercase().as_str() {
        "E" => Some(1.0),
        "D" => Some(2.0),
        "C" => Some(3.0),
        "B" => Some(4.0),
        "A" => Some(5.0),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AveragePolicy {
    pub formula: AverageFormula,
    pub passing_grade: f64,
    pub rounding_precision: u32,
    pub recovery_enabled: bool,
    pub recovery_replaces: RecoveryReplaces,
}

/// One instrument's grades for a student: the original row and, when
/// present, its recovery counterpart.
#[derive(Debug, Clone)]
pub struct InstrumentGrades {
    pub instrument_id: String,
    pub weight: f64,
    pub original: f64,
    pub recovery: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentBreakdown {
    pub instrument_id: String,
    pub original: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<f64>,
    pub effective: f64,
    pub recovered: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodAverage {
    pub average: Option<f64>,
    pub graded_instruments: usize,
    pub recovered_instruments: usize,
    pub per_instrument: Vec<InstrumentBreakdown>,
}

/// Period average with recovery substitution.
///
/// The effective value per instrument is the original unless recovery is
/// enabled, the original sits below the passing grade, and a recovery row
/// exists; then `higher` takes the max, `average` the mean of the pair, and
/// `last` the recovery value unconditionally. The configured formula runs
/// over the effective values; the result is rounded half-up to the policy's
/// precision.
pub fn period_average(grades: &[InstrumentGrades], policy: &AveragePolicy) -> PeriodAverage {
    let mut per_instrument: Vec<InstrumentBreakdown> = Vec::with_capacity(grades.len());
    let mut recovered_instruments = 0usize;
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;

    for g in grades {
        let mut effective = g.original;
        let mut recovered = false;
        if policy.recovery_enabled && g.original < policy.passing_grade {
            if let Some(rec) = g.recovery {
                effective = match policy.recovery_replaces {
                    RecoveryReplaces::Higher => g.original.max(rec),
                    RecoveryReplaces::Average => (g.original + rec) / 2.0,
                    RecoveryReplaces::Last => rec,
                };
                recovered = true;
                recovered_instruments += 1;
            }
        }

        let weight = match policy.formula {
            AverageFormula::Arithmetic => 1.0,
            AverageFormula::Weighted => {
                if g.weight > 0.0 {
                    g.weight
                } else {
                    1.0
                }
            }
        };
        sum += effective * weight;
        denom += weight;

        per_instrument.push(InstrumentBreakdown {
            instrument_id: g.instrument_id.clone(),
            original: g.original,
            recovery: g.recovery,
            effective,
            recovered,
        });
    }

    let average = if denom > 0.0 {
        Some(round_half_up(sum / denom, policy.rounding_precision))
    } else {
        None
    };

    PeriodAverage {
        average,
        graded_instruments: grades.len(),
        recovered_instruments,
        per_instrument,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencySummary {
    pub total: i64,
    pub present: i64,
    pub absent: i64,
    pub justified: i64,
    pub excused: i64,
    pub frequency_percentage: f64,
}

/// Attendance frequency over a set of records. With no records at all the
/// percentage defaults to 100.00, not NaN.
pub fn frequency_summary<I>(statuses: I) -> FrequencySummary
where
    I: IntoIterator<Item = AttendanceStatus>,
{
    let mut out = FrequencySummary::default();
    let mut attended = 0i64;
    for s in statuses {
        out.total += 1;
        if s.counts_as_present() {
            attended += 1;
        }
        match s {
            AttendanceStatus::Present => out.present += 1,
            AttendanceStatus::Absent => out.absent += 1,
            AttendanceStatus::JustifiedAbsence => out.justified += 1,
            AttendanceStatus::Excused => out.excused += 1,
        }
    }
    out.frequency_percentage = if out.total == 0 {
        100.0
    } else {
        round_half_up(100.0 * attended as f64 / out.total as f64, 2)
    };
    out
}

pub const ALERT_CONSECUTIVE_ABSENCES: &str = "consecutive_absences";
pub const ALERT_MONTHLY_ABSENCES: &str = "monthly_absences";

/// How many most-recent records the consecutive-absence scan looks at.
pub const CONSECUTIVE_SCAN_WINDOW: i64 = 30;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceAlert {
    pub alert_type: String,
    pub threshold: i64,
    pub current: i64,
    pub message: String,
}

/// Length of the contiguous run of `Absent` at the head of a
/// date-descending record list. Stops at the first non-absent record.
pub fn leading_absent_run(recent_desc: &[AttendanceStatus]) -> i64 {
    let mut run = 0i64;
    for s in recent_desc {
        if *s == AttendanceStatus::Absent {
            run += 1;
        } else {
            break;
        }
    }
    run
}

#[derive(Debug, Clone)]
pub struct AverageContext<'a> {
    pub conn: &'a Connection,
    pub student_id: &'a str,
    pub class_group_id: &'a str,
    pub teacher_assignment_id: &'a str,
    pub assessment_period_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAverageModel {
    pub student_id: String,
    pub assessment_period_id: String,
    pub formula: String,
    pub passing_grade: f64,
    #[serde(flatten)]
    pub average: PeriodAverage,
    pub passed: Option<bool>,
}

struct ConfigRow {
    id: String,
    grade_type: GradeType,
    passing_grade: f64,
    formula: AverageFormula,
    rounding_precision: u32,
    recovery_enabled: bool,
    recovery_replaces: RecoveryReplaces,
}

fn load_config_for_class_group(
    conn: &Connection,
    class_group_id: &str,
) -> Result<ConfigRow, CalcError> {
    let row: Option<(String, String, f64, String, i64, i64, String)> = conn
        .query_row(
            "SELECT ac.id, ac.grade_type, ac.passing_grade, ac.average_formula,
                    ac.rounding_precision, ac.recovery_enabled, ac.recovery_replaces
             FROM assessment_configs ac
             JOIN class_groups cg
               ON cg.school_id = ac.school_id
              AND cg.academic_year_id = ac.academic_year_id
              AND cg.grade_level = ac.grade_level
             WHERE cg.id = ?",
            [class_group_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let Some((id, grade_type, passing_grade, formula, precision, recovery_enabled, replaces)) = row
    else {
        return Err(CalcError::new(
            "not_found",
            "no assessment config for this class group's grade level",
        ));
    };

    let grade_type = GradeType::parse(&grade_type)
        .ok_or_else(|| CalcError::new("db_query_failed", "bad grade_type in config"))?;
    let formula = AverageFormula::parse(&formula)
        .ok_or_else(|| CalcError::new("db_query_failed", "bad average_formula in config"))?;
    let replaces = RecoveryReplaces::parse(&replaces)
        .ok_or_else(|| CalcError::new("db_query_failed", "bad recovery_replaces in config"))?;

    Ok(ConfigRow {
        id,
        grade_type,
        passing_grade,
        formula,
        rounding_precision: precision.clamp(0, 6) as u32,
        recovery_enabled: recovery_enabled != 0,
        recovery_replaces: replaces,
    })
}

/// Resolve a student's period average straight from persisted grades.
///
/// Conceptual grades participate through their ordinal points; the passing
/// grade is then read on the same 1-5 scale.
pub fn student_period_average(ctx: &AverageContext<'_>) -> Result<StudentAverageModel, CalcError> {
    let conn = ctx.conn;
    let config = load_config_for_class_group(conn, ctx.class_group_id)?;

    let mut weights: HashMap<String, f64> = HashMap::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT id, COALESCE(weight, 1.0)
                 FROM assessment_instruments
                 WHERE assessment_config_id = ?",
            )
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        let rows = stmt
            .query_map([&config.id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        for (id, w) in rows {
            weights.insert(id, w);
        }
    }

    let mut originals: HashMap<String, f64> = HashMap::new();
    let mut recoveries: HashMap<String, f64> = HashMap::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT assessment_instrument_id, numeric_value, conceptual_value, is_recovery
                 FROM grades
                 WHERE student_id = ?
                   AND class_group_id = ?
                   AND teacher_assignment_id = ?
                   AND assessment_period_id = ?",
            )
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        let rows = stmt
            .query_map(
                (
                    ctx.student_id,
                    ctx.class_group_id,
                    ctx.teacher_assignment_id,
                    ctx.assessment_period_id,
                ),
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, Option<f64>>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, i64>(3)? != 0,
                    ))
                },
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

        for (instrument_id, numeric, conceptual, is_recovery) in rows {
            if !weights.contains_key(&instrument_id) {
                continue;
            }
            let value = match config.grade_type {
                GradeType::Numeric => numeric,
                GradeType::Conceptual => conceptual.as_deref().and_then(conceptual_ordinal),
            };
            let Some(value) = value else {
                continue;
            };
            if is_recovery {
                recoveries.insert(instrument_id, value);
            } else {
                originals.insert(instrument_id, value);
            }
        }
    }

    let mut grades: Vec<InstrumentGrades> = originals
        .into_iter()
        .map(|(instrument_id, original)| InstrumentGrades {
            weight: weights.get(&instrument_id).copied().unwrap_or(1.0),
            recovery: recoveries.get(&instrument_id).copied(),
            instrument_id,
            original,
        })
        .collect();
    grades.sort_by(|a, b| a.instrument_id.cmp(&b.instrument_id));

    let policy = AveragePolicy {
        formula: config.formula,
        passing_grade: config.passing_grade,
        rounding_precision: config.rounding_precision,
        recovery_enabled: config.recovery_enabled,
        recovery_replaces: config.recovery_replaces,
    };
    let average = period_average(&grades, &policy);
    let passed = average.average.map(|a| a >= config.passing_grade);

    Ok(StudentAverageModel {
        student_id: ctx.student_id.to_string(),
        assessment_period_id: ctx.assessment_period_id.to_string(),
        formula: config.formula.as_str().to_string(),
        passing_grade: config.passing_grade,
        average,
        passed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::AttendanceStatus::*;

    fn policy(
        formula: AverageFormula,
        passing: f64,
        recovery_enabled: bool,
        replaces: RecoveryReplaces,
    ) -> AveragePolicy {
        AveragePolicy {
            formula,
            passing_grade: passing,
            rounding_precision: 1,
            recovery_enabled,
            recovery_replaces: replaces,
        }
    }

    fn grade(id: &str, weight: f64, original: f64, recovery: Option<f64>) -> InstrumentGrades {
        InstrumentGrades {
            instrument_id: id.to_string(),
            weight,
            original,
            recovery,
        }
    }

    #[test]
    fn round_half_up_at_configured_precision() {
        assert_eq!(round_half_up(7.25, 1), 7.3);
        assert_eq!(round_half_up(7.24, 1), 7.2);
        assert_eq!(round_half_up(2.5, 0), 3.0);
        assert_eq!(round_half_up(0.0, 2), 0.0);
    }

    #[test]
    fn arithmetic_average_without_recovery() {
        let p = policy(AverageFormula::Arithmetic, 6.0, false, RecoveryReplaces::Higher);
        let out = period_average(
            &[grade("a", 1.0, 8.0, None), grade("b", 1.0, 6.0, None)],
            &p,
        );
        assert_eq!(out.average, Some(7.0));
        assert_eq!(out.recovered_instruments, 0);
    }

    #[test]
    fn weighted_average_scales_by_instrument_weight() {
        let p = policy(AverageFormula::Weighted, 6.0, false, RecoveryReplaces::Higher);
        let out = period_average(
            &[grade("a", 3.0, 10.0, None), grade("b", 1.0, 2.0, None)],
            &p,
        );
        // (10*3 + 2*1) / 4 = 8.0
        assert_eq!(out.average, Some(8.0));
    }

    #[test]
    fn recovery_higher_takes_the_max() {
        let p = policy(AverageFormula::Arithmetic, 6.0, true, RecoveryReplaces::Higher);
        let out = period_average(&[grade("a", 1.0, 4.0, Some(7.0))], &p);
        assert_eq!(out.average, Some(7.0));
        assert_eq!(out.recovered_instruments, 1);
        assert!(out.per_instrument[0].recovered);
    }

    #[test]
    fn recovery_higher_keeps_original_when_recovery_is_worse() {
        let p = policy(AverageFormula::Arithmetic, 6.0, true, RecoveryReplaces::Higher);
        let out = period_average(&[grade("a", 1.0, 5.0, Some(3.0))], &p);
        assert_eq!(out.average, Some(5.0));
        // Substitution still happened; `higher` just resolved to the original.
        assert_eq!(out.recovered_instruments, 1);
    }

    #[test]
    fn recovery_average_blends_the_pair() {
        let p = policy(AverageFormula::Arithmetic, 6.0, true, RecoveryReplaces::Average);
        let out = period_average(&[grade("a", 1.0, 4.0, Some(8.0))], &p);
        assert_eq!(out.average, Some(6.0));
    }

    #[test]
    fn recovery_last_is_unconditional() {
        let p = policy(AverageFormula::Arithmetic, 6.0, true, RecoveryReplaces::Last);
        let out = period_average(&[grade("a", 1.0, 4.0, Some(3.0))], &p);
        assert_eq!(out.average, Some(3.0));
    }

    #[test]
    fn recovery_skipped_at_or_above_passing() {
        let p = policy(AverageFormula::Arithmetic, 6.0, true, RecoveryReplaces::Last);
        let out = period_average(&[grade("a", 1.0, 6.0, Some(10.0))], &p);
        assert_eq!(out.average, Some(6.0));
        assert_eq!(out.recovered_instruments, 0);
    }

    #[test]
    fn recovery_skipped_when_disabled() {
        let p = policy(AverageFormula::Arithmetic, 6.0, false, RecoveryReplaces::Last);
        let out = period_average(&[grade("a", 1.0, 2.0, Some(9.0))], &p);
        assert_eq!(out.average, Some(2.0));
    }

    #[test]
    fn no_grades_means_no_average() {
        let p = policy(AverageFormula::Arithmetic, 6.0, true, RecoveryReplaces::Higher);
        let out = period_average(&[], &p);
        assert_eq!(out.average, None);
        assert_eq!(out.graded_instruments, 0);
    }

    #[test]
    fn frequency_with_no_records_defaults_to_100() {
        let out = frequency_summary([]);
        assert_eq!(out.total, 0);
        assert_eq!(out.present, 0);
        assert_eq!(out.absent, 0);
        assert_eq!(out.frequency_percentage, 100.0);
    }

    #[test]
    fn frequency_counts_justified_and_excused_as_present() {
        let statuses = [
            Present, Present, Present, Present, Present, Present, Present, Absent,
            JustifiedAbsence, Excused,
        ];
        let out = frequency_summary(statuses);
        assert_eq!(out.total, 10);
        assert_eq!(out.present, 7);
        assert_eq!(out.absent, 1);
        assert_eq!(out.justified, 1);
        assert_eq!(out.excused, 1);
        assert_eq!(out.frequency_percentage, 90.0);
    }

    #[test]
    fn leading_absent_run_stops_at_first_non_absent() {
        assert_eq!(leading_absent_run(&[Absent, Absent, Present, Absent]), 2);
        assert_eq!(leading_absent_run(&[Present, Absent, Absent]), 0);
        assert_eq!(leading_absent_run(&[Absent; 5]), 5);
        assert_eq!(leading_absent_run(&[]), 0);
    }

    #[test]
    fn conceptual_ordinal_scale() {
        assert_eq!(conceptual_ordinal("A"), Some(5.0));
        assert_eq!(conceptual_ordinal(" b "), Some(4.0));
        assert_eq!(conceptual_ordinal("E"), Some(1.0));
        assert_eq!(conceptual_ordinal("F"), None);
    }
}
