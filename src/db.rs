use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("campus.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            status TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_academic_years_school ON academic_years(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_periods(
            id TEXT PRIMARY KEY,
            academic_year_id TEXT NOT NULL,
            period_type TEXT NOT NULL,
            number INTEGER NOT NULL,
            status TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(academic_year_id, period_type, number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessment_periods_year ON assessment_periods(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_groups(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            grade_level TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_groups_year ON class_groups(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_assignments(
            id TEXT PRIMARY KEY,
            class_group_id TEXT NOT NULL,
            teacher_name TEXT NOT NULL,
            subject TEXT NOT NULL,
            FOREIGN KEY(class_group_id) REFERENCES class_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_assignments_class ON teacher_assignments(class_group_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            birth_date TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            school_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            class_group_id TEXT NOT NULL,
            enrollment_no TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(class_group_id) REFERENCES class_groups(id),
            UNIQUE(school_id, academic_year_id, sequence)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_class ON enrollments(class_group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_year ON enrollments(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollment_movements(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            from_class_group_id TEXT,
            to_class_group_id TEXT,
            moved_by TEXT NOT NULL,
            moved_at TEXT NOT NULL,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollment_movements_enrollment ON enrollment_movements(enrollment_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_configs(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            grade_level TEXT NOT NULL,
            grade_type TEXT NOT NULL,
            scale_min REAL NOT NULL,
            scale_max REAL NOT NULL,
            passing_grade REAL NOT NULL,
            average_formula TEXT NOT NULL,
            rounding_precision INTEGER NOT NULL,
            recovery_enabled INTEGER NOT NULL,
            recovery_replaces TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(school_id, academic_year_id, grade_level)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_instruments(
            id TEXT PRIMARY KEY,
            assessment_config_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight REAL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(assessment_config_id) REFERENCES assessment_configs(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessment_instruments_config ON assessment_instruments(assessment_config_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_group_id TEXT NOT NULL,
            teacher_assignment_id TEXT NOT NULL,
            assessment_period_id TEXT NOT NULL,
            assessment_instrument_id TEXT NOT NULL,
            numeric_value REAL,
            conceptual_value TEXT,
            is_recovery INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_group_id) REFERENCES class_groups(id),
            FOREIGN KEY(teacher_assignment_id) REFERENCES teacher_assignments(id),
            FOREIGN KEY(assessment_period_id) REFERENCES assessment_periods(id),
            FOREIGN KEY(assessment_instrument_id) REFERENCES assessment_instruments(id),
            UNIQUE(student_id, class_group_id, teacher_assignment_id,
                   assessment_period_id, assessment_instrument_id, is_recovery)
        )",
        [],
    )?;
    ensure_grades_updated_at(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_period ON grades(assessment_period_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            class_group_id TEXT NOT NULL,
            teacher_assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(class_group_id, teacher_assignment_id, student_id, date),
            FOREIGN KEY(class_group_id) REFERENCES class_groups(id),
            FOREIGN KEY(teacher_assignment_id) REFERENCES teacher_assignments(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student ON attendance_records(student_id, class_group_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS absence_justifications(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_group_id TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            reason TEXT,
            approved INTEGER NOT NULL DEFAULT 0,
            approved_by TEXT,
            approved_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_group_id) REFERENCES class_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_absence_justifications_student ON absence_justifications(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_configs(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            consecutive_absences_alert INTEGER NOT NULL,
            monthly_absences_alert INTEGER NOT NULL,
            period_absence_percentage_alert REAL NOT NULL,
            annual_minimum_frequency REAL NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(school_id, academic_year_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lesson_records(
            id TEXT PRIMARY KEY,
            class_group_id TEXT NOT NULL,
            teacher_assignment_id TEXT NOT NULL,
            date TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(class_group_id) REFERENCES class_groups(id),
            FOREIGN KEY(teacher_assignment_id) REFERENCES teacher_assignments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lesson_records_pair ON lesson_records(class_group_id, teacher_assignment_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS period_closings(
            id TEXT PRIMARY KEY,
            class_group_id TEXT NOT NULL,
            teacher_assignment_id TEXT NOT NULL,
            assessment_period_id TEXT NOT NULL,
            status TEXT NOT NULL,
            grades_complete INTEGER NOT NULL DEFAULT 0,
            attendance_complete INTEGER NOT NULL DEFAULT 0,
            lesson_records_complete INTEGER NOT NULL DEFAULT 0,
            submitted_by TEXT,
            submitted_at TEXT,
            validated_by TEXT,
            validated_at TEXT,
            approved_by TEXT,
            approved_at TEXT,
            rejection_reason TEXT,
            FOREIGN KEY(class_group_id) REFERENCES class_groups(id),
            FOREIGN KEY(teacher_assignment_id) REFERENCES teacher_assignments(id),
            FOREIGN KEY(assessment_period_id) REFERENCES assessment_periods(id),
            UNIQUE(class_group_id, teacher_assignment_id, assessment_period_id)
        )",
        [],
    )?;
    ensure_period_closings_rejection_reason(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_period_closings_period ON period_closings(assessment_period_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rectifications(
            id TEXT PRIMARY KEY,
            period_closing_id TEXT NOT NULL,
            entity TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            field TEXT NOT NULL,
            old_value TEXT,
            new_value TEXT NOT NULL,
            reason TEXT NOT NULL,
            status TEXT NOT NULL,
            requested_by TEXT NOT NULL,
            requested_at TEXT NOT NULL,
            decided_by TEXT,
            decided_at TEXT,
            FOREIGN KEY(period_closing_id) REFERENCES period_closings(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_rectifications_closing ON rectifications(period_closing_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS final_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_group_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            result TEXT NOT NULL,
            overall_average REAL,
            overall_frequency REAL,
            council_override INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_group_id) REFERENCES class_groups(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(student_id, class_group_id, academic_year_id)
        )",
        [],
    )?;
    ensure_final_results_council_override(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_final_results_year ON final_results(academic_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            id TEXT PRIMARY KEY,
            entity TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL,
            actor TEXT NOT NULL,
            at TEXT NOT NULL,
            before_json TEXT,
            after_json TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_entity ON audit_log(entity, entity_id)",
        [],
    )?;

    Ok(())
}

/// Append-only audit row. Called explicitly at the use-case boundary; the
/// before/after snapshots are whatever the caller considers the mutated
/// attributes, not a whole-row diff.
pub fn audit_write(
    conn: &Connection,
    entity: &str,
    entity_id: &str,
    action: &str,
    actor: &str,
    at: &str,
    before: Option<&serde_json::Value>,
    after: Option<&serde_json::Value>,
) -> rusqlite::Result<()> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO audit_log(id, entity, entity_id, action, actor, at, before_json, after_json)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            entity,
            entity_id,
            action,
            actor,
            at,
            before.map(|v| v.to_string()),
            after.map(|v| v.to_string()),
        ),
    )?;
    Ok(())
}

fn ensure_grades_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grades", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE grades ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn ensure_period_closings_rejection_reason(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "period_closings", "rejection_reason")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE period_closings ADD COLUMN rejection_reason TEXT",
        [],
    )?;
    Ok(())
}

fn ensure_final_results_council_override(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "final_results", "council_override")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE final_results ADD COLUMN council_override INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
