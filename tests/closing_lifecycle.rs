use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn raw_request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = raw_request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = raw_request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error body")
}

struct Fixture {
    period_id: String,
    class_group_id: String,
    assignment_id: String,
    student_ids: Vec<String>,
    instrument_ids: Vec<String>,
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {}", key))
        .to_string()
}

fn setup_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student_count: usize,
    instrument_count: usize,
) -> Fixture {
    let school = request_ok(
        stdin,
        reader,
        "s1",
        "schools.create",
        json!({ "name": "Lifecycle School" }),
    );
    let school_id = str_field(&school, "schoolId");

    let year = request_ok(
        stdin,
        reader,
        "s2",
        "years.create",
        json!({ "schoolId": school_id, "year": 2026 }),
    );
    let year_id = str_field(&year, "yearId");

    let period = request_ok(
        stdin,
        reader,
        "s3",
        "periods.create",
        json!({
            "yearId": year_id,
            "periodType": "bimestral",
            "number": 1,
            "startDate": "2026-02-01",
            "endDate": "2026-04-10"
        }),
    );
    let period_id = str_field(&period, "periodId");

    let class_group = request_ok(
        stdin,
        reader,
        "s4",
        "classGroups.create",
        json!({
            "schoolId": school_id,
            "yearId": year_id,
            "name": "5A",
            "gradeLevel": "5"
        }),
    );
    let class_group_id = str_field(&class_group, "classGroupId");

    let assignment = request_ok(
        stdin,
        reader,
        "s5",
        "teacherAssignments.create",
        json!({
            "classGroupId": class_group_id,
            "teacherName": "Silva",
            "subject": "Mathematics"
        }),
    );
    let assignment_id = str_field(&assignment, "teacherAssignmentId");

    let mut student_ids = Vec::new();
    for i in 0..student_count {
        let student = request_ok(
            stdin,
            reader,
            &format!("s6-{i}"),
            "students.create",
            json!({ "lastName": "Student", "firstName": format!("Number{i}") }),
        );
        let student_id = str_field(&student, "studentId");
        request_ok(
            stdin,
            reader,
            &format!("s7-{i}"),
            "enrollments.create",
            json!({
                "studentId": student_id,
                "schoolId": school_id,
                "yearId": year_id,
                "classGroupId": class_group_id,
                "actorId": "secretary"
            }),
        );
        student_ids.push(student_id);
    }

    let config = request_ok(
        stdin,
        reader,
        "s8",
        "assessmentConfigs.set",
        json!({
            "schoolId": school_id,
            "yearId": year_id,
            "gradeLevel": "5",
            "gradeType": "numeric",
            "scaleMin": 0.0,
            "scaleMax": 10.0,
            "passingGrade": 6.0,
            "averageFormula": "arithmetic",
            "roundingPrecision": 1,
            "recoveryEnabled": true,
            "recoveryReplaces": "higher"
        }),
    );
    let config_id = str_field(&config, "configId");

    let mut instrument_ids = Vec::new();
    for i in 0..instrument_count {
        let instrument = request_ok(
            stdin,
            reader,
            &format!("s9-{i}"),
            "instruments.create",
            json!({ "configId": config_id, "name": format!("Instrument {i}"), "sortOrder": i }),
        );
        instrument_ids.push(str_field(&instrument, "instrumentId"));
    }

    Fixture {
        period_id,
        class_group_id,
        assignment_id,
        student_ids,
        instrument_ids,
    }
}

#[test]
fn closing_walks_the_full_lattice_with_completeness_gating() {
    let workspace = temp_dir("campus-closing-lifecycle");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let fx = setup_class(&mut stdin, &mut reader, 2, 2);

    let closing = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "closings.open",
        json!({
            "classGroupId": fx.class_group_id,
            "teacherAssignmentId": fx.assignment_id,
            "periodId": fx.period_id
        }),
    );
    let closing_id = str_field(&closing, "closingId");
    assert_eq!(closing.get("status").and_then(|v| v.as_str()), Some("pending"));

    // Nothing recorded yet: submission is refused and all three flags are
    // persisted as false.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "closings.submit",
        json!({ "closingId": closing_id, "actorId": "teacher-1" }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("incomplete"));
    let missing: Vec<String> = error
        .get("details")
        .and_then(|d| d.get("missing"))
        .and_then(|m| m.as_array())
        .expect("missing list")
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    assert_eq!(missing, vec!["grades", "attendance", "lesson_records"]);

    let row = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "closings.get",
        json!({ "closingId": closing_id }),
    );
    assert_eq!(row.get("status").and_then(|v| v.as_str()), Some("pending"));
    assert_eq!(row.get("gradesComplete").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        row.get("attendanceComplete").and_then(|v| v.as_bool()),
        Some(false)
    );

    // Fill the full grid plus one attendance date and one lesson record.
    let mut entries = Vec::new();
    for student_id in &fx.student_ids {
        for instrument_id in &fx.instrument_ids {
            entries.push(json!({
                "studentId": student_id,
                "instrumentId": instrument_id,
                "numericValue": 7.0
            }));
        }
    }
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.bulkUpsert",
        json!({
            "classGroupId": fx.class_group_id,
            "teacherAssignmentId": fx.assignment_id,
            "periodId": fx.period_id,
            "entries": entries
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.upsert",
        json!({
            "classGroupId": fx.class_group_id,
            "teacherAssignmentId": fx.assignment_id,
            "studentId": fx.student_ids[0],
            "date": "2026-03-02",
            "status": "present"
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "lessons.create",
        json!({
            "classGroupId": fx.class_group_id,
            "teacherAssignmentId": fx.assignment_id,
            "date": "2026-03-02",
            "content": "Decimals"
        }),
    );

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "closings.submit",
        json!({
            "closingId": closing_id,
            "actorId": "teacher-1",
            "at": "2026-04-11T09:00:00Z"
        }),
    );
    assert_eq!(
        submitted.get("status").and_then(|v| v.as_str()),
        Some("in_validation")
    );
    assert_eq!(
        submitted.get("gradesComplete").and_then(|v| v.as_bool()),
        Some(true)
    );

    // Reject back to pending, then resubmit.
    let rejected = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "closings.reject",
        json!({
            "closingId": closing_id,
            "actorId": "coordinator",
            "reason": "grade for instrument 2 looks wrong"
        }),
    );
    assert_eq!(rejected.get("status").and_then(|v| v.as_str()), Some("pending"));

    let row = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "closings.get",
        json!({ "closingId": closing_id }),
    );
    assert_eq!(
        row.get("rejectionReason").and_then(|v| v.as_str()),
        Some("grade for instrument 2 looks wrong")
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "closings.submit",
        json!({ "closingId": closing_id, "actorId": "teacher-1" }),
    );
    let row = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "closings.get",
        json!({ "closingId": closing_id }),
    );
    assert!(row.get("rejectionReason").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        row.get("submittedBy").and_then(|v| v.as_str()),
        Some("teacher-1")
    );

    // Validation cannot jump straight to closed.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "12",
        "closings.finalize",
        json!({ "closingId": closing_id, "actorId": "director" }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("invalid_transition")
    );

    let validated = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "closings.validate",
        json!({ "closingId": closing_id, "actorId": "coordinator" }),
    );
    assert_eq!(
        validated.get("status").and_then(|v| v.as_str()),
        Some("approved")
    );

    let finalized = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "closings.finalize",
        json!({ "closingId": closing_id, "actorId": "director" }),
    );
    assert_eq!(finalized.get("status").and_then(|v| v.as_str()), Some("closed"));

    let row = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "closings.get",
        json!({ "closingId": closing_id }),
    );
    assert_eq!(
        row.get("validatedBy").and_then(|v| v.as_str()),
        Some("coordinator")
    );
    assert_eq!(
        row.get("approvedBy").and_then(|v| v.as_str()),
        Some("director")
    );

    // Closed is terminal for every operation.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "16",
        "closings.submit",
        json!({ "closingId": closing_id, "actorId": "teacher-1" }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("invalid_transition")
    );
    let error = request_err(
        &mut stdin,
        &mut reader,
        "17",
        "closings.finalize",
        json!({ "closingId": closing_id, "actorId": "director" }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("invalid_transition")
    );

    // Rectifications only attach once the closing is closed.
    let rectification = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "rectifications.request",
        json!({
            "closingId": closing_id,
            "entity": "grade",
            "entityId": "some-grade-id",
            "field": "numeric_value",
            "oldValue": "7.0",
            "newValue": "8.0",
            "reason": "transcription mistake",
            "actorId": "teacher-1"
        }),
    );
    let rectification_id = str_field(&rectification, "rectificationId");

    let decided = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "rectifications.decide",
        json!({
            "rectificationId": rectification_id,
            "approve": true,
            "actorId": "director"
        }),
    );
    assert_eq!(decided.get("status").and_then(|v| v.as_str()), Some("approved"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "20",
        "rectifications.decide",
        json!({
            "rectificationId": rectification_id,
            "approve": false,
            "actorId": "director"
        }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("invalid_transition")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn submit_persists_partial_flags_and_names_only_missing_areas() {
    let workspace = temp_dir("campus-closing-partial");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let fx = setup_class(&mut stdin, &mut reader, 1, 1);

    let closing = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "closings.open",
        json!({
            "classGroupId": fx.class_group_id,
            "teacherAssignmentId": fx.assignment_id,
            "periodId": fx.period_id
        }),
    );
    let closing_id = str_field(&closing, "closingId");

    // Attendance and lessons recorded, grade grid untouched.
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.upsert",
        json!({
            "classGroupId": fx.class_group_id,
            "teacherAssignmentId": fx.assignment_id,
            "studentId": fx.student_ids[0],
            "date": "2026-02-10",
            "status": "present"
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "lessons.create",
        json!({
            "classGroupId": fx.class_group_id,
            "teacherAssignmentId": fx.assignment_id,
            "date": "2026-02-10",
            "content": "Reading"
        }),
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "closings.submit",
        json!({ "closingId": closing_id, "actorId": "teacher-1" }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("incomplete"));
    let missing: Vec<String> = error
        .get("details")
        .and_then(|d| d.get("missing"))
        .and_then(|m| m.as_array())
        .expect("missing list")
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    assert_eq!(missing, vec!["grades"]);

    let row = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "closings.get",
        json!({ "closingId": closing_id }),
    );
    assert_eq!(row.get("gradesComplete").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        row.get("attendanceComplete").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        row.get("lessonRecordsComplete").and_then(|v| v.as_bool()),
        Some(true)
    );

    // A rectification cannot attach to a closing that never closed.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "rectifications.request",
        json!({
            "closingId": closing_id,
            "entity": "grade",
            "entityId": "x",
            "field": "numeric_value",
            "newValue": "9.0",
            "reason": "early request",
            "actorId": "teacher-1"
        }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("validation_failed")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
