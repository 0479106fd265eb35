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

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn result_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get("result")
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing result.{}", key))
        .to_string()
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("campus-router-smoke");
    let bundle_out = workspace.join("smoke-backup.campusbundle.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let school = request(
        &mut stdin,
        &mut reader,
        "3",
        "schools.create",
        json!({ "name": "Smoke Municipal School" }),
    );
    let school_id = result_str(&school, "schoolId");
    let _ = request(&mut stdin, &mut reader, "4", "schools.list", json!({}));

    let year = request(
        &mut stdin,
        &mut reader,
        "5",
        "years.create",
        json!({ "schoolId": school_id, "year": 2026 }),
    );
    let year_id = result_str(&year, "yearId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "years.list",
        json!({ "schoolId": school_id }),
    );

    let period = request(
        &mut stdin,
        &mut reader,
        "7",
        "periods.create",
        json!({
            "yearId": year_id,
            "periodType": "bimestral",
            "number": 1,
            "startDate": "2026-02-01",
            "endDate": "2026-04-10"
        }),
    );
    let period_id = result_str(&period, "periodId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "periods.list",
        json!({ "yearId": year_id }),
    );

    let class_group = request(
        &mut stdin,
        &mut reader,
        "9",
        "classGroups.create",
        json!({
            "schoolId": school_id,
            "yearId": year_id,
            "name": "5A",
            "gradeLevel": "5"
        }),
    );
    let class_group_id = result_str(&class_group, "classGroupId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "classGroups.list",
        json!({ "yearId": year_id }),
    );

    let assignment = request(
        &mut stdin,
        &mut reader,
        "11",
        "teacherAssignments.create",
        json!({
            "classGroupId": class_group_id,
            "teacherName": "Silva",
            "subject": "Mathematics"
        }),
    );
    let assignment_id = result_str(&assignment, "teacherAssignmentId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "teacherAssignments.list",
        json!({ "classGroupId": class_group_id }),
    );

    let student = request(
        &mut stdin,
        &mut reader,
        "13",
        "students.create",
        json!({ "lastName": "Smoke", "firstName": "Student" }),
    );
    let student_id = result_str(&student, "studentId");
    let _ = request(&mut stdin, &mut reader, "14", "students.list", json!({}));

    let enrollment = request(
        &mut stdin,
        &mut reader,
        "15",
        "enrollments.create",
        json!({
            "studentId": student_id,
            "schoolId": school_id,
            "yearId": year_id,
            "classGroupId": class_group_id,
            "actorId": "secretary"
        }),
    );
    let enrollment_id = result_str(&enrollment, "enrollmentId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "enrollments.list",
        json!({ "classGroupId": class_group_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16b",
        "enrollments.movements",
        json!({ "enrollmentId": enrollment_id }),
    );

    let config = request(
        &mut stdin,
        &mut reader,
        "17",
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
    let config_id = result_str(&config, "configId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "assessmentConfigs.get",
        json!({ "schoolId": school_id, "yearId": year_id, "gradeLevel": "5" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "instruments.create",
        json!({ "configId": config_id, "name": "Written test", "weight": 2.0 }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "20",
        "instruments.list",
        json!({ "configId": config_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "grades.list",
        json!({
            "classGroupId": class_group_id,
            "teacherAssignmentId": assignment_id,
            "periodId": period_id
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "calc.studentAverage",
        json!({
            "studentId": student_id,
            "classGroupId": class_group_id,
            "teacherAssignmentId": assignment_id,
            "periodId": period_id
        }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "attendance.upsert",
        json!({
            "classGroupId": class_group_id,
            "teacherAssignmentId": assignment_id,
            "studentId": student_id,
            "date": "2026-02-02",
            "status": "present"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "24",
        "attendance.frequency",
        json!({ "studentId": student_id, "classGroupId": class_group_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "attendance.alerts",
        json!({
            "studentId": student_id,
            "classGroupId": class_group_id,
            "schoolId": school_id,
            "yearId": year_id
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "26",
        "justifications.list",
        json!({ "studentId": student_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "27",
        "lessons.create",
        json!({
            "classGroupId": class_group_id,
            "teacherAssignmentId": assignment_id,
            "date": "2026-02-02",
            "content": "Fractions"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "28",
        "lessons.list",
        json!({ "classGroupId": class_group_id, "teacherAssignmentId": assignment_id }),
    );

    let closing = request(
        &mut stdin,
        &mut reader,
        "29",
        "closings.open",
        json!({
            "classGroupId": class_group_id,
            "teacherAssignmentId": assignment_id,
            "periodId": period_id
        }),
    );
    let closing_id = result_str(&closing, "closingId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "30",
        "closings.get",
        json!({ "closingId": closing_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "31",
        "closings.list",
        json!({ "periodId": period_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "32",
        "rectifications.list",
        json!({ "closingId": closing_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "33",
        "finalResults.set",
        json!({
            "studentId": student_id,
            "classGroupId": class_group_id,
            "yearId": year_id,
            "result": "approved",
            "overallAverage": 7.5,
            "overallFrequency": 96.0,
            "actorId": "council"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "34",
        "finalResults.list",
        json!({ "classGroupId": class_group_id, "yearId": year_id }),
    );

    let _ = request(&mut stdin, &mut reader, "35", "audit.list", json!({}));

    let _ = request(
        &mut stdin,
        &mut reader,
        "36",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "37",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
