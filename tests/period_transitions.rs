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

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {}", key))
        .to_string()
}

fn setup_year(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> String {
    let school = request_ok(
        stdin,
        reader,
        "s1",
        "schools.create",
        json!({ "name": "Period School" }),
    );
    let school_id = str_field(&school, "schoolId");
    let year = request_ok(
        stdin,
        reader,
        "s2",
        "years.create",
        json!({ "schoolId": school_id, "year": 2026 }),
    );
    str_field(&year, "yearId")
}

#[test]
fn period_number_respects_the_type_cap() {
    let workspace = temp_dir("campus-period-caps");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let year_id = setup_year(&mut stdin, &mut reader);

    for (i, (period_type, number)) in
        [("bimestral", 5), ("trimestral", 4), ("semestral", 3), ("bimestral", 0)]
            .iter()
            .enumerate()
    {
        let error = request_err(
            &mut stdin,
            &mut reader,
            &format!("1-{i}"),
            "periods.create",
            json!({
                "yearId": year_id,
                "periodType": period_type,
                "number": number,
                "startDate": "2026-02-01",
                "endDate": "2026-04-10"
            }),
        );
        assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));
        assert_eq!(
            error
                .get("details")
                .and_then(|d| d.get("field"))
                .and_then(|v| v.as_str()),
            Some("number")
        );
    }

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "periods.create",
        json!({
            "yearId": year_id,
            "periodType": "semestral",
            "number": 2,
            "startDate": "2026-07-01",
            "endDate": "2026-12-10"
        }),
    );

    // Same (year, type, number) pair collides at the database.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "periods.create",
        json!({
            "yearId": year_id,
            "periodType": "semestral",
            "number": 2,
            "startDate": "2026-07-02",
            "endDate": "2026-12-11"
        }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("db_insert_failed")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn period_status_walks_only_declared_edges_and_closed_is_immutable() {
    let workspace = temp_dir("campus-period-edges");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let year_id = setup_year(&mut stdin, &mut reader);

    let period = request_ok(
        &mut stdin,
        &mut reader,
        "1",
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

    // Open cannot jump straight to closed.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "periods.transition",
        json!({ "periodId": period_id, "status": "closed", "actorId": "secretary" }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("invalid_transition")
    );
    assert!(error
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .contains("Open"));

    // Open -> Closing -> Open is a legal round trip.
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "periods.transition",
        json!({ "periodId": period_id, "status": "closing", "actorId": "secretary" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "periods.transition",
        json!({ "periodId": period_id, "status": "open", "actorId": "secretary" }),
    );

    // Date edits are allowed while the period is open.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "periods.update",
        json!({ "periodId": period_id, "patch": { "endDate": "2026-04-15" } }),
    );
    assert_eq!(
        updated.get("endDate").and_then(|v| v.as_str()),
        Some("2026-04-15")
    );

    // A number edit above the type cap is refused.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "periods.update",
        json!({ "periodId": period_id, "patch": { "number": 5 } }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "periods.transition",
        json!({ "periodId": period_id, "status": "closing", "actorId": "secretary" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "periods.transition",
        json!({ "periodId": period_id, "status": "closed", "actorId": "secretary" }),
    );

    // Closed rejects transitions and field updates alike.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "periods.transition",
        json!({ "periodId": period_id, "status": "open", "actorId": "secretary" }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("period_closed")
    );
    let error = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "periods.update",
        json!({ "periodId": period_id, "patch": { "endDate": "2026-05-01" } }),
    );
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("period_closed")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
