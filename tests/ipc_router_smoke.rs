use rust_decimal::Decimal;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::str::FromStr;
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
    let exe = env!("CARGO_BIN_EXE_tuitiond");
    let mut child = Command::new(exe)
        .env_remove("TUITIOND_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn tuitiond");
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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> String {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false), "{}", value);
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn dec(v: &serde_json::Value) -> Decimal {
    let s = v.as_str().unwrap_or_else(|| panic!("expected decimal string, got {}", v));
    Decimal::from_str(s).expect("decimal")
}

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).expect("decimal literal")
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

fn assert_known(value: &serde_json::Value, method: &str) {
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
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("tuition-router-smoke");
    let restored = temp_dir("tuition-router-restored");
    let bundle_out = workspace.join("smoke-backup.tuition.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["workspacePath"], serde_json::Value::Null);
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let year = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "schoolYears.create",
        json!({ "name": "Smoke Year" }),
    );
    let school_year_id = str_field(&year, "schoolYearId");
    let tt = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "billing.createTuitionType",
        json!({ "name": "Smoke", "baseAmount": 400 }),
    );
    let tuition_type_id = str_field(&tt, "tuitionTypeId");
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({
            "schoolYearId": school_year_id,
            "lastName": "Smoke",
            "firstName": "Student",
            "tuitionTypeId": tuition_type_id
        }),
    );
    let student_id = str_field(&student, "studentId");
    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "billing.bulkCreate",
        json!({ "schoolYearId": school_year_id, "billingMonth": 3, "billingYear": 2026 }),
    );
    let record_id = bulk["recordIds"][0].as_str().expect("recordId").to_string();

    let calls: Vec<(&str, serde_json::Value)> = vec![
        ("schoolYears.list", json!({})),
        ("students.list", json!({ "schoolYearId": school_year_id })),
        (
            "students.update",
            json!({ "studentId": student_id, "patch": { "firstName": "Updated" } }),
        ),
        ("billing.getTuitionConfig", json!({})),
        ("billing.updateTuitionConfig", json!({ "patch": { "graceDays": 2 } })),
        ("billing.getTuitionTypes", json!({})),
        (
            "billing.updateTuitionType",
            json!({ "tuitionTypeId": tuition_type_id, "patch": { "name": "Smoke Renamed" } }),
        ),
        ("billing.deleteTuitionType", json!({ "tuitionTypeId": tuition_type_id })),
        (
            "billing.create",
            json!({ "studentId": student_id, "billingMonth": 4, "billingYear": 2026 }),
        ),
        ("billing.list", json!({})),
        ("billing.get", json!({ "recordId": record_id })),
        (
            "billing.update",
            json!({ "recordId": record_id, "patch": { "extraCharges": [{ "amount": 15 }] } }),
        ),
        ("billing.recordPayment", json!({ "recordId": record_id, "amount": 100 })),
        ("billing.payments", json!({ "recordId": record_id })),
        ("billing.refreshStatuses", json!({ "asOf": "2026-05-01" })),
        ("billing.summary", json!({ "billingMonth": 3, "billingYear": 2026 })),
        ("billing.lock", json!({ "recordIds": [record_id] })),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let resp = request(&mut stdin, &mut reader, &format!("c{}", i), method, params);
        assert_known(&resp, method);
    }

    let unknown = request(&mut stdin, &mut reader, "7", "billing.explode", json!({}));
    assert_eq!(error_code(&unknown), "not_implemented");

    let export = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "workspace.exportBackup",
        json!({ "outPath": bundle_out.to_string_lossy() }),
    );
    assert_eq!(export["bundleFormat"], json!("tuition-workspace-v1"));
    assert_eq!(export["dbSha256"].as_str().map(|s| s.len()), Some(64));

    let import = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "workspace.importBackup",
        json!({
            "inPath": bundle_out.to_string_lossy(),
            "workspacePath": restored.to_string_lossy()
        }),
    );
    assert_eq!(import["bundleFormatDetected"], json!("tuition-workspace-v1"));

    let health = request_ok(&mut stdin, &mut reader, "10", "health", json!({}));
    assert_eq!(
        health["workspacePath"].as_str(),
        Some(restored.to_string_lossy().as_ref())
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "billing.get",
        json!({ "recordId": record_id }),
    );
    assert_eq!(got["record"]["isLocked"], json!(true));
    assert_eq!(dec(&got["record"]["paidAmount"]), d("100"));
    assert_eq!(dec(&got["record"]["finalAmount"]), d("415"));

    let missing = request(
        &mut stdin,
        &mut reader,
        "12",
        "workspace.importBackup",
        json!({ "inPath": workspace.join("nope.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(restored);
}

#[test]
fn malformed_line_gets_bad_json_reply() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(value["ok"], json!(false));
    assert_eq!(value["error"]["code"], json!("bad_json"));

    // The sidecar keeps serving after a bad line.
    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health["version"].is_string());

    drop(stdin);
    let _ = child.wait();
}
