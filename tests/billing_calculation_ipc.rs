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

fn setup_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
    tuition_type: serde_json::Value,
    scholarship: &str,
) -> (String, String) {
    request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let year = request_ok(
        stdin,
        reader,
        "s2",
        "schoolYears.create",
        json!({ "name": "2025-2026", "startDate": "2025-08-25", "endDate": "2026-06-30" }),
    );
    let school_year_id = str_field(&year, "schoolYearId");
    let tt = request_ok(stdin, reader, "s3", "billing.createTuitionType", tuition_type);
    let tuition_type_id = str_field(&tt, "tuitionTypeId");
    request_ok(
        stdin,
        reader,
        "s4",
        "students.create",
        json!({
            "schoolYearId": school_year_id,
            "lastName": "Rivera",
            "firstName": "Ana",
            "tuitionTypeId": tuition_type_id,
            "scholarshipAmount": scholarship
        }),
    );
    let bulk = request_ok(
        stdin,
        reader,
        "s5",
        "billing.bulkCreate",
        json!({ "schoolYearId": school_year_id, "billingMonth": 9, "billingYear": 2025 }),
    );
    assert_eq!(bulk.get("created").and_then(|v| v.as_u64()), Some(1));
    let record_id = bulk
        .get("recordIds")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
        .expect("recordId")
        .to_string();
    (school_year_id, record_id)
}

#[test]
fn late_fee_discount_and_extra_charge_add_up() {
    let workspace = temp_dir("tuition-calc-mixed");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_, record_id) = setup_student(
        &mut stdin,
        &mut reader,
        &workspace,
        json!({
            "name": "Monthly",
            "baseAmount": 1000,
            "lateFeeType": "fixed",
            "lateFeeValue": 20
        }),
        "100",
    );

    let got = request_ok(&mut stdin, &mut reader, "1", "billing.get", json!({ "recordId": record_id }));
    let rec = &got["record"];
    assert_eq!(dec(&rec["effectiveTuitionAmount"]), d("1000"));
    assert_eq!(dec(&rec["scholarshipAmount"]), d("100"));
    assert_eq!(dec(&rec["finalAmount"]), d("900"));
    assert_eq!(rec["paymentStatus"], json!("pending"));
    assert_eq!(rec["dueDate"], json!("2025-09-10"));
    assert_eq!(rec["paidAmount"], serde_json::Value::Null);
    assert_eq!(dec(&rec["remainingAmount"]), d("900"));

    let on_due = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "billing.refreshStatuses",
        json!({ "asOf": "2025-09-10" }),
    );
    assert_eq!(on_due["delayed"], json!(0));
    let late = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "billing.refreshStatuses",
        json!({ "asOf": "2025-09-11" }),
    );
    assert_eq!(late["delayed"], json!(1));

    let got = request_ok(&mut stdin, &mut reader, "4", "billing.get", json!({ "recordId": record_id }));
    assert_eq!(got["record"]["paymentStatus"], json!("delayed"));
    assert_eq!(dec(&got["record"]["lateFeeAmount"]), d("20"));
    assert_eq!(dec(&got["record"]["finalAmount"]), d("920"));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "billing.update",
        json!({
            "recordId": record_id,
            "patch": {
                "discountAdjustments": [{ "type": "fixed", "value": 50, "description": "Sibling" }],
                "extraCharges": [{ "amount": 75, "description": "Field trip" }]
            }
        }),
    );
    assert_eq!(dec(&updated["breakdown"]["discountTotal"]), d("50"));
    assert_eq!(dec(&updated["breakdown"]["extraTotal"]), d("75"));
    assert_eq!(dec(&updated["breakdown"]["lateFee"]), d("20"));
    assert_eq!(dec(&updated["record"]["finalAmount"]), d("945"));
    assert_eq!(dec(&updated["record"]["remainingAmount"]), d("945"));
    assert_eq!(updated["record"]["paymentStatus"], json!("delayed"));
    assert_eq!(
        updated["record"]["extraCharges"][0]["description"],
        json!("Field trip")
    );

    // A second refresh leaves already-delayed records alone.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "billing.refreshStatuses",
        json!({ "asOf": "2025-12-01" }),
    );
    assert_eq!(again["delayed"], json!(0));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn percentage_discount_follows_tuition_changes() {
    let workspace = temp_dir("tuition-calc-percentage");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_, record_id) = setup_student(
        &mut stdin,
        &mut reader,
        &workspace,
        json!({ "name": "Standard", "baseAmount": "1000" }),
        "0",
    );

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "billing.update",
        json!({
            "recordId": record_id,
            "patch": { "discountAdjustments": [{ "type": "percentage", "value": 10 }] }
        }),
    );
    assert_eq!(dec(&updated["breakdown"]["discountBase"]), d("1000"));
    assert_eq!(dec(&updated["breakdown"]["discountTotal"]), d("100"));
    assert_eq!(dec(&updated["record"]["finalAmount"]), d("900"));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "billing.update",
        json!({
            "recordId": record_id,
            "patch": { "effectiveTuitionAmount": 1200, "scholarshipAmount": "200" }
        }),
    );
    // 10% of (1200 - 200)
    assert_eq!(dec(&updated["breakdown"]["discountTotal"]), d("100"));
    assert_eq!(dec(&updated["record"]["finalAmount"]), d("900"));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "billing.update",
        json!({ "recordId": record_id, "patch": { "scholarshipAmount": 0 } }),
    );
    assert_eq!(dec(&updated["breakdown"]["discountTotal"]), d("120"));
    assert_eq!(dec(&updated["record"]["finalAmount"]), d("1080"));

    let a = request_ok(&mut stdin, &mut reader, "4", "billing.get", json!({ "recordId": record_id }));
    let b = request_ok(&mut stdin, &mut reader, "5", "billing.get", json!({ "recordId": record_id }));
    assert_eq!(a, b);

    // Percentage lines keep full precision; no cent rounding.
    let exact = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "billing.update",
        json!({ "recordId": record_id, "patch": { "effectiveTuitionAmount": "333.33" } }),
    );
    assert_eq!(dec(&exact["breakdown"]["discountTotal"]), d("33.333"));
    assert_eq!(dec(&exact["record"]["finalAmount"]), d("299.997"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn percentage_late_fee_uses_effective_tuition() {
    let workspace = temp_dir("tuition-calc-late-pct");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_, record_id) = setup_student(
        &mut stdin,
        &mut reader,
        &workspace,
        json!({
            "name": "Late Percent",
            "baseAmount": 800,
            "lateFeeType": "percentage",
            "lateFeeValue": 2.5
        }),
        "0",
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "billing.updateTuitionConfig",
        json!({ "patch": { "graceDays": 5 } }),
    );
    let within_grace = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "billing.refreshStatuses",
        json!({ "asOf": "2025-09-15" }),
    );
    assert_eq!(within_grace["delayed"], json!(0));
    let after_grace = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "billing.refreshStatuses",
        json!({ "asOf": "2025-09-16" }),
    );
    assert_eq!(after_grace["delayed"], json!(1));

    let got = request_ok(&mut stdin, &mut reader, "4", "billing.get", json!({ "recordId": record_id }));
    assert_eq!(dec(&got["record"]["lateFeeAmount"]), d("20"));
    assert_eq!(dec(&got["record"]["finalAmount"]), d("820"));

    let _ = std::fs::remove_dir_all(workspace);
}
