use crate::calc::{
    self, BillingBreakdown, BillingInputs, DiscountAdjustment, ExtraCharge, PaymentStatus,
};
use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::school_years::school_year_exists;
use crate::ipc::handlers::students::{list_students_for_year, load_student, BillingStudent};
use crate::ipc::handlers::tuition::{load_tuition_config, load_tuition_type, TuitionConfig};
use crate::ipc::helpers::{
    get_opt_date, get_opt_i64, get_opt_str, get_patch, get_required_decimal, get_required_i64,
    get_required_str, parse_date, parse_decimal, require_db,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct BillingRecord {
    id: String,
    student_id: String,
    student_name: String,
    school_year_id: String,
    tuition_type_id: Option<String>,
    billing_month: i64,
    billing_year: i64,
    due_date: String,
    effective_tuition_amount: Decimal,
    scholarship_amount: Decimal,
    discount_adjustments: Vec<DiscountAdjustment>,
    extra_charges: Vec<ExtraCharge>,
    late_fee_amount: Decimal,
    final_amount: Decimal,
    paid_amount: Option<Decimal>,
    payment_status: PaymentStatus,
    is_locked: bool,
}

impl BillingRecord {
    fn inputs(&self) -> BillingInputs<'_> {
        BillingInputs {
            tuition: self.effective_tuition_amount,
            scholarship: self.scholarship_amount,
            discounts: &self.discount_adjustments,
            extra_charges: &self.extra_charges,
            late_fee: self.late_fee_amount,
        }
    }

    fn remaining_amount(&self) -> Result<Decimal, HandlerErr> {
        Ok(calc::remaining_amount(self.final_amount, self.paid_amount)?)
    }

    fn to_json(&self) -> Result<Value, HandlerErr> {
        Ok(json!({
            "id": self.id,
            "studentId": self.student_id,
            "studentName": self.student_name,
            "schoolYearId": self.school_year_id,
            "tuitionTypeId": self.tuition_type_id,
            "billingMonth": self.billing_month,
            "billingYear": self.billing_year,
            "dueDate": self.due_date,
            "effectiveTuitionAmount": self.effective_tuition_amount,
            "scholarshipAmount": self.scholarship_amount,
            "discountAdjustments": self.discount_adjustments,
            "extraCharges": self.extra_charges,
            "lateFeeAmount": self.late_fee_amount,
            "finalAmount": self.final_amount,
            "paidAmount": self.paid_amount,
            "remainingAmount": self.remaining_amount()?,
            "paymentStatus": self.payment_status,
            "isLocked": self.is_locked
        }))
    }
}

const RECORD_SELECT: &str = "SELECT
       b.id, b.student_id, s.last_name || ', ' || s.first_name, b.school_year_id,
       b.tuition_type_id, b.billing_month, b.billing_year, b.due_date,
       b.effective_tuition_amount, b.scholarship_amount, b.discount_adjustments,
       b.extra_charges, b.late_fee_amount, b.final_amount, b.paid_amount,
       b.payment_status, b.is_locked
     FROM billing_records b
     JOIN students s ON s.id = b.student_id";

fn record_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<BillingRecord> {
    let status_raw: String = r.get(15)?;
    let payment_status = PaymentStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            15,
            rusqlite::types::Type::Text,
            format!("unknown payment status: {}", status_raw).into(),
        )
    })?;
    Ok(BillingRecord {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: r.get(2)?,
        school_year_id: r.get(3)?,
        tuition_type_id: r.get(4)?,
        billing_month: r.get(5)?,
        billing_year: r.get(6)?,
        due_date: r.get(7)?,
        effective_tuition_amount: db::decimal_col(r, 8)?,
        scholarship_amount: db::decimal_col(r, 9)?,
        discount_adjustments: db::json_col(r, 10)?,
        extra_charges: db::json_col(r, 11)?,
        late_fee_amount: db::decimal_col(r, 12)?,
        final_amount: db::decimal_col(r, 13)?,
        paid_amount: db::opt_decimal_col(r, 14)?,
        payment_status,
        is_locked: r.get::<_, i64>(16)? != 0,
    })
}

fn load_record(conn: &Connection, record_id: &str) -> Result<BillingRecord, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE b.id = ?", RECORD_SELECT),
        [record_id],
        record_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("billing record not found"))
}

fn json_text<T: serde::Serialize>(v: &T) -> Result<String, HandlerErr> {
    serde_json::to_string(v).map_err(HandlerErr::query)
}

/// Writes every mutable column of `rec` back in one statement.
fn save_record(conn: &Connection, rec: &BillingRecord) -> Result<(), HandlerErr> {
    conn.execute(
        "UPDATE billing_records
         SET effective_tuition_amount = ?, scholarship_amount = ?, discount_adjustments = ?,
             extra_charges = ?, late_fee_amount = ?, final_amount = ?, paid_amount = ?,
             payment_status = ?, updated_at = ?
         WHERE id = ?",
        (
            rec.effective_tuition_amount.to_string(),
            rec.scholarship_amount.to_string(),
            json_text(&rec.discount_adjustments)?,
            json_text(&rec.extra_charges)?,
            rec.late_fee_amount.to_string(),
            rec.final_amount.to_string(),
            rec.paid_amount.map(|d| d.to_string()),
            rec.payment_status.as_str(),
            db::now_rfc3339(),
            &rec.id,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(())
}

fn parse_period(params: &Value) -> Result<(i64, i64), HandlerErr> {
    let month = get_required_i64(params, "billingMonth")?;
    let year = get_required_i64(params, "billingYear")?;
    if !(1..=12).contains(&month) {
        return Err(HandlerErr::bad_params("billingMonth must be in 1..=12"));
    }
    if !(2000..=2100).contains(&year) {
        return Err(HandlerErr::bad_params("billingYear must be in 2000..=2100"));
    }
    Ok((month, year))
}

fn period_exists(
    conn: &Connection,
    student_id: &str,
    month: i64,
    year: i64,
) -> Result<bool, HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM billing_records
             WHERE student_id = ? AND billing_year = ? AND billing_month = ?",
            (student_id, year, month),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn insert_record(
    conn: &Connection,
    cfg: &TuitionConfig,
    student: &BillingStudent,
    tuition_type_id: &str,
    month: i64,
    year: i64,
) -> Result<String, HandlerErr> {
    let Some(tuition_type) = load_tuition_type(conn, tuition_type_id)? else {
        return Err(HandlerErr::not_found("tuition type not found"));
    };
    let due = calc::due_date(year as i32, month as u32, cfg.due_day)
        .ok_or_else(|| HandlerErr::bad_params("invalid billing period"))?;
    let breakdown = calc::compute_breakdown(
        &BillingInputs {
            tuition: tuition_type.base_amount,
            scholarship: student.scholarship_amount,
            discounts: &[],
            extra_charges: &[],
            late_fee: Decimal::ZERO,
        },
        cfg.calc_options(),
    )?;
    // Full scholarships leave nothing owed; such records start settled.
    let status = calc::settle_status(PaymentStatus::Pending, None, breakdown.final_amount);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO billing_records(
            id, student_id, school_year_id, tuition_type_id, billing_month, billing_year,
            due_date, effective_tuition_amount, scholarship_amount, final_amount,
            payment_status, is_locked, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        (
            &id,
            &student.id,
            &student.school_year_id,
            tuition_type_id,
            month,
            year,
            due.to_string(),
            tuition_type.base_amount.to_string(),
            student.scholarship_amount.to_string(),
            breakdown.final_amount.to_string(),
            status.as_str(),
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "billing_records" }))
    })?;
    Ok(id)
}

fn handle_bulk_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let school_year_id = get_required_str(&req.params, "schoolYearId")?;
    let (month, year) = parse_period(&req.params)?;
    if !school_year_exists(conn, &school_year_id)? {
        return Err(HandlerErr::not_found("school year not found"));
    }
    let cfg = load_tuition_config(conn).map_err(HandlerErr::query)?;
    let students = list_students_for_year(conn, &school_year_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut created: Vec<String> = Vec::new();
    let mut skipped_existing = 0usize;
    let mut skipped_no_tuition_type = 0usize;
    for student in students.iter().filter(|s| s.active) {
        let Some(tuition_type_id) = student.tuition_type_id.as_deref() else {
            skipped_no_tuition_type += 1;
            continue;
        };
        if period_exists(&tx, &student.id, month, year)? {
            skipped_existing += 1;
            continue;
        }
        created.push(insert_record(&tx, &cfg, student, tuition_type_id, month, year)?);
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    info!(
        school_year = %school_year_id,
        month,
        year,
        created = created.len(),
        skipped = skipped_existing + skipped_no_tuition_type,
        "billing period generated"
    );
    Ok(json!({
        "created": created.len(),
        "recordIds": created,
        "skipped": skipped_existing + skipped_no_tuition_type,
        "skippedExisting": skipped_existing,
        "skippedNoTuitionType": skipped_no_tuition_type
    }))
}

fn handle_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let (month, year) = parse_period(&req.params)?;
    let Some(student) = load_student(conn, &student_id)? else {
        return Err(HandlerErr::not_found("student not found"));
    };
    let Some(tuition_type_id) = student.tuition_type_id.clone() else {
        return Err(HandlerErr::bad_params("student has no tuition type"));
    };
    if period_exists(conn, &student.id, month, year)? {
        return Err(HandlerErr::new(
            "conflict",
            "billing record already exists for this period",
        ));
    }
    let cfg = load_tuition_config(conn).map_err(HandlerErr::query)?;
    let id = insert_record(conn, &cfg, &student, &tuition_type_id, month, year)?;
    let rec = load_record(conn, &id)?;
    Ok(json!({ "recordId": id, "record": rec.to_json()? }))
}

fn handle_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;

    let mut clauses: Vec<&str> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();
    if let Some(v) = get_opt_str(&req.params, "schoolYearId")? {
        clauses.push("b.school_year_id = ?");
        params.push(SqlValue::Text(v));
    }
    if let Some(v) = get_opt_i64(&req.params, "billingMonth")? {
        clauses.push("b.billing_month = ?");
        params.push(SqlValue::Integer(v));
    }
    if let Some(v) = get_opt_i64(&req.params, "billingYear")? {
        clauses.push("b.billing_year = ?");
        params.push(SqlValue::Integer(v));
    }
    if let Some(v) = get_opt_str(&req.params, "status")? {
        let Some(status) = PaymentStatus::parse(&v) else {
            return Err(HandlerErr::bad_params(format!("unknown status: {}", v)));
        };
        clauses.push("b.payment_status = ?");
        params.push(SqlValue::Text(status.as_str().to_string()));
    }

    let mut sql = RECORD_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY b.billing_year, b.billing_month, s.sort_order, s.last_name");

    let mut stmt = conn.prepare(&sql)?;
    let records: Vec<Value> = stmt
        .query_map(params_from_iter(params), record_from_row)?
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .map(BillingRecord::to_json)
        .collect::<Result<_, _>>()?;
    Ok(json!({ "records": records }))
}

fn breakdown_for(
    rec: &BillingRecord,
    cfg: &TuitionConfig,
) -> Result<BillingBreakdown, HandlerErr> {
    Ok(calc::compute_breakdown(&rec.inputs(), cfg.calc_options())?)
}

fn handle_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let record_id = get_required_str(&req.params, "recordId")?;
    let rec = load_record(conn, &record_id)?;
    let cfg = load_tuition_config(conn).map_err(HandlerErr::query)?;
    let breakdown = breakdown_for(&rec, &cfg)?;
    Ok(json!({ "record": rec.to_json()?, "breakdown": breakdown }))
}

fn parse_json_field<T: serde::de::DeserializeOwned>(v: &Value, key: &str) -> Result<T, HandlerErr> {
    serde_json::from_value(v.clone()).map_err(|e| {
        HandlerErr::new("validation_failed", format!("{}: {}", key, e))
            .with_details(json!({ "field": key }))
    })
}

fn handle_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let record_id = get_required_str(&req.params, "recordId")?;
    let patch = get_patch(&req.params)?;
    let mut rec = load_record(conn, &record_id)?;

    if let Err(e) = calc::ensure_editable(rec.payment_status, rec.is_locked) {
        warn!(record = %rec.id, status = rec.payment_status.as_str(), "edit rejected");
        return Err(e.into());
    }

    for (k, v) in patch {
        match k.as_str() {
            "effectiveTuitionAmount" => {
                rec.effective_tuition_amount = parse_decimal(v, "effectiveTuitionAmount")?
            }
            "scholarshipAmount" => rec.scholarship_amount = parse_decimal(v, "scholarshipAmount")?,
            "discountAdjustments" => {
                rec.discount_adjustments = parse_json_field(v, "discountAdjustments")?
            }
            "extraCharges" => rec.extra_charges = parse_json_field(v, "extraCharges")?,
            _ => {
                return Err(HandlerErr::bad_params(format!(
                    "unknown billing field: {}",
                    k
                )))
            }
        }
    }

    let cfg = load_tuition_config(conn).map_err(HandlerErr::query)?;
    let breakdown = breakdown_for(&rec, &cfg)?;
    rec.final_amount = breakdown.final_amount;
    rec.payment_status = calc::settle_status(rec.payment_status, rec.paid_amount, rec.final_amount);

    save_record(conn, &rec)?;
    info!(record = %rec.id, final_amount = %rec.final_amount, "billing record updated");
    Ok(json!({ "record": rec.to_json()?, "breakdown": breakdown }))
}

fn handle_record_payment(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let record_id = get_required_str(&req.params, "recordId")?;
    let amount = get_required_decimal(&req.params, "amount")?;
    let paid_on = get_opt_date(&req.params, "paidOn")?
        .unwrap_or_else(|| chrono::Local::now().date_naive());
    let mut rec = load_record(conn, &record_id)?;

    let (new_paid, new_status) =
        calc::apply_payment(rec.payment_status, rec.paid_amount, rec.final_amount, amount)?;
    rec.paid_amount = Some(new_paid);
    rec.payment_status = new_status;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    save_record(&tx, &rec)?;
    let payment_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO billing_payments(id, record_id, amount, paid_on, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &payment_id,
            &rec.id,
            amount.to_string(),
            paid_on.to_string(),
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "billing_payments" }))
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    info!(
        record = %rec.id,
        amount = %amount,
        status = rec.payment_status.as_str(),
        "payment recorded"
    );
    Ok(json!({ "paymentId": payment_id, "record": rec.to_json()? }))
}

fn handle_payments(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let record_id = get_required_str(&req.params, "recordId")?;
    load_record(conn, &record_id)?;
    let mut stmt = conn.prepare(
        "SELECT id, amount, paid_on, created_at
         FROM billing_payments
         WHERE record_id = ?
         ORDER BY created_at, rowid",
    )?;
    let payments = stmt
        .query_map([&record_id], |r| {
            let id: String = r.get(0)?;
            let amount = db::decimal_col(r, 1)?;
            let paid_on: String = r.get(2)?;
            let created_at: String = r.get(3)?;
            Ok(json!({
                "id": id,
                "amount": amount,
                "paidOn": paid_on,
                "createdAt": created_at
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "payments": payments }))
}

fn handle_lock(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let Some(ids) = req.params.get("recordIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("recordIds must be an array"));
    };
    let ids: Vec<String> = ids
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| HandlerErr::bad_params("recordIds must contain strings"))
        })
        .collect::<Result<_, _>>()?;
    for id in &ids {
        load_record(conn, id).map_err(|e| e.with_details(json!({ "recordId": id })))?;
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let now = db::now_rfc3339();
    let mut locked = 0usize;
    for id in &ids {
        locked += tx
            .execute(
                "UPDATE billing_records SET is_locked = 1, locked_at = ?, updated_at = ?
                 WHERE id = ? AND is_locked = 0",
                (&now, &now, id),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    info!(locked, requested = ids.len(), "billing records locked");
    Ok(json!({ "locked": locked }))
}

fn handle_refresh_statuses(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let as_of = get_opt_date(&req.params, "asOf")?
        .unwrap_or_else(|| chrono::Local::now().date_naive());
    let cfg = load_tuition_config(conn).map_err(HandlerErr::query)?;

    let mut stmt = conn.prepare(&format!(
        "{} WHERE b.payment_status = 'pending' AND b.is_locked = 0",
        RECORD_SELECT
    ))?;
    let pending = stmt
        .query_map([], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut delayed: Vec<String> = Vec::new();
    let mut settled = 0usize;
    for mut rec in pending {
        // Nothing owed: never delayed, never charged a late fee.
        if calc::settle_status(rec.payment_status, rec.paid_amount, rec.final_amount)
            == PaymentStatus::Paid
        {
            rec.payment_status = PaymentStatus::Paid;
            save_record(&tx, &rec)?;
            settled += 1;
            continue;
        }
        let due: NaiveDate = parse_date(&rec.due_date, "dueDate")?;
        if !calc::is_overdue(due, cfg.grace_days, as_of) {
            continue;
        }
        let policy = match rec.tuition_type_id.as_deref() {
            Some(id) => load_tuition_type(&tx, id)?.map(|t| t.late_fee),
            None => None,
        };
        rec.late_fee_amount = policy
            .map(|p| p.fee_for(rec.effective_tuition_amount))
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        rec.final_amount = breakdown_for(&rec, &cfg)?.final_amount;
        rec.payment_status = PaymentStatus::Delayed;
        save_record(&tx, &rec)?;
        delayed.push(rec.id);
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    info!(as_of = %as_of, delayed = delayed.len(), settled, "payment statuses refreshed");
    Ok(json!({
        "asOf": as_of.to_string(),
        "delayed": delayed.len(),
        "settled": settled,
        "recordIds": delayed
    }))
}

fn handle_summary(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let (month, year) = parse_period(&req.params)?;
    let mut stmt = conn.prepare(&format!(
        "{} WHERE b.billing_month = ? AND b.billing_year = ?",
        RECORD_SELECT
    ))?;
    let records = stmt
        .query_map((month, year), record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts: BTreeMap<&'static str, usize> = PaymentStatus::ALL
        .iter()
        .map(|s| (s.as_str(), 0usize))
        .collect();
    let total_final =
        calc::checked_total(records.iter().map(|r| r.final_amount), "totalFinalAmount")?;
    let total_paid = calc::checked_total(
        records.iter().map(|r| r.paid_amount.unwrap_or(Decimal::ZERO)),
        "totalPaidAmount",
    )?;
    let remaining = records
        .iter()
        .map(BillingRecord::remaining_amount)
        .collect::<Result<Vec<_>, _>>()?;
    let total_remaining = calc::checked_total(remaining, "totalRemainingAmount")?;
    let mut locked = 0usize;
    for rec in &records {
        *counts.entry(rec.payment_status.as_str()).or_insert(0) += 1;
        if rec.is_locked {
            locked += 1;
        }
    }
    let cfg = load_tuition_config(conn).map_err(HandlerErr::query)?;

    Ok(json!({
        "billingMonth": month,
        "billingYear": year,
        "currency": cfg.currency,
        "recordCount": records.len(),
        "lockedCount": locked,
        "totalFinalAmount": total_final,
        "totalPaidAmount": total_paid,
        "totalRemainingAmount": total_remaining,
        "statusCounts": counts
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "billing.bulkCreate" => handle_bulk_create(state, req),
        "billing.create" => handle_create(state, req),
        "billing.list" => handle_list(state, req),
        "billing.get" => handle_get(state, req),
        "billing.update" => handle_update(state, req),
        "billing.recordPayment" => handle_record_payment(state, req),
        "billing.payments" => handle_payments(state, req),
        "billing.lock" => handle_lock(state, req),
        "billing.refreshStatuses" => handle_refresh_statuses(state, req),
        "billing.summary" => handle_summary(state, req),
        _ => return None,
    };
    Some(respond(&req.id, resp))
}
