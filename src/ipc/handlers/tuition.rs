use crate::calc::{CalcOptions, LateFeePolicy};
use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    get_opt_decimal, get_opt_str, get_patch, get_required_decimal, get_required_str,
    non_empty_trimmed, parse_decimal, require_db,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

const TUITION_CONFIG_KEY: &str = "billing.tuitionConfig";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TuitionConfig {
    pub due_day: u32,
    pub grace_days: i64,
    pub currency: String,
    pub clamp_discount_base: bool,
}

impl Default for TuitionConfig {
    fn default() -> Self {
        Self {
            due_day: 10,
            grace_days: 0,
            currency: "USD".to_string(),
            clamp_discount_base: false,
        }
    }
}

impl TuitionConfig {
    pub fn calc_options(&self) -> CalcOptions {
        CalcOptions {
            clamp_discount_base: self.clamp_discount_base,
        }
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_config_patch(cfg: &mut TuitionConfig, patch: &Map<String, Value>) -> Result<(), String> {
    for (k, v) in patch {
        match k.as_str() {
            "dueDay" => cfg.due_day = parse_i64_range(v, k, 1, 28)? as u32,
            "graceDays" => cfg.grace_days = parse_i64_range(v, k, 0, 60)?,
            "currency" => {
                let s = v.as_str().ok_or_else(|| format!("{} must be string", k))?;
                let s = s.trim();
                if s.is_empty() || s.chars().count() > 8 {
                    return Err(format!("{} length must be 1..=8", k));
                }
                cfg.currency = s.to_ascii_uppercase();
            }
            "clampDiscountBase" => {
                cfg.clamp_discount_base =
                    v.as_bool().ok_or_else(|| format!("{} must be boolean", k))?
            }
            _ => return Err(format!("unknown tuition config field: {}", k)),
        }
    }
    Ok(())
}

pub fn load_tuition_config(conn: &Connection) -> anyhow::Result<TuitionConfig> {
    let mut cfg = TuitionConfig::default();
    if let Some(saved) = db::settings_get_json(conn, TUITION_CONFIG_KEY)? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            let mut candidate = cfg.clone();
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                if merge_config_patch(&mut candidate, &one).is_ok() {
                    cfg = candidate.clone();
                } else {
                    candidate = cfg.clone();
                }
            }
        }
    }
    Ok(cfg)
}

fn get_tuition_config(state: &AppState) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let cfg = load_tuition_config(conn).map_err(HandlerErr::query)?;
    Ok(json!({ "config": cfg }))
}

fn update_tuition_config(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let patch = get_patch(&req.params)?;
    let mut cfg = load_tuition_config(conn).map_err(HandlerErr::query)?;
    merge_config_patch(&mut cfg, patch).map_err(HandlerErr::bad_params)?;
    let value = serde_json::to_value(&cfg).map_err(HandlerErr::query)?;
    db::settings_set_json(conn, TUITION_CONFIG_KEY, &value)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    info!(due_day = cfg.due_day, grace_days = cfg.grace_days, "tuition config updated");
    Ok(json!({ "config": cfg }))
}

#[derive(Debug, Clone)]
pub struct TuitionType {
    pub id: String,
    pub name: String,
    pub base_amount: Decimal,
    pub late_fee: LateFeePolicy,
}

impl TuitionType {
    fn to_json(&self, student_count: Option<i64>) -> Value {
        let mut v = json!({
            "id": self.id,
            "name": self.name,
            "baseAmount": self.base_amount,
            "lateFeeType": self.late_fee.kind(),
            "lateFeeValue": self.late_fee.value(),
        });
        if let Some(n) = student_count {
            v["studentCount"] = json!(n);
        }
        v
    }
}

fn tuition_type_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TuitionType> {
    let kind: String = row.get(3)?;
    let value = db::decimal_col(row, 4)?;
    let late_fee = LateFeePolicy::from_parts(&kind, value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(TuitionType {
        id: row.get(0)?,
        name: row.get(1)?,
        base_amount: db::decimal_col(row, 2)?,
        late_fee,
    })
}

pub fn load_tuition_type(
    conn: &Connection,
    tuition_type_id: &str,
) -> Result<Option<TuitionType>, HandlerErr> {
    conn.query_row(
        "SELECT id, name, base_amount, late_fee_type, late_fee_value
         FROM tuition_types WHERE id = ?",
        [tuition_type_id],
        tuition_type_from_row,
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn list_tuition_types(state: &AppState) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut stmt = conn.prepare(
        "SELECT t.id, t.name, t.base_amount, t.late_fee_type, t.late_fee_value,
                (SELECT COUNT(*) FROM students s WHERE s.tuition_type_id = t.id)
         FROM tuition_types t
         ORDER BY t.name",
    )?;
    let types = stmt
        .query_map([], |row| {
            let t = tuition_type_from_row(row)?;
            let count: i64 = row.get(5)?;
            Ok(t.to_json(Some(count)))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "tuitionTypes": types }))
}

fn late_fee_from_params(
    params: &Value,
    current: Option<LateFeePolicy>,
) -> Result<LateFeePolicy, HandlerErr> {
    let kind = get_opt_str(params, "lateFeeType")?;
    let value = get_opt_decimal(params, "lateFeeValue")?;
    let kind = kind.unwrap_or_else(|| current.map(|p| p.kind()).unwrap_or("none").to_string());
    let value = value.unwrap_or_else(|| current.map(|p| p.value()).unwrap_or(Decimal::ZERO));
    Ok(LateFeePolicy::from_parts(kind.trim(), value)?)
}

fn non_negative_amount(value: Decimal, key: &str) -> Result<Decimal, HandlerErr> {
    if value < Decimal::ZERO {
        return Err(HandlerErr::new(
            "validation_failed",
            format!("{} must not be negative", key),
        )
        .with_details(json!({ "field": key })));
    }
    Ok(value)
}

fn name_taken(conn: &Connection, name: &str, except_id: Option<&str>) -> Result<bool, HandlerErr> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM tuition_types WHERE name = ?", [name], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(match found {
        Some(id) => Some(id.as_str()) != except_id,
        None => false,
    })
}

fn create_tuition_type(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let name = non_empty_trimmed(&get_required_str(&req.params, "name")?, "name", 80)?;
    let base_amount =
        non_negative_amount(get_required_decimal(&req.params, "baseAmount")?, "baseAmount")?;
    let late_fee = late_fee_from_params(&req.params, None)?;
    if name_taken(conn, &name, None)? {
        return Err(HandlerErr::new("conflict", "tuition type name already exists"));
    }

    let t = TuitionType {
        id: Uuid::new_v4().to_string(),
        name,
        base_amount,
        late_fee,
    };
    conn.execute(
        "INSERT INTO tuition_types(id, name, base_amount, late_fee_type, late_fee_value, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &t.id,
            &t.name,
            t.base_amount.to_string(),
            t.late_fee.kind(),
            t.late_fee.value().to_string(),
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "tuition_types" }))
    })?;
    info!(tuition_type = %t.id, "tuition type created");
    Ok(json!({ "tuitionTypeId": t.id, "tuitionType": t.to_json(None) }))
}

fn update_tuition_type(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_str(&req.params, "tuitionTypeId")?;
    let patch = get_patch(&req.params)?;
    let Some(mut t) = load_tuition_type(conn, &id)? else {
        return Err(HandlerErr::not_found("tuition type not found"));
    };

    for k in patch.keys() {
        if !matches!(
            k.as_str(),
            "name" | "baseAmount" | "lateFeeType" | "lateFeeValue"
        ) {
            return Err(HandlerErr::bad_params(format!(
                "unknown tuition type field: {}",
                k
            )));
        }
    }
    if let Some(v) = patch.get("name") {
        let s = v
            .as_str()
            .ok_or_else(|| HandlerErr::bad_params("name must be a string"))?;
        t.name = non_empty_trimmed(s, "name", 80)?;
        if name_taken(conn, &t.name, Some(&t.id))? {
            return Err(HandlerErr::new("conflict", "tuition type name already exists"));
        }
    }
    if let Some(v) = patch.get("baseAmount") {
        t.base_amount = non_negative_amount(parse_decimal(v, "baseAmount")?, "baseAmount")?;
    }
    let patch_value = Value::Object(patch.clone());
    t.late_fee = late_fee_from_params(&patch_value, Some(t.late_fee))?;

    conn.execute(
        "UPDATE tuition_types
         SET name = ?, base_amount = ?, late_fee_type = ?, late_fee_value = ?, updated_at = ?
         WHERE id = ?",
        (
            &t.name,
            t.base_amount.to_string(),
            t.late_fee.kind(),
            t.late_fee.value().to_string(),
            db::now_rfc3339(),
            &t.id,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "tuitionType": t.to_json(None) }))
}

fn delete_tuition_type(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let id = get_required_str(&req.params, "tuitionTypeId")?;
    if load_tuition_type(conn, &id)?.is_none() {
        return Err(HandlerErr::not_found("tuition type not found"));
    }
    let in_use: i64 = conn.query_row(
        "SELECT COUNT(*) FROM students WHERE tuition_type_id = ?",
        [&id],
        |r| r.get(0),
    )?;
    if in_use > 0 {
        return Err(
            HandlerErr::new("conflict", "tuition type is assigned to students")
                .with_details(json!({ "studentCount": in_use })),
        );
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Existing records keep their amounts; only the link is dropped.
    tx.execute(
        "UPDATE billing_records SET tuition_type_id = NULL WHERE tuition_type_id = ?",
        [&id],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.execute("DELETE FROM tuition_types WHERE id = ?", [&id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "tuition_types" }))
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    info!(tuition_type = %id, "tuition type deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "billing.getTuitionConfig" => Some(respond(&req.id, get_tuition_config(state))),
        "billing.updateTuitionConfig" => Some(respond(&req.id, update_tuition_config(state, req))),
        "billing.getTuitionTypes" => Some(respond(&req.id, list_tuition_types(state))),
        "billing.createTuitionType" => Some(respond(&req.id, create_tuition_type(state, req))),
        "billing.updateTuitionType" => Some(respond(&req.id, update_tuition_type(state, req))),
        "billing.deleteTuitionType" => Some(respond(&req.id, delete_tuition_type(state, req))),
        _ => None,
    }
}
