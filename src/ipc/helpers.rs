use crate::ipc::error::HandlerErr;
use crate::ipc::types::AppState;
use chrono::NaiveDate;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing integer {}", key)))
}

pub fn get_opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

/// Accepts JSON numbers and numeric strings; the number's literal text is
/// parsed so `0.1` stays exactly `0.1`.
pub fn parse_decimal(v: &Value, key: &str) -> Result<Decimal, HandlerErr> {
    let raw = match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => {
            return Err(HandlerErr::new(
                "validation_failed",
                format!("{} must be a number", key),
            )
            .with_details(serde_json::json!({ "field": key })))
        }
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| {
            HandlerErr::new("validation_failed", format!("{} is not numeric: {}", key, raw))
                .with_details(serde_json::json!({ "field": key }))
        })
}

pub fn get_required_decimal(params: &Value, key: &str) -> Result<Decimal, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Err(HandlerErr::bad_params(format!("missing {}", key))),
        Some(v) => parse_decimal(v, key),
    }
}

pub fn get_opt_decimal(params: &Value, key: &str) -> Result<Option<Decimal>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_decimal(v, key).map(Some),
    }
}

pub fn parse_date(s: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn get_opt_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    get_opt_str(params, key)?
        .map(|s| parse_date(&s, key))
        .transpose()
}

pub fn non_empty_trimmed(s: &str, key: &str, max_len: usize) -> Result<String, HandlerErr> {
    let s = s.trim();
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    if s.chars().count() > max_len {
        return Err(HandlerErr::bad_params(format!(
            "{} length must be <= {}",
            key, max_len
        )));
    }
    Ok(s.to_string())
}

pub fn get_patch(params: &Value) -> Result<&serde_json::Map<String, Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))
}
