use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_opt_date, get_required_str, non_empty_trimmed, require_db};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn school_year_exists(conn: &Connection, school_year_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM school_years WHERE id = ?",
        [school_year_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

fn list_school_years(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = conn.prepare(
        "SELECT
           y.id,
           y.name,
           y.start_date,
           y.end_date,
           (SELECT COUNT(*) FROM students s WHERE s.school_year_id = y.id) AS student_count,
           (SELECT COUNT(*) FROM billing_records b WHERE b.school_year_id = y.id) AS record_count
         FROM school_years y
         ORDER BY y.name",
    )?;
    let years = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let start_date: Option<String> = row.get(2)?;
            let end_date: Option<String> = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            let record_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "startDate": start_date,
                "endDate": end_date,
                "studentCount": student_count,
                "billingRecordCount": record_count
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "schoolYears": years }))
}

fn create_school_year(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let name = non_empty_trimmed(&get_required_str(&req.params, "name")?, "name", 60)?;
    let start = get_opt_date(&req.params, "startDate")?;
    let end = get_opt_date(&req.params, "endDate")?;
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(HandlerErr::bad_params("startDate must not be after endDate"));
        }
    }

    let taken: Option<i64> = conn
        .query_row("SELECT 1 FROM school_years WHERE name = ?", [&name], |r| {
            r.get(0)
        })
        .optional()?;
    if taken.is_some() {
        return Err(HandlerErr::new("conflict", "school year name already exists"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO school_years(id, name, start_date, end_date) VALUES(?, ?, ?, ?)",
        (
            &id,
            &name,
            start.map(|d| d.to_string()),
            end.map(|d| d.to_string()),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "school_years" }))
    })?;

    Ok(json!({ "schoolYearId": id, "name": name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schoolYears.list" => Some(respond(&req.id, list_school_years(state))),
        "schoolYears.create" => Some(respond(&req.id, create_school_year(state, req))),
        _ => None,
    }
}
