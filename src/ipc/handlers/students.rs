use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::school_years::school_year_exists;
use crate::ipc::handlers::tuition::load_tuition_type;
use crate::ipc::helpers::{
    get_opt_decimal, get_opt_str, get_patch, get_required_str, non_empty_trimmed, parse_decimal,
    require_db,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BillingStudent {
    pub id: String,
    pub school_year_id: String,
    pub last_name: String,
    pub first_name: String,
    pub tuition_type_id: Option<String>,
    pub scholarship_amount: Decimal,
    pub active: bool,
    pub sort_order: i64,
}

impl BillingStudent {
    pub fn display_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "schoolYearId": self.school_year_id,
            "lastName": self.last_name,
            "firstName": self.first_name,
            "displayName": self.display_name(),
            "tuitionTypeId": self.tuition_type_id,
            "scholarshipAmount": self.scholarship_amount,
            "active": self.active,
            "sortOrder": self.sort_order
        })
    }
}

const STUDENT_COLUMNS: &str = "id, school_year_id, last_name, first_name, tuition_type_id,
     scholarship_amount, active, sort_order";

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<BillingStudent> {
    Ok(BillingStudent {
        id: r.get(0)?,
        school_year_id: r.get(1)?,
        last_name: r.get(2)?,
        first_name: r.get(3)?,
        tuition_type_id: r.get(4)?,
        scholarship_amount: db::decimal_col(r, 5)?,
        active: r.get::<_, i64>(6)? != 0,
        sort_order: r.get(7)?,
    })
}

pub fn load_student(conn: &Connection, student_id: &str) -> Result<Option<BillingStudent>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS),
        [student_id],
        student_from_row,
    )
    .optional()
    .map_err(HandlerErr::query)
}

pub fn list_students_for_year(
    conn: &Connection,
    school_year_id: &str,
) -> Result<Vec<BillingStudent>, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM students WHERE school_year_id = ? ORDER BY sort_order",
        STUDENT_COLUMNS
    ))?;
    let rows = stmt
        .query_map([school_year_id], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn scholarship_value(v: Decimal) -> Result<Decimal, HandlerErr> {
    if v < Decimal::ZERO {
        return Err(HandlerErr::new(
            "validation_failed",
            "scholarshipAmount must not be negative",
        )
        .with_details(json!({ "field": "scholarshipAmount" })));
    }
    Ok(v)
}

fn check_tuition_type(conn: &Connection, id: Option<&str>) -> Result<(), HandlerErr> {
    if let Some(id) = id {
        if load_tuition_type(conn, id)?.is_none() {
            return Err(HandlerErr::not_found("tuition type not found"));
        }
    }
    Ok(())
}

fn handle_students_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let school_year_id = get_required_str(&req.params, "schoolYearId")?;
    if !school_year_exists(conn, &school_year_id)? {
        return Err(HandlerErr::not_found("school year not found"));
    }
    let students: Vec<Value> = list_students_for_year(conn, &school_year_id)?
        .iter()
        .map(BillingStudent::to_json)
        .collect();
    Ok(json!({ "students": students }))
}

fn handle_students_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let school_year_id = get_required_str(&req.params, "schoolYearId")?;
    if !school_year_exists(conn, &school_year_id)? {
        return Err(HandlerErr::not_found("school year not found"));
    }
    let last_name = non_empty_trimmed(&get_required_str(&req.params, "lastName")?, "lastName", 80)?;
    let first_name =
        non_empty_trimmed(&get_required_str(&req.params, "firstName")?, "firstName", 80)?;
    let tuition_type_id = get_opt_str(&req.params, "tuitionTypeId")?;
    check_tuition_type(conn, tuition_type_id.as_deref())?;
    let scholarship_amount = scholarship_value(
        get_opt_decimal(&req.params, "scholarshipAmount")?.unwrap_or(Decimal::ZERO),
    )?;
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let sort_order: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE school_year_id = ?",
        [&school_year_id],
        |r| r.get(0),
    )?;

    let student = BillingStudent {
        id: Uuid::new_v4().to_string(),
        school_year_id,
        last_name,
        first_name,
        tuition_type_id,
        scholarship_amount,
        active,
        sort_order,
    };
    conn.execute(
        "INSERT INTO students(id, school_year_id, last_name, first_name, tuition_type_id,
                              scholarship_amount, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student.id,
            &student.school_year_id,
            &student.last_name,
            &student.first_name,
            &student.tuition_type_id,
            student.scholarship_amount.to_string(),
            student.active as i64,
            student.sort_order,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "students" }))
    })?;

    Ok(json!({ "studentId": student.id, "student": student.to_json() }))
}

fn handle_students_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let patch = get_patch(&req.params)?;
    let Some(mut student) = load_student(conn, &student_id)? else {
        return Err(HandlerErr::not_found("student not found"));
    };

    for (k, v) in patch {
        match k.as_str() {
            "lastName" => {
                let s = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("lastName must be a string"))?;
                student.last_name = non_empty_trimmed(s, "lastName", 80)?;
            }
            "firstName" => {
                let s = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("firstName must be a string"))?;
                student.first_name = non_empty_trimmed(s, "firstName", 80)?;
            }
            "tuitionTypeId" => {
                student.tuition_type_id = match v {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    _ => return Err(HandlerErr::bad_params("tuitionTypeId must be a string")),
                };
                check_tuition_type(conn, student.tuition_type_id.as_deref())?;
            }
            "scholarshipAmount" => {
                student.scholarship_amount =
                    scholarship_value(parse_decimal(v, "scholarshipAmount")?)?;
            }
            "active" => {
                student.active = v
                    .as_bool()
                    .ok_or_else(|| HandlerErr::bad_params("active must be boolean"))?;
            }
            _ => {
                return Err(HandlerErr::bad_params(format!(
                    "unknown student field: {}",
                    k
                )))
            }
        }
    }

    conn.execute(
        "UPDATE students
         SET last_name = ?, first_name = ?, tuition_type_id = ?, scholarship_amount = ?,
             active = ?, updated_at = ?
         WHERE id = ?",
        (
            &student.last_name,
            &student.first_name,
            &student.tuition_type_id,
            student.scholarship_amount.to_string(),
            student.active as i64,
            db::now_rfc3339(),
            &student.id,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "student": student.to_json() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "students.list" => Some(respond(&req.id, handle_students_list(state, req))),
        "students.create" => Some(respond(&req.id, handle_students_create(state, req))),
        "students.update" => Some(respond(&req.id, handle_students_update(state, req))),
        _ => None,
    }
}
