use crate::backup::DB_FILE;
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            start_date TEXT,
            end_date TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tuition_types(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            base_amount TEXT NOT NULL,
            late_fee_type TEXT NOT NULL DEFAULT 'none',
            late_fee_value TEXT NOT NULL DEFAULT '0',
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_year_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            tuition_type_id TEXT,
            scholarship_amount TEXT NOT NULL DEFAULT '0',
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(school_year_id) REFERENCES school_years(id),
            FOREIGN KEY(tuition_type_id) REFERENCES tuition_types(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_year_sort ON students(school_year_id, sort_order)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_tuition_type ON students(tuition_type_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS billing_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            school_year_id TEXT NOT NULL,
            tuition_type_id TEXT,
            billing_month INTEGER NOT NULL,
            billing_year INTEGER NOT NULL,
            due_date TEXT NOT NULL,
            effective_tuition_amount TEXT NOT NULL,
            scholarship_amount TEXT NOT NULL,
            discount_adjustments TEXT NOT NULL DEFAULT '[]',
            extra_charges TEXT NOT NULL DEFAULT '[]',
            late_fee_amount TEXT NOT NULL DEFAULT '0',
            final_amount TEXT NOT NULL,
            paid_amount TEXT,
            payment_status TEXT NOT NULL DEFAULT 'pending',
            is_locked INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(school_year_id) REFERENCES school_years(id),
            FOREIGN KEY(tuition_type_id) REFERENCES tuition_types(id),
            UNIQUE(student_id, billing_year, billing_month)
        )",
        [],
    )?;
    ensure_billing_records_locked_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_billing_records_period ON billing_records(billing_year, billing_month)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_billing_records_year ON billing_records(school_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS billing_payments(
            id TEXT PRIMARY KEY,
            record_id TEXT NOT NULL,
            amount TEXT NOT NULL,
            paid_on TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(record_id) REFERENCES billing_records(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_billing_payments_record ON billing_payments(record_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_billing_records_locked_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "billing_records", "locked_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE billing_records ADD COLUMN locked_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("bad settings json for {}", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

/// Money columns are TEXT so no precision is lost through REAL.
pub fn decimal_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub fn opt_decimal_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        Decimal::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

pub fn json_col<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
