//! Customer registry and credit/advance ledger.
//!
//! Customers are created lazily the first time a bill names them, together
//! with a zeroed ledger row. The ledger keeps exactly one row per customer:
//! `advance` is money the shop owes the customer (pre-paid credit),
//! `remaining` is money the customer still owes the shop. Reconciliation
//! keeps at most one of the two nonzero; this module only guards the signs
//! and the 2-decimal rounding at the persistence boundary.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::billing::round2;
use crate::db::DbState;
use crate::error::{is_unique_violation, Error, Result};

// ---------------------------------------------------------------------------
// Customer registry
// ---------------------------------------------------------------------------

/// Resolve a customer name to its id, creating the customer (and a zeroed
/// ledger row) on first sight.
///
/// Names are trimmed before use; the `customers.name` column collates
/// NOCASE, so "Ali " and "ali" resolve to the same customer and duplicate
/// creation is blocked by the store, not by this function. A lost creation
/// race is recovered by re-resolving the existing row.
pub fn resolve_customer(conn: &Connection, name: &str) -> Result<i64> {
    let display_name = name.trim();
    if display_name.is_empty() {
        return Err(Error::Validation("customer name is required".into()));
    }

    if let Some(id) = find_customer(conn, display_name)? {
        return Ok(id);
    }

    match create_customer(conn, display_name) {
        Ok(id) => {
            info!(customer_id = id, name = %display_name, "customer created");
            Ok(id)
        }
        Err(Error::Db(e)) if is_unique_violation(&e) => find_customer(conn, display_name)?
            .ok_or_else(|| Error::Duplicate(format!("customer '{display_name}'"))),
        Err(e) => Err(e),
    }
}

fn find_customer(conn: &Connection, display: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM customers WHERE name = ?1",
            params![display],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn create_customer(conn: &Connection, display: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO customers (name, created_at) VALUES (?1, ?2)",
        params![display, Utc::now()],
    )?;
    let id = conn.last_insert_rowid();
    conn.execute(
        "INSERT OR IGNORE INTO ledger (customer_id, advance, remaining) VALUES (?1, 0, 0)",
        params![id],
    )?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// Ledger store
// ---------------------------------------------------------------------------

/// Read a customer's (advance, remaining) state, defaulting to (0, 0) when
/// no ledger row exists.
pub fn get_ledger(conn: &Connection, customer_id: i64) -> Result<(f64, f64)> {
    let row = conn
        .query_row(
            "SELECT advance, remaining FROM ledger WHERE customer_id = ?1",
            params![customer_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row.unwrap_or((0.0, 0.0)))
}

/// Overwrite a customer's ledger state.
///
/// Both values are rounded to 2 decimals before persisting. Negative
/// values are rejected; the reconciliation algorithm never produces them,
/// so a negative here means the caller is broken.
pub fn set_ledger(conn: &Connection, customer_id: i64, advance: f64, remaining: f64) -> Result<()> {
    if advance < 0.0 || remaining < 0.0 {
        return Err(Error::Validation(format!(
            "ledger values must be non-negative (advance {advance:.2}, remaining {remaining:.2})"
        )));
    }

    conn.execute(
        "INSERT INTO ledger (customer_id, advance, remaining) VALUES (?1, ?2, ?3)
         ON CONFLICT(customer_id) DO UPDATE SET
            advance = excluded.advance,
            remaining = excluded.remaining",
        params![customer_id, round2(advance), round2(remaining)],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Credit page query surface
// ---------------------------------------------------------------------------

/// One row of the credit/advance ledger page.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerRow {
    pub customer: String,
    pub advance: f64,
    pub remaining: f64,
}

/// List every customer's ledger state, ordered by customer name.
pub fn list_ledger(db: &DbState) -> Result<Vec<LedgerRow>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT c.name, l.advance, l.remaining
         FROM customers c
         JOIN ledger l ON l.customer_id = c.id
         ORDER BY c.name",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(LedgerRow {
                customer: row.get(0)?,
                advance: row.get(1)?,
                remaining: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ===========================================================================
// Tests
// ===========================================================================
