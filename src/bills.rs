//! Bill record store: append-only log of finalized bills.
//!
//! Bills and their line items are write-once. The serial is the SQLite
//! rowid of the `bills` table (AUTOINCREMENT, monotonic, never reused);
//! gaps can appear after a rolled-back attempt, which is fine. Besides the
//! append that runs inside the bill-creation transaction, this module
//! serves the history page and re-issues invoices by serial.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::auth::{self, AuthState};
use crate::billing::{round2, BillOutcome, LineItem};
use crate::db::DbState;
use crate::error::{Error, Result};
use crate::invoice;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A finalized bill as stored, with its line items and customer name.
#[derive(Debug, Clone, Serialize)]
pub struct Bill {
    pub serial: i64,
    pub customer_id: i64,
    pub customer_name: String,
    pub bill_date: DateTime<Utc>,
    pub subtotal: f64,
    pub advance_applied: f64,
    pub amount_paid: f64,
    pub remaining_after: f64,
    pub advance_after: f64,
    pub items: Vec<LineItem>,
}

/// One row of the billing-history page.
#[derive(Debug, Clone, Serialize)]
pub struct BillSummary {
    pub serial: i64,
    pub customer_name: String,
    pub bill_date: DateTime<Utc>,
    pub subtotal: f64,
    pub amount_paid: f64,
    pub remaining_after: f64,
    pub advance_after: f64,
}

// ---------------------------------------------------------------------------
// Append
// ---------------------------------------------------------------------------

/// Persist a bill and its line items, returning the assigned serial.
///
/// The caller owns the surrounding transaction; this function must never
/// be invoked outside the atomic bill-creation unit.
pub(crate) fn append_bill(
    conn: &Connection,
    customer_id: i64,
    outcome: &BillOutcome,
    bill_date: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO bills (customer_id, bill_date, subtotal, advance_applied,
                            amount_paid, remaining_after, advance_after)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            customer_id,
            bill_date,
            round2(outcome.subtotal),
            round2(outcome.advance_applied),
            round2(outcome.amount_paid),
            round2(outcome.remaining_after),
            round2(outcome.advance_after),
        ],
    )?;
    let serial = conn.last_insert_rowid();

    for item in &outcome.items {
        conn.execute(
            "INSERT INTO bill_items (bill_id, item_name, quantity, unit_price, line_total)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![serial, item.name, item.qty, round2(item.price), round2(item.total)],
        )?;
    }

    Ok(serial)
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Load a bill with its line items by serial.
pub fn get_by_serial(db: &DbState, serial: i64) -> Result<Bill> {
    let conn = db.lock()?;

    let bill = conn
        .query_row(
            "SELECT b.id, b.customer_id, c.name, b.bill_date, b.subtotal,
                    b.advance_applied, b.amount_paid, b.remaining_after, b.advance_after
             FROM bills b
             JOIN customers c ON c.id = b.customer_id
             WHERE b.id = ?1",
            params![serial],
            |row| {
                Ok(Bill {
                    serial: row.get(0)?,
                    customer_id: row.get(1)?,
                    customer_name: row.get(2)?,
                    bill_date: row.get(3)?,
                    subtotal: row.get(4)?,
                    advance_applied: row.get(5)?,
                    amount_paid: row.get(6)?,
                    remaining_after: row.get(7)?,
                    advance_after: row.get(8)?,
                    items: Vec::new(),
                })
            },
        )
        .optional()?;

    let mut bill = bill.ok_or(Error::NotFound(serial))?;

    let mut stmt = conn.prepare(
        "SELECT item_name, quantity, unit_price, line_total
         FROM bill_items WHERE bill_id = ?1 ORDER BY id",
    )?;
    bill.items = stmt
        .query_map(params![serial], |row| {
            Ok(LineItem {
                name: row.get(0)?,
                qty: row.get(1)?,
                price: row.get(2)?,
                total: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(bill)
}

/// List bill summaries for the history page, newest serial first.
pub fn list_bills(db: &DbState) -> Result<Vec<BillSummary>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT b.id, c.name, b.bill_date, b.subtotal, b.amount_paid,
                b.remaining_after, b.advance_after
         FROM bills b
         JOIN customers c ON c.id = b.customer_id
         ORDER BY b.id DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(BillSummary {
                serial: row.get(0)?,
                customer_name: row.get(1)?,
                bill_date: row.get(2)?,
                subtotal: row.get(3)?,
                amount_paid: row.get(4)?,
                remaining_after: row.get(5)?,
                advance_after: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Invoice re-issue
// ---------------------------------------------------------------------------

/// Re-render the invoice PDF for a stored bill.
///
/// Renders purely from the stored record, so the bytes match the original
/// download and every later re-issue of the same serial.
pub fn reissue_invoice(db: &DbState, auth: &AuthState, token: &str, serial: i64) -> Result<Vec<u8>> {
    auth::require_session(auth, token)?;
    let bill = get_by_serial(db, serial)?;
    let pdf = invoice::render(&bill)?;
    info!(serial, bytes = pdf.len(), "invoice re-issued");
    Ok(pdf)
}

// ===========================================================================
// Tests
// ===========================================================================
