//! Billing engine: reconciliation of advance, payment, and debt.
//!
//! [`reconcile`] is the heart of the system and the only piece with subtle
//! semantics. For one bill it applies the customer's stored advance to the
//! subtotal first, then the payment made now, and folds whatever is left
//! into new debt or new advance. It is pure: no I/O, deterministic output.
//!
//! [`create_bill`] is the orchestration around it: resolve the customer,
//! read the prior ledger state, reconcile, and persist bill + line items +
//! new ledger state in a single `BEGIN IMMEDIATE` transaction so that no
//! failure can leave a bill recorded against a stale ledger.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{self, AuthState};
use crate::db::DbState;
use crate::error::{Error, Result};
use crate::{bills, invoice, ledger};

/// Products the billing form offers by default. The engine itself accepts
/// arbitrary item names.
pub const DEFAULT_PRODUCTS: [&str; 3] = ["500ML PACK", "1.5LTR PACK", "6LTR BOTTLE"];

/// Round to 2 decimal places, half away from zero.
///
/// Applied to every monetary value at each persisted boundary.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One purchased line as entered at the till.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemInput {
    pub name: String,
    pub qty: f64,
    pub price: f64,
}

/// A surviving line item with its computed total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub qty: f64,
    pub price: f64,
    pub total: f64,
}

/// Result of reconciling one bill against the prior ledger state.
#[derive(Debug, Clone, Serialize)]
pub struct BillOutcome {
    pub subtotal: f64,
    pub advance_applied: f64,
    pub amount_paid: f64,
    pub advance_after: f64,
    pub remaining_after: f64,
    pub items: Vec<LineItem>,
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Reconcile a bill: stored advance is consumed first, then the payment
/// made now; leftover payment becomes new advance, any shortfall becomes
/// new debt on top of `prior_remaining`.
///
/// Items with `qty <= 0` or `price < 0` are silently dropped and negative
/// payments clamp to 0 — filtering policy inherited from the till form,
/// not an error path. NaN or infinite numbers are the one hard failure.
///
/// Prior debt is untouched by an overpayment on the same bill: advance
/// only ever offsets a future subtotal, never `remaining` directly.
/// Inconsistent prior states (both advance and remaining nonzero) are
/// reconciled as-is rather than rejected; the output restores the
/// one-side-only invariant whenever the input held it and subtotal > 0.
pub fn reconcile(
    prior_advance: f64,
    prior_remaining: f64,
    items: &[LineItemInput],
    payment_now: f64,
) -> Result<BillOutcome> {
    for (label, value) in [
        ("prior advance", prior_advance),
        ("prior remaining", prior_remaining),
        ("payment", payment_now),
    ] {
        if !value.is_finite() {
            return Err(Error::InvalidInput(format!("{label} is not a number")));
        }
    }

    let mut subtotal = 0.0;
    let mut lines = Vec::new();
    for item in items {
        if !item.qty.is_finite() || !item.price.is_finite() {
            return Err(Error::InvalidInput(format!(
                "item '{}' has a non-numeric quantity or price",
                item.name
            )));
        }
        if item.qty <= 0.0 || item.price < 0.0 {
            continue;
        }
        let total = round2(item.qty * item.price);
        subtotal += total;
        lines.push(LineItem {
            name: item.name.clone(),
            qty: item.qty,
            price: item.price,
            total,
        });
    }
    let subtotal = round2(subtotal);

    // Use advance first, capped at the subtotal
    let advance_applied = prior_advance.min(subtotal);
    let after_advance = subtotal - advance_applied;

    let payment = payment_now.max(0.0);
    let after_payment = after_advance - payment;

    let (advance_after, remaining_after) = if after_payment > 0.0 {
        // Customer still owes
        (prior_advance - advance_applied, prior_remaining + after_payment)
    } else {
        // Overpaid (or exact): surplus becomes new advance
        let overpay = -after_payment;
        ((prior_advance - advance_applied) + overpay, prior_remaining)
    };

    Ok(BillOutcome {
        subtotal,
        advance_applied,
        amount_paid: payment,
        advance_after: round2(advance_after),
        remaining_after: round2(remaining_after),
        items: lines,
    })
}

// ---------------------------------------------------------------------------
// Bill creation
// ---------------------------------------------------------------------------

/// Create and persist one bill, returning its serial, the reconciliation
/// outcome, and the rendered invoice PDF.
///
/// The registry lookup, ledger read, reconciliation, bill append, and
/// ledger update all run inside one `BEGIN IMMEDIATE` transaction on the
/// shared connection, so concurrent billing cannot act on a stale prior
/// state and no failure leaves partial rows behind. Invoice rendering
/// happens after commit, from the stored record, which keeps the returned
/// bytes identical to a later re-issue of the same serial.
pub fn create_bill(
    db: &DbState,
    auth: &AuthState,
    token: &str,
    customer_name: &str,
    items: &[LineItemInput],
    amount_paid: f64,
) -> Result<(i64, BillOutcome, Vec<u8>)> {
    auth::require_session(auth, token)?;

    let conn = db.lock()?;
    let bill_date = Utc::now();

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> Result<(i64, BillOutcome)> {
        let customer_id = ledger::resolve_customer(&conn, customer_name)?;
        let (prior_advance, prior_remaining) = ledger::get_ledger(&conn, customer_id)?;
        let outcome = reconcile(prior_advance, prior_remaining, items, amount_paid)?;
        let serial = bills::append_bill(&conn, customer_id, &outcome, bill_date)?;
        ledger::set_ledger(&conn, customer_id, outcome.advance_after, outcome.remaining_after)?;
        Ok((serial, outcome))
    })();

    let (serial, outcome) = match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")?;
            v
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };
    drop(conn);

    info!(
        serial,
        customer = %customer_name.trim(),
        subtotal = outcome.subtotal,
        paid = outcome.amount_paid,
        remaining = outcome.remaining_after,
        advance = outcome.advance_after,
        "bill created"
    );

    let bill = bills::get_by_serial(db, serial)?;
    let pdf = invoice::render(&bill)?;
    Ok((serial, outcome, pdf))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }
    }

    /// Sign up an operator and open a session for entry-point tests.
    fn operator_session(db: &DbState) -> (AuthState, String) {
        let auth = AuthState::new();
        auth::sign_up(db, "op@example.com", "hunter2").unwrap();
        let session = auth::login(db, &auth, "op@example.com", "hunter2").unwrap();
        (auth, session.token)
    }

    fn item(name: &str, qty: f64, price: f64) -> LineItemInput {
        LineItemInput {
            name: name.into(),
            qty,
            price,
        }
    }

    // -- pure engine ---------------------------------------------------------

    #[test]
    fn test_first_bill_underpaid_creates_debt() {
        // Scenario: fresh customer, 150.00 of water, pays 100.00
        let items = [item("500ML PACK", 10.0, 5.0), item("6LTR BOTTLE", 2.0, 50.0)];
        let out = reconcile(0.0, 0.0, &items, 100.0).unwrap();

        assert_eq!(out.subtotal, 150.0);
        assert_eq!(out.advance_applied, 0.0);
        assert_eq!(out.amount_paid, 100.0);
        assert_eq!(out.remaining_after, 50.0);
        assert_eq!(out.advance_after, 0.0);
        assert_eq!(out.items.len(), 2);
    }

    #[test]
    fn test_advance_covers_bill_without_payment() {
        // 15.00 of the 20.00 advance is consumed; the rest stays banked
        let out = reconcile(20.0, 0.0, &[item("1.5LTR PACK", 3.0, 5.0)], 0.0).unwrap();

        assert_eq!(out.subtotal, 15.0);
        assert_eq!(out.advance_applied, 15.0);
        assert_eq!(out.advance_after, 5.0);
        assert_eq!(out.remaining_after, 0.0);
    }

    #[test]
    fn test_exact_payment_leaves_prior_debt_untouched() {
        // Paying this bill in full does not pay down old debt: advance
        // offsets subtotals, never remaining directly.
        let out = reconcile(0.0, 30.0, &[item("6LTR BOTTLE", 1.0, 30.0)], 30.0).unwrap();

        assert_eq!(out.subtotal, 30.0);
        assert_eq!(out.advance_applied, 0.0);
        assert_eq!(out.advance_after, 0.0);
        assert_eq!(out.remaining_after, 30.0);
    }

    #[test]
    fn test_overpayment_becomes_advance() {
        let out = reconcile(0.0, 0.0, &[item("500ML PACK", 4.0, 5.0)], 50.0).unwrap();

        assert_eq!(out.subtotal, 20.0);
        assert_eq!(out.amount_paid, 50.0);
        assert_eq!(out.advance_after, 30.0);
        assert_eq!(out.remaining_after, 0.0);
    }

    #[test]
    fn test_partial_advance_then_partial_payment() {
        // 10 advance against 50 bill, pays 25: owes 15 more
        let out = reconcile(10.0, 0.0, &[item("6LTR BOTTLE", 1.0, 50.0)], 25.0).unwrap();

        assert_eq!(out.advance_applied, 10.0);
        assert_eq!(out.advance_after, 0.0);
        assert_eq!(out.remaining_after, 15.0);
    }

    #[test]
    fn test_empty_cart_with_payment_accumulates_advance() {
        // Subtotal 0: nothing to apply advance to, payment is all surplus
        let out = reconcile(20.0, 0.0, &[], 10.0).unwrap();

        assert_eq!(out.subtotal, 0.0);
        assert_eq!(out.advance_applied, 0.0);
        assert_eq!(out.advance_after, 30.0);
        assert_eq!(out.remaining_after, 0.0);
    }

    #[test]
    fn test_invalid_lines_are_filtered_not_rejected() {
        let items = [
            item("500ML PACK", 0.0, 5.0),   // zero quantity
            item("1.5LTR PACK", -2.0, 5.0), // negative quantity
            item("6LTR BOTTLE", 1.0, -1.0), // negative price
            item("6LTR BOTTLE", 2.0, 50.0), // the only survivor
        ];
        let out = reconcile(0.0, 0.0, &items, 0.0).unwrap();

        assert_eq!(out.subtotal, 100.0);
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].name, "6LTR BOTTLE");
    }

    #[test]
    fn test_free_item_survives_filtering() {
        // price 0 is legal; only negative prices are dropped
        let out = reconcile(0.0, 0.0, &[item("SAMPLE", 1.0, 0.0)], 0.0).unwrap();
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.subtotal, 0.0);
    }

    #[test]
    fn test_negative_payment_clamps_to_zero() {
        let out = reconcile(0.0, 0.0, &[item("500ML PACK", 2.0, 5.0)], -40.0).unwrap();

        assert_eq!(out.amount_paid, 0.0);
        assert_eq!(out.remaining_after, 10.0);
    }

    #[test]
    fn test_non_numeric_input_is_an_error() {
        assert!(matches!(
            reconcile(0.0, 0.0, &[item("X", f64::NAN, 1.0)], 0.0),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            reconcile(0.0, 0.0, &[item("X", 1.0, f64::INFINITY)], 0.0),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            reconcile(0.0, 0.0, &[], f64::NAN),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_line_totals_round_per_line_before_summing() {
        // 3 x 0.335 = 1.005 -> 1.01 per line, then summed
        let out = reconcile(0.0, 0.0, &[item("A", 3.0, 0.335), item("B", 3.0, 0.335)], 0.0)
            .unwrap();
        assert_eq!(out.items[0].total, 1.01);
        assert_eq!(out.subtotal, 2.02);
    }

    #[test]
    fn test_outcome_serializes_for_the_shell() {
        // The UI shell ships outcomes over IPC as JSON
        let out = reconcile(0.0, 0.0, &[item("500ML PACK", 10.0, 5.0)], 20.0).unwrap();
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["subtotal"], 50.0);
        assert_eq!(v["remaining_after"], 30.0);
        assert_eq!(v["items"][0]["name"], "500ML PACK");
    }

    #[test]
    fn test_outcome_signs_and_mutual_exclusivity() {
        // Sweep a few prior states and payments; outputs must keep both
        // sides non-negative, and collapse to one side whenever the prior
        // state was consistent and the bill was non-empty.
        let cases = [
            (0.0, 0.0, 10.0, 0.0),
            (0.0, 0.0, 10.0, 25.0),
            (35.0, 0.0, 10.0, 0.0),
            (5.0, 0.0, 10.0, 2.0),
            (0.0, 40.0, 10.0, 10.0),
            (0.0, 40.0, 10.0, 3.0),
        ];
        for (adv, rem, price, paid) in cases {
            let out = reconcile(adv, rem, &[item("W", 1.0, price)], paid).unwrap();
            assert!(out.advance_after >= 0.0, "advance {out:?}");
            assert!(out.remaining_after >= 0.0, "remaining {out:?}");
            if rem == 0.0 || adv == 0.0 {
                assert!(
                    out.advance_after == 0.0 || out.remaining_after == 0.0,
                    "both sides nonzero for {adv}/{rem}/{price}/{paid}: {out:?}"
                );
            }
        }
    }

    #[test]
    fn test_money_is_conserved() {
        // advance_applied + payment - subtotal must equal the net movement
        // of the two ledger sides: no money created or destroyed.
        let cases = [
            (0.0, 0.0, 150.0, 100.0),
            (20.0, 0.0, 15.0, 0.0),
            (0.0, 30.0, 30.0, 30.0),
            (10.0, 0.0, 50.0, 25.0),
            (0.0, 0.0, 20.0, 50.0),
        ];
        for (adv, rem, subtotal, paid) in cases {
            let out = reconcile(adv, rem, &[item("W", 1.0, subtotal)], paid).unwrap();
            let advance_delta = out.advance_after - (adv - out.advance_applied);
            let remaining_delta = out.remaining_after - rem;
            let net = out.advance_applied + out.amount_paid - out.subtotal
                - (advance_delta - remaining_delta);
            assert!(
                net.abs() < 1e-9,
                "money leak {net} for {adv}/{rem}/{subtotal}/{paid}: {out:?}"
            );
        }
    }

    #[test]
    fn test_inconsistent_prior_state_is_reconciled_not_rejected() {
        // Both sides nonzero upstream: the engine still applies advance to
        // the subtotal and leaves remaining on its own track.
        let out = reconcile(10.0, 5.0, &[item("W", 1.0, 10.0)], 0.0).unwrap();
        assert_eq!(out.advance_applied, 10.0);
        assert_eq!(out.advance_after, 0.0);
        assert_eq!(out.remaining_after, 5.0);
    }

    // -- orchestration -------------------------------------------------------

    #[test]
    fn test_create_bill_persists_bill_items_and_ledger_atomically() {
        let db = test_db();
        let (auth, token) = operator_session(&db);

        let items = [item("500ML PACK", 10.0, 5.0), item("6LTR BOTTLE", 2.0, 50.0)];
        let (serial, out, pdf) =
            create_bill(&db, &auth, &token, "Ali", &items, 100.0).unwrap();

        assert!(serial >= 1);
        assert_eq!(out.remaining_after, 50.0);
        assert!(pdf.starts_with(b"%PDF"));

        let conn = db.conn.lock().unwrap();
        let (advance, remaining): (f64, f64) = conn
            .query_row(
                "SELECT l.advance, l.remaining FROM ledger l
                 JOIN customers c ON c.id = l.customer_id WHERE c.name = 'Ali'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((advance, remaining), (0.0, 50.0));

        let item_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM bill_items WHERE bill_id = ?1",
                [serial],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(item_count, 2);
    }

    #[test]
    fn test_second_bill_draws_down_recorded_advance() {
        let db = test_db();
        let (auth, token) = operator_session(&db);

        // Overpay the first bill by 30
        create_bill(&db, &auth, &token, "Sara", &[item("500ML PACK", 4.0, 5.0)], 50.0).unwrap();
        // Second bill of 25 should consume the advance first
        let (_, out, _) =
            create_bill(&db, &auth, &token, "Sara", &[item("1.5LTR PACK", 5.0, 5.0)], 0.0)
                .unwrap();

        assert_eq!(out.advance_applied, 25.0);
        assert_eq!(out.advance_after, 5.0);
        assert_eq!(out.remaining_after, 0.0);
    }

    #[test]
    fn test_create_bill_rejects_without_session() {
        let db = test_db();
        let auth = AuthState::new();

        let err = create_bill(&db, &auth, "no-such-token", "Ali", &[], 0.0).unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn test_create_bill_rolls_back_fully_on_bad_name() {
        let db = test_db();
        let (auth, token) = operator_session(&db);

        let err =
            create_bill(&db, &auth, &token, "  ", &[item("500ML PACK", 1.0, 5.0)], 5.0)
                .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let conn = db.conn.lock().unwrap();
        for table in ["customers", "ledger", "bills", "bill_items"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(count, 0, "partial state left in {table}");
        }
    }

    #[test]
    fn test_create_bill_excludes_filtered_items_from_persistence() {
        let db = test_db();
        let (auth, token) = operator_session(&db);

        let items = [item("500ML PACK", 0.0, 5.0), item("6LTR BOTTLE", 1.0, 50.0)];
        let (serial, _, _) = create_bill(&db, &auth, &token, "Ali", &items, 50.0).unwrap();

        let conn = db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM bill_items WHERE bill_id = ?1",
                [serial],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1, "zero-quantity line must not be persisted");
    }

    #[test]
    fn test_serials_are_monotonic() {
        let db = test_db();
        let (auth, token) = operator_session(&db);

        let (first, _, _) =
            create_bill(&db, &auth, &token, "Ali", &[item("500ML PACK", 1.0, 5.0)], 5.0).unwrap();
        let (second, _, _) =
            create_bill(&db, &auth, &token, "Sara", &[item("500ML PACK", 1.0, 5.0)], 5.0).unwrap();
        assert!(second > first);
    }
}
