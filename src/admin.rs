//! Administrative maintenance.
//!
//! One operation: wipe all business data (customers, ledger, bills, line
//! items) in a single transaction. Operator accounts survive so the shop
//! can log back in afterwards.

use tracing::warn;

use crate::auth::{self, AuthState};
use crate::db::{self, DbState};
use crate::error::Result;

/// Delete every customer, ledger row, bill, and line item atomically.
pub fn wipe_business_data(db: &DbState, auth: &AuthState, token: &str) -> Result<()> {
    auth::require_session(auth, token)?;

    let conn = db.lock()?;
    db::clear_business_data(&conn)?;

    warn!("all business data wiped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
