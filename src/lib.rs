//! Aqua POS — billing and credit ledger backend.
//!
//! Backend library for a single-terminal bottled-water shop. The UI shell
//! embeds [`db::DbState`] and [`auth::AuthState`] and calls the entry
//! points with an explicit session token; the crate never reads ambient
//! user state. The heart of the system is [`billing::reconcile`], which
//! settles each bill against the customer's stored advance or outstanding
//! debt, and [`billing::create_bill`], which persists the result and the
//! invoice atomically.

use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod admin;
pub mod auth;
pub mod billing;
pub mod bills;
pub mod db;
pub mod error;
pub mod invoice;
pub mod ledger;

pub use auth::{AuthState, Session};
pub use billing::{create_bill, reconcile, BillOutcome, LineItem, LineItemInput, DEFAULT_PRODUCTS};
pub use bills::{get_by_serial, list_bills, reissue_invoice, Bill, BillSummary};
pub use db::DbState;
pub use error::{Error, Result};
pub use ledger::{list_ledger, LedgerRow};

/// Initialize structured logging (console + daily-rolling file).
///
/// Must be called at most once, by the embedding shell; a second call
/// panics because the global subscriber is already set.
pub fn init_logging(log_dir: &Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,aqua_pos=debug"));

    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "aqua-pos");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the process — dropping it
    // stops log flushing.
    std::mem::forget(guard);

    info!("Aqua POS backend v{}", env!("CARGO_PKG_VERSION"));
}
