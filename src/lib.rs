//! Cash register sessions for the point-of-sale backend.
//!
//! Operators open a cash session with an opening balance, ring up sales and
//! record deposits (`suprimento`) and withdrawals (`sangria`) against it, then
//! close it. Everything is stored in a local SQLite database; changes are
//! queued in `sync_queue` for the hosted store.
//!
//! The frontend talks to [`commands`]; the domain modules can also be used
//! directly.

pub mod auth;
pub mod board;
pub mod commands;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod movements;
pub mod operators;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod sales;
pub mod sessions;
pub mod settings;

pub use auth::{authorize, Actor, AuthDecision, Capability};
pub use commands::RegisterState;
pub use error::{CashError, Result, Toast};
pub use events::{CashEvent, EventBus};
pub use movements::{Movement, MovementType, NewMovement};
pub use sales::{Payment, Sale, SaleChannel, SaleStatus};
pub use sessions::{CashSession, SessionStatus};
pub use settings::{CashSettings, ReopenPolicy};

use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

/// Set up logging under `{data_dir}/logs` and open the register database.
///
/// Keep the returned guard alive; dropping it flushes the log file.
pub fn start(data_dir: &Path) -> std::result::Result<(RegisterState, WorkerGuard), String> {
    let json_logs = std::env::var("POS_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let guard = logging::init_logging(&logging::log_dir(data_dir), json_logs)?;

    info!("Starting cash register v{}", env!("CARGO_PKG_VERSION"));

    let state = RegisterState::open(data_dir)?;
    Ok((state, guard))
}
