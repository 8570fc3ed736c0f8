//! Local SQLite database layer for the cash register.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! the immediate-transaction wrapper every state transition runs in, and the
//! money/timestamp column codecs shared by the session, ledger and sale
//! modules.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{CashError, Result};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/cash.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> std::result::Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("cash.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> std::result::Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> std::result::Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: settings, outbox, audit trail and the operator directory.
fn migrate_v1(conn: &Connection) -> std::result::Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- sync_queue (append-only outbox for the hosted store)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER DEFAULT 0,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            synced_at TEXT
        );

        -- audit_log (who did what to which session/sale)
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor_id TEXT NOT NULL,
            action TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            details TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );

        -- operators (directory cache fed by the identity service)
        CREATE TABLE IF NOT EXISTS operators (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            is_admin INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_audit_log_entity ON audit_log(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: cash sessions and the movement ledger.
///
/// Money columns are TEXT holding canonical decimals. The partial unique
/// index is what rejects a second open session for the same operator when
/// two connections race past the in-transaction check.
fn migrate_v2(conn: &Connection) -> std::result::Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cash_sessions (
            id TEXT PRIMARY KEY,
            display_id INTEGER NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'aberto' CHECK (status IN ('aberto', 'fechado')),
            opening_balance TEXT NOT NULL DEFAULT '0',
            open_time TEXT NOT NULL,
            close_time TEXT,
            deposits TEXT NOT NULL DEFAULT '0',
            withdrawals TEXT NOT NULL DEFAULT '0',
            transactions_value TEXT NOT NULL DEFAULT '0',
            cash_in_register TEXT NOT NULL DEFAULT '0',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (
                (status = 'aberto' AND close_time IS NULL)
                OR (status = 'fechado' AND close_time IS NOT NULL)
            )
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_cash_sessions_one_open_per_user
            ON cash_sessions(user_id) WHERE status = 'aberto';
        CREATE INDEX IF NOT EXISTS idx_cash_sessions_user_id ON cash_sessions(user_id);
        CREATE INDEX IF NOT EXISTS idx_cash_sessions_open_time ON cash_sessions(open_time);

        CREATE TABLE IF NOT EXISTS cash_movements (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            movement_type TEXT NOT NULL CHECK (movement_type IN ('suprimento', 'sangria')),
            amount TEXT NOT NULL,
            reason TEXT NOT NULL CHECK (length(trim(reason)) > 0),
            user_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES cash_sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_cash_movements_session_id ON cash_movements(session_id);

        CREATE TRIGGER IF NOT EXISTS trg_cash_movements_append_only
        BEFORE UPDATE ON cash_movements
        BEGIN
            SELECT RAISE(ABORT, 'cash_movements is append-only');
        END;

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (cash session tables)");
    Ok(())
}

/// Migration v3: sales and their ordered payments.
///
/// `sales.cash_session_id` has no foreign key: legacy rows may point at a
/// session that no longer resolves, and the linker has to see them as such.
fn migrate_v3(conn: &Connection) -> std::result::Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            cash_session_id TEXT,
            cash_session_display_id INTEGER,
            salesperson_id TEXT NOT NULL,
            channel TEXT NOT NULL DEFAULT 'backoffice' CHECK (channel IN ('register', 'backoffice')),
            status TEXT NOT NULL CHECK (status IN ('Finalizada', 'Pendente', 'Cancelada', 'Editada', 'Rascunho')),
            total TEXT NOT NULL DEFAULT '0',
            cancellation_reason TEXT,
            cancelled_by TEXT,
            cancelled_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sale_payments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sale_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            method TEXT NOT NULL,
            amount TEXT NOT NULL,
            fees TEXT,
            FOREIGN KEY(sale_id) REFERENCES sales(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_sales_cash_session_id ON sales(cash_session_id);
        CREATE INDEX IF NOT EXISTS idx_sales_salesperson_id ON sales(salesperson_id);
        CREATE INDEX IF NOT EXISTS idx_sale_payments_sale_id ON sale_payments(sale_id);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3 (sales tables)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Transactions, outbox, audit
// ---------------------------------------------------------------------------

/// Run `f` inside `BEGIN IMMEDIATE … COMMIT`, rolling back on any error.
pub(crate) fn with_immediate_tx<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    match f(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Enqueue a change for the hosted store.
pub(crate) fn enqueue_sync(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    operation: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let idempotency_key = format!("{entity_type}:{operation}:{entity_id}:{}", Uuid::new_v4());
    conn.execute(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entity_type,
            entity_id,
            operation,
            payload.to_string(),
            idempotency_key
        ],
    )?;
    Ok(())
}

/// Encode an entity for `sync_queue`.
pub(crate) fn sync_payload<T: serde::Serialize>(entity: &T) -> Result<serde_json::Value> {
    serde_json::to_value(entity)
        .map_err(|e| CashError::Storage(format!("could not encode sync payload: {e}")))
}

pub(crate) fn write_audit(
    conn: &Connection,
    actor_id: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    details: &serde_json::Value,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (actor_id, action, entity_type, entity_id, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            actor_id,
            action,
            entity_type,
            entity_id,
            details.to_string(),
            now_timestamp()
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

/// RFC 3339 UTC with millisecond precision; lexicographic order == time order.
pub(crate) fn now_timestamp() -> String {
    format_timestamp(&Utc::now())
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn timestamp_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_timestamp_at(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get_ref(idx)? {
        ValueRef::Null => Ok(None),
        _ => timestamp_at(row, idx).map(Some),
    }
}

/// Read a money column. TEXT is the canonical encoding; REAL/INTEGER are
/// accepted for rows written by older tooling.
pub(crate) fn decimal_at(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    match row.get_ref(idx)? {
        ValueRef::Text(raw) => {
            let text = String::from_utf8_lossy(raw);
            Decimal::from_str(text.trim()).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
            })
        }
        ValueRef::Integer(v) => Ok(Decimal::from(v)),
        ValueRef::Real(v) => Decimal::try_from(v)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Real, Box::new(e))),
        ValueRef::Null => Ok(Decimal::ZERO),
        ValueRef::Blob(_) => Err(rusqlite::Error::InvalidColumnType(
            idx,
            "money".to_string(),
            Type::Blob,
        )),
    }
}

pub(crate) fn opt_decimal_at(row: &Row, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    match row.get_ref(idx)? {
        ValueRef::Null => Ok(None),
        _ => decimal_at(row, idx).map(Some),
    }
}

pub(crate) fn money_text(value: &Decimal) -> String {
    value.normalize().to_string()
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory database with the full schema, shared by the module tests.
#[cfg(test)]
pub fn test_db() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
