//! Cash session lifecycle.
//!
//! A session is opened by an operator with an opening balance, accumulates
//! sales and ledger movements while `aberto`, and is closed (and possibly
//! reopened) later. The store enforces at most one open session per
//! operator; every transition here runs inside `BEGIN IMMEDIATE` so the
//! in-transaction check and the partial unique index agree.

use chrono::{DateTime, Local, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{authorize, Actor, Capability, Resource};
use crate::db::{self, DbState};
use crate::error::{is_unique_violation, CashError, Result};
use crate::movements::{self, Movement, NewMovement};
use crate::reconcile::{self, Aggregates, MethodTotal};
use crate::sales;
use crate::settings::{CashSettings, ReopenPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "aberto")]
    Open,
    #[serde(rename = "fechado")]
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "aberto",
            SessionStatus::Closed => "fechado",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "aberto" => Some(SessionStatus::Open),
            "fechado" => Some(SessionStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashSession {
    pub id: String,
    /// Human-facing sequence number, shown as `#N`.
    pub display_id: i64,
    pub user_id: String,
    pub status: SessionStatus,
    pub opening_balance: Decimal,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub deposits: Decimal,
    pub withdrawals: Decimal,
    pub transactions_value: Decimal,
    pub cash_in_register: Decimal,
    /// Ledger entries, newest first. Empty when loaded as part of a list.
    pub movements: Vec<Movement>,
}

impl CashSession {
    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    pub fn aggregates(&self) -> Aggregates {
        Aggregates {
            deposits: self.deposits,
            withdrawals: self.withdrawals,
            transactions_value: self.transactions_value,
            cash_in_register: self.cash_in_register,
        }
    }
}

pub(crate) const SESSION_COLUMNS: &str = "id, display_id, user_id, status, opening_balance, open_time, close_time,
     deposits, withdrawals, transactions_value, cash_in_register";

/// Map a row selected with [`SESSION_COLUMNS`] (in that order, starting at
/// column 0).
pub(crate) fn session_from_row(row: &Row) -> rusqlite::Result<CashSession> {
    let raw_status: String = row.get(3)?;
    let status = SessionStatus::parse(&raw_status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown session status: {raw_status}").into(),
        )
    })?;

    Ok(CashSession {
        id: row.get(0)?,
        display_id: row.get(1)?,
        user_id: row.get(2)?,
        status,
        opening_balance: db::decimal_at(row, 4)?,
        open_time: db::timestamp_at(row, 5)?,
        close_time: db::opt_timestamp_at(row, 6)?,
        deposits: db::decimal_at(row, 7)?,
        withdrawals: db::decimal_at(row, 8)?,
        transactions_value: db::decimal_at(row, 9)?,
        cash_in_register: db::decimal_at(row, 10)?,
        movements: Vec::new(),
    })
}

pub(crate) fn load_session(conn: &Connection, session_id: &str) -> Result<CashSession> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM cash_sessions WHERE id = ?1"),
        params![session_id],
        session_from_row,
    )
    .optional()?
    .ok_or_else(|| CashError::NotFound(format!("Cash session not found: {session_id}")))
}

pub(crate) fn load_session_with_movements(conn: &Connection, session_id: &str) -> Result<CashSession> {
    let mut session = load_session(conn, session_id)?;
    session.movements = movements::load_movements(conn, session_id, None)?;
    Ok(session)
}

pub(crate) fn ensure_session_exists(conn: &Connection, session_id: &str) -> Result<()> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM cash_sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(CashError::NotFound(format!(
            "Cash session not found: {session_id}"
        ))),
    }
}

/// `(id, display_id)` of the operator's open session, if any.
pub(crate) fn open_session_of(conn: &Connection, user_id: &str) -> Result<Option<(String, i64)>> {
    Ok(conn
        .query_row(
            "SELECT id, display_id FROM cash_sessions WHERE user_id = ?1 AND status = 'aberto'",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

/// Fold a sale posting (or its reversal, with negative deltas) into the
/// session counters. Must run inside a transaction.
pub(crate) fn post_sale_totals(
    conn: &Connection,
    session_id: &str,
    total_delta: Decimal,
    cash_delta: Decimal,
) -> Result<()> {
    let session = load_session(conn, session_id)?;
    conn.execute(
        "UPDATE cash_sessions SET transactions_value = ?1, cash_in_register = ?2, updated_at = ?3
         WHERE id = ?4",
        params![
            db::money_text(&(session.transactions_value + total_delta)),
            db::money_text(&(session.cash_in_register + cash_delta)),
            db::now_timestamp(),
            session_id,
        ],
    )?;
    Ok(())
}

fn owner_has_conflict(conn: &Connection, user_id: &str) -> Result<()> {
    if let Some((_, display_id)) = open_session_of(conn, user_id)? {
        return Err(CashError::Conflict(format!(
            "Operator {user_id} already has an open cash session (#{display_id})"
        )));
    }
    Ok(())
}

fn map_open_conflict(err: CashError, user_id: &str) -> CashError {
    match err {
        CashError::Database(ref e) if is_unique_violation(e) => CashError::Conflict(format!(
            "Operator {user_id} already has an open cash session"
        )),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Open a new session for the actor.
pub fn open_session(db: &DbState, actor: &Actor, opening_balance: Decimal) -> Result<CashSession> {
    if opening_balance < Decimal::ZERO {
        return Err(CashError::Validation(
            "Opening balance cannot be negative".into(),
        ));
    }
    if actor.user_id.trim().is_empty() {
        return Err(CashError::Validation("Missing userId".into()));
    }

    let conn = db.conn.lock()?;
    let session = db::with_immediate_tx(&conn, |tx| {
        owner_has_conflict(tx, &actor.user_id)?;

        let display_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(display_id), 0) + 1 FROM cash_sessions",
            [],
            |row| row.get(0),
        )?;

        let now = Utc::now();
        let session = CashSession {
            id: Uuid::new_v4().to_string(),
            display_id,
            user_id: actor.user_id.clone(),
            status: SessionStatus::Open,
            opening_balance,
            open_time: now,
            close_time: None,
            deposits: Decimal::ZERO,
            withdrawals: Decimal::ZERO,
            transactions_value: Decimal::ZERO,
            cash_in_register: opening_balance,
            movements: Vec::new(),
        };
        let ts = db::format_timestamp(&now);

        tx.execute(
            "INSERT INTO cash_sessions (
                id, display_id, user_id, status, opening_balance, open_time, close_time,
                deposits, withdrawals, transactions_value, cash_in_register, created_at, updated_at
             ) VALUES (?1, ?2, ?3, 'aberto', ?4, ?5, NULL, '0', '0', '0', ?4, ?5, ?5)",
            params![
                session.id,
                display_id,
                session.user_id,
                db::money_text(&opening_balance),
                ts,
            ],
        )?;

        db::enqueue_sync(tx, "cash_session", &session.id, "insert", &db::sync_payload(&session)?)?;
        db::write_audit(
            tx,
            &actor.user_id,
            "cash_session.open",
            "cash_session",
            &session.id,
            &json!({ "displayId": display_id, "openingBalance": opening_balance }),
        )?;
        Ok(session)
    })
    .map_err(|e| map_open_conflict(e, &actor.user_id))?;

    info!(
        session_id = %session.id,
        display_id = session.display_id,
        user_id = %session.user_id,
        opening_balance = %session.opening_balance,
        "Cash session opened"
    );
    Ok(session)
}

/// Close a session. Owner or admin only.
pub fn close_session(db: &DbState, actor: &Actor, session_id: &str) -> Result<CashSession> {
    let conn = db.conn.lock()?;
    db::with_immediate_tx(&conn, |tx| {
        let session = load_session(tx, session_id)?;
        authorize(
            Capability::CloseSession,
            actor,
            Resource::Session {
                owner_id: &session.user_id,
            },
        )
        .into_result()?;

        if !session.is_open() {
            return Err(CashError::InvalidState(format!(
                "Cash session #{} is already closed",
                session.display_id
            )));
        }

        let now = db::now_timestamp();
        tx.execute(
            "UPDATE cash_sessions SET status = 'fechado', close_time = ?1, updated_at = ?1
             WHERE id = ?2",
            params![now, session_id],
        )?;

        let closed = load_session(tx, session_id)?;
        db::enqueue_sync(tx, "cash_session", session_id, "update", &db::sync_payload(&closed)?)?;
        db::write_audit(
            tx,
            &actor.user_id,
            "cash_session.close",
            "cash_session",
            session_id,
            &json!({
                "displayId": closed.display_id,
                "cashInRegister": closed.cash_in_register,
                "transactionsValue": closed.transactions_value,
            }),
        )?;
        Ok(())
    })?;

    let closed = load_session_with_movements(&conn, session_id)?;
    info!(
        session_id = %closed.id,
        display_id = closed.display_id,
        closed_by = %actor.user_id,
        cash_in_register = %closed.cash_in_register,
        "Cash session closed"
    );
    Ok(closed)
}

/// Whether the reopen policy admits a session opened at `open_time`, judged
/// on the calendar of `tz` at instant `now`.
pub fn reopen_permitted<Tz: TimeZone>(
    policy: ReopenPolicy,
    open_time: &DateTime<Utc>,
    now: &DateTime<Utc>,
    tz: &Tz,
) -> bool {
    match policy {
        ReopenPolicy::Unrestricted => true,
        ReopenPolicy::SameDay => {
            open_time.with_timezone(tz).date_naive() == now.with_timezone(tz).date_naive()
        }
    }
}

/// Reopen a closed session. Owner or admin only; neither the actor nor the
/// session's owner may already have another open session.
pub fn reopen_session(db: &DbState, actor: &Actor, session_id: &str) -> Result<CashSession> {
    let conn = db.conn.lock()?;
    let policy = CashSettings::load(&conn).reopen_policy;

    db::with_immediate_tx(&conn, |tx| {
        let session = load_session(tx, session_id)?;
        authorize(
            Capability::ReopenSession,
            actor,
            Resource::Session {
                owner_id: &session.user_id,
            },
        )
        .into_result()?;

        if session.is_open() {
            return Err(CashError::InvalidState(format!(
                "Cash session #{} is already open",
                session.display_id
            )));
        }
        if !reopen_permitted(policy, &session.open_time, &Utc::now(), &Local) {
            return Err(CashError::InvalidState(format!(
                "Cash session #{} can only be reopened on the day it was opened",
                session.display_id
            )));
        }

        owner_has_conflict(tx, &actor.user_id)?;
        if session.user_id != actor.user_id {
            owner_has_conflict(tx, &session.user_id)?;
        }

        tx.execute(
            "UPDATE cash_sessions SET status = 'aberto', close_time = NULL, updated_at = ?1
             WHERE id = ?2",
            params![db::now_timestamp(), session_id],
        )?;

        let reopened = load_session(tx, session_id)?;
        db::enqueue_sync(tx, "cash_session", session_id, "update", &db::sync_payload(&reopened)?)?;
        db::write_audit(
            tx,
            &actor.user_id,
            "cash_session.reopen",
            "cash_session",
            session_id,
            &json!({ "displayId": reopened.display_id, "ownerId": reopened.user_id }),
        )?;
        Ok(())
    })
    .map_err(|e| map_open_conflict(e, &actor.user_id))?;

    let reopened = load_session_with_movements(&conn, session_id)?;
    info!(
        session_id = %reopened.id,
        display_id = reopened.display_id,
        reopened_by = %actor.user_id,
        "Cash session reopened"
    );
    Ok(reopened)
}

/// Guarded ledger append: the actor must own the session (or be an admin)
/// and the session must be open. The movement is attributed to the actor.
pub fn record_movement(
    db: &DbState,
    actor: &Actor,
    session_id: &str,
    mut movement: NewMovement,
) -> Result<CashSession> {
    movement.user_id = actor.user_id.clone();
    movement.validate()?;

    let conn = db.conn.lock()?;
    let stored = db::with_immediate_tx(&conn, |tx| {
        let session = load_session(tx, session_id)?;
        authorize(
            Capability::AddMovement,
            actor,
            Resource::Session {
                owner_id: &session.user_id,
            },
        )
        .into_result()?;
        if !session.is_open() {
            return Err(CashError::InvalidState(format!(
                "Cash session #{} is closed",
                session.display_id
            )));
        }
        movements::append_movement(tx, session_id, &movement)
    })?;

    info!(
        movement_id = %stored.id,
        session_id = %session_id,
        movement_type = stored.movement_type.as_str(),
        amount = %stored.amount,
        user_id = %actor.user_id,
        "Cash movement recorded"
    );
    load_session_with_movements(&conn, session_id)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Load a session with its movements. Owner or admin only.
pub fn get_session(db: &DbState, actor: &Actor, session_id: &str) -> Result<CashSession> {
    let conn = db.conn.lock()?;
    let session = load_session_with_movements(&conn, session_id)?;
    authorize(
        Capability::ViewSession,
        actor,
        Resource::Session {
            owner_id: &session.user_id,
        },
    )
    .into_result()?;
    Ok(session)
}

/// The operator's open session, if any.
pub fn get_active_session(db: &DbState, user_id: &str) -> Result<Option<CashSession>> {
    let conn = db.conn.lock()?;
    match open_session_of(&conn, user_id)? {
        Some((id, _)) => load_session_with_movements(&conn, &id).map(Some),
        None => Ok(None),
    }
}

pub fn totals_by_method(db: &DbState, session_id: &str) -> Result<Vec<MethodTotal>> {
    let conn = db.conn.lock()?;
    ensure_session_exists(&conn, session_id)?;
    let settings = CashSettings::load(&conn);
    let sales = sales::load_session_sales(&conn, session_id)?;
    Ok(reconcile::group_totals_by_method(&sales, &settings.cash_methods))
}

/// The session detail view. Money figures are recomputed from sales and the
/// ledger; the stored running counter is reported alongside.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub display_id: i64,
    pub user_id: String,
    pub status: SessionStatus,
    pub open_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub opening_balance: Decimal,
    pub deposits: Decimal,
    pub withdrawals: Decimal,
    pub transactions_value: Decimal,
    pub cash_in_register: Decimal,
    pub cached_cash_in_register: Decimal,
    pub totals_by_method: Vec<MethodTotal>,
    pub movements: Vec<Movement>,
    pub sales_count: usize,
    pub cancelled_count: usize,
    pub consistent: bool,
}

pub fn session_summary(db: &DbState, actor: &Actor, session_id: &str) -> Result<SessionSummary> {
    let conn = db.conn.lock()?;
    let session = load_session_with_movements(&conn, session_id)?;
    authorize(
        Capability::ViewSession,
        actor,
        Resource::Session {
            owner_id: &session.user_id,
        },
    )
    .into_result()?;

    let settings = CashSettings::load(&conn);
    let sales = sales::load_session_sales(&conn, session_id)?;
    let derived = reconcile::derive_aggregates(
        session.opening_balance,
        &session.movements,
        &sales,
        &settings.cash_methods,
    );
    let consistent = derived == session.aggregates();

    Ok(SessionSummary {
        totals_by_method: reconcile::group_totals_by_method(&sales, &settings.cash_methods),
        sales_count: sales.iter().filter(|s| s.counts_toward_totals()).count(),
        cancelled_count: sales.iter().filter(|s| !s.counts_toward_totals()).count(),
        session_id: session.id,
        display_id: session.display_id,
        user_id: session.user_id,
        status: session.status,
        open_time: session.open_time,
        close_time: session.close_time,
        opening_balance: session.opening_balance,
        deposits: derived.deposits,
        withdrawals: derived.withdrawals,
        transactions_value: derived.transactions_value,
        cash_in_register: derived.cash_in_register,
        cached_cash_in_register: session.cash_in_register,
        movements: session.movements,
        consistent,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub session_id: String,
    pub cached: Aggregates,
    pub derived: Aggregates,
    pub consistent: bool,
}

fn reconcile_on(conn: &Connection, session_id: &str) -> Result<Reconciliation> {
    let session = load_session_with_movements(conn, session_id)?;
    let settings = CashSettings::load(conn);
    let sales = sales::load_session_sales(conn, session_id)?;
    let derived = reconcile::derive_aggregates(
        session.opening_balance,
        &session.movements,
        &sales,
        &settings.cash_methods,
    );
    let cached = session.aggregates();
    Ok(Reconciliation {
        session_id: session_id.to_string(),
        consistent: cached == derived,
        cached,
        derived,
    })
}

/// Compare the cached aggregates against values derived from the ledger and
/// the linked sales.
pub fn reconcile_session(db: &DbState, session_id: &str) -> Result<Reconciliation> {
    let conn = db.conn.lock()?;
    let report = reconcile_on(&conn, session_id)?;
    if !report.consistent {
        warn!(
            session_id = %session_id,
            cached = ?report.cached,
            derived = ?report.derived,
            "Cash session aggregates drifted from ledger"
        );
    }
    Ok(report)
}

/// Overwrite drifted aggregates with the derived values. Returns the report
/// taken before the repair.
pub fn repair_session_cache(db: &DbState, session_id: &str) -> Result<Reconciliation> {
    let conn = db.conn.lock()?;
    db::with_immediate_tx(&conn, |tx| {
        let report = reconcile_on(tx, session_id)?;
        if report.consistent {
            return Ok(report);
        }

        let d = &report.derived;
        tx.execute(
            "UPDATE cash_sessions SET
                deposits = ?1, withdrawals = ?2, transactions_value = ?3, cash_in_register = ?4,
                updated_at = ?5
             WHERE id = ?6",
            params![
                db::money_text(&d.deposits),
                db::money_text(&d.withdrawals),
                db::money_text(&d.transactions_value),
                db::money_text(&d.cash_in_register),
                db::now_timestamp(),
                session_id,
            ],
        )?;
        let repaired = load_session(tx, session_id)?;
        db::enqueue_sync(tx, "cash_session", session_id, "update", &db::sync_payload(&repaired)?)?;

        warn!(
            session_id = %session_id,
            cached = ?report.cached,
            derived = ?report.derived,
            "Repaired cash session aggregates"
        );
        Ok(report)
    })
}

// ===========================================================================
// Tests
// ===========================================================================
