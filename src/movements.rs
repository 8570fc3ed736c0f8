//! Cash movement ledger.
//!
//! Deposits (`suprimento`) and withdrawals (`sangria`) are appended to
//! `cash_movements` and folded into the owning session's `deposits` /
//! `withdrawals` / `cash_in_register` columns in the same transaction. This
//! is the only code path that changes `deposits` and `withdrawals`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::{CashError, Result};
use crate::sessions::{self, CashSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementType {
    /// Cash added to the drawer.
    Suprimento,
    /// Cash taken out of the drawer.
    Sangria,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Suprimento => "suprimento",
            MovementType::Sangria => "sangria",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "suprimento" => Some(MovementType::Suprimento),
            "sangria" => Some(MovementType::Sangria),
            _ => None,
        }
    }
}

/// A movement as requested by the caller, before it is stored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMovement {
    #[serde(rename = "type", alias = "movementType", alias = "movement_type")]
    pub movement_type: MovementType,
    pub amount: Decimal,
    #[serde(default)]
    pub reason: String,
    #[serde(default, alias = "user_id")]
    pub user_id: String,
}

impl NewMovement {
    pub fn validate(&self) -> Result<()> {
        if self.amount <= Decimal::ZERO {
            return Err(CashError::Validation(
                "Amount must be greater than zero".into(),
            ));
        }
        if self.reason.trim().is_empty() {
            return Err(CashError::Validation("A reason is required".into()));
        }
        if self.user_id.trim().is_empty() {
            return Err(CashError::Validation("Missing userId".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Movement {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub movement_type: MovementType,
    pub amount: Decimal,
    pub reason: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Append
// ---------------------------------------------------------------------------

/// Append a movement to a session and return the updated session.
///
/// The ledger does not look at the session status; the engine's
/// [`sessions::record_movement`] is the guarded entry point for the UI.
pub fn add_movement(db: &DbState, session_id: &str, movement: &NewMovement) -> Result<CashSession> {
    movement.validate()?;

    let conn = db.conn.lock()?;
    let stored = db::with_immediate_tx(&conn, |tx| append_movement(tx, session_id, movement))?;

    info!(
        movement_id = %stored.id,
        session_id = %session_id,
        movement_type = stored.movement_type.as_str(),
        amount = %stored.amount,
        "Cash movement recorded"
    );

    sessions::load_session_with_movements(&conn, session_id)
}

/// Insert the movement and fold it into the session aggregates. Must run
/// inside a transaction; `movement` must already be validated.
pub(crate) fn append_movement(
    conn: &Connection,
    session_id: &str,
    movement: &NewMovement,
) -> Result<Movement> {
    let (deposits, withdrawals, cash_in_register) = conn
        .query_row(
            "SELECT deposits, withdrawals, cash_in_register FROM cash_sessions WHERE id = ?1",
            params![session_id],
            |row| {
                Ok((
                    db::decimal_at(row, 0)?,
                    db::decimal_at(row, 1)?,
                    db::decimal_at(row, 2)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| CashError::NotFound(format!("Cash session not found: {session_id}")))?;

    let (deposits, withdrawals, cash_in_register) = match movement.movement_type {
        MovementType::Suprimento => (
            deposits + movement.amount,
            withdrawals,
            cash_in_register + movement.amount,
        ),
        MovementType::Sangria => (
            deposits,
            withdrawals + movement.amount,
            cash_in_register - movement.amount,
        ),
    };

    let stored = Movement {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        movement_type: movement.movement_type,
        amount: movement.amount,
        reason: movement.reason.trim().to_string(),
        user_id: movement.user_id.clone(),
        timestamp: Utc::now(),
    };
    let timestamp = db::format_timestamp(&stored.timestamp);

    conn.execute(
        "INSERT INTO cash_movements (id, session_id, movement_type, amount, reason, user_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            stored.id,
            session_id,
            stored.movement_type.as_str(),
            db::money_text(&stored.amount),
            stored.reason,
            stored.user_id,
            timestamp,
        ],
    )?;

    conn.execute(
        "UPDATE cash_sessions SET
            deposits = ?1, withdrawals = ?2, cash_in_register = ?3, updated_at = ?4
         WHERE id = ?5",
        params![
            db::money_text(&deposits),
            db::money_text(&withdrawals),
            db::money_text(&cash_in_register),
            timestamp,
            session_id,
        ],
    )?;

    db::enqueue_sync(
        conn,
        "cash_movement",
        &stored.id,
        "insert",
        &db::sync_payload(&stored)?,
    )?;

    Ok(stored)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Movements of a session, newest first, optionally limited to one type.
pub fn list_movements(
    db: &DbState,
    session_id: &str,
    type_filter: Option<MovementType>,
) -> Result<Vec<Movement>> {
    let conn = db.conn.lock()?;
    sessions::ensure_session_exists(&conn, session_id)?;
    load_movements(&conn, session_id, type_filter)
}

pub(crate) fn load_movements(
    conn: &Connection,
    session_id: &str,
    type_filter: Option<MovementType>,
) -> Result<Vec<Movement>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, movement_type, amount, reason, user_id, created_at
         FROM cash_movements
         WHERE session_id = ?1 AND (?2 IS NULL OR movement_type = ?2)
         ORDER BY created_at DESC, rowid DESC",
    )?;

    let rows = stmt.query_map(
        params![session_id, type_filter.map(|t| t.as_str())],
        |row| {
            let raw_type: String = row.get(2)?;
            Ok((
                raw_type,
                Movement {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    movement_type: MovementType::Suprimento,
                    amount: db::decimal_at(row, 3)?,
                    reason: row.get(4)?,
                    user_id: row.get(5)?,
                    timestamp: db::timestamp_at(row, 6)?,
                },
            ))
        },
    )?;

    let mut movements = Vec::new();
    for row in rows {
        match row {
            Ok((raw_type, mut movement)) => match MovementType::parse(&raw_type) {
                Some(t) => {
                    movement.movement_type = t;
                    movements.push(movement);
                }
                None => warn!(movement_id = %movement.id, raw_type = %raw_type, "skipping movement with unknown type"),
            },
            Err(e) => warn!("skipping malformed movement row: {e}"),
        }
    }
    Ok(movements)
}

/// Sum of ledger entries per type: `(deposits, withdrawals)`.
pub fn ledger_totals(movements: &[Movement]) -> (Decimal, Decimal) {
    movements
        .iter()
        .fold((Decimal::ZERO, Decimal::ZERO), |(dep, wd), m| match m.movement_type {
            MovementType::Suprimento => (dep + m.amount, wd),
            MovementType::Sangria => (dep, wd + m.amount),
        })
}

// ===========================================================================
// Tests
// ===========================================================================
