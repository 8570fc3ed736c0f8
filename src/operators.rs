//! Local cache of the operator directory.
//!
//! Names are only used for display and search in the session history; who
//! is an admin for a given call is always taken from the [`Actor`] passed in.
//!
//! [`Actor`]: crate::auth::Actor

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

use crate::error::{CashError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub id: String,
    pub name: String,
    pub is_admin: bool,
}

pub fn upsert_operator(conn: &Connection, id: &str, name: &str, is_admin: bool) -> Result<()> {
    if id.trim().is_empty() || name.trim().is_empty() {
        return Err(CashError::Validation("Operator id and name are required".into()));
    }
    conn.execute(
        "INSERT INTO operators (id, name, is_admin, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            is_admin = excluded.is_admin,
            updated_at = excluded.updated_at",
        params![id.trim(), name.trim(), is_admin],
    )?;
    debug!(operator_id = %id, "Operator cached");
    Ok(())
}

pub fn get_operator(conn: &Connection, id: &str) -> Result<Option<Operator>> {
    Ok(conn
        .query_row(
            "SELECT id, name, is_admin FROM operators WHERE id = ?1",
            params![id],
            |row| {
                Ok(Operator {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    is_admin: row.get(2)?,
                })
            },
        )
        .optional()?)
}
