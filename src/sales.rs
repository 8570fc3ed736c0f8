//! Sales and their link to the cash session they were rung up in.
//!
//! A sale made at the register is stamped with the salesperson's open session
//! (id and display number) and posted into that session's counters. The link
//! also drives authorization: the owner of the session may act on every sale
//! in it, not just their own.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{authorize, Actor, AuthDecision, Capability, Resource};
use crate::db::{self, DbState};
use crate::error::{CashError, Result};
use crate::reconcile;
use crate::sessions;
use crate::settings::CashSettings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleStatus {
    #[default]
    Finalizada,
    Pendente,
    Cancelada,
    Editada,
    Rascunho,
}

impl SaleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleStatus::Finalizada => "Finalizada",
            SaleStatus::Pendente => "Pendente",
            SaleStatus::Cancelada => "Cancelada",
            SaleStatus::Editada => "Editada",
            SaleStatus::Rascunho => "Rascunho",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Finalizada" => Some(SaleStatus::Finalizada),
            "Pendente" => Some(SaleStatus::Pendente),
            "Cancelada" => Some(SaleStatus::Cancelada),
            "Editada" => Some(SaleStatus::Editada),
            "Rascunho" => Some(SaleStatus::Rascunho),
            _ => None,
        }
    }
}

/// Where a sale was made: the register flow links it to a session, the
/// back-office flow does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaleChannel {
    Register,
    Backoffice,
}

impl SaleChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleChannel::Register => "register",
            SaleChannel::Backoffice => "backoffice",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub method: String,
    #[serde(alias = "amount")]
    pub value: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fees: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub id: String,
    pub cash_session_id: Option<String>,
    pub cash_session_display_id: Option<i64>,
    pub salesperson_id: String,
    pub channel: SaleChannel,
    pub status: SaleStatus,
    pub total: Decimal,
    pub payments: Vec<Payment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Sale {
    pub fn counts_toward_totals(&self) -> bool {
        self.status != SaleStatus::Cancelada
    }

    pub fn is_linked(&self) -> bool {
        self.cash_session_id.is_some() || self.cash_session_display_id.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSale {
    #[serde(default)]
    pub id: Option<String>,
    pub channel: SaleChannel,
    #[serde(default)]
    pub status: SaleStatus,
    pub total: Decimal,
    #[serde(default)]
    pub payments: Vec<Payment>,
}

impl NewSale {
    fn validate(&self) -> Result<()> {
        if self.total < Decimal::ZERO {
            return Err(CashError::Validation("Sale total cannot be negative".into()));
        }
        if self.status == SaleStatus::Cancelada {
            return Err(CashError::Validation(
                "A sale cannot be created already cancelled".into(),
            ));
        }
        for payment in &self.payments {
            if payment.method.trim().is_empty() {
                return Err(CashError::Validation("Payment method is required".into()));
            }
            if payment.value < Decimal::ZERO {
                return Err(CashError::Validation(
                    "Payment value cannot be negative".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaleOperation {
    View,
    Edit,
    Print,
    Cancel,
}

impl SaleOperation {
    pub fn capability(&self) -> Capability {
        match self {
            SaleOperation::View => Capability::ViewSale,
            SaleOperation::Edit => Capability::EditSale,
            SaleOperation::Print => Capability::PrintSale,
            SaleOperation::Cancel => Capability::CancelSale,
        }
    }
}

/// The screen an edit was started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditOrigin {
    Register,
    SalesList,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const SALE_COLUMNS: &str = "id, cash_session_id, cash_session_display_id, salesperson_id, channel, status,
     total, cancellation_reason, created_at";

fn sale_from_row(row: &rusqlite::Row) -> rusqlite::Result<Sale> {
    let raw_channel: String = row.get(4)?;
    let raw_status: String = row.get(5)?;
    let status = SaleStatus::parse(&raw_status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown sale status: {raw_status}").into(),
        )
    })?;

    Ok(Sale {
        id: row.get(0)?,
        cash_session_id: row.get(1)?,
        cash_session_display_id: row.get(2)?,
        salesperson_id: row.get(3)?,
        channel: if raw_channel == "register" {
            SaleChannel::Register
        } else {
            SaleChannel::Backoffice
        },
        status,
        total: db::decimal_at(row, 6)?,
        payments: Vec::new(),
        cancellation_reason: row.get(7)?,
        created_at: db::timestamp_at(row, 8)?,
    })
}

fn load_payments(conn: &Connection, sale_id: &str) -> Result<Vec<Payment>> {
    let mut stmt = conn.prepare(
        "SELECT method, amount, fees FROM sale_payments WHERE sale_id = ?1 ORDER BY position, id",
    )?;
    let payments = stmt
        .query_map(params![sale_id], |row| {
            Ok(Payment {
                method: row.get(0)?,
                value: db::decimal_at(row, 1)?,
                fees: db::opt_decimal_at(row, 2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(payments)
}

pub(crate) fn load_sale(conn: &Connection, sale_id: &str) -> Result<Sale> {
    let mut sale = conn
        .query_row(
            &format!("SELECT {SALE_COLUMNS} FROM sales WHERE id = ?1"),
            params![sale_id],
            sale_from_row,
        )
        .optional()?
        .ok_or_else(|| CashError::NotFound(format!("Sale not found: {sale_id}")))?;
    sale.payments = load_payments(conn, sale_id)?;
    Ok(sale)
}

/// All sales linked to a session by id, cancelled ones included, oldest first.
pub(crate) fn load_session_sales(conn: &Connection, session_id: &str) -> Result<Vec<Sale>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SALE_COLUMNS} FROM sales WHERE cash_session_id = ?1 ORDER BY created_at, rowid"
    ))?;
    let rows = stmt.query_map(params![session_id], sale_from_row)?;

    let mut sales = Vec::new();
    for row in rows {
        match row {
            Ok(mut sale) => {
                sale.payments = load_payments(conn, &sale.id)?;
                sales.push(sale);
            }
            Err(e) => warn!(session_id = %session_id, "skipping malformed sale row: {e}"),
        }
    }
    Ok(sales)
}

/// `(session_id, owner_id)` of the session a sale points at.
///
/// A stored session id is authoritative: when it no longer resolves the sale
/// is treated as unlinked. The display number is only consulted for rows
/// that carry no session id at all.
fn resolve_linked_session(conn: &Connection, sale: &Sale) -> Result<Option<(String, String)>> {
    if let Some(ref id) = sale.cash_session_id {
        return Ok(conn
            .query_row(
                "SELECT id, user_id FROM cash_sessions WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?);
    }
    if let Some(display_id) = sale.cash_session_display_id {
        return Ok(conn
            .query_row(
                "SELECT id, user_id FROM cash_sessions WHERE display_id = ?1",
                params![display_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?);
    }
    Ok(None)
}

fn decide(
    conn: &Connection,
    actor: &Actor,
    sale: &Sale,
    capability: Capability,
) -> Result<(AuthDecision, Option<(String, String)>)> {
    let linked = resolve_linked_session(conn, sale)?;
    let decision = authorize(
        capability,
        actor,
        Resource::Sale {
            salesperson_id: &sale.salesperson_id,
            session_owner_id: linked.as_ref().map(|(_, owner)| owner.as_str()),
        },
    );
    Ok((decision, linked))
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Record a sale made by the actor.
///
/// Register sales are stamped with the actor's open session and posted into
/// its counters. With no open session the sale is stored unlinked.
pub fn create_sale(db: &DbState, actor: &Actor, new_sale: NewSale) -> Result<Sale> {
    new_sale.validate()?;

    let conn = db.conn.lock()?;
    let settings = CashSettings::load(&conn);

    let sale = db::with_immediate_tx(&conn, |tx| {
        let link = match new_sale.channel {
            SaleChannel::Register => sessions::open_session_of(tx, &actor.user_id)?,
            SaleChannel::Backoffice => None,
        };
        if new_sale.channel == SaleChannel::Register && link.is_none() {
            warn!(user_id = %actor.user_id, "Register sale without an open cash session");
        }

        let sale = Sale {
            id: new_sale
                .id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            cash_session_id: link.as_ref().map(|(id, _)| id.clone()),
            cash_session_display_id: link.as_ref().map(|(_, display)| *display),
            salesperson_id: actor.user_id.clone(),
            channel: new_sale.channel,
            status: new_sale.status,
            total: new_sale.total,
            payments: new_sale.payments.clone(),
            cancellation_reason: None,
            created_at: Utc::now(),
        };
        let ts = db::format_timestamp(&sale.created_at);

        tx.execute(
            "INSERT INTO sales (
                id, cash_session_id, cash_session_display_id, salesperson_id, channel, status,
                total, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                sale.id,
                sale.cash_session_id,
                sale.cash_session_display_id,
                sale.salesperson_id,
                sale.channel.as_str(),
                sale.status.as_str(),
                db::money_text(&sale.total),
                ts,
            ],
        )?;
        for (position, payment) in sale.payments.iter().enumerate() {
            tx.execute(
                "INSERT INTO sale_payments (sale_id, position, method, amount, fees)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    sale.id,
                    position as i64,
                    payment.method.trim(),
                    db::money_text(&payment.value),
                    payment.fees.as_ref().map(db::money_text),
                ],
            )?;
        }

        if let Some(ref session_id) = sale.cash_session_id {
            sessions::post_sale_totals(
                tx,
                session_id,
                sale.total,
                reconcile::cash_paid(&sale, &settings.cash_methods),
            )?;
        }

        db::enqueue_sync(
            tx,
            "sale",
            &sale.id,
            "insert",
            &db::sync_payload(&sale)?,
        )?;
        Ok(sale)
    })?;

    info!(
        sale_id = %sale.id,
        salesperson_id = %sale.salesperson_id,
        session_display_id = ?sale.cash_session_display_id,
        total = %sale.total,
        "Sale recorded"
    );
    Ok(sale)
}

pub fn get_sale(db: &DbState, actor: &Actor, sale_id: &str) -> Result<Sale> {
    let conn = db.conn.lock()?;
    let sale = load_sale(&conn, sale_id)?;
    decide(&conn, actor, &sale, Capability::ViewSale)?.0.into_result()?;
    Ok(sale)
}

/// Sales of a session. Owner or admin only.
pub fn list_session_sales(db: &DbState, actor: &Actor, session_id: &str) -> Result<Vec<Sale>> {
    let conn = db.conn.lock()?;
    let session = sessions::load_session(&conn, session_id)?;
    authorize(
        Capability::ViewSession,
        actor,
        Resource::Session {
            owner_id: &session.user_id,
        },
    )
    .into_result()?;
    load_session_sales(&conn, session_id)
}

/// Decide whether the actor may perform `operation` on a sale, without
/// performing it. A denial carries the reason to show.
pub fn authorize_sale_operation(
    db: &DbState,
    actor: &Actor,
    sale_id: &str,
    operation: SaleOperation,
) -> Result<AuthDecision> {
    let conn = db.conn.lock()?;
    let sale = load_sale(&conn, sale_id)?;
    Ok(decide(&conn, actor, &sale, operation.capability())?.0)
}

/// Gate for opening a sale in the editor.
///
/// Sales made at the register must be edited from the register; the generic
/// sales list may only edit them when the session link no longer resolves.
pub fn begin_sale_edit(
    db: &DbState,
    actor: &Actor,
    sale_id: &str,
    origin: EditOrigin,
) -> Result<Sale> {
    let conn = db.conn.lock()?;
    let sale = load_sale(&conn, sale_id)?;
    let (decision, linked) = decide(&conn, actor, &sale, Capability::EditSale)?;
    decision.into_result()?;

    if sale.status == SaleStatus::Cancelada {
        return Err(CashError::InvalidState("A cancelled sale cannot be edited".into()));
    }

    if origin == EditOrigin::SalesList && sale.is_linked() {
        match linked {
            Some(_) => {
                return Err(CashError::PolicyViolation(
                    "This sale was made at the register. Edit it from the cash register screen."
                        .into(),
                ))
            }
            None => warn!(
                sale_id = %sale.id,
                session_id = ?sale.cash_session_id,
                session_display_id = ?sale.cash_session_display_id,
                "Sale points at an unknown cash session, allowing edit from sales list"
            ),
        }
    }

    Ok(sale)
}

/// Cancel a sale: mark it `Cancelada`, take it out of its session's
/// counters, and queue an inventory restore for its items.
pub fn cancel_sale(db: &DbState, actor: &Actor, sale_id: &str, reason: &str) -> Result<Sale> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(CashError::Validation(
            "A cancellation reason is required".into(),
        ));
    }

    let conn = db.conn.lock()?;
    let settings = CashSettings::load(&conn);

    db::with_immediate_tx(&conn, |tx| {
        let sale = load_sale(tx, sale_id)?;
        let (decision, linked) = decide(tx, actor, &sale, Capability::CancelSale)?;
        decision.into_result()?;

        if sale.status == SaleStatus::Cancelada {
            return Err(CashError::InvalidState("Sale is already cancelled".into()));
        }

        let now = db::now_timestamp();
        tx.execute(
            "UPDATE sales SET status = 'Cancelada', cancellation_reason = ?1, cancelled_by = ?2,
                cancelled_at = ?3, updated_at = ?3
             WHERE id = ?4",
            params![reason, actor.user_id, now, sale_id],
        )?;

        // Only sales stored against the session were ever posted into it.
        let posted_to = linked
            .as_ref()
            .map(|(id, _)| id)
            .filter(|id| sale.cash_session_id.as_ref() == Some(*id));
        if let Some(session_id) = posted_to {
            sessions::post_sale_totals(
                tx,
                session_id,
                -sale.total,
                -reconcile::cash_paid(&sale, &settings.cash_methods),
            )?;
        }

        db::enqueue_sync(
            tx,
            "sale",
            sale_id,
            "update",
            &json!({ "id": sale_id, "status": "Cancelada", "cancellationReason": reason }),
        )?;
        db::enqueue_sync(
            tx,
            "inventory_restore",
            sale_id,
            "insert",
            &json!({ "saleId": sale_id, "reason": reason }),
        )?;
        db::write_audit(
            tx,
            &actor.user_id,
            "sale.cancel",
            "sale",
            sale_id,
            &json!({ "reason": reason, "total": sale.total, "sessionId": linked.map(|(id, _)| id) }),
        )?;
        Ok(())
    })?;

    info!(sale_id = %sale_id, cancelled_by = %actor.user_id, "Sale cancelled");
    load_sale(&conn, sale_id)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{close_session, get_session, open_session};
    use rust_decimal_macros::dec;

    fn sale_of(channel: SaleChannel, payments: &[(&str, Decimal)]) -> NewSale {
        NewSale {
            id: None,
            channel,
            status: SaleStatus::Finalizada,
            total: payments.iter().map(|(_, v)| *v).sum(),
            payments: payments
                .iter()
                .map(|(m, v)| Payment {
                    method: m.to_string(),
                    value: *v,
                    fees: None,
                })
                .collect(),
        }
    }

    fn insert_legacy_sale(db: &DbState, id: &str, salesperson: &str, session_id: Option<&str>, display_id: Option<i64>) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sales (id, cash_session_id, cash_session_display_id, salesperson_id, channel,
                status, total, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'register', 'Finalizada', '10', ?5, ?5)",
            params![id, session_id, display_id, salesperson, db::now_timestamp()],
        )
        .unwrap();
    }

    /// Operator B owns the open session; operator A rings a sale that is
    /// linked to B's session.
    fn sale_by_a_in_b_session(db: &DbState) -> Sale {
        let b = Actor::operator("B");
        let session = open_session(db, &b, dec!(0)).unwrap();
        insert_legacy_sale(db, "sale-a", "A", Some(&session.id), Some(session.display_id));
        let conn = db.conn.lock().unwrap();
        load_sale(&conn, "sale-a").unwrap()
    }

    #[test]
    fn test_register_sale_links_and_posts() {
        let db = db::test_db();
        let op = Actor::operator("op-1");
        let session = open_session(&db, &op, dec!(100)).unwrap();

        let sale = create_sale(
            &db,
            &op,
            sale_of(SaleChannel::Register, &[("Dinheiro", dec!(50)), ("Pix", dec!(30))]),
        )
        .unwrap();
        assert_eq!(sale.cash_session_id.as_deref(), Some(session.id.as_str()));
        assert_eq!(sale.cash_session_display_id, Some(session.display_id));

        let updated = get_session(&db, &op, &session.id).unwrap();
        assert_eq!(updated.transactions_value, dec!(80));
        assert_eq!(updated.cash_in_register, dec!(150));

        let reloaded = get_sale(&db, &op, &sale.id).unwrap();
        assert_eq!(reloaded.payments, sale.payments);
    }

    #[test]
    fn test_backoffice_and_sessionless_sales_stay_unlinked() {
        let db = db::test_db();
        let op = Actor::operator("op-1");

        let orphan = create_sale(&db, &op, sale_of(SaleChannel::Register, &[("Pix", dec!(5))])).unwrap();
        assert!(!orphan.is_linked());

        let session = open_session(&db, &op, dec!(0)).unwrap();
        let backoffice =
            create_sale(&db, &op, sale_of(SaleChannel::Backoffice, &[("Dinheiro", dec!(9))])).unwrap();
        assert!(!backoffice.is_linked());
        assert_eq!(get_session(&db, &op, &session.id).unwrap().cash_in_register, dec!(0));
    }

    #[test]
    fn test_create_sale_validation() {
        let db = db::test_db();
        let op = Actor::operator("op-1");
        let mut bad = sale_of(SaleChannel::Register, &[("", dec!(5))]);
        assert!(matches!(create_sale(&db, &op, bad.clone()), Err(CashError::Validation(_))));

        bad = sale_of(SaleChannel::Register, &[("Pix", dec!(5))]);
        bad.status = SaleStatus::Cancelada;
        assert!(matches!(create_sale(&db, &op, bad), Err(CashError::Validation(_))));
    }

    #[test]
    fn test_authorization_matrix_through_store() {
        let db = db::test_db();
        let sale = sale_by_a_in_b_session(&db);

        let cases = [
            (Actor::operator("A"), true),
            (Actor::operator("B"), true),
            (Actor::operator("C"), false),
            (Actor::admin("D"), true),
        ];
        for (actor, expected) in cases {
            for op in [
                SaleOperation::View,
                SaleOperation::Edit,
                SaleOperation::Print,
                SaleOperation::Cancel,
            ] {
                let decision = authorize_sale_operation(&db, &actor, &sale.id, op).unwrap();
                assert_eq!(decision.allowed, expected, "{} {:?}", actor.user_id, op);
            }
        }

        assert!(matches!(
            get_sale(&db, &Actor::operator("C"), &sale.id),
            Err(CashError::Authorization(_))
        ));
    }

    #[test]
    fn test_register_sale_cannot_be_edited_from_sales_list() {
        let db = db::test_db();
        let op = Actor::operator("op-1");
        open_session(&db, &op, dec!(0)).unwrap();
        let sale = create_sale(&db, &op, sale_of(SaleChannel::Register, &[("Pix", dec!(5))])).unwrap();

        assert!(matches!(
            begin_sale_edit(&db, &op, &sale.id, EditOrigin::SalesList),
            Err(CashError::PolicyViolation(_))
        ));
        assert!(begin_sale_edit(&db, &op, &sale.id, EditOrigin::Register).is_ok());
        assert!(matches!(
            begin_sale_edit(&db, &Actor::operator("other"), &sale.id, EditOrigin::Register),
            Err(CashError::Authorization(_))
        ));
    }

    #[test]
    fn test_unresolvable_link_allows_sales_list_edit() {
        let db = db::test_db();
        let op = Actor::operator("op-1");
        insert_legacy_sale(&db, "legacy", "op-1", Some("gone"), Some(999));

        let sale = begin_sale_edit(&db, &op, "legacy", EditOrigin::SalesList).unwrap();
        assert_eq!(sale.cash_session_id.as_deref(), Some("gone"));
    }

    #[test]
    fn test_display_id_fallback_resolves_owner() {
        let db = db::test_db();
        let b = Actor::operator("B");
        let session = open_session(&db, &b, dec!(0)).unwrap();
        insert_legacy_sale(&db, "by-display", "A", None, Some(session.display_id));

        let decision =
            authorize_sale_operation(&db, &b, "by-display", SaleOperation::Print).unwrap();
        assert!(decision.allowed);
        assert!(matches!(
            begin_sale_edit(&db, &b, "by-display", EditOrigin::SalesList),
            Err(CashError::PolicyViolation(_))
        ));
    }

    #[test]
    fn test_stale_session_id_is_not_matched_by_display_id() {
        let db = db::test_db();
        let b = Actor::operator("B");
        let session = open_session(&db, &b, dec!(0)).unwrap();
        insert_legacy_sale(&db, "stale", "A", Some("purged-session"), Some(session.display_id));

        let decision = authorize_sale_operation(&db, &b, "stale", SaleOperation::Print).unwrap();
        assert!(!decision.allowed);

        let a = Actor::operator("A");
        let sale = begin_sale_edit(&db, &a, "stale", EditOrigin::SalesList).unwrap();
        assert_eq!(sale.cash_session_id.as_deref(), Some("purged-session"));
    }

    #[test]
    fn test_cancel_display_only_sale_keeps_session_consistent() {
        let db = db::test_db();
        let b = Actor::operator("B");
        let session = open_session(&db, &b, dec!(50)).unwrap();
        create_sale(&db, &b, sale_of(SaleChannel::Register, &[("Dinheiro", dec!(20))])).unwrap();
        insert_legacy_sale(&db, "legacy", "B", None, Some(session.display_id));
        assert!(sessions::reconcile_session(&db, &session.id).unwrap().consistent);

        cancel_sale(&db, &b, "legacy", "lançamento duplicado").unwrap();

        let report = sessions::reconcile_session(&db, &session.id).unwrap();
        assert!(report.consistent);
        assert_eq!(report.cached.transactions_value, dec!(20));
        assert_eq!(report.cached.cash_in_register, dec!(70));
    }

    #[test]
    fn test_cancel_removes_sale_from_aggregates() {
        let db = db::test_db();
        let op = Actor::operator("op-1");
        let session = open_session(&db, &op, dec!(100)).unwrap();
        create_sale(&db, &op, sale_of(SaleChannel::Register, &[("Dinheiro", dec!(40))])).unwrap();
        let doomed = create_sale(
            &db,
            &op,
            sale_of(SaleChannel::Register, &[("Dinheiro", dec!(25)), ("Pix", dec!(5))]),
        )
        .unwrap();

        assert!(matches!(
            cancel_sale(&db, &op, &doomed.id, "  "),
            Err(CashError::Validation(_))
        ));

        let cancelled = cancel_sale(&db, &op, &doomed.id, "cliente desistiu").unwrap();
        assert_eq!(cancelled.status, SaleStatus::Cancelada);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("cliente desistiu"));

        let updated = get_session(&db, &op, &session.id).unwrap();
        assert_eq!(updated.transactions_value, dec!(40));
        assert_eq!(updated.cash_in_register, dec!(140));
        assert!(sessions::reconcile_session(&db, &session.id).unwrap().consistent);

        assert!(matches!(
            cancel_sale(&db, &op, &doomed.id, "again"),
            Err(CashError::InvalidState(_))
        ));

        let conn = db.conn.lock().unwrap();
        let restores: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE entity_type = 'inventory_restore' AND entity_id = ?1",
                params![doomed.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(restores, 1);
    }

    #[test]
    fn test_cancel_in_closed_session_by_owner() {
        let db = db::test_db();
        let b = Actor::operator("B");
        let sale = sale_by_a_in_b_session(&db);
        let session_id = sale.cash_session_id.clone().unwrap();
        close_session(&db, &b, &session_id).unwrap();

        assert!(matches!(
            cancel_sale(&db, &Actor::operator("C"), &sale.id, "x"),
            Err(CashError::Authorization(_))
        ));
        let cancelled = cancel_sale(&db, &b, &sale.id, "erro de digitação").unwrap();
        assert_eq!(cancelled.status, SaleStatus::Cancelada);
    }

    #[test]
    fn test_list_session_sales_scoped_to_owner() {
        let db = db::test_db();
        let op = Actor::operator("op-1");
        let session = open_session(&db, &op, dec!(0)).unwrap();
        create_sale(&db, &op, sale_of(SaleChannel::Register, &[("Pix", dec!(1))])).unwrap();
        create_sale(&db, &op, sale_of(SaleChannel::Register, &[("Pix", dec!(2))])).unwrap();

        assert_eq!(list_session_sales(&db, &op, &session.id).unwrap().len(), 2);
        assert!(matches!(
            list_session_sales(&db, &Actor::operator("op-2"), &session.id),
            Err(CashError::Authorization(_))
        ));
    }

    #[test]
    fn test_sale_payload_shape() {
        let parsed: NewSale = serde_json::from_value(json!({
            "channel": "register",
            "total": 80,
            "payments": [
                { "method": "Dinheiro", "value": 50 },
                { "method": "Cartão de Crédito", "amount": 30, "fees": 1.2 }
            ]
        }))
        .unwrap();
        assert_eq!(parsed.status, SaleStatus::Finalizada);
        assert_eq!(parsed.payments[1].value, dec!(30));
        assert_eq!(parsed.payments[1].fees, Some(dec!(1.2)));
    }
}
