//! Session history listing with date, operator and free-text filters.

use chrono::{Local, NaiveDate, TimeZone};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::Actor;
use crate::db::DbState;
use crate::error::Result;
use crate::sessions::{self, CashSession};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFilter {
    /// Inclusive, compared against the local calendar day of `open_time`.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    /// Narrows the list to one operator. Operators are always scoped to
    /// their own sessions first.
    #[serde(default)]
    pub operator_id: Option<String>,
    /// Matches display number, operator name or a linked sale id.
    #[serde(default)]
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListing {
    #[serde(flatten)]
    pub session: CashSession,
    pub operator_name: Option<String>,
    pub sales_count: usize,
    #[serde(skip)]
    pub sale_ids: Vec<String>,
}

/// Strip a leading `#` and an `id-` prefix, lowercase.
fn normalize_token(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('#').trim();
    let lower = trimmed.to_lowercase();
    match lower.strip_prefix("id-") {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

impl SessionFilter {
    /// Pure predicate over one listing; `tz` decides calendar days.
    pub fn matches<Tz: TimeZone>(&self, listing: &SessionListing, tz: &Tz) -> bool {
        let day = listing.session.open_time.with_timezone(tz).date_naive();
        if self.start_date.is_some_and(|start| day < start) {
            return false;
        }
        if self.end_date.is_some_and(|end| day > end) {
            return false;
        }
        if let Some(ref operator) = self.operator_id {
            if !operator.trim().is_empty() && listing.session.user_id != operator.trim() {
                return false;
            }
        }

        let Some(ref search) = self.search else {
            return true;
        };
        let raw = search.trim().to_lowercase();
        if raw.is_empty() {
            return true;
        }
        let token = normalize_token(&raw);

        let display = listing.session.display_id.to_string();
        let by_display = !token.is_empty() && display.contains(&token);
        let by_name = listing
            .operator_name
            .as_deref()
            .is_some_and(|name| name.to_lowercase().contains(&raw));
        let by_sale = !token.is_empty()
            && listing
                .sale_ids
                .iter()
                .any(|id| normalize_token(id).contains(&token));

        by_display || by_name || by_sale
    }
}

/// List sessions visible to the actor, newest first.
///
/// Operators only ever see their own sessions; admins see all of them,
/// optionally narrowed by `operator_id`.
pub fn list_sessions(db: &DbState, actor: &Actor, filter: &SessionFilter) -> Result<Vec<SessionListing>> {
    let conn = db.conn.lock()?;

    let scope: Option<&str> = if actor.is_admin {
        None
    } else {
        Some(actor.user_id.as_str())
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {cols}, o.name
         FROM cash_sessions s
         LEFT JOIN operators o ON o.id = s.user_id
         WHERE (?1 IS NULL OR s.user_id = ?1)
         ORDER BY s.open_time DESC, s.display_id DESC",
        cols = sessions::SESSION_COLUMNS
            .split(',')
            .map(|c| format!("s.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ")
    ))?;
    let rows = stmt
        .query_map(params![scope], |row| {
            Ok((sessions::session_from_row(row)?, row.get::<_, Option<String>>(11)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut sale_ids: HashMap<String, Vec<String>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT sa.cash_session_id, sa.id
             FROM sales sa
             JOIN cash_sessions s ON s.id = sa.cash_session_id
             WHERE (?1 IS NULL OR s.user_id = ?1)
             ORDER BY sa.created_at",
        )?;
        let pairs = stmt.query_map(params![scope], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for pair in pairs {
            let (session_id, sale_id) = pair?;
            sale_ids.entry(session_id).or_default().push(sale_id);
        }
    }

    let listings = rows
        .into_iter()
        .map(|(session, operator_name)| {
            let ids = sale_ids.remove(&session.id).unwrap_or_default();
            SessionListing {
                operator_name,
                sales_count: ids.len(),
                sale_ids: ids,
                session,
            }
        })
        .filter(|listing| filter.matches(listing, &Local))
        .collect();

    Ok(listings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::operators::upsert_operator;
    use crate::sales::{create_sale, NewSale, Payment, SaleChannel, SaleStatus};
    use crate::sessions::{close_session, open_session, SessionStatus};
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn listing(display_id: i64, name: Option<&str>, sale_ids: &[&str], open_time: DateTime<Utc>) -> SessionListing {
        SessionListing {
            session: CashSession {
                id: format!("s-{display_id}"),
                display_id,
                user_id: "op-1".into(),
                status: SessionStatus::Closed,
                opening_balance: Decimal::ZERO,
                open_time,
                close_time: Some(open_time),
                deposits: Decimal::ZERO,
                withdrawals: Decimal::ZERO,
                transactions_value: Decimal::ZERO,
                cash_in_register: Decimal::ZERO,
                movements: Vec::new(),
            },
            operator_name: name.map(str::to_string),
            sales_count: sale_ids.len(),
            sale_ids: sale_ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn search(q: &str) -> SessionFilter {
        SessionFilter {
            search: Some(q.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_search_by_display_id_name_and_sale() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap();
        let item = listing(42, Some("Maria Souza"), &["ab12cd34-sale"], at);

        assert!(search("#42").matches(&item, &Utc));
        assert!(search("42").matches(&item, &Utc));
        assert!(search("maria").matches(&item, &Utc));
        assert!(search("SOUZA").matches(&item, &Utc));
        assert!(search("id-ab12").matches(&item, &Utc));
        assert!(search("#AB12CD").matches(&item, &Utc));
        assert!(search("   ").matches(&item, &Utc));
        assert!(!search("joão").matches(&item, &Utc));
        assert!(!search("#7").matches(&item, &Utc));
    }

    #[test]
    fn test_date_range_uses_local_day() {
        // 01:30 UTC on the 11th is still the 10th three hours west.
        let at = Utc.with_ymd_and_hms(2024, 3, 11, 1, 30, 0).unwrap();
        let item = listing(1, None, &[], at);
        let tz = chrono::FixedOffset::west_opt(3 * 3600).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();

        let only_10th = SessionFilter {
            start_date: Some(day),
            end_date: Some(day),
            ..Default::default()
        };
        assert!(only_10th.matches(&item, &tz));
        assert!(!only_10th.matches(&item, &Utc));

        let from_11th = SessionFilter {
            start_date: day.succ_opt(),
            ..Default::default()
        };
        assert!(!from_11th.matches(&item, &tz));
        assert!(from_11th.matches(&item, &Utc));
    }

    #[test]
    fn test_operator_filter() {
        let item = listing(1, None, &[], Utc::now());
        let mine = SessionFilter {
            operator_id: Some("op-1".into()),
            ..Default::default()
        };
        let theirs = SessionFilter {
            operator_id: Some("op-2".into()),
            ..Default::default()
        };
        assert!(mine.matches(&item, &Utc));
        assert!(!theirs.matches(&item, &Utc));
    }

    #[test]
    fn test_list_sessions_scoped_and_sorted() {
        let db = db::test_db();
        {
            let conn = db.conn.lock().unwrap();
            upsert_operator(&conn, "op-1", "Ana Lima", false).unwrap();
            upsert_operator(&conn, "op-2", "Bruno Reis", false).unwrap();
        }
        let ana = Actor::operator("op-1");
        let bruno = Actor::operator("op-2");

        let first = open_session(&db, &ana, dec!(0)).unwrap();
        close_session(&db, &ana, &first.id).unwrap();
        let second = open_session(&db, &ana, dec!(0)).unwrap();
        let sale = create_sale(
            &db,
            &ana,
            NewSale {
                id: Some("venda-77".into()),
                channel: SaleChannel::Register,
                status: SaleStatus::Finalizada,
                total: dec!(10),
                payments: vec![Payment {
                    method: "Pix".into(),
                    value: dec!(10),
                    fees: None,
                }],
            },
        )
        .unwrap();
        open_session(&db, &bruno, dec!(0)).unwrap();

        let own = list_sessions(&db, &ana, &SessionFilter::default()).unwrap();
        assert_eq!(own.len(), 2);
        assert!(own.iter().all(|l| l.session.user_id == "op-1"));
        assert_eq!(own[0].session.id, second.id);
        assert_eq!(own[0].sales_count, 1);
        assert_eq!(own[0].operator_name.as_deref(), Some("Ana Lima"));

        // Operators cannot widen the scope with operator_id.
        let sneaky = SessionFilter {
            operator_id: Some("op-2".into()),
            ..Default::default()
        };
        assert!(list_sessions(&db, &ana, &sneaky).unwrap().is_empty());

        let admin = Actor::admin("boss");
        assert_eq!(list_sessions(&db, &admin, &SessionFilter::default()).unwrap().len(), 3);
        assert_eq!(list_sessions(&db, &admin, &sneaky).unwrap().len(), 1);

        let by_sale = list_sessions(&db, &admin, &search(&sale.id)).unwrap();
        assert_eq!(by_sale.len(), 1);
        assert_eq!(by_sale[0].session.id, second.id);

        let by_name = list_sessions(&db, &admin, &search("bruno")).unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].session.user_id, "op-2");
    }

    #[test]
    fn test_sale_counts_follow_actor_scope() {
        let db = db::test_db();
        let ana = Actor::operator("op-1");
        let bruno = Actor::operator("op-2");
        let pix = |id: &str| NewSale {
            id: Some(id.into()),
            channel: SaleChannel::Register,
            status: SaleStatus::Finalizada,
            total: dec!(5),
            payments: vec![Payment {
                method: "Pix".into(),
                value: dec!(5),
                fees: None,
            }],
        };

        let ana_session = open_session(&db, &ana, dec!(0)).unwrap();
        create_sale(&db, &ana, pix("a-1")).unwrap();
        let bruno_session = open_session(&db, &bruno, dec!(0)).unwrap();
        create_sale(&db, &bruno, pix("b-1")).unwrap();
        create_sale(&db, &bruno, pix("b-2")).unwrap();

        let own = list_sessions(&db, &ana, &SessionFilter::default()).unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].sale_ids, vec!["a-1".to_string()]);
        assert!(list_sessions(&db, &ana, &search("b-1")).unwrap().is_empty());

        let all = list_sessions(&db, &Actor::admin("boss"), &SessionFilter::default()).unwrap();
        let count_of = |id: &str| all.iter().find(|l| l.session.id == id).map(|l| l.sales_count);
        assert_eq!(count_of(&ana_session.id), Some(1));
        assert_eq!(count_of(&bruno_session.id), Some(2));
    }
}
