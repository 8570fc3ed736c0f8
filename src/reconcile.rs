//! Derivation of session aggregates from the underlying sales and ledger.
//!
//! Everything here is pure: callers load rows and pass them in. The cached
//! columns on `cash_sessions` are checked against these values by
//! [`crate::sessions::reconcile_session`].

use rust_decimal::Decimal;
use serde::Serialize;

use crate::movements::{self, Movement};
use crate::sales::Sale;

/// True when `method` names a cash payment. Trimmed, case-insensitive.
pub fn is_cash_method(method: &str, cash_methods: &[String]) -> bool {
    let method = method.trim().to_lowercase();
    !method.is_empty()
        && cash_methods
            .iter()
            .any(|cash| cash.trim().to_lowercase() == method)
}

/// Sum of cash payments of one sale.
pub fn cash_paid(sale: &Sale, cash_methods: &[String]) -> Decimal {
    sale.payments
        .iter()
        .filter(|p| is_cash_method(&p.method, cash_methods))
        .map(|p| p.value)
        .sum()
}

/// Opening balance plus cash sales plus deposits minus withdrawals.
/// Cancelled sales are ignored.
pub fn derive_cash_in_register(
    opening_balance: Decimal,
    sales: &[Sale],
    deposits: Decimal,
    withdrawals: Decimal,
    cash_methods: &[String],
) -> Decimal {
    let cash_sales: Decimal = sales
        .iter()
        .filter(|s| s.counts_toward_totals())
        .map(|s| cash_paid(s, cash_methods))
        .sum();
    opening_balance + cash_sales + deposits - withdrawals
}

/// Sum of totals of the non-cancelled sales.
pub fn derive_transactions_value(sales: &[Sale]) -> Decimal {
    sales
        .iter()
        .filter(|s| s.counts_toward_totals())
        .map(|s| s.total)
        .sum()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodTotal {
    pub method: String,
    pub total: Decimal,
    pub is_cash: bool,
}

/// Group payments of non-cancelled sales by method.
///
/// Methods that differ only by case or surrounding whitespace share a bucket,
/// labelled with the first spelling seen. Cash buckets come first, then the
/// rest in first-seen order.
pub fn group_totals_by_method(sales: &[Sale], cash_methods: &[String]) -> Vec<MethodTotal> {
    let mut buckets: Vec<(String, MethodTotal)> = Vec::new();

    for payment in sales
        .iter()
        .filter(|s| s.counts_toward_totals())
        .flat_map(|s| s.payments.iter())
    {
        let key = payment.method.trim().to_lowercase();
        match buckets.iter_mut().find(|(k, _)| *k == key) {
            Some((_, bucket)) => bucket.total += payment.value,
            None => buckets.push((
                key,
                MethodTotal {
                    method: payment.method.trim().to_string(),
                    total: payment.value,
                    is_cash: is_cash_method(&payment.method, cash_methods),
                },
            )),
        }
    }

    let (mut cash, rest): (Vec<_>, Vec<_>) = buckets
        .into_iter()
        .map(|(_, bucket)| bucket)
        .partition(|b| b.is_cash);
    cash.extend(rest);
    cash
}

/// The four cached aggregates of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregates {
    pub deposits: Decimal,
    pub withdrawals: Decimal,
    pub transactions_value: Decimal,
    pub cash_in_register: Decimal,
}

/// Recompute all aggregates from scratch.
pub fn derive_aggregates(
    opening_balance: Decimal,
    movements: &[Movement],
    sales: &[Sale],
    cash_methods: &[String],
) -> Aggregates {
    let (deposits, withdrawals) = movements::ledger_totals(movements);
    Aggregates {
        deposits,
        withdrawals,
        transactions_value: derive_transactions_value(sales),
        cash_in_register: derive_cash_in_register(
            opening_balance,
            sales,
            deposits,
            withdrawals,
            cash_methods,
        ),
    }
}
