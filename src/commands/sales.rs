use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use super::{parse_payload, require_id, to_json, RegisterState};
use crate::auth::Actor;
use crate::events::CashEvent;
use crate::retry::retry_transient;
use crate::sales::{self, EditOrigin, NewSale, Payment, SaleChannel, SaleOperation, SaleStatus};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleCreatePayload {
    actor: Actor,
    #[serde(default)]
    id: Option<String>,
    channel: SaleChannel,
    #[serde(default)]
    status: SaleStatus,
    total: Decimal,
    #[serde(default)]
    payments: Vec<Payment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleAuthorizePayload {
    actor: Actor,
    #[serde(alias = "sale_id", alias = "id")]
    sale_id: String,
    operation: SaleOperation,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleEditPayload {
    actor: Actor,
    #[serde(alias = "sale_id", alias = "id")]
    sale_id: String,
    origin: EditOrigin,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleCancelPayload {
    actor: Actor,
    #[serde(alias = "sale_id", alias = "id")]
    sale_id: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionSalesPayload {
    actor: Actor,
    #[serde(alias = "session_id", alias = "id")]
    session_id: String,
}

pub async fn sale_create(arg0: Option<Value>, state: &RegisterState) -> Result<Value, String> {
    let payload: SaleCreatePayload = parse_payload(arg0, "sale", None)?;
    let new_sale = NewSale {
        id: payload.id,
        channel: payload.channel,
        status: payload.status,
        total: payload.total,
        payments: payload.payments,
    };
    let sale = sales::create_sale(&state.db, &payload.actor, new_sale)
        .map_err(|e| state.fail("sale_create", None, e))?;
    let result = to_json(&sale)?;
    state.events.emit(CashEvent::SaleCreated {
        sale: result.clone(),
    });
    Ok(result)
}

/// Returns `{ allowed, reason? }` without performing the operation.
pub async fn sale_authorize(arg0: Option<Value>, state: &RegisterState) -> Result<Value, String> {
    let payload: SaleAuthorizePayload = parse_payload(arg0, "sale authorization", None)?;
    let sale_id = require_id(&payload.sale_id, "saleId")?;
    let decision = retry_transient(&state.fetch_policy(), "sale_authorize", || {
        sales::authorize_sale_operation(&state.db, &payload.actor, &sale_id, payload.operation)
    })
    .await
    .map_err(|e| state.fail("sale_authorize", None, e))?;
    to_json(&decision)
}

pub async fn sale_begin_edit(arg0: Option<Value>, state: &RegisterState) -> Result<Value, String> {
    let payload: SaleEditPayload = parse_payload(arg0, "sale edit", None)?;
    let sale_id = require_id(&payload.sale_id, "saleId")?;
    let sale = sales::begin_sale_edit(&state.db, &payload.actor, &sale_id, payload.origin)
        .map_err(|e| state.fail("sale_begin_edit", None, e))?;
    to_json(&sale)
}

pub async fn sale_cancel(arg0: Option<Value>, state: &RegisterState) -> Result<Value, String> {
    let payload: SaleCancelPayload = parse_payload(arg0, "sale cancel", None)?;
    let sale_id = require_id(&payload.sale_id, "saleId")?;
    let sale = sales::cancel_sale(&state.db, &payload.actor, &sale_id, &payload.reason)
        .map_err(|e| state.fail("sale_cancel", None, e))?;
    let result = to_json(&sale)?;
    state.events.emit(CashEvent::SaleCancelled {
        sale: result.clone(),
    });
    Ok(result)
}

pub async fn sale_list_for_session(
    arg0: Option<Value>,
    state: &RegisterState,
) -> Result<Value, String> {
    let payload: SessionSalesPayload = parse_payload(arg0, "session sales", None)?;
    let session_id = require_id(&payload.session_id, "sessionId")?;
    let list = retry_transient(&state.fetch_policy(), "sale_list_for_session", || {
        sales::list_session_sales(&state.db, &payload.actor, &session_id)
    })
    .await
    .map_err(|e| state.fail("sale_list_for_session", Some(&session_id), e))?;
    to_json(&list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::cash_sessions::{cash_session_get_summary, cash_session_open};
    use crate::commands::test_state;
    use serde_json::json;

    fn actor(id: &str) -> Value {
        json!({ "userId": id })
    }

    #[tokio::test]
    async fn test_register_sale_flow() {
        let state = test_state();
        let session = cash_session_open(
            Some(json!({ "actor": actor("B"), "openingBalance": 100 })),
            &state,
        )
        .await
        .unwrap();

        let sale = sale_create(
            Some(json!({
                "actor": actor("B"),
                "channel": "register",
                "total": 80,
                "payments": [
                    { "method": "Dinheiro", "value": 50 },
                    { "method": "Cartão de Crédito", "value": 30 }
                ]
            })),
            &state,
        )
        .await
        .unwrap();
        assert_eq!(sale["cashSessionId"], session["id"]);
        assert_eq!(sale["cashSessionDisplayId"], 1);

        let summary = cash_session_get_summary(
            Some(json!({ "actor": actor("B"), "sessionId": session["id"] })),
            &state,
        )
        .await
        .unwrap();
        assert_eq!(summary["cashInRegister"], 150.0);
        assert_eq!(summary["totalsByMethod"][0]["method"], "Dinheiro");

        let listed = sale_list_for_session(
            Some(json!({ "actor": actor("B"), "sessionId": session["id"] })),
            &state,
        )
        .await
        .unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let decision = sale_authorize(
            Some(json!({ "actor": actor("C"), "saleId": sale["id"], "operation": "print" })),
            &state,
        )
        .await
        .unwrap();
        assert_eq!(decision["allowed"], false);
        assert!(decision["reason"].as_str().unwrap().contains("print this sale"));

        let err = sale_begin_edit(
            Some(json!({ "actor": actor("B"), "saleId": sale["id"], "origin": "salesList" })),
            &state,
        )
        .await
        .unwrap_err();
        assert!(err.contains("cash register screen"));

        let editable = sale_begin_edit(
            Some(json!({ "actor": actor("B"), "saleId": sale["id"], "origin": "register" })),
            &state,
        )
        .await
        .unwrap();
        assert_eq!(editable["id"], sale["id"]);

        let cancelled = sale_cancel(
            Some(json!({ "actor": actor("B"), "saleId": sale["id"], "reason": "devolução" })),
            &state,
        )
        .await
        .unwrap();
        assert_eq!(cancelled["status"], "Cancelada");

        let summary = cash_session_get_summary(
            Some(json!({ "actor": actor("B"), "sessionId": session["id"] })),
            &state,
        )
        .await
        .unwrap();
        assert_eq!(summary["cashInRegister"], 100.0);
        assert_eq!(summary["consistent"], true);
    }

    #[tokio::test]
    async fn test_unknown_sale_requests_refresh() {
        let state = test_state();
        let mut rx = state.events.subscribe();
        let err = sale_cancel(
            Some(json!({ "actor": actor("A"), "saleId": "ghost", "reason": "x" })),
            &state,
        )
        .await
        .unwrap_err();
        assert!(err.contains("Sale not found"));
        assert!(matches!(
            rx.recv().await.unwrap(),
            CashEvent::RefreshRequested { .. }
        ));
    }
}
