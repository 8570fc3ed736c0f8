use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{parse_payload, require_id, to_json, RegisterState};
use crate::auth::Actor;
use crate::events::CashEvent;
use crate::movements::{self, MovementType, NewMovement};
use crate::registry::{self, SessionFilter};
use crate::retry::retry_transient;
use crate::sessions;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenPayload {
    actor: Actor,
    #[serde(default, alias = "opening_balance", alias = "openingCash")]
    opening_balance: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    actor: Actor,
    #[serde(alias = "session_id", alias = "id")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveSessionPayload {
    #[serde(alias = "user_id", alias = "id")]
    user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPayload {
    actor: Actor,
    #[serde(default, alias = "start_date")]
    start_date: Option<NaiveDate>,
    #[serde(default, alias = "end_date")]
    end_date: Option<NaiveDate>,
    #[serde(default, alias = "operator_id")]
    operator_id: Option<String>,
    #[serde(default)]
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MovementAddPayload {
    actor: Actor,
    #[serde(alias = "session_id")]
    session_id: String,
    #[serde(rename = "type", alias = "movementType", alias = "movement_type")]
    movement_type: MovementType,
    amount: Decimal,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MovementListPayload {
    actor: Actor,
    #[serde(alias = "session_id", alias = "id")]
    session_id: String,
    #[serde(default, rename = "type", alias = "movementType")]
    movement_type: Option<MovementType>,
}

pub async fn cash_session_open(arg0: Option<Value>, state: &RegisterState) -> Result<Value, String> {
    let payload: OpenPayload = parse_payload(arg0, "cash session open", None)?;
    let session = sessions::open_session(&state.db, &payload.actor, payload.opening_balance)
        .map_err(|e| state.fail("cash_session_open", None, e))?;
    let result = to_json(&session)?;
    state.events.emit(CashEvent::SessionOpened {
        session: result.clone(),
    });
    Ok(result)
}

pub async fn cash_session_close(arg0: Option<Value>, state: &RegisterState) -> Result<Value, String> {
    let payload: SessionPayload = parse_payload(arg0, "cash session close", None)?;
    let session_id = require_id(&payload.session_id, "sessionId")?;
    let session = sessions::close_session(&state.db, &payload.actor, &session_id)
        .map_err(|e| state.fail("cash_session_close", Some(&session_id), e))?;
    let result = to_json(&session)?;
    state.events.emit(CashEvent::SessionClosed {
        session: result.clone(),
    });
    Ok(result)
}

pub async fn cash_session_reopen(arg0: Option<Value>, state: &RegisterState) -> Result<Value, String> {
    let payload: SessionPayload = parse_payload(arg0, "cash session reopen", None)?;
    let session_id = require_id(&payload.session_id, "sessionId")?;
    let session = sessions::reopen_session(&state.db, &payload.actor, &session_id)
        .map_err(|e| state.fail("cash_session_reopen", Some(&session_id), e))?;
    let result = to_json(&session)?;
    state.events.emit(CashEvent::SessionReopened {
        session: result.clone(),
    });
    Ok(result)
}

/// Returns the open session or `null`.
pub async fn cash_session_get_active(
    arg0: Option<Value>,
    state: &RegisterState,
) -> Result<Value, String> {
    let payload: ActiveSessionPayload = parse_payload(arg0, "active session", Some("userId"))?;
    let user_id = require_id(&payload.user_id, "userId")?;
    let session = retry_transient(&state.fetch_policy(), "cash_session_get_active", || {
        sessions::get_active_session(&state.db, &user_id)
    })
    .await
    .map_err(|e| state.fail("cash_session_get_active", None, e))?;
    to_json(&session)
}

pub async fn cash_session_get_summary(
    arg0: Option<Value>,
    state: &RegisterState,
) -> Result<Value, String> {
    let payload: SessionPayload = parse_payload(arg0, "cash session summary", None)?;
    let session_id = require_id(&payload.session_id, "sessionId")?;
    let summary = retry_transient(&state.fetch_policy(), "cash_session_get_summary", || {
        sessions::session_summary(&state.db, &payload.actor, &session_id)
    })
    .await
    .map_err(|e| state.fail("cash_session_get_summary", Some(&session_id), e))?;
    to_json(&summary)
}

pub async fn cash_session_list(arg0: Option<Value>, state: &RegisterState) -> Result<Value, String> {
    let payload: ListPayload = parse_payload(arg0, "cash session list", None)?;
    let filter = SessionFilter {
        start_date: payload.start_date,
        end_date: payload.end_date,
        operator_id: payload.operator_id,
        search: payload.search,
    };
    let listings = retry_transient(&state.fetch_policy(), "cash_session_list", || {
        registry::list_sessions(&state.db, &payload.actor, &filter)
    })
    .await
    .map_err(|e| state.fail("cash_session_list", None, e))?;
    info!(
        user_id = %payload.actor.user_id,
        count = listings.len(),
        "Listed cash sessions"
    );
    to_json(&listings)
}

pub async fn cash_movement_add(arg0: Option<Value>, state: &RegisterState) -> Result<Value, String> {
    let payload: MovementAddPayload = parse_payload(arg0, "cash movement", None)?;
    let session_id = require_id(&payload.session_id, "sessionId")?;
    let movement = NewMovement {
        movement_type: payload.movement_type,
        amount: payload.amount,
        reason: payload.reason,
        user_id: payload.actor.user_id.clone(),
    };
    let session = sessions::record_movement(&state.db, &payload.actor, &session_id, movement)
        .map_err(|e| state.fail("cash_movement_add", Some(&session_id), e))?;
    let result = to_json(&session)?;
    state.events.emit(CashEvent::MovementAdded {
        session: result.clone(),
    });
    Ok(result)
}

pub async fn cash_movement_list(arg0: Option<Value>, state: &RegisterState) -> Result<Value, String> {
    let payload: MovementListPayload = parse_payload(arg0, "cash movement list", None)?;
    let session_id = require_id(&payload.session_id, "sessionId")?;
    let list = retry_transient(&state.fetch_policy(), "cash_movement_list", || {
        sessions::get_session(&state.db, &payload.actor, &session_id)?;
        movements::list_movements(&state.db, &session_id, payload.movement_type)
    })
    .await
    .map_err(|e| state.fail("cash_movement_list", Some(&session_id), e))?;
    to_json(&list)
}
