//! JSON command surface for the register frontend.
//!
//! Each command takes the raw argument the frontend sent (`arg0`), parses it
//! into a typed payload, calls the domain layer and returns JSON. Failures are
//! returned as the human-readable toast message; stale-view failures also
//! publish a refresh request on the event bus.

pub mod cash_sessions;
pub mod sales;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::warn;

use crate::db::{self, DbState};
use crate::error::CashError;
use crate::events::{CashEvent, EventBus};
use crate::retry::RetryPolicy;
use crate::settings::CashSettings;

/// Everything a command needs: the store and the event bus.
pub struct RegisterState {
    pub db: DbState,
    pub events: EventBus,
}

impl RegisterState {
    pub fn new(db: DbState) -> Self {
        Self {
            db,
            events: EventBus::new(),
        }
    }

    /// Open (or create) the register database under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, String> {
        Ok(Self::new(db::init(data_dir)?))
    }

    pub(crate) fn fetch_policy(&self) -> RetryPolicy {
        match self.db.conn.lock() {
            Ok(conn) => CashSettings::load(&conn).fetch_retry,
            Err(_) => RetryPolicy::default(),
        }
    }

    /// Log a failed command and turn it into the message shown to the user.
    pub(crate) fn fail(&self, command: &str, session_id: Option<&str>, err: CashError) -> String {
        let toast = err.toast();
        warn!(
            command,
            code = toast.code,
            session_id = session_id.unwrap_or(""),
            error = %err,
            "Cash command failed"
        );
        if toast.refresh {
            self.events.emit(CashEvent::RefreshRequested {
                session_id: session_id.map(str::to_string),
            });
        }
        toast.message
    }
}

/// Parse `arg0` into a payload. A bare string is accepted as `{ key: string }`.
pub(crate) fn parse_payload<T: DeserializeOwned>(
    arg0: Option<Value>,
    what: &str,
    string_key: Option<&str>,
) -> Result<T, String> {
    let payload = match (arg0, string_key) {
        (Some(Value::String(s)), Some(key)) => {
            let mut obj = serde_json::Map::new();
            obj.insert(key.to_string(), Value::String(s));
            Value::Object(obj)
        }
        (Some(v), _) => v,
        (None, _) => serde_json::json!({}),
    };
    serde_json::from_value(payload).map_err(|e| format!("Invalid {what} payload: {e}"))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Failed to encode response: {e}"))
}

pub(crate) fn require_id(raw: &str, field: &str) -> Result<String, String> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(format!("Missing {field}"));
    }
    Ok(id.to_string())
}

#[cfg(test)]
pub(crate) fn test_state() -> RegisterState {
    RegisterState::new(db::test_db())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_payload_accepts_bare_string() {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct P {
            user_id: String,
        }
        let p: P = parse_payload(Some(json!("op-1")), "user", Some("userId")).unwrap();
        assert_eq!(p.user_id, "op-1");

        let err = parse_payload::<P>(None, "user", Some("userId")).err().unwrap();
        assert!(err.starts_with("Invalid user payload"));
    }

    #[test]
    fn test_fail_hides_database_detail_and_requests_refresh() {
        let state = test_state();
        let mut rx = state.events.subscribe();

        let msg = state.fail(
            "test",
            Some("s-1"),
            CashError::InvalidState("Cash session #1 is already closed".into()),
        );
        assert_eq!(msg, "Cash session #1 is already closed");
        match rx.try_recv().unwrap() {
            CashEvent::RefreshRequested { session_id } => {
                assert_eq!(session_id.as_deref(), Some("s-1"))
            }
            other => panic!("unexpected event {other:?}"),
        }

        let db_err = CashError::Database(rusqlite::Error::QueryReturnedNoRows);
        let msg = state.fail("test", None, db_err);
        assert!(!msg.contains("QueryReturnedNoRows"));
        assert!(rx.try_recv().is_err());
    }
}
