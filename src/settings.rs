//! Register configuration stored in `local_settings` (category `cash_register`).

use rusqlite::Connection;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

use crate::db;
use crate::error::Result;
use crate::retry::RetryPolicy;

const CATEGORY: &str = "cash_register";
const KEY_CASH_METHODS: &str = "cash_methods";
const KEY_REOPEN_POLICY: &str = "reopen_policy";
const KEY_FETCH_RETRIES: &str = "fetch_max_retries";
const KEY_FETCH_BASE_DELAY_MS: &str = "fetch_base_delay_ms";

const DEFAULT_CASH_METHOD: &str = "Dinheiro";
const DEFAULT_FETCH_RETRIES: u32 = 2;
const DEFAULT_FETCH_BASE_DELAY_MS: u64 = 400;

/// Whether closed sessions may be reopened at any time or only on the day
/// they were opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReopenPolicy {
    Unrestricted,
    SameDay,
}

impl ReopenPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "unrestricted" | "any" => Some(ReopenPolicy::Unrestricted),
            "same_day" | "same-day" => Some(ReopenPolicy::SameDay),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ReopenPolicy::Unrestricted => "unrestricted",
            ReopenPolicy::SameDay => "same_day",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashSettings {
    /// Payment method names that count as cash in the drawer. Compared
    /// trimmed and case-insensitively.
    pub cash_methods: Vec<String>,
    pub reopen_policy: ReopenPolicy,
    #[serde(skip)]
    pub fetch_retry: RetryPolicy,
}

impl Default for CashSettings {
    fn default() -> Self {
        Self {
            cash_methods: vec![DEFAULT_CASH_METHOD.to_string()],
            reopen_policy: ReopenPolicy::Unrestricted,
            fetch_retry: RetryPolicy {
                max_retries: DEFAULT_FETCH_RETRIES,
                base_delay: Duration::from_millis(DEFAULT_FETCH_BASE_DELAY_MS),
                ..RetryPolicy::default()
            },
        }
    }
}

impl CashSettings {
    /// Load settings, falling back to defaults for missing or malformed keys.
    pub fn load(conn: &Connection) -> Self {
        let mut settings = CashSettings::default();

        if let Some(raw) = db::get_setting(conn, CATEGORY, KEY_CASH_METHODS) {
            let methods: Vec<String> = raw
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
            if methods.is_empty() {
                warn!(value = %raw, "Empty cash_methods setting, keeping default");
            } else {
                settings.cash_methods = methods;
            }
        }

        if let Some(raw) = db::get_setting(conn, CATEGORY, KEY_REOPEN_POLICY) {
            match ReopenPolicy::parse(&raw) {
                Some(policy) => settings.reopen_policy = policy,
                None => warn!(value = %raw, "Unknown reopen_policy setting, keeping default"),
            }
        }

        if let Some(n) = db::get_setting(conn, CATEGORY, KEY_FETCH_RETRIES)
            .and_then(|v| v.trim().parse::<u32>().ok())
        {
            settings.fetch_retry.max_retries = n;
        }
        if let Some(ms) = db::get_setting(conn, CATEGORY, KEY_FETCH_BASE_DELAY_MS)
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            settings.fetch_retry.base_delay = Duration::from_millis(ms);
        }

        settings
    }

    pub fn save(&self, conn: &Connection) -> Result<()> {
        db::set_setting(conn, CATEGORY, KEY_CASH_METHODS, &self.cash_methods.join(","))?;
        db::set_setting(conn, CATEGORY, KEY_REOPEN_POLICY, self.reopen_policy.as_str())?;
        db::set_setting(
            conn,
            CATEGORY,
            KEY_FETCH_RETRIES,
            &self.fetch_retry.max_retries.to_string(),
        )?;
        db::set_setting(
            conn,
            CATEGORY,
            KEY_FETCH_BASE_DELAY_MS,
            &self.fetch_retry.base_delay.as_millis().to_string(),
        )?;
        Ok(())
    }
}
