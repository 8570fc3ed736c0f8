//! Operator identity and the single authorization rule.
//!
//! Identity is resolved by the login service; every call here receives it
//! explicitly as an [`Actor`]. What an actor may do is decided in one place,
//! [`authorize`], over a closed set of [`Capability`] values.

use serde::{Deserialize, Serialize};

use crate::error::CashError;

/// The operator issuing a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(alias = "user_id", alias = "id")]
    pub user_id: String,
    #[serde(default, alias = "is_admin")]
    pub is_admin: bool,
}

impl Actor {
    pub fn operator(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CloseSession,
    ReopenSession,
    AddMovement,
    ViewSession,
    ViewSale,
    EditSale,
    PrintSale,
    CancelSale,
}

impl Capability {
    fn verb(&self) -> &'static str {
        match self {
            Capability::CloseSession => "close this cash session",
            Capability::ReopenSession => "reopen this cash session",
            Capability::AddMovement => "move cash in this session",
            Capability::ViewSession => "view this cash session",
            Capability::ViewSale => "view this sale",
            Capability::EditSale => "edit this sale",
            Capability::PrintSale => "print this sale",
            Capability::CancelSale => "cancel this sale",
        }
    }
}

/// What a capability is being exercised on.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    Session {
        owner_id: &'a str,
    },
    Sale {
        salesperson_id: &'a str,
        /// Owner of the linked session, when the link resolves.
        session_owner_id: Option<&'a str>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuthDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }

    pub fn into_result(self) -> Result<(), CashError> {
        if self.allowed {
            Ok(())
        } else {
            Err(CashError::Authorization(
                self.reason
                    .unwrap_or_else(|| "Operation not permitted".to_string()),
            ))
        }
    }
}

/// Admins may do anything. Otherwise sessions belong to their owner, and a
/// sale is reachable by its salesperson or by the owner of its session.
pub fn authorize(capability: Capability, actor: &Actor, resource: Resource<'_>) -> AuthDecision {
    if actor.is_admin {
        return AuthDecision::allow();
    }

    let permitted = match resource {
        Resource::Session { owner_id } => owner_id == actor.user_id,
        Resource::Sale {
            salesperson_id,
            session_owner_id,
        } => salesperson_id == actor.user_id || session_owner_id == Some(actor.user_id.as_str()),
    };

    if permitted {
        AuthDecision::allow()
    } else {
        let whose = match resource {
            Resource::Session { .. } => "it belongs to another operator",
            Resource::Sale { .. } => "it was made by another operator in another cash session",
        };
        AuthDecision::deny(format!(
            "You are not allowed to {}: {whose}",
            capability.verb()
        ))
    }
}
