//! Client-side view of a set of sessions with optimistic updates.
//!
//! A [`SessionCommand`] is applied to the local copy first, then sent to the
//! store. The confirmed session replaces the local copy on success; on
//! failure the local copy is rolled back, and if the failure means the view
//! was stale the session is reloaded from the store.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::auth::Actor;
use crate::db::DbState;
use crate::error::{CashError, Result};
use crate::movements::{MovementType, NewMovement};
use crate::registry::{self, SessionFilter};
use crate::sessions::{self, CashSession, SessionStatus};

#[derive(Debug, Clone)]
pub enum SessionCommand {
    Close {
        session_id: String,
    },
    Reopen {
        session_id: String,
    },
    AddMovement {
        session_id: String,
        movement_type: MovementType,
        amount: Decimal,
        reason: String,
    },
}

impl SessionCommand {
    pub fn session_id(&self) -> &str {
        match self {
            SessionCommand::Close { session_id }
            | SessionCommand::Reopen { session_id }
            | SessionCommand::AddMovement { session_id, .. } => session_id,
        }
    }

    fn apply_locally(&self, session: &mut CashSession) {
        match self {
            SessionCommand::Close { .. } => {
                session.status = SessionStatus::Closed;
                session.close_time = Some(Utc::now());
            }
            SessionCommand::Reopen { .. } => {
                session.status = SessionStatus::Open;
                session.close_time = None;
            }
            SessionCommand::AddMovement {
                movement_type,
                amount,
                ..
            } => match movement_type {
                MovementType::Suprimento => {
                    session.deposits += *amount;
                    session.cash_in_register += *amount;
                }
                MovementType::Sangria => {
                    session.withdrawals += *amount;
                    session.cash_in_register -= *amount;
                }
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionBoard {
    sessions: HashMap<String, CashSession>,
}

impl SessionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the board with every session the actor can see.
    pub fn load(db: &DbState, actor: &Actor) -> Result<Self> {
        let sessions = registry::list_sessions(db, actor, &SessionFilter::default())?
            .into_iter()
            .map(|listing| (listing.session.id.clone(), listing.session))
            .collect();
        Ok(Self { sessions })
    }

    pub fn get(&self, session_id: &str) -> Option<&CashSession> {
        self.sessions.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Apply `command` optimistically and confirm it against the store.
    pub fn dispatch(&mut self, db: &DbState, actor: &Actor, command: SessionCommand) -> Result<CashSession> {
        let session_id = command.session_id().to_string();
        let snapshot = self.sessions.get(&session_id).cloned();

        if let Some(local) = self.sessions.get_mut(&session_id) {
            command.apply_locally(local);
        }

        let outcome = match &command {
            SessionCommand::Close { .. } => sessions::close_session(db, actor, &session_id),
            SessionCommand::Reopen { .. } => sessions::reopen_session(db, actor, &session_id),
            SessionCommand::AddMovement {
                movement_type,
                amount,
                reason,
                ..
            } => sessions::record_movement(
                db,
                actor,
                &session_id,
                NewMovement {
                    movement_type: *movement_type,
                    amount: *amount,
                    reason: reason.clone(),
                    user_id: actor.user_id.clone(),
                },
            ),
        };

        match outcome {
            Ok(confirmed) => {
                self.sessions.insert(session_id, confirmed.clone());
                Ok(confirmed)
            }
            Err(err) => {
                match snapshot {
                    Some(previous) => {
                        self.sessions.insert(session_id.clone(), previous);
                    }
                    None => {
                        self.sessions.remove(&session_id);
                    }
                }
                debug!(session_id = %session_id, error = %err, "Rolled back optimistic update");
                if err.needs_refresh() {
                    self.refresh(db, actor, &session_id);
                }
                Err(err)
            }
        }
    }

    /// Reload one session from the store. Sessions that no longer exist are
    /// dropped from the board.
    pub fn refresh(&mut self, db: &DbState, actor: &Actor, session_id: &str) {
        match sessions::get_session(db, actor, session_id) {
            Ok(session) => {
                self.sessions.insert(session_id.to_string(), session);
            }
            Err(CashError::NotFound(_)) => {
                self.sessions.remove(session_id);
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "Background refresh failed"),
        }
    }
}
