// src/live/registry.rs

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::participant::{Participant, Role};
use crate::models::session::{Session, SessionStatus};
use crate::store::{JoinWrite, SessionStore};
use crate::utils::html::sanitize_display_name;

/// Who is in a session. Joining is idempotent per `(session, participant)`.
#[derive(Clone)]
pub struct ParticipantRegistry {
    store: Arc<dyn SessionStore>,
}

impl ParticipantRegistry {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Adds the participant, or refreshes the existing row.
    ///
    /// The ended check is repeated inside the store write, so a join racing
    /// an end cannot slip into a finished session.
    pub async fn join(
        &self,
        session: &Session,
        participant_id: &str,
        display_name: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<Participant, AppError> {
        if session.status == SessionStatus::Ended {
            return Err(AppError::SessionEnded);
        }
        if participant_id.trim().is_empty() {
            return Err(AppError::BadRequest("Participant id cannot be empty".to_string()));
        }

        let candidate = Participant {
            session_id: session.id,
            participant_id: participant_id.to_string(),
            display_name: sanitize_display_name(display_name)?,
            role,
            joined_at: now,
            last_seen_at: now,
        };

        match self.store.join_participant(&candidate).await? {
            JoinWrite::Joined(participant) => {
                tracing::info!(
                    session_id = %session.id,
                    participant_id = %participant.participant_id,
                    role = %participant.role,
                    rejoin = participant.joined_at != now,
                    "Participant joined"
                );
                Ok(participant)
            }
            JoinWrite::SessionMissing => Err(AppError::NotFound("Session not found".to_string())),
            JoinWrite::SessionEnded => Err(AppError::SessionEnded),
            JoinWrite::RoleConflict(existing) => Err(AppError::BadRequest(format!(
                "Already joined this session as {}",
                existing
            ))),
        }
    }

    pub async fn count(&self, session_id: Uuid, role: Option<Role>) -> Result<u64, AppError> {
        self.store.count_participants(session_id, role).await
    }

    pub async fn get(
        &self,
        session_id: Uuid,
        participant_id: &str,
    ) -> Result<Option<Participant>, AppError> {
        self.store.get_participant(session_id, participant_id).await
    }

    pub async fn list(&self, session_id: Uuid) -> Result<Vec<Participant>, AppError> {
        self.store.list_participants(session_id).await
    }

    /// Presence refresh, e.g. when a client (re)subscribes to events.
    pub async fn touch(&self, session_id: Uuid, participant_id: &str) -> Result<(), AppError> {
        self.store
            .touch_participant(session_id, participant_id, Utc::now())
            .await
    }
}
