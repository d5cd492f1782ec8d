// src/models/session.rs

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::config::{DEFAULT_TIME_PER_QUESTION, MAX_TIME_PER_QUESTION, MIN_TIME_PER_QUESTION};
use crate::error::AppError;
use crate::models::participant::Role;

/// Lifecycle of a live session. Only ever moves forward:
/// `Lobby -> Active -> Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Lobby,
    Active,
    Ended,
}

impl SessionStatus {
    /// Column representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Lobby => "lobby",
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }

    /// Lobby and active sessions hold their PIN; ended ones release it.
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionStatus::Ended)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lobby" => Ok(SessionStatus::Lobby),
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            other => Err(AppError::InternalServerError(format!(
                "unknown session status '{}'",
                other
            ))),
        }
    }
}

/// Teacher-chosen pacing options. All of them are advisory for the server:
/// the timer and auto-advance run on the teacher's client, which calls the
/// regular advance operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SessionSettings {
    #[validate(range(min = MIN_TIME_PER_QUESTION, max = MAX_TIME_PER_QUESTION))]
    pub time_per_question: u32,
    pub auto_advance: bool,
    /// Lets students read the tally of a question once it is closed.
    pub reveal_after_each: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            time_per_question: DEFAULT_TIME_PER_QUESTION,
            auto_advance: false,
            reveal_after_each: true,
        }
    }
}

/// Represents the 'live_sessions' table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub pin: String,
    pub status: SessionStatus,
    /// Zero-based cursor; meaningful only while `Active`.
    pub current_index: i32,
    pub quiz_ref: String,
    /// Question count captured from the quiz when the session was created.
    pub question_count: i32,
    pub settings: SessionSettings,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// When the current question became visible.
    pub question_started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// A fresh session in the lobby. The PIN is filled in by the allocator.
    pub fn new_lobby(
        created_by: &str,
        quiz_ref: &str,
        question_count: i32,
        settings: SessionSettings,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pin: String::new(),
            status: SessionStatus::Lobby,
            current_index: 0,
            quiz_ref: quiz_ref.to_string(),
            question_count,
            settings,
            created_by: created_by.to_string(),
            created_at: now,
            started_at: None,
            question_started_at: None,
            ended_at: None,
        }
    }

    /// The session as participants see it: no owner identity.
    pub fn public_view(&self) -> PublicSession {
        PublicSession {
            id: self.id,
            pin: self.pin.clone(),
            status: self.status,
            current_index: self.current_index,
            quiz_ref: self.quiz_ref.clone(),
            question_count: self.question_count,
            settings: self.settings.clone(),
            started_at: self.started_at,
            question_started_at: self.question_started_at,
            ended_at: self.ended_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicSession {
    pub id: Uuid,
    pub pin: String,
    pub status: SessionStatus,
    pub current_index: i32,
    pub quiz_ref: String,
    pub question_count: i32,
    pub settings: SessionSettings,
    pub started_at: Option<DateTime<Utc>>,
    pub question_started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Broadcast topic name of a session.
pub fn topic_for(session_id: Uuid) -> String {
    format!("session:{}", session_id)
}

/// DTO for creating a new session.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 128))]
    pub quiz_ref: String,
    #[serde(default)]
    #[validate(nested)]
    pub settings: SessionSettings,
}

/// DTO for joining, by PIN (students) or by id (teachers/co-owners).
#[derive(Debug, Deserialize, Validate)]
pub struct JoinSessionRequest {
    #[validate(length(min = 1, max = 16))]
    pub pin: Option<String>,
    pub session_id: Option<Uuid>,
    #[validate(length(min = 1, max = 200))]
    pub display_name: String,
    #[serde(default)]
    pub role: Option<Role>,
}

/// DTO for submitting an answer to the current question.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitAnswerRequest {
    #[validate(length(min = 1, max = 128))]
    pub question_id: String,
    pub value: crate::models::question::AnswerValue,
}

/// Query parameters for the participant count.
#[derive(Debug, Deserialize)]
pub struct CountParams {
    pub role: Option<Role>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_column_text() {
        for status in [SessionStatus::Lobby, SessionStatus::Active, SessionStatus::Ended] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn settings_defaults_fill_missing_fields() {
        let settings: SessionSettings =
            serde_json::from_value(serde_json::json!({ "auto_advance": true })).unwrap();
        assert_eq!(settings.time_per_question, DEFAULT_TIME_PER_QUESTION);
        assert!(settings.auto_advance);
    }

    #[test]
    fn settings_reject_out_of_range_timer() {
        let settings = SessionSettings {
            time_per_question: 1,
            ..SessionSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn new_session_waits_in_lobby() {
        let s = Session::new_lobby("t1", "quiz-1", 3, SessionSettings::default(), Utc::now());
        assert_eq!(s.status, SessionStatus::Lobby);
        assert_eq!(s.current_index, 0);
        assert!(s.started_at.is_none());
        assert_eq!(topic_for(s.id), format!("session:{}", s.id));
    }

    #[test]
    fn public_view_hides_owner() {
        let s = Session::new_lobby("t1", "quiz-1", 3, SessionSettings::default(), Utc::now());
        let json = serde_json::to_value(s.public_view()).unwrap();
        assert!(json.get("created_by").is_none());
        assert_eq!(json["status"], "LOBBY");
    }
}
