// src/store/mod.rs

//! External collaborators of the live-session core.
//!
//! The core never keeps session state of its own between requests. Every
//! exclusion it relies on is expressed as a conditional write here:
//! live-PIN uniqueness on insert, compare-and-swap on transitions, and the
//! uniqueness triple on answers. Implementations must make each method a
//! single atomic step.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::utils::jwt::is_anonymous;
use crate::models::{
    answer::Answer,
    participant::{Participant, Role},
    question::Quiz,
    session::{Session, SessionStatus},
};

pub use memory::{MemoryQuizCatalog, MemorySessionStore};
pub use postgres::{PgQuizCatalog, PgSessionStore};

/// A conditional session update.
///
/// Applied only if the stored row still has status `from` (and, when
/// given, cursor `from_index`). The timestamps are derived from `to`:
/// entering `Active` from the lobby stamps `started_at`, every move that
/// lands in `Active` stamps `question_started_at`, and entering `Ended`
/// stamps `ended_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: SessionStatus,
    pub from_index: Option<i32>,
    pub to: SessionStatus,
    pub to_index: i32,
    pub at: DateTime<Utc>,
}

impl Transition {
    /// Applies the transition to an in-memory copy of the row.
    /// Callers must have checked the precondition.
    pub fn apply_to(&self, session: &mut Session) {
        if self.from == SessionStatus::Lobby && self.to == SessionStatus::Active {
            session.started_at = Some(self.at);
        }
        if self.to == SessionStatus::Active {
            session.question_started_at = Some(self.at);
        }
        if self.to == SessionStatus::Ended {
            session.ended_at = Some(self.at);
        }
        session.status = self.to;
        session.current_index = self.to_index;
    }

    pub fn matches(&self, session: &Session) -> bool {
        session.status == self.from
            && self
                .from_index
                .is_none_or(|expected| expected == session.current_index)
    }
}

/// Outcome of a conditional participant upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinWrite {
    /// Inserted, or refreshed in place if the participant already existed.
    Joined(Participant),
    SessionMissing,
    SessionEnded,
    /// The participant already exists under a different role; untouched.
    RoleConflict(Role),
}

/// Outcome of a conditional answer insert.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerWrite {
    Inserted(Answer),
    /// The identity triple already exists; the stored answer is untouched.
    Duplicate,
    /// The session is no longer active at the expected cursor. Carries the
    /// row as seen inside the write so the caller can say why.
    CursorMoved(Option<Session>),
}

/// Durable record of sessions, participants and answers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts a new session unless another live session already holds its
    /// PIN. Returns `false` on a PIN collision.
    async fn insert_session(&self, session: &Session) -> Result<bool, AppError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, AppError>;

    /// Looks up the live (lobby or active) session holding `pin`.
    async fn find_live_by_pin(&self, pin: &str) -> Result<Option<Session>, AppError>;

    /// Compare-and-swap. Returns the updated row, or `None` when the row is
    /// missing or no longer matches the transition's precondition.
    async fn apply_transition(
        &self,
        id: Uuid,
        transition: &Transition,
    ) -> Result<Option<Session>, AppError>;

    /// Inserts the participant, or refreshes `display_name`/`last_seen_at`
    /// of the existing row (`joined_at` is kept). A rejoin under another
    /// role is refused, as is any join once the session has ended.
    async fn join_participant(&self, participant: &Participant) -> Result<JoinWrite, AppError>;

    async fn get_participant(
        &self,
        session_id: Uuid,
        participant_id: &str,
    ) -> Result<Option<Participant>, AppError>;

    async fn list_participants(&self, session_id: Uuid) -> Result<Vec<Participant>, AppError>;

    async fn count_participants(
        &self,
        session_id: Uuid,
        role: Option<Role>,
    ) -> Result<u64, AppError>;

    /// Refreshes `last_seen_at`; a missing participant is not an error.
    async fn touch_participant(
        &self,
        session_id: Uuid,
        participant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Inserts the answer if the session is still active at
    /// `expected_index` and the triple is new, refreshing the participant's
    /// `last_seen_at` in the same step.
    async fn record_answer(
        &self,
        answer: &Answer,
        expected_index: i32,
    ) -> Result<AnswerWrite, AppError>;

    async fn answers_for_question(
        &self,
        session_id: Uuid,
        question_id: &str,
    ) -> Result<Vec<Answer>, AppError>;

    async fn answers_for_session(&self, session_id: Uuid) -> Result<Vec<Answer>, AppError>;
}

/// Quiz content lookup by `quiz_ref`.
#[async_trait]
pub trait QuizCatalog: Send + Sync {
    async fn load_quiz(&self, quiz_ref: &str) -> Result<Option<Quiz>, AppError>;
}

/// Identity/authorization decisions about sessions.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// May `caller` open a session on `quiz`?
    async fn can_host(&self, caller: &str, quiz: &Quiz) -> Result<bool, AppError>;

    /// May `caller` drive (start/advance/end) or review `session`?
    async fn can_manage(
        &self,
        caller: &str,
        session: &Session,
        quiz: &Quiz,
    ) -> Result<bool, AppError>;
}

/// Default policy: quiz owners and collaborators host; the session creator
/// and those same co-owners manage. Anonymous callers do neither.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuizOwnership;

#[async_trait]
impl AccessPolicy for QuizOwnership {
    async fn can_host(&self, caller: &str, quiz: &Quiz) -> Result<bool, AppError> {
        Ok(!is_anonymous(caller) && quiz.is_owner_or_collaborator(caller))
    }

    async fn can_manage(
        &self,
        caller: &str,
        session: &Session,
        quiz: &Quiz,
    ) -> Result<bool, AppError> {
        if is_anonymous(caller) {
            return Ok(false);
        }
        Ok(session.created_by == caller || quiz.is_owner_or_collaborator(caller))
    }
}
