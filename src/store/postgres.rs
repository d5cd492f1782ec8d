// src/store/postgres.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, types::Json};
use uuid::Uuid;

use super::{AnswerWrite, JoinWrite, QuizCatalog, SessionStore, Transition};
use crate::error::AppError;
use crate::models::{
    answer::Answer,
    participant::{Participant, Role},
    question::{AnswerValue, Question, Quiz},
    session::{Session, SessionSettings, SessionStatus},
};

const SESSION_COLUMNS: &str = "id, pin, status, current_index, quiz_ref, question_count, settings, \
     created_by, created_at, started_at, question_started_at, ended_at";

const PARTICIPANT_COLUMNS: &str =
    "session_id, participant_id, display_name, role, joined_at, last_seen_at";

const ANSWER_COLUMNS: &str =
    "session_id, question_id, participant_id, value, is_correct, submitted_at";

/// Raw 'live_sessions' row. Status is stored as text and parsed on the way out.
#[derive(FromRow)]
struct SessionRow {
    id: Uuid,
    pin: String,
    status: String,
    current_index: i32,
    quiz_ref: String,
    question_count: i32,
    settings: Json<SessionSettings>,
    created_by: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    question_started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<SessionRow> for Session {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Session {
            id: row.id,
            pin: row.pin,
            status: row.status.parse()?,
            current_index: row.current_index,
            quiz_ref: row.quiz_ref,
            question_count: row.question_count,
            settings: row.settings.0,
            created_by: row.created_by,
            created_at: row.created_at,
            started_at: row.started_at,
            question_started_at: row.question_started_at,
            ended_at: row.ended_at,
        })
    }
}

#[derive(FromRow)]
struct ParticipantRow {
    session_id: Uuid,
    participant_id: String,
    display_name: String,
    role: String,
    joined_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl TryFrom<ParticipantRow> for Participant {
    type Error = AppError;

    fn try_from(row: ParticipantRow) -> Result<Self, Self::Error> {
        let role = row
            .role
            .parse::<Role>()
            .map_err(|e| AppError::InternalServerError(e.to_string()))?;
        Ok(Participant {
            session_id: row.session_id,
            participant_id: row.participant_id,
            display_name: row.display_name,
            role,
            joined_at: row.joined_at,
            last_seen_at: row.last_seen_at,
        })
    }
}

#[derive(FromRow)]
struct AnswerRow {
    session_id: Uuid,
    question_id: String,
    participant_id: String,
    value: Json<AnswerValue>,
    is_correct: bool,
    submitted_at: DateTime<Utc>,
}

impl From<AnswerRow> for Answer {
    fn from(row: AnswerRow) -> Self {
        Answer {
            session_id: row.session_id,
            question_id: row.question_id,
            participant_id: row.participant_id,
            value: row.value.0,
            is_correct: row.is_correct,
            submitted_at: row.submitted_at,
        }
    }
}

/// Session store on Postgres. Uniqueness and compare-and-swap are left to
/// the database: a partial unique index on live PINs, primary keys on the
/// participant and answer identities, and `UPDATE ... WHERE status = $expected`.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert_session(&self, session: &Session) -> Result<bool, AppError> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO live_sessions (
                id, pin, status, current_index, quiz_ref, question_count, settings,
                created_by, created_at, started_at, question_started_at, ended_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (pin) WHERE status <> 'ended' DO NOTHING
            RETURNING id
            "#,
        )
        .bind(session.id)
        .bind(&session.pin)
        .bind(session.status.as_str())
        .bind(session.current_index)
        .bind(&session.quiz_ref)
        .bind(session.question_count)
        .bind(Json(&session.settings))
        .bind(&session.created_by)
        .bind(session.created_at)
        .bind(session.started_at)
        .bind(session.question_started_at)
        .bind(session.ended_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to insert session: {:?}", e);
            AppError::from(e)
        })?;

        Ok(inserted.is_some())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, AppError> {
        let sql = format!("SELECT {} FROM live_sessions WHERE id = $1", SESSION_COLUMNS);
        sqlx::query_as::<_, SessionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Session::try_from)
            .transpose()
    }

    async fn find_live_by_pin(&self, pin: &str) -> Result<Option<Session>, AppError> {
        let sql = format!(
            "SELECT {} FROM live_sessions WHERE pin = $1 AND status <> 'ended'",
            SESSION_COLUMNS
        );
        sqlx::query_as::<_, SessionRow>(&sql)
            .bind(pin)
            .fetch_optional(&self.pool)
            .await?
            .map(Session::try_from)
            .transpose()
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        transition: &Transition,
    ) -> Result<Option<Session>, AppError> {
        let sql = format!(
            r#"
            UPDATE live_sessions SET
                status = $3,
                current_index = $4,
                started_at = CASE WHEN $2 = 'lobby' AND $3 = 'active' THEN $5 ELSE started_at END,
                question_started_at = CASE WHEN $3 = 'active' THEN $5 ELSE question_started_at END,
                ended_at = CASE WHEN $3 = 'ended' THEN $5 ELSE ended_at END
            WHERE id = $1
              AND status = $2
              AND ($6::INT4 IS NULL OR current_index = $6)
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );

        sqlx::query_as::<_, SessionRow>(&sql)
            .bind(id)
            .bind(transition.from.as_str())
            .bind(transition.to.as_str())
            .bind(transition.to_index)
            .bind(transition.at)
            .bind(transition.from_index)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to apply session transition: {:?}", e);
                AppError::from(e)
            })?
            .map(Session::try_from)
            .transpose()
    }

    async fn join_participant(&self, participant: &Participant) -> Result<JoinWrite, AppError> {
        let mut tx = self.pool.begin().await?;

        // Shared row lock: a concurrent end has to wait for this join.
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM live_sessions WHERE id = $1 FOR SHARE")
                .bind(participant.session_id)
                .fetch_optional(&mut *tx)
                .await?;

        match status.as_deref().map(str::parse::<SessionStatus>).transpose()? {
            None => return Ok(JoinWrite::SessionMissing),
            Some(SessionStatus::Ended) => return Ok(JoinWrite::SessionEnded),
            Some(_) => {}
        }

        let sql = format!(
            r#"
            INSERT INTO live_participants (session_id, participant_id, display_name, role, joined_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (session_id, participant_id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                last_seen_at = EXCLUDED.last_seen_at
            WHERE live_participants.role = EXCLUDED.role
            RETURNING {}
            "#,
            PARTICIPANT_COLUMNS
        );
        let row = sqlx::query_as::<_, ParticipantRow>(&sql)
            .bind(participant.session_id)
            .bind(&participant.participant_id)
            .bind(&participant.display_name)
            .bind(participant.role.as_str())
            .bind(participant.joined_at)
            .bind(participant.last_seen_at)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            // Conflicting row under another role; the update was skipped.
            let existing: String = sqlx::query_scalar(
                "SELECT role FROM live_participants WHERE session_id = $1 AND participant_id = $2",
            )
            .bind(participant.session_id)
            .bind(&participant.participant_id)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(JoinWrite::RoleConflict(existing.parse()?));
        };

        tx.commit().await?;
        Ok(JoinWrite::Joined(row.try_into()?))
    }

    async fn get_participant(
        &self,
        session_id: Uuid,
        participant_id: &str,
    ) -> Result<Option<Participant>, AppError> {
        let sql = format!(
            "SELECT {} FROM live_participants WHERE session_id = $1 AND participant_id = $2",
            PARTICIPANT_COLUMNS
        );
        sqlx::query_as::<_, ParticipantRow>(&sql)
            .bind(session_id)
            .bind(participant_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Participant::try_from)
            .transpose()
    }

    async fn list_participants(&self, session_id: Uuid) -> Result<Vec<Participant>, AppError> {
        let sql = format!(
            "SELECT {} FROM live_participants WHERE session_id = $1 ORDER BY joined_at, participant_id",
            PARTICIPANT_COLUMNS
        );
        sqlx::query_as::<_, ParticipantRow>(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Participant::try_from)
            .collect()
    }

    async fn count_participants(
        &self,
        session_id: Uuid,
        role: Option<Role>,
    ) -> Result<u64, AppError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM live_participants
            WHERE session_id = $1 AND ($2::TEXT IS NULL OR role = $2)
            "#,
        )
        .bind(session_id)
        .bind(role.map(|r| r.as_str()))
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn touch_participant(
        &self,
        session_id: Uuid,
        participant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE live_participants SET last_seen_at = $3 WHERE session_id = $1 AND participant_id = $2",
        )
        .bind(session_id)
        .bind(participant_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_answer(
        &self,
        answer: &Answer,
        expected_index: i32,
    ) -> Result<AnswerWrite, AppError> {
        let mut tx = self.pool.begin().await?;

        // Holding the session row in share mode keeps an advance from
        // slipping in between the cursor check and the insert.
        let sql = format!(
            "SELECT {} FROM live_sessions WHERE id = $1 FOR SHARE",
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(answer.session_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(Session::try_from)
            .transpose()?;

        match &session {
            Some(s) if s.status == SessionStatus::Active && s.current_index == expected_index => {}
            _ => return Ok(AnswerWrite::CursorMoved(session)),
        }

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO live_answers (session_id, question_id, participant_id, value, is_correct, submitted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (session_id, question_id, participant_id) DO NOTHING
            RETURNING session_id
            "#,
        )
        .bind(answer.session_id)
        .bind(&answer.question_id)
        .bind(&answer.participant_id)
        .bind(Json(&answer.value))
        .bind(answer.is_correct)
        .bind(answer.submitted_at)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            return Ok(AnswerWrite::Duplicate);
        }

        sqlx::query(
            "UPDATE live_participants SET last_seen_at = $3 WHERE session_id = $1 AND participant_id = $2",
        )
        .bind(answer.session_id)
        .bind(&answer.participant_id)
        .bind(answer.submitted_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(AnswerWrite::Inserted(answer.clone()))
    }

    async fn answers_for_question(
        &self,
        session_id: Uuid,
        question_id: &str,
    ) -> Result<Vec<Answer>, AppError> {
        let sql = format!(
            "SELECT {} FROM live_answers WHERE session_id = $1 AND question_id = $2 ORDER BY submitted_at",
            ANSWER_COLUMNS
        );
        let rows = sqlx::query_as::<_, AnswerRow>(&sql)
            .bind(session_id)
            .bind(question_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Answer::from).collect())
    }

    async fn answers_for_session(&self, session_id: Uuid) -> Result<Vec<Answer>, AppError> {
        let sql = format!(
            "SELECT {} FROM live_answers WHERE session_id = $1 ORDER BY submitted_at",
            ANSWER_COLUMNS
        );
        let rows = sqlx::query_as::<_, AnswerRow>(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Answer::from).collect())
    }
}

/// Reads quiz content from the `quizzes` / `quiz_collaborators` /
/// `quiz_questions` tables.
#[derive(Clone)]
pub struct PgQuizCatalog {
    pool: PgPool,
}

impl PgQuizCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Replaces a quiz with `quiz` (owner, collaborators and questions).
    pub async fn save_quiz(&self, quiz: &Quiz) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO quizzes (quiz_ref, owner_id) VALUES ($1, $2)
            ON CONFLICT (quiz_ref) DO UPDATE SET owner_id = EXCLUDED.owner_id
            "#,
        )
        .bind(&quiz.quiz_ref)
        .bind(&quiz.owner_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM quiz_collaborators WHERE quiz_ref = $1")
            .bind(&quiz.quiz_ref)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM quiz_questions WHERE quiz_ref = $1")
            .bind(&quiz.quiz_ref)
            .execute(&mut *tx)
            .await?;

        for user_id in &quiz.collaborators {
            sqlx::query("INSERT INTO quiz_collaborators (quiz_ref, user_id) VALUES ($1, $2)")
                .bind(&quiz.quiz_ref)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }

        for (position, question) in quiz.questions.iter().enumerate() {
            sqlx::query("INSERT INTO quiz_questions (quiz_ref, position, body) VALUES ($1, $2, $3)")
                .bind(&quiz.quiz_ref)
                .bind(position as i32)
                .bind(Json(question))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl QuizCatalog for PgQuizCatalog {
    async fn load_quiz(&self, quiz_ref: &str) -> Result<Option<Quiz>, AppError> {
        let owner: Option<String> =
            sqlx::query_scalar("SELECT owner_id FROM quizzes WHERE quiz_ref = $1")
                .bind(quiz_ref)
                .fetch_optional(&self.pool)
                .await?;

        let Some(owner_id) = owner else {
            return Ok(None);
        };

        let collaborators: Vec<String> = sqlx::query_scalar(
            "SELECT user_id FROM quiz_collaborators WHERE quiz_ref = $1 ORDER BY user_id",
        )
        .bind(quiz_ref)
        .fetch_all(&self.pool)
        .await?;

        let questions: Vec<Json<Question>> = sqlx::query_scalar(
            "SELECT body FROM quiz_questions WHERE quiz_ref = $1 ORDER BY position",
        )
        .bind(quiz_ref)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to load questions for quiz {}: {:?}", quiz_ref, e);
            AppError::InternalServerError(e.to_string())
        })?;

        Ok(Some(Quiz {
            quiz_ref: quiz_ref.to_string(),
            owner_id,
            collaborators,
            questions: questions.into_iter().map(|q| q.0).collect(),
        }))
    }
}
