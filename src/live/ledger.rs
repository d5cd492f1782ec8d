// src/live/ledger.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    answer::{Answer, AnswerProgress, Tally},
    participant::Role,
    question::{AnswerValue, Question, Quiz},
    session::{Session, SessionStatus},
};
use crate::store::{AnswerWrite, SessionStore};

/// One answer per `(session, question, participant)`, graded on entry.
#[derive(Clone)]
pub struct AnswerLedger {
    store: Arc<dyn SessionStore>,
}

impl AnswerLedger {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Records a student's answer to the current question.
    ///
    /// Checks run against the row the caller read; the store repeats the
    /// status/cursor check and enforces the uniqueness triple in the same
    /// write, so a late or doubled submission can never slip through.
    pub async fn submit(
        &self,
        session: &Session,
        quiz: &Quiz,
        question_id: &str,
        participant_id: &str,
        value: AnswerValue,
        now: DateTime<Utc>,
    ) -> Result<Answer, AppError> {
        if session.status != SessionStatus::Active {
            return Err(AppError::SessionNotActive);
        }

        let position = quiz
            .position_of(question_id)
            .ok_or_else(|| AppError::NotFound("Question is not part of this quiz".to_string()))?;
        if position as i32 != session.current_index {
            return Err(AppError::StaleQuestion);
        }
        let question = &quiz.questions[position];

        let participant = self
            .store
            .get_participant(session.id, participant_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Participant has not joined this session".to_string()))?;
        if participant.role != Role::Student {
            return Err(AppError::InvalidRole);
        }

        let is_correct = question.evaluate(&value)?;
        let answer = Answer {
            session_id: session.id,
            question_id: question_id.to_string(),
            participant_id: participant_id.to_string(),
            value,
            is_correct,
            submitted_at: now,
        };

        match self.store.record_answer(&answer, session.current_index).await? {
            AnswerWrite::Inserted(answer) => {
                tracing::info!(
                    session_id = %session.id,
                    question_id = %answer.question_id,
                    participant_id = %answer.participant_id,
                    is_correct = answer.is_correct,
                    "Answer recorded"
                );
                Ok(answer)
            }
            AnswerWrite::Duplicate => {
                tracing::debug!(
                    session_id = %session.id,
                    question_id,
                    participant_id,
                    "Duplicate answer rejected"
                );
                Err(AppError::DuplicateAnswer)
            }
            AnswerWrite::CursorMoved(None) => {
                Err(AppError::NotFound("Session not found".to_string()))
            }
            AnswerWrite::CursorMoved(Some(current)) if current.status != SessionStatus::Active => {
                Err(AppError::SessionNotActive)
            }
            AnswerWrite::CursorMoved(Some(_)) => Err(AppError::StaleQuestion),
        }
    }

    /// Tally recomputed from the stored answers.
    pub async fn tally(
        &self,
        session_id: Uuid,
        question: &Question,
        reveal: bool,
    ) -> Result<Tally, AppError> {
        let answers = self
            .store
            .answers_for_question(session_id, question.id())
            .await?;
        Ok(compute_tally(question, &answers, reveal))
    }

    /// `(answered, students)` for a question, as broadcast after a submission.
    pub async fn progress(
        &self,
        session_id: Uuid,
        question_id: &str,
    ) -> Result<AnswerProgress, AppError> {
        let answered = self
            .store
            .answers_for_question(session_id, question_id)
            .await?
            .len();
        let students = self
            .store
            .count_participants(session_id, Some(Role::Student))
            .await?;

        Ok(AnswerProgress {
            answered_count: answered as u64,
            total_participants: students,
        })
    }

    pub async fn all_answers(&self, session_id: Uuid) -> Result<Vec<Answer>, AppError> {
        self.store.answers_for_session(session_id).await
    }
}

/// Aggregates `answers` for `question`. Answers for other questions are
/// ignored. Choice questions also get per-option counts, with every option
/// present even when nobody picked it.
pub fn compute_tally(question: &Question, answers: &[Answer], reveal: bool) -> Tally {
    let mut per_option: Option<BTreeMap<String, u64>> = question.is_choice().then(|| {
        question
            .option_ids()
            .into_iter()
            .map(|id| (id.to_string(), 0))
            .collect()
    });

    let mut total = 0;
    let mut correct = 0;
    for answer in answers.iter().filter(|a| a.question_id == question.id()) {
        total += 1;
        if answer.is_correct {
            correct += 1;
        }
        if let Some(counts) = per_option.as_mut() {
            for selected in answer.value.selections() {
                if let Some(count) = counts.get_mut(selected) {
                    *count += 1;
                }
            }
        }
    }

    Tally {
        question_id: question.id().to_string(),
        total_responses: total,
        correct_responses: correct,
        per_option_counts: per_option,
        correct_option_ids: if reveal { question.correct_option_ids() } else { None },
    }
}
