// src/models/answer.rs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::participant::Participant;
use crate::models::question::AnswerValue;
use crate::models::session::Session;

/// Represents the 'live_answers' table.
/// Immutable once written; `(session_id, question_id, participant_id)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub session_id: Uuid,
    pub question_id: String,
    pub participant_id: String,
    pub value: AnswerValue,
    /// Graded once at insertion against the quiz content of that moment.
    pub is_correct: bool,
    pub submitted_at: DateTime<Utc>,
}

/// Live aggregate for one question, always recomputed from the answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub question_id: String,
    pub total_responses: u64,
    pub correct_responses: u64,
    /// Selections per option id, for choice questions only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_option_counts: Option<BTreeMap<String, u64>>,
    /// Answer key, included only when the tally is revealed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct_option_ids: Option<Vec<String>>,
}

/// Progress of the current question, as broadcast after each submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnswerProgress {
    pub answered_count: u64,
    pub total_participants: u64,
}

/// Result of a successful submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub answer: Answer,
    pub progress: AnswerProgress,
}

/// Per-participant line of a session summary.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantScore {
    #[serde(flatten)]
    pub participant: Participant,
    pub answered: u64,
    pub correct: u64,
}

/// End-of-session (or in-flight) report for managers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: Session,
    /// Students ordered by correct answers, best first.
    pub participants: Vec<ParticipantScore>,
    /// One tally per quiz question, in quiz order.
    pub questions: Vec<Tally>,
    pub total_answers: u64,
    pub correct_answers: u64,
    /// `correct_answers / total_answers`, 0.0 when nobody answered.
    pub overall_correct_rate: f64,
    pub connected_clients: usize,
}
