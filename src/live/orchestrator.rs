// src/live/orchestrator.rs

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;
use validator::Validate;

use super::hub::{BroadcastHub, Envelope, QuestionShown, SessionEvent};
use super::ledger::{AnswerLedger, compute_tally};
use super::machine::{plan_advance, plan_end, plan_start};
use super::pin::{PinAllocator, normalize_pin};
use super::registry::ParticipantRegistry;
use crate::error::AppError;
use crate::models::{
    answer::{ParticipantScore, SessionSummary, SubmitOutcome, Tally},
    participant::{Participant, Role},
    question::{AnswerValue, PublicQuestion, Quiz},
    session::{PublicSession, Session, SessionSettings, SessionStatus},
};
use crate::store::{AccessPolicy, QuizCatalog, SessionStore, Transition};

/// How many times `end` re-reads after losing a race to start/advance.
const END_ATTEMPTS: usize = 3;

/// How a client names the session it wants to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    Pin(String),
    Id(Uuid),
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinOutcome {
    pub participant: Participant,
    pub session: PublicSession,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvanceOutcome {
    pub session: Session,
    pub finished: bool,
}

/// The current question as students see it.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentQuestion {
    pub session_id: Uuid,
    pub index: i32,
    pub total_questions: i32,
    pub question: PublicQuestion,
    pub time_limit_secs: u32,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub auto_advance: bool,
}

/// What a caller may see of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Manager,
    Participant,
}

/// Entry point for every live-session operation.
///
/// Each operation reads the authoritative rows, decides, performs one
/// conditional write and then enqueues at most one event. Nothing is cached
/// between calls and no lock is held across them, so any number of server
/// processes can serve the same session.
pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    catalog: Arc<dyn QuizCatalog>,
    access: Arc<dyn AccessPolicy>,
    pins: PinAllocator,
    registry: ParticipantRegistry,
    ledger: AnswerLedger,
    hub: BroadcastHub,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        catalog: Arc<dyn QuizCatalog>,
        access: Arc<dyn AccessPolicy>,
        pins: PinAllocator,
        hub: BroadcastHub,
    ) -> Self {
        Self {
            registry: ParticipantRegistry::new(Arc::clone(&store)),
            ledger: AnswerLedger::new(Arc::clone(&store)),
            store,
            catalog,
            access,
            pins,
            hub,
        }
    }

    /// CreateSession: a new session in the lobby under a fresh PIN.
    pub async fn create_session(
        &self,
        teacher_id: &str,
        quiz_ref: &str,
        settings: SessionSettings,
    ) -> Result<Session, AppError> {
        settings.validate()?;

        let quiz = self.load_quiz(quiz_ref).await?;
        if !self.access.can_host(teacher_id, &quiz).await? {
            tracing::warn!(teacher_id, quiz_ref, "Refused to host quiz");
            return Err(AppError::Unauthorized(
                "You cannot host sessions for this quiz".to_string(),
            ));
        }
        if quiz.questions.is_empty() {
            return Err(AppError::BadRequest("Quiz has no questions".to_string()));
        }

        let question_count = i32::try_from(quiz.question_count())
            .map_err(|_| AppError::BadRequest("Quiz has too many questions".to_string()))?;
        let draft = Session::new_lobby(teacher_id, quiz_ref, question_count, settings, Utc::now());
        let session = self
            .pins
            .insert_with_fresh_pin(self.store.as_ref(), draft)
            .await?;

        tracing::info!(
            session_id = %session.id,
            pin = %session.pin,
            quiz_ref,
            teacher_id,
            "Session created"
        );
        Ok(session)
    }

    /// JoinSession: registers (or refreshes) a participant.
    pub async fn join_session(
        &self,
        target: JoinTarget,
        participant_id: &str,
        display_name: &str,
        role: Role,
    ) -> Result<JoinOutcome, AppError> {
        let session = match target {
            JoinTarget::Id(id) => self.load_session(id).await?,
            JoinTarget::Pin(raw) => {
                let pin = normalize_pin(&raw)?;
                self.store
                    .find_live_by_pin(&pin)
                    .await?
                    .ok_or_else(|| AppError::NotFound("No running session with this PIN".to_string()))?
            }
        };
        if session.status == SessionStatus::Ended {
            return Err(AppError::SessionEnded);
        }

        if role == Role::Teacher {
            let quiz = self.load_quiz(&session.quiz_ref).await?;
            if !self.access.can_manage(participant_id, &session, &quiz).await? {
                return Err(AppError::Unauthorized(
                    "Only the session's owners can join as teacher".to_string(),
                ));
            }
        }

        let participant = self
            .registry
            .join(&session, participant_id, display_name, role, Utc::now())
            .await?;

        let participant_count = self.registry.count(session.id, None).await?;
        let student_count = self.registry.count(session.id, Some(Role::Student)).await?;
        self.hub.publish(
            session.id,
            SessionEvent::ParticipantJoined {
                participant_id: participant.participant_id.clone(),
                display_name: participant.display_name.clone(),
                role: participant.role,
                participant_count,
                student_count,
            },
        );

        Ok(JoinOutcome {
            participant,
            session: session.public_view(),
        })
    }

    /// StartSession: LOBBY -> ACTIVE with the cursor on the first question.
    pub async fn start_session(&self, session_id: Uuid, caller: &str) -> Result<Session, AppError> {
        let session = self.load_session(session_id).await?;
        let quiz = self.load_quiz(&session.quiz_ref).await?;
        self.ensure_manager(caller, &session, &quiz).await?;

        let transition = plan_start(&session, Utc::now())?;
        let started = self.swap(session_id, &transition, "start").await?;

        tracing::info!(session_id = %session_id, caller, "Session started");
        self.hub.publish(
            session_id,
            SessionEvent::SessionStarted {
                started_at: started.started_at,
                question: question_shown(&started, &quiz),
            },
        );
        Ok(started)
    }

    /// AdvanceQuestion: moves the cursor, or ends the session after the
    /// last question.
    pub async fn advance_question(
        &self,
        session_id: Uuid,
        caller: &str,
    ) -> Result<AdvanceOutcome, AppError> {
        let session = self.load_session(session_id).await?;
        let quiz = self.load_quiz(&session.quiz_ref).await?;
        self.ensure_manager(caller, &session, &quiz).await?;

        let plan = plan_advance(&session, Utc::now())?;
        let advanced = self.swap(session_id, &plan.transition, "advance").await?;

        let event = if plan.finished {
            tracing::info!(session_id = %session_id, "Last question closed, session finished");
            SessionEvent::SessionEnded {
                ended_at: advanced.ended_at,
                finished: true,
            }
        } else {
            tracing::info!(
                session_id = %session_id,
                index = advanced.current_index,
                "Advanced to next question"
            );
            SessionEvent::QuestionShown(question_shown(&advanced, &quiz))
        };
        self.hub.publish(session_id, event);

        Ok(AdvanceOutcome {
            session: advanced,
            finished: plan.finished,
        })
    }

    /// EndSession: valid from LOBBY or ACTIVE; ending an ended session
    /// returns it unchanged.
    pub async fn end_session(&self, session_id: Uuid, caller: &str) -> Result<Session, AppError> {
        let mut session = self.load_session(session_id).await?;
        let quiz = self.load_quiz(&session.quiz_ref).await?;
        self.ensure_manager(caller, &session, &quiz).await?;

        for _ in 0..END_ATTEMPTS {
            let Some(transition) = plan_end(&session, Utc::now()) else {
                tracing::debug!(session_id = %session_id, "End requested for ended session");
                return Ok(session);
            };

            if let Some(ended) = self.store.apply_transition(session_id, &transition).await? {
                tracing::info!(session_id = %session_id, caller, from = %transition.from, "Session ended");
                self.hub.publish(
                    session_id,
                    SessionEvent::SessionEnded {
                        ended_at: ended.ended_at,
                        finished: false,
                    },
                );
                return Ok(ended);
            }

            // Lost to a concurrent start/advance/end; look again.
            session = self.load_session(session_id).await?;
        }

        Err(AppError::InvalidTransition(
            "Session kept changing while ending it".to_string(),
        ))
    }

    /// SubmitAnswer: the participant's one answer to the current question.
    pub async fn submit_answer(
        &self,
        session_id: Uuid,
        question_id: &str,
        participant_id: &str,
        value: AnswerValue,
    ) -> Result<SubmitOutcome, AppError> {
        let session = self.load_session(session_id).await?;
        let quiz = self.load_quiz(&session.quiz_ref).await?;

        let answer = self
            .ledger
            .submit(&session, &quiz, question_id, participant_id, value, Utc::now())
            .await?;

        let progress = self.ledger.progress(session_id, question_id).await?;
        self.hub.publish(
            session_id,
            SessionEvent::AnswerSubmitted {
                question_id: question_id.to_string(),
                answered_count: progress.answered_count,
                total_participants: progress.total_participants,
            },
        );

        Ok(SubmitOutcome { answer, progress })
    }

    /// GetSummary: participants with scores, every question's tally and the
    /// overall correct rate. Managers only.
    pub async fn get_summary(
        &self,
        session_id: Uuid,
        caller: &str,
    ) -> Result<SessionSummary, AppError> {
        let session = self.load_session(session_id).await?;
        let quiz = self.load_quiz(&session.quiz_ref).await?;
        self.ensure_manager(caller, &session, &quiz).await?;

        let participants = self.registry.list(session_id).await?;
        let answers = self.ledger.all_answers(session_id).await?;

        let mut per_participant: HashMap<&str, (u64, u64)> = HashMap::new();
        for answer in &answers {
            let entry = per_participant.entry(answer.participant_id.as_str()).or_default();
            entry.0 += 1;
            if answer.is_correct {
                entry.1 += 1;
            }
        }

        let mut scores: Vec<ParticipantScore> = participants
            .into_iter()
            .map(|participant| {
                let (answered, correct) = per_participant
                    .get(participant.participant_id.as_str())
                    .copied()
                    .unwrap_or_default();
                ParticipantScore {
                    participant,
                    answered,
                    correct,
                }
            })
            .collect();
        scores.sort_by(|a, b| {
            (a.participant.role != Role::Student)
                .cmp(&(b.participant.role != Role::Student))
                .then_with(|| Reverse(a.correct).cmp(&Reverse(b.correct)))
                .then_with(|| a.participant.display_name.cmp(&b.participant.display_name))
        });

        let questions: Vec<Tally> = quiz
            .questions
            .iter()
            .map(|q| compute_tally(q, &answers, true))
            .collect();

        let total_answers = answers.len() as u64;
        let correct_answers = answers.iter().filter(|a| a.is_correct).count() as u64;
        let overall_correct_rate = if total_answers == 0 {
            0.0
        } else {
            correct_answers as f64 / total_answers as f64
        };

        Ok(SessionSummary {
            connected_clients: self.hub.subscriber_count(session_id),
            session,
            participants: scores,
            questions,
            total_answers,
            correct_answers,
            overall_correct_rate,
        })
    }

    /// Authoritative session state, for clients reconciling after missed events.
    pub async fn get_session(
        &self,
        session_id: Uuid,
        caller: &str,
    ) -> Result<PublicSession, AppError> {
        let session = self.load_session(session_id).await?;
        let quiz = self.load_quiz(&session.quiz_ref).await?;
        self.access_for(caller, &session, &quiz).await?;
        Ok(session.public_view())
    }

    pub async fn current_question(
        &self,
        session_id: Uuid,
        caller: &str,
    ) -> Result<CurrentQuestion, AppError> {
        let session = self.load_session(session_id).await?;
        let quiz = self.load_quiz(&session.quiz_ref).await?;
        self.access_for(caller, &session, &quiz).await?;

        if session.status != SessionStatus::Active {
            return Err(AppError::SessionNotActive);
        }
        let question = quiz
            .question_at(session.current_index)
            .ok_or_else(|| AppError::NotFound("Current question is missing from the quiz".to_string()))?;

        Ok(CurrentQuestion {
            session_id,
            index: session.current_index,
            total_questions: session.question_count,
            question: question.public_view(),
            time_limit_secs: session.settings.time_per_question,
            started_at: session.question_started_at,
            auto_advance: session.settings.auto_advance,
        })
    }

    /// Tally of one question. Managers always; students only for closed
    /// questions of sessions with reveal-after-each on.
    pub async fn question_tally(
        &self,
        session_id: Uuid,
        question_id: &str,
        caller: &str,
    ) -> Result<Tally, AppError> {
        let session = self.load_session(session_id).await?;
        let quiz = self.load_quiz(&session.quiz_ref).await?;
        let access = self.access_for(caller, &session, &quiz).await?;

        let position = quiz
            .position_of(question_id)
            .ok_or_else(|| AppError::NotFound("Question is not part of this quiz".to_string()))?;

        if access == Access::Participant {
            let closed = match session.status {
                SessionStatus::Ended => true,
                SessionStatus::Active => (position as i32) < session.current_index,
                SessionStatus::Lobby => false,
            };
            if !(session.settings.reveal_after_each && closed) {
                return Err(AppError::Unauthorized(
                    "Results for this question are not revealed".to_string(),
                ));
            }
        }

        self.ledger
            .tally(session_id, &quiz.questions[position], true)
            .await
    }

    /// Participant Registry count, optionally by role.
    pub async fn participant_count(
        &self,
        session_id: Uuid,
        caller: &str,
        role: Option<Role>,
    ) -> Result<u64, AppError> {
        let session = self.load_session(session_id).await?;
        let quiz = self.load_quiz(&session.quiz_ref).await?;
        self.access_for(caller, &session, &quiz).await?;
        self.registry.count(session_id, role).await
    }

    /// Opens an event subscription on the session topic and marks the
    /// caller as seen. Ended sessions have no topic left to follow.
    pub async fn subscribe(
        &self,
        session_id: Uuid,
        caller: &str,
    ) -> Result<broadcast::Receiver<Arc<Envelope>>, AppError> {
        let session = self.load_session(session_id).await?;
        let quiz = self.load_quiz(&session.quiz_ref).await?;
        self.access_for(caller, &session, &quiz).await?;
        if session.status == SessionStatus::Ended {
            return Err(AppError::SessionEnded);
        }

        self.registry.touch(session_id, caller).await?;
        let rx = self.hub.subscribe(session_id);

        // An end committed between the read above and the subscribe has
        // already been delivered; its topic must not be reopened.
        if self.load_session(session_id).await?.status == SessionStatus::Ended {
            drop(rx);
            self.hub.release_idle(session_id);
            return Err(AppError::SessionEnded);
        }
        Ok(rx)
    }

    async fn load_session(&self, session_id: Uuid) -> Result<Session, AppError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Session not found".to_string()))
    }

    async fn load_quiz(&self, quiz_ref: &str) -> Result<Quiz, AppError> {
        self.catalog
            .load_quiz(quiz_ref)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Quiz '{}' not found", quiz_ref)))
    }

    async fn ensure_manager(&self, caller: &str, session: &Session, quiz: &Quiz) -> Result<(), AppError> {
        if self.access.can_manage(caller, session, quiz).await? {
            Ok(())
        } else {
            tracing::warn!(session_id = %session.id, caller, "Caller may not manage session");
            Err(AppError::Unauthorized(
                "Only the session's owners can do this".to_string(),
            ))
        }
    }

    async fn access_for(&self, caller: &str, session: &Session, quiz: &Quiz) -> Result<Access, AppError> {
        if self.access.can_manage(caller, session, quiz).await? {
            return Ok(Access::Manager);
        }
        match self.registry.get(session.id, caller).await? {
            Some(_) => Ok(Access::Participant),
            None => Err(AppError::Unauthorized("Join the session first".to_string())),
        }
    }

    /// Compare-and-swap; a lost race reads as an invalid transition.
    async fn swap(
        &self,
        session_id: Uuid,
        transition: &Transition,
        action: &str,
    ) -> Result<Session, AppError> {
        self.store
            .apply_transition(session_id, transition)
            .await?
            .ok_or_else(|| {
                tracing::warn!(session_id = %session_id, action, "Session changed concurrently");
                AppError::InvalidTransition(format!(
                    "Session changed before it could {}",
                    action
                ))
            })
    }
}

fn question_shown(session: &Session, quiz: &Quiz) -> QuestionShown {
    QuestionShown {
        index: session.current_index,
        question_id: quiz
            .question_at(session.current_index)
            .map(|q| q.id().to_string())
            .unwrap_or_default(),
        time_limit_secs: session.settings.time_per_question,
        started_at: session.question_started_at,
        auto_advance: session.settings.auto_advance,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::models::question::{ChoiceOption, Question};
    use crate::store::{MemoryQuizCatalog, MemorySessionStore, QuizOwnership};

    const TEACHER: &str = "teacher-1";

    fn quiz() -> Quiz {
        let choice = |id: &str, correct: &str| Question::Choice {
            id: id.into(),
            prompt: format!("Question {}", id),
            options: ["A", "B", "C", "D"]
                .iter()
                .map(|o| ChoiceOption {
                    id: o.to_string(),
                    label: o.to_string(),
                    correct: *o == correct,
                })
                .collect(),
            multiple: false,
        };
        Quiz {
            quiz_ref: "algebra".into(),
            owner_id: TEACHER.into(),
            collaborators: vec!["co-teacher".into()],
            questions: vec![choice("q0", "A"), choice("q1", "B"), choice("q2", "C")],
        }
    }

    fn orchestrator() -> Arc<Orchestrator> {
        let empty = Quiz {
            quiz_ref: "empty".into(),
            owner_id: TEACHER.into(),
            collaborators: vec![],
            questions: vec![],
        };
        Arc::new(Orchestrator::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryQuizCatalog::with_quizzes([quiz(), empty])),
            Arc::new(QuizOwnership),
            PinAllocator::random(10),
            BroadcastHub::spawn(64),
        ))
    }

    async fn lobby_with_students(o: &Orchestrator, students: &[&str]) -> Session {
        let session = o
            .create_session(TEACHER, "algebra", SessionSettings::default())
            .await
            .unwrap();
        for id in students {
            o.join_session(JoinTarget::Pin(session.pin.clone()), id, id, Role::Student)
                .await
                .unwrap();
        }
        session
    }

    fn pick(id: &str) -> AnswerValue {
        AnswerValue::Text(id.into())
    }

    async fn next_event(rx: &mut broadcast::Receiver<Arc<Envelope>>) -> Arc<Envelope> {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within a second")
            .expect("topic open")
    }

    #[tokio::test]
    async fn full_session_walkthrough() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &["ann", "bob"]).await;
        assert_eq!(session.status, SessionStatus::Lobby);
        assert_eq!(session.pin.len(), 6);

        let started = o.start_session(session.id, TEACHER).await.unwrap();
        assert_eq!(started.status, SessionStatus::Active);
        assert_eq!(started.current_index, 0);
        assert!(started.started_at.is_some());

        o.submit_answer(session.id, "q0", "ann", pick("A")).await.unwrap();
        let outcome = o.submit_answer(session.id, "q0", "bob", pick("D")).await.unwrap();
        assert_eq!(outcome.progress.answered_count, 2);
        assert_eq!(outcome.progress.total_participants, 2);

        let step = o.advance_question(session.id, TEACHER).await.unwrap();
        assert!(!step.finished);
        assert_eq!(step.session.current_index, 1);

        o.submit_answer(session.id, "q1", "ann", pick("B")).await.unwrap();
        o.advance_question(session.id, TEACHER).await.unwrap();
        let last = o.advance_question(session.id, TEACHER).await.unwrap();
        assert!(last.finished);
        assert_eq!(last.session.status, SessionStatus::Ended);
        assert_eq!(last.session.current_index, 2);

        let summary = o.get_summary(session.id, TEACHER).await.unwrap();
        assert_eq!(summary.total_answers, 3);
        assert_eq!(summary.correct_answers, 2);
        assert!((summary.overall_correct_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.questions.len(), 3);
        assert_eq!(summary.participants[0].participant.participant_id, "ann");
        assert_eq!(summary.participants[0].correct, 2);
        assert_eq!(summary.participants[1].correct, 0);
    }

    #[tokio::test]
    async fn empty_or_foreign_quiz_cannot_be_hosted() {
        let o = orchestrator();
        let empty = o.create_session(TEACHER, "empty", SessionSettings::default()).await;
        assert_eq!(empty.unwrap_err().code(), "bad_request");

        let foreign = o.create_session("stranger", "algebra", SessionSettings::default()).await;
        assert_eq!(foreign.unwrap_err().code(), "unauthorized");

        let missing = o.create_session(TEACHER, "nope", SessionSettings::default()).await;
        assert_eq!(missing.unwrap_err().code(), "not_found");

        let bad = SessionSettings {
            time_per_question: 1,
            ..SessionSettings::default()
        };
        let invalid = o.create_session(TEACHER, "algebra", bad).await;
        assert_eq!(invalid.unwrap_err().code(), "bad_request");
    }

    #[tokio::test]
    async fn only_managers_drive_the_session() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &["ann"]).await;

        let err = o.start_session(session.id, "ann").await.unwrap_err();
        assert_eq!(err.code(), "unauthorized");

        // Collaborators of the quiz may drive it too.
        o.start_session(session.id, "co-teacher").await.unwrap();
        let again = o.start_session(session.id, TEACHER).await.unwrap_err();
        assert_eq!(again.code(), "invalid_transition");
    }

    #[tokio::test]
    async fn advance_in_lobby_is_rejected() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &[]).await;
        let err = o.advance_question(session.id, TEACHER).await.unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_advances_move_the_cursor_once() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &[]).await;
        o.start_session(session.id, TEACHER).await.unwrap();
        let id = session.id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let o = Arc::clone(&o);
                tokio::spawn(async move { o.advance_question(id, TEACHER).await })
            })
            .collect();

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        // Each landed advance moves the cursor exactly one step.
        assert!(wins >= 1);
        let current = o.get_session(session.id, TEACHER).await.unwrap();
        assert_eq!(current.current_index as usize + usize::from(current.status == SessionStatus::Ended), wins);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_duplicate_answers_keep_one() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &["ann"]).await;
        o.start_session(session.id, TEACHER).await.unwrap();
        let id = session.id;

        let handles: Vec<_> = ["A", "B", "C", "D"]
            .into_iter()
            .map(|choice| {
                let o = Arc::clone(&o);
                tokio::spawn(async move { o.submit_answer(id, "q0", "ann", pick(choice)).await })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(err) => assert_eq!(err, AppError::DuplicateAnswer),
            }
        }
        assert_eq!(accepted, 1);

        let tally = o.question_tally(session.id, "q0", TEACHER).await.unwrap();
        assert_eq!(tally.total_responses, 1);
    }

    #[tokio::test]
    async fn answers_after_advance_or_end_are_refused() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &["ann"]).await;
        o.start_session(session.id, TEACHER).await.unwrap();
        o.advance_question(session.id, TEACHER).await.unwrap();

        let stale = o.submit_answer(session.id, "q0", "ann", pick("A")).await;
        assert_eq!(stale.unwrap_err(), AppError::StaleQuestion);

        o.end_session(session.id, TEACHER).await.unwrap();
        let ended = o.submit_answer(session.id, "q1", "ann", pick("B")).await;
        assert_eq!(ended.unwrap_err(), AppError::SessionNotActive);
    }

    #[tokio::test]
    async fn end_is_idempotent_and_blocks_joins() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &["ann"]).await;

        let mut rx = o.subscribe(session.id, TEACHER).await.unwrap();
        let first = o.end_session(session.id, TEACHER).await.unwrap();
        let second = o.end_session(session.id, TEACHER).await.unwrap();
        assert_eq!(first.status, SessionStatus::Ended);
        assert_eq!(first.ended_at, second.ended_at);

        let mut env = next_event(&mut rx).await;
        while env.event.name() != "session:end" {
            env = next_event(&mut rx).await;
        }
        assert_eq!(
            env.event,
            SessionEvent::SessionEnded {
                ended_at: first.ended_at,
                finished: false
            }
        );

        // The PIN is released with the session.
        let by_pin = o
            .join_session(JoinTarget::Pin(session.pin.clone()), "late", "Late", Role::Student)
            .await;
        assert_eq!(by_pin.unwrap_err().code(), "not_found");

        let by_id = o
            .join_session(JoinTarget::Id(session.id), "late", "Late", Role::Student)
            .await;
        assert_eq!(by_id.unwrap_err(), AppError::SessionEnded);
    }

    #[tokio::test]
    async fn events_follow_the_lifecycle() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &[]).await;
        let mut rx = o.subscribe(session.id, TEACHER).await.unwrap();

        o.join_session(JoinTarget::Id(session.id), "ann", "Ann", Role::Student)
            .await
            .unwrap();
        o.start_session(session.id, TEACHER).await.unwrap();
        o.submit_answer(session.id, "q0", "ann", pick("A")).await.unwrap();
        o.advance_question(session.id, TEACHER).await.unwrap();

        let names: Vec<&str> = [
            next_event(&mut rx).await,
            next_event(&mut rx).await,
            next_event(&mut rx).await,
            next_event(&mut rx).await,
        ]
        .iter()
        .map(|env| env.event.name())
        .collect();
        assert_eq!(
            names,
            ["participant_joined", "session:start", "answer:submitted", "question:show"]
        );
    }

    #[tokio::test]
    async fn teacher_join_requires_ownership() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &[]).await;

        let err = o
            .join_session(JoinTarget::Id(session.id), "ann", "Ann", Role::Teacher)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unauthorized");

        let joined = o
            .join_session(JoinTarget::Id(session.id), TEACHER, "Ms T", Role::Teacher)
            .await
            .unwrap();
        assert_eq!(joined.participant.role, Role::Teacher);
        assert_eq!(o.participant_count(session.id, TEACHER, Some(Role::Student)).await.unwrap(), 0);
        assert_eq!(o.participant_count(session.id, TEACHER, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn students_see_closed_tallies_only() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &["ann"]).await;
        o.start_session(session.id, TEACHER).await.unwrap();
        o.submit_answer(session.id, "q0", "ann", pick("A")).await.unwrap();

        let open = o.question_tally(session.id, "q0", "ann").await;
        assert_eq!(open.unwrap_err().code(), "unauthorized");
        assert!(o.question_tally(session.id, "q0", TEACHER).await.is_ok());

        o.advance_question(session.id, TEACHER).await.unwrap();
        let closed = o.question_tally(session.id, "q0", "ann").await.unwrap();
        assert_eq!(closed.correct_responses, 1);
        assert_eq!(closed.correct_option_ids, Some(vec!["A".to_string()]));

        let summary = o.get_summary(session.id, "ann").await;
        assert_eq!(summary.unwrap_err().code(), "unauthorized");
    }

    #[tokio::test]
    async fn current_question_hides_answers() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &["ann"]).await;

        let lobby = o.current_question(session.id, "ann").await;
        assert_eq!(lobby.unwrap_err(), AppError::SessionNotActive);

        o.start_session(session.id, TEACHER).await.unwrap();
        let current = o.current_question(session.id, "ann").await.unwrap();
        assert_eq!(current.index, 0);
        assert_eq!(current.total_questions, 3);
        assert_eq!(current.question.id, "q0");
        let json = serde_json::to_value(&current).unwrap();
        assert!(!json.to_string().contains("correct"));

        let outsider = o.current_question(session.id, "mallory").await;
        assert_eq!(outsider.unwrap_err().code(), "unauthorized");
    }

    #[tokio::test]
    async fn ended_session_cannot_be_subscribed() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &["ann"]).await;
        o.end_session(session.id, TEACHER).await.unwrap();

        let err = o.subscribe(session.id, "ann").await.unwrap_err();
        assert_eq!(err, AppError::SessionEnded);
        let err = o.subscribe(session.id, TEACHER).await.unwrap_err();
        assert_eq!(err, AppError::SessionEnded);

        let summary = o.get_summary(session.id, TEACHER).await.unwrap();
        assert_eq!(summary.connected_clients, 0);
    }

    #[tokio::test]
    async fn join_response_hides_session_owner() {
        let o = orchestrator();
        let session = lobby_with_students(&o, &[]).await;
        let joined = o
            .join_session(JoinTarget::Id(session.id), "ann", "Ann", Role::Student)
            .await
            .unwrap();

        let json = serde_json::to_value(&joined).unwrap();
        assert!(json["session"].get("created_by").is_none());
        assert_eq!(json["session"]["pin"], session.pin.as_str());
    }
}
