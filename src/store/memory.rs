// src/store/memory.rs

//! In-process implementations of the collaborators.
//!
//! All tables sit behind one mutex, which makes every trait method a single
//! atomic step exactly like a row-locking transaction would.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{AnswerWrite, JoinWrite, QuizCatalog, SessionStore, Transition};
use crate::error::AppError;
use crate::models::{
    answer::Answer,
    participant::{Participant, Role},
    question::Quiz,
    session::{Session, SessionStatus},
};

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, Session>,
    /// Keyed by `(session_id, participant_id)`; ordered so listings are stable.
    participants: BTreeMap<(Uuid, String), Participant>,
    /// Keyed by the answer identity triple.
    answers: BTreeMap<(Uuid, String, String), Answer>,
}

#[derive(Default)]
pub struct MemorySessionStore {
    tables: Mutex<Tables>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, AppError> {
        self.tables
            .lock()
            .map_err(|_| AppError::InternalServerError("session store lock poisoned".to_string()))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert_session(&self, session: &Session) -> Result<bool, AppError> {
        let mut tables = self.lock()?;
        let pin_taken = tables
            .sessions
            .values()
            .any(|s| s.status.is_live() && s.pin == session.pin);
        if pin_taken || tables.sessions.contains_key(&session.id) {
            return Ok(false);
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(true)
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, AppError> {
        Ok(self.lock()?.sessions.get(&id).cloned())
    }

    async fn find_live_by_pin(&self, pin: &str) -> Result<Option<Session>, AppError> {
        Ok(self
            .lock()?
            .sessions
            .values()
            .find(|s| s.status.is_live() && s.pin == pin)
            .cloned())
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        transition: &Transition,
    ) -> Result<Option<Session>, AppError> {
        let mut tables = self.lock()?;
        match tables.sessions.get_mut(&id) {
            Some(session) if transition.matches(session) => {
                transition.apply_to(session);
                Ok(Some(session.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn join_participant(&self, participant: &Participant) -> Result<JoinWrite, AppError> {
        let mut tables = self.lock()?;
        match tables.sessions.get(&participant.session_id) {
            None => return Ok(JoinWrite::SessionMissing),
            Some(s) if s.status == SessionStatus::Ended => return Ok(JoinWrite::SessionEnded),
            Some(_) => {}
        }

        let key = (participant.session_id, participant.participant_id.clone());
        if let Some(existing) = tables.participants.get_mut(&key) {
            if existing.role != participant.role {
                return Ok(JoinWrite::RoleConflict(existing.role));
            }
            existing.display_name = participant.display_name.clone();
            existing.last_seen_at = participant.last_seen_at;
            return Ok(JoinWrite::Joined(existing.clone()));
        }

        tables.participants.insert(key, participant.clone());
        Ok(JoinWrite::Joined(participant.clone()))
    }

    async fn get_participant(
        &self,
        session_id: Uuid,
        participant_id: &str,
    ) -> Result<Option<Participant>, AppError> {
        Ok(self
            .lock()?
            .participants
            .get(&(session_id, participant_id.to_string()))
            .cloned())
    }

    async fn list_participants(&self, session_id: Uuid) -> Result<Vec<Participant>, AppError> {
        Ok(self
            .lock()?
            .participants
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn count_participants(
        &self,
        session_id: Uuid,
        role: Option<Role>,
    ) -> Result<u64, AppError> {
        let count = self
            .lock()?
            .participants
            .values()
            .filter(|p| p.session_id == session_id && role.is_none_or(|r| p.role == r))
            .count();
        Ok(count as u64)
    }

    async fn touch_participant(
        &self,
        session_id: Uuid,
        participant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if let Some(p) = self
            .lock()?
            .participants
            .get_mut(&(session_id, participant_id.to_string()))
        {
            p.last_seen_at = at;
        }
        Ok(())
    }

    async fn record_answer(
        &self,
        answer: &Answer,
        expected_index: i32,
    ) -> Result<AnswerWrite, AppError> {
        let mut tables = self.lock()?;
        let session = tables.sessions.get(&answer.session_id).cloned();
        match &session {
            Some(s) if s.status == SessionStatus::Active && s.current_index == expected_index => {}
            _ => return Ok(AnswerWrite::CursorMoved(session)),
        }

        let key = (
            answer.session_id,
            answer.question_id.clone(),
            answer.participant_id.clone(),
        );
        if tables.answers.contains_key(&key) {
            return Ok(AnswerWrite::Duplicate);
        }
        tables.answers.insert(key, answer.clone());

        if let Some(p) = tables
            .participants
            .get_mut(&(answer.session_id, answer.participant_id.clone()))
        {
            p.last_seen_at = answer.submitted_at;
        }
        Ok(AnswerWrite::Inserted(answer.clone()))
    }

    async fn answers_for_question(
        &self,
        session_id: Uuid,
        question_id: &str,
    ) -> Result<Vec<Answer>, AppError> {
        Ok(self
            .lock()?
            .answers
            .values()
            .filter(|a| a.session_id == session_id && a.question_id == question_id)
            .cloned()
            .collect())
    }

    async fn answers_for_session(&self, session_id: Uuid) -> Result<Vec<Answer>, AppError> {
        Ok(self
            .lock()?
            .answers
            .values()
            .filter(|a| a.session_id == session_id)
            .cloned()
            .collect())
    }
}

/// Quiz catalog backed by a map, seeded up front.
#[derive(Default)]
pub struct MemoryQuizCatalog {
    quizzes: RwLock<HashMap<String, Quiz>>,
}

impl MemoryQuizCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quizzes(quizzes: impl IntoIterator<Item = Quiz>) -> Self {
        let catalog = Self::new();
        for quiz in quizzes {
            catalog.insert(quiz);
        }
        catalog
    }

    pub fn insert(&self, quiz: Quiz) {
        if let Ok(mut map) = self.quizzes.write() {
            map.insert(quiz.quiz_ref.clone(), quiz);
        }
    }
}

#[async_trait]
impl QuizCatalog for MemoryQuizCatalog {
    async fn load_quiz(&self, quiz_ref: &str) -> Result<Option<Quiz>, AppError> {
        let map = self
            .quizzes
            .read()
            .map_err(|_| AppError::InternalServerError("quiz catalog lock poisoned".to_string()))?;
        Ok(map.get(quiz_ref).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::question::AnswerValue;
    use crate::models::session::SessionSettings;

    fn lobby(pin: &str) -> Session {
        let mut s = Session::new_lobby("t1", "quiz", 3, SessionSettings::default(), Utc::now());
        s.pin = pin.to_string();
        s
    }

    fn student(session_id: Uuid, id: &str, name: &str) -> Participant {
        let now = Utc::now();
        Participant {
            session_id,
            participant_id: id.to_string(),
            display_name: name.to_string(),
            role: Role::Student,
            joined_at: now,
            last_seen_at: now,
        }
    }

    fn answer(session_id: Uuid, question_id: &str, participant_id: &str, v: &str) -> Answer {
        Answer {
            session_id,
            question_id: question_id.to_string(),
            participant_id: participant_id.to_string(),
            value: AnswerValue::Text(v.to_string()),
            is_correct: v == "A",
            submitted_at: Utc::now(),
        }
    }

    async fn activate(store: &MemorySessionStore, id: Uuid) {
        store
            .apply_transition(
                id,
                &Transition {
                    from: SessionStatus::Lobby,
                    from_index: None,
                    to: SessionStatus::Active,
                    to_index: 0,
                    at: Utc::now(),
                },
            )
            .await
            .unwrap()
            .expect("lobby session should start");
    }

    #[tokio::test]
    async fn live_pin_cannot_be_reused_until_ended() {
        let store = MemorySessionStore::new();
        let first = lobby("ABC123");
        assert!(store.insert_session(&first).await.unwrap());
        assert!(!store.insert_session(&lobby("ABC123")).await.unwrap());

        store
            .apply_transition(
                first.id,
                &Transition {
                    from: SessionStatus::Lobby,
                    from_index: None,
                    to: SessionStatus::Ended,
                    to_index: 0,
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();

        assert!(store.insert_session(&lobby("ABC123")).await.unwrap());
        assert_eq!(store.find_live_by_pin("ABC123").await.unwrap().unwrap().status, SessionStatus::Lobby);
    }

    #[tokio::test]
    async fn stale_transition_is_refused() {
        let store = MemorySessionStore::new();
        let s = lobby("PIN001");
        store.insert_session(&s).await.unwrap();
        activate(&store, s.id).await;

        let advance = Transition {
            from: SessionStatus::Active,
            from_index: Some(0),
            to: SessionStatus::Active,
            to_index: 1,
            at: Utc::now(),
        };
        assert!(store.apply_transition(s.id, &advance).await.unwrap().is_some());
        assert!(store.apply_transition(s.id, &advance).await.unwrap().is_none());
        assert_eq!(store.get_session(s.id).await.unwrap().unwrap().current_index, 1);
    }

    #[tokio::test]
    async fn rejoin_refreshes_instead_of_duplicating() {
        let store = MemorySessionStore::new();
        let s = lobby("PIN002");
        store.insert_session(&s).await.unwrap();

        store.join_participant(&student(s.id, "s1", "Ann")).await.unwrap();
        let again = store.join_participant(&student(s.id, "s1", "Annie")).await.unwrap();

        let JoinWrite::Joined(p) = again else { panic!("expected join") };
        assert_eq!(p.display_name, "Annie");
        assert_eq!(store.count_participants(s.id, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn join_refused_for_missing_or_ended_session() {
        let store = MemorySessionStore::new();
        assert_eq!(
            store.join_participant(&student(Uuid::new_v4(), "s1", "Ann")).await.unwrap(),
            JoinWrite::SessionMissing
        );

        let s = lobby("PIN003");
        store.insert_session(&s).await.unwrap();
        store
            .apply_transition(
                s.id,
                &Transition {
                    from: SessionStatus::Lobby,
                    from_index: None,
                    to: SessionStatus::Ended,
                    to_index: 0,
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            store.join_participant(&student(s.id, "s1", "Ann")).await.unwrap(),
            JoinWrite::SessionEnded
        );
    }

    #[tokio::test]
    async fn second_answer_is_a_duplicate_and_first_is_kept() {
        let store = MemorySessionStore::new();
        let s = lobby("PIN004");
        store.insert_session(&s).await.unwrap();
        activate(&store, s.id).await;

        let first = answer(s.id, "q0", "s1", "A");
        assert_eq!(
            store.record_answer(&first, 0).await.unwrap(),
            AnswerWrite::Inserted(first.clone())
        );
        assert_eq!(
            store.record_answer(&answer(s.id, "q0", "s1", "B"), 0).await.unwrap(),
            AnswerWrite::Duplicate
        );

        let stored = store.answers_for_question(s.id, "q0").await.unwrap();
        assert_eq!(stored, vec![first]);
    }

    #[tokio::test]
    async fn answer_refused_when_cursor_moved() {
        let store = MemorySessionStore::new();
        let s = lobby("PIN005");
        store.insert_session(&s).await.unwrap();
        activate(&store, s.id).await;

        let write = store.record_answer(&answer(s.id, "q1", "s1", "A"), 1).await.unwrap();
        assert!(matches!(write, AnswerWrite::CursorMoved(Some(_))));
        assert!(store.answers_for_session(s.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn count_filters_by_role() {
        let store = MemorySessionStore::new();
        let s = lobby("PIN006");
        store.insert_session(&s).await.unwrap();
        store.join_participant(&student(s.id, "s1", "Ann")).await.unwrap();
        store.join_participant(&student(s.id, "s2", "Bob")).await.unwrap();
        let mut teacher = student(s.id, "t1", "Ms T");
        teacher.role = Role::Teacher;
        store.join_participant(&teacher).await.unwrap();

        assert_eq!(store.count_participants(s.id, None).await.unwrap(), 3);
        assert_eq!(store.count_participants(s.id, Some(Role::Student)).await.unwrap(), 2);
        assert_eq!(store.count_participants(s.id, Some(Role::Teacher)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejoin_under_another_role_is_refused() {
        let store = MemorySessionStore::new();
        let s = lobby("PIN007");
        store.insert_session(&s).await.unwrap();
        store.join_participant(&student(s.id, "u1", "Ann")).await.unwrap();

        let mut as_teacher = student(s.id, "u1", "Ms Ann");
        as_teacher.role = Role::Teacher;
        assert_eq!(
            store.join_participant(&as_teacher).await.unwrap(),
            JoinWrite::RoleConflict(Role::Student)
        );

        let kept = store.get_participant(s.id, "u1").await.unwrap().unwrap();
        assert_eq!(kept.role, Role::Student);
        assert_eq!(kept.display_name, "Ann");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_advances_from_one_snapshot_land_once() {
        let store = std::sync::Arc::new(MemorySessionStore::new());
        let s = lobby("PIN008");
        store.insert_session(&s).await.unwrap();
        activate(&store, s.id).await;

        let snapshot = store.get_session(s.id).await.unwrap().unwrap();
        let plan = crate::live::machine::plan_advance(&snapshot, Utc::now()).unwrap();
        let id = s.id;

        let racers: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                let transition = plan.transition.clone();
                tokio::spawn(async move { store.apply_transition(id, &transition).await.unwrap() })
            })
            .collect();
        let mut outcomes = Vec::new();
        for racer in racers {
            outcomes.push(racer.await.unwrap());
        }

        assert_eq!(outcomes.iter().filter(|o| o.is_some()).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| o.is_none()).count(), 1);
        assert_eq!(store.get_session(id).await.unwrap().unwrap().current_index, 1);
    }
}
