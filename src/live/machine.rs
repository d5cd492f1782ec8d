// src/live/machine.rs

//! Session lifecycle rules: `Lobby -> Active -> Ended`, never backwards,
//! never skipping. Each function inspects the row the caller just read and
//! returns the conditional write to attempt; the store decides whether it
//! still applies.

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::session::{Session, SessionStatus};
use crate::store::Transition;

/// Planned advance: the write, and whether it finishes the session.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvancePlan {
    pub transition: Transition,
    pub finished: bool,
}

pub fn plan_start(session: &Session, at: DateTime<Utc>) -> Result<Transition, AppError> {
    if session.status != SessionStatus::Lobby {
        return Err(AppError::InvalidTransition(format!(
            "Cannot start a session that is {}",
            session.status
        )));
    }
    Ok(Transition {
        from: SessionStatus::Lobby,
        from_index: None,
        to: SessionStatus::Active,
        to_index: 0,
        at,
    })
}

/// Moves the cursor forward, or ends the session when the last question
/// was current. Keyed on the cursor too, so two racing advances from the
/// same question cannot both land.
pub fn plan_advance(session: &Session, at: DateTime<Utc>) -> Result<AdvancePlan, AppError> {
    if session.status != SessionStatus::Active {
        return Err(AppError::InvalidTransition(format!(
            "Cannot advance a session that is {}",
            session.status
        )));
    }

    let next_index = session.current_index + 1;
    let finished = next_index >= session.question_count;
    let (to, to_index) = if finished {
        (SessionStatus::Ended, session.current_index)
    } else {
        (SessionStatus::Active, next_index)
    };

    Ok(AdvancePlan {
        transition: Transition {
            from: SessionStatus::Active,
            from_index: Some(session.current_index),
            to,
            to_index,
            at,
        },
        finished,
    })
}

/// Ends a live session. `None` when it already ended: ending is idempotent.
pub fn plan_end(session: &Session, at: DateTime<Utc>) -> Option<Transition> {
    if session.status == SessionStatus::Ended {
        return None;
    }
    Some(Transition {
        from: session.status,
        from_index: None,
        to: SessionStatus::Ended,
        to_index: session.current_index,
        at,
    })
}
