// src/handlers/session.rs

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::Config,
    error::AppError,
    live::{JoinTarget, Orchestrator, orchestrator::JoinOutcome},
    models::{
        participant::Role,
        session::{CountParams, CreateSessionRequest, JoinSessionRequest, SubmitAnswerRequest},
    },
    utils::jwt::{Claims, anonymous_subject, bearer_claims, sign_jwt},
};

/// Join response. `token` is only present for anonymous joins.
#[derive(Serialize)]
pub struct JoinResponse {
    #[serde(flatten)]
    pub outcome: JoinOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Opens a new session in the lobby for a quiz the caller may host.
pub async fn create_session(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let session = orchestrator
        .create_session(&claims.sub, &payload.quiz_ref, payload.settings)
        .await?;

    Ok((StatusCode::CREATED, Json(session)))
}

/// Joins a session by PIN or id.
///
/// Works without a token: anonymous students always get a fresh
/// server-minted participant id and a student token bound to it. Rejoining
/// as the same participant means presenting that token.
pub async fn join_session(
    State(orchestrator): State<Arc<Orchestrator>>,
    State(config): State<Config>,
    headers: HeaderMap,
    Json(payload): Json<JoinSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let claims = bearer_claims(&headers, &config.jwt_secret)?;
    let role = payload.role.unwrap_or(Role::Student);
    if claims.is_none() && role == Role::Teacher {
        return Err(AppError::AuthError("Sign in to join as teacher".to_string()));
    }

    let target = match (payload.session_id, payload.pin) {
        (Some(id), _) => JoinTarget::Id(id),
        (None, Some(pin)) => JoinTarget::Pin(pin),
        (None, None) => {
            return Err(AppError::BadRequest("Provide a pin or a session_id".to_string()));
        }
    };

    let participant_id = match &claims {
        Some(claims) => claims.sub.clone(),
        None => anonymous_subject(),
    };

    let outcome = orchestrator
        .join_session(target, &participant_id, &payload.display_name, role)
        .await?;

    let token = match claims {
        Some(_) => None,
        None => Some(sign_jwt(
            &participant_id,
            Role::Student.as_str(),
            &config.jwt_secret,
            config.jwt_expiration,
        )?),
    };

    Ok(Json(JoinResponse { outcome, token }))
}

pub async fn get_session(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let session = orchestrator.get_session(id, &claims.sub).await?;
    Ok(Json(session))
}

pub async fn start_session(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let session = orchestrator.start_session(id, &claims.sub).await?;
    Ok(Json(session))
}

pub async fn advance_question(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = orchestrator.advance_question(id, &claims.sub).await?;
    Ok(Json(outcome))
}

pub async fn end_session(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let session = orchestrator.end_session(id, &claims.sub).await?;
    Ok(Json(session))
}

/// Submits the caller's answer; the token subject is the participant.
pub async fn submit_answer(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SubmitAnswerRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let outcome = orchestrator
        .submit_answer(id, &payload.question_id, &claims.sub, payload.value)
        .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn participant_count(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Query(params): Query<CountParams>,
) -> Result<impl IntoResponse, AppError> {
    let count = orchestrator
        .participant_count(id, &claims.sub, params.role)
        .await?;

    Ok(Json(json!({ "count": count, "role": params.role })))
}

pub async fn current_question(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let current = orchestrator.current_question(id, &claims.sub).await?;
    Ok(Json(current))
}

pub async fn question_tally(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(claims): Extension<Claims>,
    Path((id, question_id)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, AppError> {
    let tally = orchestrator
        .question_tally(id, &question_id, &claims.sub)
        .await?;
    Ok(Json(tally))
}

pub async fn get_summary(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let summary = orchestrator.get_summary(id, &claims.sub).await?;
    Ok(Json(summary))
}
