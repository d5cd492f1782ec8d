// src/routes.rs

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    handlers::{self, events, session},
    state::AppState,
    utils::jwt::auth_middleware,
};

/// Assembles the main application router.
///
/// * Session routes require a bearer token, except join and the event
///   stream which authenticate on their own.
/// * Applies global middleware (Trace, CORS).
pub fn create_router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let protected_routes = Router::new()
        .route("/", post(session::create_session))
        .route("/{id}", get(session::get_session))
        .route("/{id}/start", post(session::start_session))
        .route("/{id}/advance", post(session::advance_question))
        .route("/{id}/end", post(session::end_session))
        .route("/{id}/answers", post(session::submit_answer))
        .route("/{id}/participants/count", get(session::participant_count))
        .route("/{id}/questions/current", get(session::current_question))
        .route(
            "/{id}/questions/{question_id}/tally",
            get(session::question_tally),
        )
        .route("/{id}/summary", get(session::get_summary))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let open_routes = Router::new()
        .route("/join", post(session::join_session))
        .route("/{id}/events", get(events::subscribe));

    Router::new()
        .route("/api/health", get(handlers::health))
        .nest("/api/sessions", protected_routes.merge(open_routes))
        // Global Middleware (applied from outside in)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
