// src/handlers/events.rs

use std::sync::Arc;

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::{
    config::Config,
    error::AppError,
    live::{Envelope, Orchestrator},
    models::session::topic_for,
    utils::jwt::verify_jwt,
};

/// Browsers cannot set headers on a WebSocket handshake, so the token
/// travels in the query string.
#[derive(Debug, Deserialize)]
pub struct EventsParams {
    pub token: String,
}

/// Upgrades to a WebSocket streaming `session:{id}` events.
///
/// Authorization and the subscription happen before the upgrade, so a
/// refused caller gets a regular JSON error.
pub async fn subscribe(
    ws: WebSocketUpgrade,
    State(orchestrator): State<Arc<Orchestrator>>,
    State(config): State<Config>,
    Path(session_id): Path<Uuid>,
    Query(params): Query<EventsParams>,
) -> Result<impl IntoResponse, AppError> {
    let claims = verify_jwt(&params.token, &config.jwt_secret)?;
    let rx = orchestrator.subscribe(session_id, &claims.sub).await?;

    tracing::info!(session_id = %session_id, participant_id = %claims.sub, "Event subscriber connected");
    Ok(ws.on_upgrade(move |socket| forward_events(socket, session_id, claims.sub, rx)))
}

/// What a single receive from the topic turns into on the socket.
#[derive(Debug, PartialEq)]
enum Frame {
    Text(String),
    Skip,
    Close,
}

fn frame_for(session_id: Uuid, received: Result<Arc<Envelope>, RecvError>) -> Frame {
    match received {
        Ok(envelope) => match serde_json::to_string(envelope.as_ref()) {
            Ok(text) => Frame::Text(text),
            Err(e) => {
                tracing::error!(session_id = %session_id, "Failed to encode event: {:?}", e);
                Frame::Skip
            }
        },
        // Dropped events are not replayed; the client refetches state.
        Err(RecvError::Lagged(missed)) => Frame::Text(
            json!({
                "topic": topic_for(session_id),
                "event": "sync:required",
                "payload": { "missed": missed },
            })
            .to_string(),
        ),
        // Topic closed after session:end.
        Err(RecvError::Closed) => Frame::Close,
    }
}

async fn forward_events(
    socket: WebSocket,
    session_id: Uuid,
    subscriber: String,
    mut rx: broadcast::Receiver<Arc<Envelope>>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            received = rx.recv() => {
                if let Err(RecvError::Lagged(missed)) = &received {
                    tracing::debug!(session_id = %session_id, subscriber = %subscriber, missed, "Subscriber lagged");
                }
                match frame_for(session_id, received) {
                    Frame::Text(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Frame::Skip => {}
                    Frame::Close => break,
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered by axum; clients have nothing else to say.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    tracing::info!(session_id = %session_id, subscriber = %subscriber, "Event subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::live::SessionEvent;

    fn envelope(seq: u64) -> Arc<Envelope> {
        Arc::new(Envelope {
            topic: "session:x".into(),
            seq,
            sent_at: Utc::now(),
            event: SessionEvent::AnswerSubmitted {
                question_id: "q0".into(),
                answered_count: seq,
                total_participants: 3,
            },
        })
    }

    fn text(frame: Frame) -> serde_json::Value {
        match frame {
            Frame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn envelope_is_forwarded_as_json() {
        let json = text(frame_for(Uuid::new_v4(), Ok(envelope(7))));
        assert_eq!(json["seq"], 7);
        assert_eq!(json["event"], "answer:submitted");
    }

    #[tokio::test]
    async fn overflowed_subscriber_is_told_to_resync() {
        let session = Uuid::new_v4();
        let (tx, mut rx) = broadcast::channel(1);
        for seq in 1..=3 {
            tx.send(envelope(seq)).unwrap();
        }

        let json = text(frame_for(session, rx.recv().await));
        assert_eq!(json["event"], "sync:required");
        assert_eq!(json["payload"]["missed"], 2);
        assert_eq!(json["topic"], format!("session:{}", session));

        // The newest event is still delivered after the hint.
        assert_eq!(text(frame_for(session, rx.recv().await))["seq"], 3);
    }

    #[tokio::test]
    async fn closed_topic_closes_the_socket() {
        let (tx, mut rx) = broadcast::channel::<Arc<Envelope>>(1);
        drop(tx);
        assert_eq!(frame_for(Uuid::new_v4(), rx.recv().await), Frame::Close);
    }
}
