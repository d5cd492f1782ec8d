// src/live/hub.rs

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::models::participant::Role;
use crate::models::session::topic_for;

/// What every client sees when a question becomes current.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionShown {
    pub index: i32,
    pub question_id: String,
    pub time_limit_secs: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub auto_advance: bool,
}

/// Events published on a session topic. They are hints to refetch
/// authoritative state, never the only copy of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum SessionEvent {
    #[serde(rename = "session:start")]
    SessionStarted {
        started_at: Option<DateTime<Utc>>,
        question: QuestionShown,
    },
    #[serde(rename = "question:show")]
    QuestionShown(QuestionShown),
    #[serde(rename = "answer:submitted")]
    AnswerSubmitted {
        question_id: String,
        answered_count: u64,
        total_participants: u64,
    },
    #[serde(rename = "participant_joined")]
    ParticipantJoined {
        participant_id: String,
        display_name: String,
        role: Role,
        participant_count: u64,
        student_count: u64,
    },
    #[serde(rename = "session:end")]
    SessionEnded {
        ended_at: Option<DateTime<Utc>>,
        /// True when the end came from advancing past the last question.
        finished: bool,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::SessionStarted { .. } => "session:start",
            SessionEvent::QuestionShown(_) => "question:show",
            SessionEvent::AnswerSubmitted { .. } => "answer:submitted",
            SessionEvent::ParticipantJoined { .. } => "participant_joined",
            SessionEvent::SessionEnded { .. } => "session:end",
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub topic: String,
    /// Per-topic sequence number, starting at 1. Gaps mean missed events.
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SessionEvent,
}

struct Outgoing {
    session_id: Uuid,
    event: SessionEvent,
}

struct Topics {
    capacity: usize,
    channels: RwLock<HashMap<Uuid, broadcast::Sender<Arc<Envelope>>>>,
}

impl Topics {
    fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<Arc<Envelope>> {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn remove_if_idle(&self, session_id: Uuid) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        if channels
            .get(&session_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(&session_id);
        }
    }

    fn receiver_count(&self, session_id: Uuid) -> usize {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.get(&session_id).map_or(0, |tx| tx.receiver_count())
    }

    fn deliver(&self, session_id: Uuid, envelope: Arc<Envelope>, closing: bool) {
        let delivered = {
            let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
            match channels.get(&session_id) {
                Some(tx) => tx.send(envelope).ok(),
                None => None,
            }
        };

        match delivered {
            Some(receivers) => {
                tracing::trace!(session_id = %session_id, receivers, "Event delivered");
            }
            None => tracing::trace!(session_id = %session_id, "No subscribers for event"),
        }

        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        let idle = channels
            .get(&session_id)
            .is_some_and(|tx| tx.receiver_count() == 0);
        if closing || idle {
            // Dropping the sender closes the topic once receivers drain it.
            channels.remove(&session_id);
        }
    }
}

/// Per-session fan-out of lifecycle and progress events.
///
/// `publish` only enqueues. A single delivery task drains the queue, so
/// events reach each subscriber of a topic in publish order, and a slow or
/// vanished subscriber never blocks or fails the publishing request.
#[derive(Clone)]
pub struct BroadcastHub {
    queue: mpsc::UnboundedSender<Outgoing>,
    topics: Arc<Topics>,
}

impl BroadcastHub {
    /// Creates the hub and spawns its delivery task on the current runtime.
    pub fn spawn(capacity: usize) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let topics = Arc::new(Topics {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        });
        tokio::spawn(run_delivery(rx, Arc::clone(&topics)));
        Self { queue, topics }
    }

    /// Fire-and-forget publish to `session:{session_id}`.
    pub fn publish(&self, session_id: Uuid, event: SessionEvent) {
        let name = event.name();
        if self.queue.send(Outgoing { session_id, event }).is_err() {
            tracing::warn!(session_id = %session_id, event = name, "Broadcast hub is gone, event dropped");
        }
    }

    pub fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<Arc<Envelope>> {
        self.topics.subscribe(session_id)
    }

    pub fn subscriber_count(&self, session_id: Uuid) -> usize {
        self.topics.receiver_count(session_id)
    }

    /// Drops the topic if nobody listens to it any more.
    pub fn release_idle(&self, session_id: Uuid) {
        self.topics.remove_if_idle(session_id);
    }

    #[cfg(test)]
    fn has_topic(&self, session_id: Uuid) -> bool {
        let channels = self.topics.channels.read().unwrap_or_else(|e| e.into_inner());
        channels.contains_key(&session_id)
    }
}

async fn run_delivery(mut rx: mpsc::UnboundedReceiver<Outgoing>, topics: Arc<Topics>) {
    let mut sequences: HashMap<Uuid, u64> = HashMap::new();

    while let Some(Outgoing { session_id, event }) = rx.recv().await {
        let closing = matches!(event, SessionEvent::SessionEnded { .. });
        let seq = {
            let counter = sequences.entry(session_id).or_insert(0);
            *counter += 1;
            *counter
        };

        let envelope = Arc::new(Envelope {
            topic: topic_for(session_id),
            seq,
            sent_at: Utc::now(),
            event,
        });
        topics.deliver(session_id, envelope, closing);

        if closing {
            sequences.remove(&session_id);
        }
    }

    tracing::debug!("Broadcast hub queue closed");
}
