// src/live/pin.rs

use std::sync::{Arc, LazyLock};

use rand::Rng;
use regex::Regex;

use crate::config::{PIN_ALPHABET, PIN_LENGTH};
use crate::error::AppError;
use crate::models::session::Session;
use crate::store::SessionStore;

static PIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^[A-Z0-9]{{{}}}$", PIN_LENGTH)).expect("PIN pattern is valid")
});

/// Source of candidate PINs.
pub trait PinGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Uniform draw over the PIN alphabet using the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPins;

impl PinGenerator for RandomPins {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..PIN_LENGTH)
            .map(|_| PIN_ALPHABET[rng.gen_range(0..PIN_ALPHABET.len())] as char)
            .collect()
    }
}

/// Hands out join PINs that are unique among live sessions.
///
/// Uniqueness is decided by the store's conditional insert, not by a
/// separate lookup, so two creators drawing the same PIN at the same time
/// cannot both win.
#[derive(Clone)]
pub struct PinAllocator {
    generator: Arc<dyn PinGenerator>,
    max_attempts: u32,
}

impl PinAllocator {
    pub fn new(generator: Arc<dyn PinGenerator>, max_attempts: u32) -> Self {
        Self {
            generator,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn random(max_attempts: u32) -> Self {
        Self::new(Arc::new(RandomPins), max_attempts)
    }

    /// Draws one candidate PIN. Not checked for uniqueness.
    pub fn allocate(&self) -> String {
        self.generator.generate()
    }

    /// Inserts `session` under a freshly drawn PIN, redrawing on collision.
    /// Fails with `PinExhausted` once the attempt budget is spent.
    pub async fn insert_with_fresh_pin(
        &self,
        store: &dyn SessionStore,
        mut session: Session,
    ) -> Result<Session, AppError> {
        for attempt in 1..=self.max_attempts {
            session.pin = self.allocate();
            if store.insert_session(&session).await? {
                return Ok(session);
            }
            tracing::debug!(attempt, pin = %session.pin, "PIN collision, redrawing");
        }

        tracing::error!(
            attempts = self.max_attempts,
            session_id = %session.id,
            "Gave up allocating a session PIN"
        );
        Err(AppError::PinExhausted)
    }
}

/// Normalises a user-typed PIN: trims, drops spaces and dashes, uppercases.
pub fn normalize_pin(raw: &str) -> Result<String, AppError> {
    let pin: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_ascii_uppercase();

    if PIN_PATTERN.is_match(&pin) {
        Ok(pin)
    } else {
        Err(AppError::BadRequest(format!(
            "A PIN is {} letters or digits",
            PIN_LENGTH
        )))
    }
}
