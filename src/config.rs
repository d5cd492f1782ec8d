// src/config.rs

use std::env;
use std::str::FromStr;

use dotenvy::dotenv;

/// Length of a join PIN.
pub const PIN_LENGTH: usize = 6;

/// Characters a PIN is drawn from. Uppercase only so students can type it.
pub const PIN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Maximum length of a participant display name (after sanitising).
pub const MAX_DISPLAY_NAME_LEN: usize = 40;

/// Bounds for the advisory time-per-question setting, in seconds.
pub const MIN_TIME_PER_QUESTION: u32 = 5;
pub const MAX_TIME_PER_QUESTION: u32 = 600;
pub const DEFAULT_TIME_PER_QUESTION: u32 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    /// Lifetime (seconds) of tokens issued to anonymous students on join.
    pub jwt_expiration: u64,
    pub rust_log: String,
    pub bind_address: String,
    /// How many PIN draws a session creation may burn before giving up.
    pub pin_max_attempts: u32,
    /// Per-topic broadcast buffer; slower subscribers are told to resync.
    pub broadcast_capacity: usize,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

        let jwt_secret = env::var("JWT_SECRET").expect("JWT_SECRET must be set");

        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let bind_address =
            env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        Self {
            database_url,
            jwt_secret,
            jwt_expiration: parse_or("JWT_EXPIRATION", 4 * 60 * 60),
            rust_log,
            bind_address,
            pin_max_attempts: parse_or("PIN_MAX_ATTEMPTS", 10),
            broadcast_capacity: parse_or("BROADCAST_CAPACITY", 64),
            allowed_origins,
        }
    }
}

/// Reads a numeric variable, falling back to `default` when unset or malformed.
fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring malformed {}={:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
