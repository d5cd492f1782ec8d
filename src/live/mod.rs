// src/live/mod.rs

//! Live session core: lifecycle, participants, answers and event fan-out.

pub mod hub;
pub mod ledger;
pub mod machine;
pub mod orchestrator;
pub mod pin;
pub mod registry;

pub use hub::{BroadcastHub, Envelope, SessionEvent};
pub use orchestrator::{JoinTarget, Orchestrator};
pub use pin::PinAllocator;
