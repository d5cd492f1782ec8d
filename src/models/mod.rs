// src/models/mod.rs

pub mod answer;
pub mod participant;
pub mod question;
pub mod session;
