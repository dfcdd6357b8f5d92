//! Cross-cutting infrastructure: event bus and per-device persistence.

pub mod database;
pub mod events;
