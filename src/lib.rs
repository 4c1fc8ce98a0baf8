//! Rallypoint - coordination service for distributed test runs.
//!
//! Gives every instance of a run an ordered, replayable publish/subscribe
//! channel per topic and a counting barrier per named state, backed by an
//! append-only log store (Redis in production, memory for standalone use).

pub mod config;
pub mod protocol;
pub mod server;
pub mod store;
pub mod sync;
pub mod utils;
