//! Shared helpers for the library and the daemon binary.

pub mod bootstrap;
pub mod retry;
