//! Shared coordination service integration tests.
//!
//! Tests the Service contract against every store implementation.
//! Each store's test binary builds a service and runs these.

pub mod service_tests;
