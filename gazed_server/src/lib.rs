#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! HTTP/SSE/WebSocket edge for the gaze telemetry backend.
//!
//! The engine lives in `gazed_core`; this crate adds the axum router, the
//! tokio-side sink adapters, CLI parsing and tracing setup. Split out as a
//! library so the API surface is testable in-process.

pub mod cli;
pub mod error_fmt;
pub mod routes;
pub mod state;
pub mod tracing_setup;
pub mod ws;
