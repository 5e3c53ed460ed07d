//! # signalint-server
//!
//! HTTP server library for the signalint telemetry engine.
//!
//! This library provides the API handlers and state management wrapping the
//! radios and the session of `signalint-core`.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod state;

pub use api::create_router;
pub use state::AppState;
