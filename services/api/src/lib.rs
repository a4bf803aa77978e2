//! Transcription Relay API Library Crate
//!
//! This library contains the web-facing half of the relay: configuration,
//! application state, HTTP handlers, the WebSocket endpoint, the speech
//! backends, and routing. The `api` binary is a thin wrapper around it.

pub mod audio_utils;
pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
