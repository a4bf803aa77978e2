//! WebSocket Relay Endpoint
//!
//! This module bridges client WebSocket connections to relay sessions:
//!
//! - `session`: Manages the client connection lifecycle, from upgrade to close.
//! - `provider`: Outbound connections to streaming speech-recognition services.

pub mod provider;
pub mod session;

pub use session::ws_handler;
