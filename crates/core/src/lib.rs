//! Relay Core
//!
//! Transport-agnostic pieces of the transcription relay: the recognition
//! configuration sent to a speech backend, the backend capability trait,
//! the per-connection session state machine and the relay actor that ties a
//! client connection to one outbound recognition stream.

pub mod backend;
pub mod error;
pub mod protocol;
pub mod recognition;
pub mod relay;
pub mod session;

pub use backend::{BackendEvent, RecognizeStream, TranscriptionBackend, TranscriptionEvent};
pub use error::RelayError;
pub use protocol::TranscriptionMessage;
pub use recognition::{AudioEncoding, RecognitionConfig};
pub use relay::{ClientConnection, ClientHandle, Relay, RelaySettings, SessionEnd, client_channel};
pub use session::{FrameDisposition, Session, SessionPhase};
