//! Defines the message the relay sends to connected clients.
//!
//! Clients send raw binary audio frames with no application-level framing;
//! the only message flowing the other way is a recognition result.

use crate::backend::TranscriptionEvent;
use serde::{Deserialize, Serialize};

/// A recognition result as delivered to the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionMessage {
    pub transcription: String,
    pub is_final: bool,
}

impl From<TranscriptionEvent> for TranscriptionMessage {
    fn from(event: TranscriptionEvent) -> Self {
        Self {
            transcription: event.text,
            is_final: event.is_final,
        }
    }
}

impl TranscriptionMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
