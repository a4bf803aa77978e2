//! The streaming speech-recognition capability the relay depends on.

use crate::recognition::RecognitionConfig;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// A recognition result produced by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionEvent {
    pub text: String,
    pub is_final: bool,
}

impl TranscriptionEvent {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_result(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Everything an open recognition stream can report back.
///
/// The end of the stream is not an event: the backend signals it by closing
/// the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Transcript(TranscriptionEvent),
    /// The backend failed. Terminal for the stream.
    Error(String),
}

/// One open outbound recognition session.
///
/// Dropping `audio` is the end-of-input signal; the backend is expected to
/// flush any pending final result and then close `events`.
#[derive(Debug)]
pub struct RecognizeStream {
    pub audio: mpsc::Sender<Bytes>,
    pub events: mpsc::Receiver<BackendEvent>,
}

impl RecognizeStream {
    pub fn new(audio: mpsc::Sender<Bytes>, events: mpsc::Receiver<BackendEvent>) -> Self {
        Self { audio, events }
    }
}

/// A speech-recognition service that accepts a continuous audio stream and
/// emits incremental transcriptions.
///
/// Implementations are built once at startup and shared read-only by every
/// session, so they must not hold per-session state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    /// Opens a new outbound recognition stream with the given settings.
    async fn open(&self, config: &RecognitionConfig) -> Result<RecognizeStream>;
}
