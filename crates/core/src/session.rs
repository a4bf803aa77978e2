//! Per-connection relay state.
//!
//! A `Session` bridges one client connection to at most one outbound
//! recognition stream. The stream handle only exists inside the `Streaming`
//! state, so writing before the stream is opened or after the session is
//! closed cannot reach the backend.
//!
//! Audio writes never block the session. When the backend's audio queue is
//! full the frame waits in a one-frame backlog, which
//! [`Session::next_backend_event`] delivers while it keeps receiving events.

use crate::{
    backend::{BackendEvent, RecognizeStream, TranscriptionBackend, TranscriptionEvent},
    error::RelayError,
    protocol::TranscriptionMessage,
    recognition::RecognitionConfig,
};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace};

/// How long a backend may take to open a stream unless configured otherwise.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Observable lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Streaming,
    Closed,
}

/// What happened to a frame handed to [`Session::on_client_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    Forwarded,
    /// The backend's audio queue is full; the frame is held in the backlog.
    Backlogged,
    /// The session is closed; the frame went nowhere.
    Discarded,
}

#[derive(Debug)]
enum SessionState {
    Idle,
    Streaming(RecognizeStream),
    Closed,
}

/// Counters reported when the session ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_forwarded: u64,
    pub bytes_forwarded: u64,
    pub events_relayed: u64,
}

impl SessionStats {
    fn record_frame(&mut self, len: usize) {
        self.frames_forwarded += 1;
        self.bytes_forwarded += len as u64;
    }
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    /// A frame accepted from the client that the backend has no room for yet.
    backlog: Option<Bytes>,
    open_timeout: Duration,
    stats: SessionStats,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Creates a session in the `Idle` phase. No backend resources are
    /// touched until the first frame arrives.
    pub fn new() -> Self {
        Self::with_open_timeout(DEFAULT_OPEN_TIMEOUT)
    }

    pub fn with_open_timeout(open_timeout: Duration) -> Self {
        Self {
            state: SessionState::Idle,
            backlog: None,
            open_timeout,
            stats: SessionStats::default(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match self.state {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Streaming(_) => SessionPhase::Streaming,
            SessionState::Closed => SessionPhase::Closed,
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Whether a frame is still waiting for room in the backend's audio queue.
    /// No further frame may be written until it has been delivered.
    pub fn is_backlogged(&self) -> bool {
        self.backlog.is_some()
    }

    /// Forwards one client frame, opening the recognition stream first if
    /// this is the first frame of the session.
    ///
    /// The frame is written unmodified. Frames arriving after the session is
    /// closed are discarded. Opening gives up after the session's open timeout.
    pub async fn on_client_frame(
        &mut self,
        backend: &dyn TranscriptionBackend,
        config: &RecognitionConfig,
        frame: Bytes,
    ) -> Result<FrameDisposition, RelayError> {
        match self.state {
            SessionState::Closed => {
                trace!(len = frame.len(), "Discarding frame for closed session.");
                return Ok(FrameDisposition::Discarded);
            }
            SessionState::Idle => {
                let stream = tokio::time::timeout(self.open_timeout, backend.open(config))
                    .await
                    .map_err(|_| {
                        RelayError::BackendOpen(format!("timed out after {:?}", self.open_timeout))
                    })?
                    .map_err(|e| RelayError::BackendOpen(format!("{e:#}")))?;
                info!(
                    encoding = %config.encoding,
                    sample_rate_hz = config.sample_rate_hz,
                    language = %config.language_code,
                    "Opened recognition stream."
                );
                self.state = SessionState::Streaming(stream);
            }
            SessionState::Streaming(_) => {}
        }

        self.write(frame)
    }

    fn write(&mut self, frame: Bytes) -> Result<FrameDisposition, RelayError> {
        let SessionState::Streaming(stream) = &self.state else {
            return Err(RelayError::UnopenedStreamWrite);
        };
        if self.backlog.is_some() {
            return Err(RelayError::BacklogOverrun);
        }
        let len = frame.len();
        match stream.audio.try_send(frame) {
            Ok(()) => {
                self.stats.record_frame(len);
                Ok(FrameDisposition::Forwarded)
            }
            Err(TrySendError::Full(frame)) => {
                trace!(len, "Backend audio queue full; holding frame.");
                self.backlog = Some(frame);
                Ok(FrameDisposition::Backlogged)
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::StreamClosed),
        }
    }

    /// Waits for the next event from the recognition stream.
    ///
    /// Never resolves unless the session is streaming. Returns `None` once
    /// the backend has ended the stream. A backlogged frame is handed to the
    /// backend as soon as it has room, without holding back events.
    pub async fn next_backend_event(&mut self) -> Option<BackendEvent> {
        let SessionState::Streaming(stream) = &mut self.state else {
            return std::future::pending().await;
        };
        while self.backlog.is_some() {
            tokio::select! {
                permit = stream.audio.reserve() => match permit {
                    Ok(permit) => {
                        if let Some(frame) = self.backlog.take() {
                            self.stats.record_frame(frame.len());
                            permit.send(frame);
                        }
                    }
                    // The backend stopped taking audio; its events tell why.
                    Err(_) => self.backlog = None,
                },
                event = stream.events.recv() => return event,
            }
        }
        stream.events.recv().await
    }

    /// Turns a backend result into the message for the client.
    pub fn on_backend_event(&mut self, event: TranscriptionEvent) -> TranscriptionMessage {
        self.stats.events_relayed += 1;
        debug!(is_final = event.is_final, len = event.text.len(), "Relaying transcription.");
        event.into()
    }

    /// Moves the session to `Closed`.
    ///
    /// If a recognition stream is open, its audio sender is dropped, which is
    /// the end-of-input signal, and the handle is released. Closing an already
    /// closed session does nothing. Returns whether this call closed it.
    pub fn close(&mut self) -> bool {
        if let Some(frame) = self.backlog.take() {
            debug!(len = frame.len(), "Dropping undelivered frame.");
        }
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Streaming(stream) => {
                drop(stream);
                debug!("Signalled end of input to recognition stream.");
                true
            }
            SessionState::Idle => true,
            SessionState::Closed => false,
        }
    }
}
