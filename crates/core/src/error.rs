use thiserror::Error;

/// Failures raised while handling a single relay session.
///
/// None of these outlive the session that produced them.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The backend refused or failed to open a recognition stream.
    #[error("failed to open recognition stream: {0}")]
    BackendOpen(String),
    /// The backend stopped accepting audio.
    #[error("recognition stream is closed")]
    StreamClosed,
    /// Audio was written to a session that never opened a stream.
    #[error("attempted to write audio before the recognition stream was opened")]
    UnopenedStreamWrite,
    /// A frame was written while an earlier one still waited for the backend.
    #[error("attempted to write audio while a frame is still waiting for the backend")]
    BacklogOverrun,
}
