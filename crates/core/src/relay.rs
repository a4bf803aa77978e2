//! The per-connection relay actor.
//!
//! `Relay::run` owns one [`Session`] and processes its two event sources, client
//! frames and backend events, one at a time until either side goes away.
//! Transports talk to it through a [`ClientHandle`], so the relay never
//! touches a socket directly.

use crate::{
    backend::{BackendEvent, TranscriptionBackend},
    error::RelayError,
    protocol::TranscriptionMessage,
    recognition::RecognitionConfig,
    session::{DEFAULT_OPEN_TIMEOUT, Session, SessionPhase},
};
use bytes::Bytes;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::Instant,
};
use tracing::{error, info, warn};

/// Capacity of the inbound frame channel between a transport and the relay.
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Process-wide settings applied to every session.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub recognition: RecognitionConfig,
    /// Closes sessions that connect but never send audio. `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// Messages buffered for a client before it is considered too slow.
    pub client_buffer: usize,
    /// Upper bound on opening the recognition stream.
    pub open_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            recognition: RecognitionConfig::default(),
            idle_timeout: None,
            client_buffer: 256,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

/// Relay side of a client connection.
#[derive(Debug)]
pub struct ClientConnection {
    frames: mpsc::Receiver<Bytes>,
    outgoing: mpsc::Sender<TranscriptionMessage>,
}

/// Transport side of a client connection.
///
/// Dropping `frames` is how the transport reports a client disconnect. When
/// `outgoing` yields `None` the relay is done and the transport should close
/// the connection.
#[derive(Debug)]
pub struct ClientHandle {
    pub frames: mpsc::Sender<Bytes>,
    pub outgoing: mpsc::Receiver<TranscriptionMessage>,
}

/// Creates the channel pair linking a transport to a relay session.
pub fn client_channel(outgoing_capacity: usize) -> (ClientConnection, ClientHandle) {
    let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let (outgoing_tx, outgoing_rx) = mpsc::channel(outgoing_capacity.max(1));
    (
        ClientConnection {
            frames: frames_rx,
            outgoing: outgoing_tx,
        },
        ClientHandle {
            frames: frames_tx,
            outgoing: outgoing_rx,
        },
    )
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    ClientDisconnected,
    BackendEnded,
    BackendFailed(String),
    /// The client stopped draining its messages and its buffer filled up.
    ClientTooSlow,
    IdleTimeout,
    /// An internal invariant was violated.
    Fault(String),
}

impl SessionEnd {
    pub fn is_error(&self) -> bool {
        matches!(self, SessionEnd::BackendFailed(_) | SessionEnd::Fault(_))
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::ClientDisconnected => write!(f, "client disconnected"),
            SessionEnd::BackendEnded => write!(f, "recognition stream ended"),
            SessionEnd::BackendFailed(e) => write!(f, "recognition stream failed: {}", e),
            SessionEnd::ClientTooSlow => write!(f, "client could not keep up"),
            SessionEnd::IdleTimeout => write!(f, "no audio received before idle timeout"),
            SessionEnd::Fault(e) => write!(f, "relay fault: {}", e),
        }
    }
}

impl From<RelayError> for SessionEnd {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::BackendOpen(_) => SessionEnd::BackendFailed(err.to_string()),
            RelayError::StreamClosed => SessionEnd::BackendEnded,
            RelayError::UnopenedStreamWrite | RelayError::BacklogOverrun => {
                SessionEnd::Fault(err.to_string())
            }
        }
    }
}

/// Bridges client connections to the shared transcription backend.
///
/// Cloning is cheap; every clone shares the same backend and settings.
#[derive(Clone)]
pub struct Relay {
    backend: Arc<dyn TranscriptionBackend>,
    settings: Arc<RelaySettings>,
}

impl Relay {
    pub fn new(backend: Arc<dyn TranscriptionBackend>, settings: RelaySettings) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
        }
    }

    /// Opens the channel pair for a new connection, sized by the settings.
    pub fn connect(&self) -> (ClientConnection, ClientHandle) {
        client_channel(self.settings.client_buffer)
    }

    /// Runs one session to completion.
    ///
    /// Returns once the client disconnects, the backend ends or fails, the
    /// client falls behind, or the idle timeout fires. The session is always
    /// closed before returning, and dropping the connection closes the client
    /// side.
    pub async fn run(&self, client: ClientConnection) -> SessionEnd {
        let ClientConnection {
            mut frames,
            outgoing,
        } = client;
        let mut session = Session::with_open_timeout(self.settings.open_timeout);
        let idle_deadline = self.settings.idle_timeout.map(|t| Instant::now() + t);

        let end = loop {
            tokio::select! {
                // A backlogged frame must reach the backend before the next one is read.
                frame = frames.recv(), if !session.is_backlogged() => match frame {
                    Some(frame) => {
                        if let Err(e) = session
                            .on_client_frame(self.backend.as_ref(), &self.settings.recognition, frame)
                            .await
                        {
                            break SessionEnd::from(e);
                        }
                    }
                    None => break SessionEnd::ClientDisconnected,
                },
                event = session.next_backend_event() => match event {
                    Some(BackendEvent::Transcript(event)) => {
                        let msg = session.on_backend_event(event);
                        match outgoing.try_send(msg) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => break SessionEnd::ClientTooSlow,
                            Err(TrySendError::Closed(_)) => break SessionEnd::ClientDisconnected,
                        }
                    }
                    Some(BackendEvent::Error(e)) => break SessionEnd::BackendFailed(e),
                    None => break SessionEnd::BackendEnded,
                },
                _ = sleep_until(idle_deadline), if session.phase() == SessionPhase::Idle => {
                    break SessionEnd::IdleTimeout;
                }
            }
        };

        session.close();
        let stats = session.stats();
        match &end {
            end if end.is_error() => error!(
                reason = %end,
                frames = stats.frames_forwarded,
                bytes = stats.bytes_forwarded,
                events = stats.events_relayed,
                "Relay session terminated."
            ),
            SessionEnd::ClientTooSlow | SessionEnd::IdleTimeout => warn!(
                reason = %end,
                frames = stats.frames_forwarded,
                events = stats.events_relayed,
                "Relay session dropped."
            ),
            _ => info!(
                reason = %end,
                frames = stats.frames_forwarded,
                bytes = stats.bytes_forwarded,
                events = stats.events_relayed,
                "Relay session finished."
            ),
        }
        end
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockTranscriptionBackend, RecognizeStream, TranscriptionEvent};
    use anyhow::anyhow;

    struct BackendSide {
        audio: mpsc::Receiver<Bytes>,
        events: mpsc::Sender<BackendEvent>,
    }

    fn backend_opening_once() -> (MockTranscriptionBackend, BackendSide) {
        let (audio_tx, audio_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let stream = RecognizeStream::new(audio_tx, event_rx);
        let mut backend = MockTranscriptionBackend::new();
        backend
            .expect_open()
            .times(1)
            .return_once(move |_| Ok(stream));
        (
            backend,
            BackendSide {
                audio: audio_rx,
                events: event_tx,
            },
        )
    }

    fn relay_with(backend: MockTranscriptionBackend, settings: RelaySettings) -> Relay {
        Relay::new(Arc::new(backend), settings)
    }

    #[test]
    fn test_session_end_error_classification() {
        assert!(SessionEnd::BackendFailed("boom".into()).is_error());
        assert!(SessionEnd::Fault("bug".into()).is_error());
        assert!(!SessionEnd::ClientDisconnected.is_error());
        assert!(!SessionEnd::BackendEnded.is_error());
        assert!(!SessionEnd::ClientTooSlow.is_error());
        assert!(!SessionEnd::IdleTimeout.is_error());
    }

    #[test]
    fn test_relay_error_mapping() {
        assert!(matches!(
            SessionEnd::from(RelayError::BackendOpen("denied".into())),
            SessionEnd::BackendFailed(msg) if msg.contains("denied")
        ));
        assert_eq!(
            SessionEnd::from(RelayError::StreamClosed),
            SessionEnd::BackendEnded
        );
        assert!(matches!(
            SessionEnd::from(RelayError::UnopenedStreamWrite),
            SessionEnd::Fault(_)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_audio_never_opens_backend() {
        let mut backend = MockTranscriptionBackend::new();
        backend.expect_open().times(0);
        let relay = relay_with(backend, RelaySettings::default());

        let (connection, handle) = relay.connect();
        let ClientHandle { frames, mut outgoing } = handle;
        drop(frames);

        assert_eq!(relay.run(connection).await, SessionEnd::ClientDisconnected);
        assert!(outgoing.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_interim_then_final_reach_client_in_order() {
        let (backend, mut side) = backend_opening_once();
        let relay = relay_with(backend, RelaySettings::default());
        let (connection, handle) = relay.connect();
        let ClientHandle { frames, mut outgoing } = handle;
        let run = tokio::spawn({
            let relay = relay.clone();
            async move { relay.run(connection).await }
        });

        frames.send(Bytes::from_static(b"F1")).await.unwrap();
        assert_eq!(side.audio.recv().await.unwrap(), Bytes::from_static(b"F1"));

        side.events
            .send(BackendEvent::Transcript(TranscriptionEvent::interim("hello")))
            .await
            .unwrap();
        let first = outgoing.recv().await.unwrap();
        assert_eq!(
            first,
            TranscriptionMessage {
                transcription: "hello".into(),
                is_final: false
            }
        );

        side.events
            .send(BackendEvent::Transcript(TranscriptionEvent::final_result(
                "hello world",
            )))
            .await
            .unwrap();
        let second = outgoing.recv().await.unwrap();
        assert_eq!(
            second,
            TranscriptionMessage {
                transcription: "hello world".into(),
                is_final: true
            }
        );

        drop(frames);
        assert_eq!(run.await.unwrap(), SessionEnd::ClientDisconnected);
        assert!(outgoing.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_many_events_keep_their_order() {
        let (backend, mut side) = backend_opening_once();
        let relay = relay_with(backend, RelaySettings::default());
        let (connection, handle) = relay.connect();
        let ClientHandle { frames, mut outgoing } = handle;
        let run = tokio::spawn({
            let relay = relay.clone();
            async move { relay.run(connection).await }
        });

        frames.send(Bytes::from_static(b"audio")).await.unwrap();
        side.audio.recv().await.unwrap();

        let events: Vec<TranscriptionEvent> = (0..50)
            .map(|i| TranscriptionEvent {
                text: format!("word {i}"),
                is_final: i % 10 == 9,
            })
            .collect();
        let producer = {
            let tx = side.events.clone();
            let events = events.clone();
            tokio::spawn(async move {
                for event in events {
                    tx.send(BackendEvent::Transcript(event)).await.unwrap();
                }
            })
        };

        for expected in &events {
            let msg = outgoing.recv().await.unwrap();
            assert_eq!(msg.transcription, expected.text);
            assert_eq!(msg.is_final, expected.is_final);
        }
        producer.await.unwrap();

        drop(side.events);
        assert_eq!(run.await.unwrap(), SessionEnd::BackendEnded);
        assert!(outgoing.recv().await.is_none());
        drop(frames);
    }

    #[tokio::test]
    async fn test_backend_error_closes_client_and_drops_later_frames() {
        let (backend, mut side) = backend_opening_once();
        let relay = relay_with(backend, RelaySettings::default());
        let (connection, handle) = relay.connect();
        let ClientHandle { frames, mut outgoing } = handle;
        let run = tokio::spawn({
            let relay = relay.clone();
            async move { relay.run(connection).await }
        });

        frames.send(Bytes::from_static(b"F1")).await.unwrap();
        side.audio.recv().await.unwrap();
        side.events
            .send(BackendEvent::Error("stream reset".into()))
            .await
            .unwrap();

        assert_eq!(
            run.await.unwrap(),
            SessionEnd::BackendFailed("stream reset".into())
        );
        assert!(outgoing.recv().await.is_none());

        // The relay is gone, so later frames have nowhere to go.
        assert!(frames.send(Bytes::from_static(b"F2")).await.is_err());
        assert!(side.audio.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_client_disconnect_ends_backend_input_once() {
        let (backend, mut side) = backend_opening_once();
        let relay = relay_with(backend, RelaySettings::default());
        let (connection, handle) = relay.connect();
        let ClientHandle { frames, outgoing: _outgoing } = handle;
        let run = tokio::spawn({
            let relay = relay.clone();
            async move { relay.run(connection).await }
        });

        frames.send(Bytes::from_static(b"F1")).await.unwrap();
        frames.send(Bytes::from_static(b"F2")).await.unwrap();
        drop(frames);

        assert_eq!(run.await.unwrap(), SessionEnd::ClientDisconnected);
        assert_eq!(side.audio.recv().await.unwrap(), Bytes::from_static(b"F1"));
        assert_eq!(side.audio.recv().await.unwrap(), Bytes::from_static(b"F2"));
        assert!(side.audio.recv().await.is_none());
        assert!(side.audio.recv().await.is_none());
        assert!(side.events.is_closed());
    }

    #[tokio::test]
    async fn test_backend_open_failure_ends_session() {
        let mut backend = MockTranscriptionBackend::new();
        backend
            .expect_open()
            .times(1)
            .returning(|_| Err(anyhow!("credentials rejected")));
        let relay = relay_with(backend, RelaySettings::default());
        let (connection, handle) = relay.connect();
        let ClientHandle { frames, mut outgoing } = handle;

        frames.send(Bytes::from_static(b"F1")).await.unwrap();
        let end = relay.run(connection).await;

        assert!(matches!(end, SessionEnd::BackendFailed(ref msg) if msg.contains("credentials rejected")));
        assert!(outgoing.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_client_is_dropped() {
        let (backend, mut side) = backend_opening_once();
        let settings = RelaySettings {
            client_buffer: 2,
            ..RelaySettings::default()
        };
        let relay = relay_with(backend, settings);
        let (connection, handle) = relay.connect();
        let ClientHandle { frames, mut outgoing } = handle;
        let run = tokio::spawn({
            let relay = relay.clone();
            async move { relay.run(connection).await }
        });

        frames.send(Bytes::from_static(b"F1")).await.unwrap();
        side.audio.recv().await.unwrap();
        for i in 0..3 {
            side.events
                .send(BackendEvent::Transcript(TranscriptionEvent::interim(format!(
                    "partial {i}"
                ))))
                .await
                .unwrap();
        }

        assert_eq!(run.await.unwrap(), SessionEnd::ClientTooSlow);
        assert_eq!(outgoing.recv().await.unwrap().transcription, "partial 0");
        assert_eq!(outgoing.recv().await.unwrap().transcription, "partial 1");
        assert!(outgoing.recv().await.is_none());
        assert!(side.audio.recv().await.is_none());
        drop(frames);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_only_applies_before_audio() {
        let mut backend = MockTranscriptionBackend::new();
        backend.expect_open().times(0);
        let settings = RelaySettings {
            idle_timeout: Some(Duration::from_secs(30)),
            ..RelaySettings::default()
        };
        let relay = relay_with(backend, settings);
        let (connection, _handle) = relay.connect();

        assert_eq!(relay.run(connection).await, SessionEnd::IdleTimeout);

        let (backend, mut side) = backend_opening_once();
        let settings = RelaySettings {
            idle_timeout: Some(Duration::from_secs(30)),
            ..RelaySettings::default()
        };
        let relay = relay_with(backend, settings);
        let (connection, handle) = relay.connect();
        let run = tokio::spawn({
            let relay = relay.clone();
            async move { relay.run(connection).await }
        });
        handle.frames.send(Bytes::from_static(b"F1")).await.unwrap();
        side.audio.recv().await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!run.is_finished());

        drop(handle);
        assert_eq!(run.await.unwrap(), SessionEnd::ClientDisconnected);
    }

    #[tokio::test]
    async fn test_failure_in_one_session_leaves_others_running() {
        let (backend_a, mut side_a) = backend_opening_once();
        let (backend_b, mut side_b) = backend_opening_once();
        let relay_a = relay_with(backend_a, RelaySettings::default());
        let relay_b = relay_with(backend_b, RelaySettings::default());

        let (conn_a, handle_a) = relay_a.connect();
        let (conn_b, handle_b) = relay_b.connect();
        let ClientHandle { frames: frames_a, outgoing: mut out_a } = handle_a;
        let ClientHandle { frames: frames_b, outgoing: mut out_b } = handle_b;
        let run_a = tokio::spawn(async move { relay_a.run(conn_a).await });
        let run_b = tokio::spawn(async move { relay_b.run(conn_b).await });

        frames_a.send(Bytes::from_static(b"A")).await.unwrap();
        frames_b.send(Bytes::from_static(b"B")).await.unwrap();
        side_a.audio.recv().await.unwrap();
        side_b.audio.recv().await.unwrap();

        side_a
            .events
            .send(BackendEvent::Error("backend A crashed".into()))
            .await
            .unwrap();
        assert!(run_a.await.unwrap().is_error());
        assert!(out_a.recv().await.is_none());

        frames_b.send(Bytes::from_static(b"B2")).await.unwrap();
        assert_eq!(side_b.audio.recv().await.unwrap(), Bytes::from_static(b"B2"));
        side_b
            .events
            .send(BackendEvent::Transcript(TranscriptionEvent::final_result(
                "still here",
            )))
            .await
            .unwrap();
        assert_eq!(out_b.recv().await.unwrap().transcription, "still here");
        assert!(!run_b.is_finished());

        drop(frames_b);
        assert_eq!(run_b.await.unwrap(), SessionEnd::ClientDisconnected);
        drop(frames_a);
    }

    #[tokio::test]
    async fn test_chatty_backend_does_not_stall_fast_client() {
        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let stream = RecognizeStream::new(audio_tx, event_rx);
        let mut backend = MockTranscriptionBackend::new();
        backend
            .expect_open()
            .times(1)
            .return_once(move |_| Ok(stream));

        // Three results per frame, each awaited before the next frame is read.
        let backend_task = tokio::spawn(async move {
            let mut frames = 0usize;
            while audio_rx.recv().await.is_some() {
                frames += 1;
                for i in 0..3 {
                    let event = TranscriptionEvent::interim(format!("{frames}.{i}"));
                    if event_tx.send(BackendEvent::Transcript(event)).await.is_err() {
                        return frames;
                    }
                }
            }
            frames
        });

        let settings = RelaySettings {
            client_buffer: 100_000,
            ..RelaySettings::default()
        };
        let relay = relay_with(backend, settings);
        let (connection, handle) = relay.connect();
        let ClientHandle {
            frames,
            mut outgoing,
        } = handle;
        let run = tokio::spawn({
            let relay = relay.clone();
            async move { relay.run(connection).await }
        });
        let reader = tokio::spawn(async move {
            let mut received = 0usize;
            while outgoing.recv().await.is_some() {
                received += 1;
            }
            received
        });

        let sent = tokio::time::timeout(Duration::from_secs(10), async {
            for i in 0..3000u32 {
                frames.send(Bytes::from(i.to_be_bytes().to_vec())).await?;
            }
            Ok::<_, mpsc::error::SendError<Bytes>>(())
        })
        .await;
        assert!(matches!(sent, Ok(Ok(()))));
        drop(frames);

        let end = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::ClientDisconnected);
        let forwarded = tokio::time::timeout(Duration::from_secs(10), backend_task)
            .await
            .unwrap()
            .unwrap();
        assert!(forwarded > 0);
        assert!(reader.await.unwrap() > 0);
    }
}
