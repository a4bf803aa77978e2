//! Streams audio to a speech gateway over a WebSocket.
//!
//! The gateway fronts a streaming recognizer such as Google Cloud Speech,
//! whose `StreamingRecognize` call is only reachable over gRPC, and speaks
//! the JSON shapes of that API's v1 messages. The first message carries the
//! streaming configuration. Each audio frame follows as one raw binary
//! message rather than base64 `audioContent`, and `{"audioStreamEnd": true}`
//! is the gateway's end-of-input marker. Responses use the
//! `StreamingRecognizeResponse` shape.

use super::{AUDIO_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY, Flow, WsSink, WsSource};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use relay_core::{BackendEvent, RecognitionConfig, RecognizeStream, TranscriptionBackend};
use std::time::Duration;
use tokio::{sync::mpsc, time::Instant};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{Instrument, debug, error, info, warn};

// --- Local StreamingRecognize Types (for encapsulation) ---
mod speech_types {
    use relay_core::TranscriptionEvent;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct StreamingRecognizeRequest {
        pub streaming_config: StreamingRecognitionConfig,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct StreamingRecognitionConfig {
        pub config: RecognitionConfig,
        pub interim_results: bool,
        pub single_utterance: bool,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct RecognitionConfig {
        pub encoding: String,
        pub sample_rate_hertz: u32,
        pub language_code: String,
        pub alternative_language_codes: Vec<String>,
        pub model: String,
        pub use_enhanced: bool,
        pub speech_contexts: Vec<SpeechContext>,
        pub enable_automatic_punctuation: bool,
    }
    #[derive(Serialize)]
    pub(super) struct SpeechContext {
        pub phrases: Vec<String>,
    }
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct AudioStreamEnd {
        pub audio_stream_end: bool,
    }

    impl StreamingRecognizeRequest {
        pub(super) fn from_config(config: &relay_core::RecognitionConfig) -> Self {
            Self {
                streaming_config: StreamingRecognitionConfig {
                    config: RecognitionConfig {
                        encoding: config.encoding.as_str().to_string(),
                        sample_rate_hertz: config.sample_rate_hz,
                        language_code: config.language_code.clone(),
                        alternative_language_codes: config.alternative_language_codes.clone(),
                        model: config.model.clone(),
                        use_enhanced: config.use_enhanced,
                        speech_contexts: vec![SpeechContext {
                            phrases: config.phrases.clone(),
                        }],
                        enable_automatic_punctuation: config.enable_automatic_punctuation,
                    },
                    interim_results: config.interim_results,
                    single_utterance: config.single_utterance,
                },
            }
        }
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct StreamingRecognizeResponse {
        #[serde(default)]
        pub results: Vec<StreamingRecognitionResult>,
        pub error: Option<Status>,
    }
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct StreamingRecognitionResult {
        #[serde(default)]
        pub alternatives: Vec<SpeechRecognitionAlternative>,
        #[serde(default)]
        pub is_final: bool,
    }
    #[derive(Deserialize, Debug)]
    pub(super) struct SpeechRecognitionAlternative {
        #[serde(default)]
        pub transcript: String,
    }
    #[derive(Deserialize, Debug)]
    pub(super) struct Status {
        #[serde(default)]
        pub code: i32,
        #[serde(default)]
        pub message: String,
    }

    impl StreamingRecognizeResponse {
        /// The first alternative of the first result, if the response has one.
        pub(super) fn into_event(self) -> Option<TranscriptionEvent> {
            let result = self.results.into_iter().next()?;
            let transcript = result
                .alternatives
                .into_iter()
                .next()
                .map(|alt| alt.transcript)
                .unwrap_or_default();
            Some(TranscriptionEvent {
                text: transcript,
                is_final: result.is_final,
            })
        }
    }
}

use speech_types::{AudioStreamEnd, StreamingRecognizeRequest, StreamingRecognizeResponse};

/// A `TranscriptionBackend` backed by a `StreamingRecognize` speech gateway.
pub struct SpeechGatewayBackend {
    endpoint: String,
    api_key: Option<String>,
    drain_timeout: Duration,
}

impl SpeechGatewayBackend {
    pub fn new(endpoint: String, api_key: Option<String>, drain_timeout: Duration) -> Self {
        Self {
            endpoint,
            api_key,
            drain_timeout,
        }
    }

    fn stream_url(&self) -> String {
        match &self.api_key {
            Some(key) => {
                let sep = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{}key={}", self.endpoint, sep, key)
            }
            None => self.endpoint.clone(),
        }
    }
}

#[async_trait]
impl TranscriptionBackend for SpeechGatewayBackend {
    async fn open(&self, config: &RecognitionConfig) -> Result<RecognizeStream> {
        let (ws_stream, _) = connect_async(self.stream_url())
            .await
            .context("Failed to connect to speech gateway")?;
        let (mut gateway_tx, gateway_rx) = ws_stream.split();
        info!("Connected to speech gateway.");

        let request = StreamingRecognizeRequest::from_config(config);
        gateway_tx
            .send(WsMessage::Text(serde_json::to_string(&request)?.into()))
            .await
            .context("Failed to send streaming configuration")?;

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let drain_timeout = self.drain_timeout;
        tokio::spawn(
            async move {
                if let Err(e) = run(gateway_tx, gateway_rx, audio_rx, &event_tx, drain_timeout).await
                {
                    error!(error = ?e, "Speech gateway stream failed");
                    let _ = event_tx.send(BackendEvent::Error(format!("{e:#}"))).await;
                }
            }
            .in_current_span(),
        );

        Ok(RecognizeStream::new(audio_tx, event_rx))
    }
}

/// Forwards audio until end of input, then drains remaining results.
async fn run(
    mut gateway_tx: WsSink,
    mut gateway_rx: WsSource,
    mut audio_rx: mpsc::Receiver<Bytes>,
    event_tx: &mpsc::Sender<BackendEvent>,
    drain_timeout: Duration,
) -> Result<()> {
    loop {
        tokio::select! {
            frame = audio_rx.recv() => match frame {
                Some(frame) => gateway_tx
                    .send(WsMessage::Binary(frame))
                    .await
                    .context("Failed to forward audio to the speech gateway")?,
                None => break,
            },
            msg = gateway_rx.next() => match msg {
                Some(Ok(msg)) => {
                    if handle_message(msg, event_tx).await? == Flow::Stop {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e).context("Error reading from speech gateway"),
                None => {
                    info!("Speech gateway closed the connection.");
                    return Ok(());
                }
            },
            _ = event_tx.closed() => {
                debug!("Recognition stream released; closing speech gateway connection.");
                let _ = gateway_tx.close().await;
                return Ok(());
            }
        }
    }

    debug!("End of input; waiting for final results.");
    let end = serde_json::to_string(&AudioStreamEnd {
        audio_stream_end: true,
    })?;
    gateway_tx
        .send(WsMessage::Text(end.into()))
        .await
        .context("Failed to signal end of audio")?;

    let deadline = Instant::now() + drain_timeout;
    loop {
        match tokio::time::timeout_at(deadline, gateway_rx.next()).await {
            Ok(Some(Ok(msg))) => {
                if handle_message(msg, event_tx).await? == Flow::Stop {
                    break;
                }
            }
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Speech gateway errored while draining.");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(?drain_timeout, "Timed out waiting for final results.");
                break;
            }
        }
    }
    let _ = gateway_tx.close().await;
    Ok(())
}

async fn handle_message(msg: WsMessage, event_tx: &mpsc::Sender<BackendEvent>) -> Result<Flow> {
    match msg {
        WsMessage::Text(text) => {
            let response = match serde_json::from_str::<StreamingRecognizeResponse>(&text) {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Ignoring unparseable speech gateway response.");
                    return Ok(Flow::Continue);
                }
            };
            if let Some(status) = response.error {
                bail!("Speech gateway error {}: {}", status.code, status.message);
            }
            // Responses without results (speech events) carry nothing to relay.
            if let Some(event) = response.into_event() {
                if event_tx.send(BackendEvent::Transcript(event)).await.is_err() {
                    return Ok(Flow::Stop);
                }
            }
            Ok(Flow::Continue)
        }
        WsMessage::Close(frame) => {
            info!(?frame, "Speech gateway closed the stream.");
            Ok(Flow::Stop)
        }
        _ => Ok(Flow::Continue),
    }
}
