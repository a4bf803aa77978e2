//! Handles the real-time WebSocket connection to OpenAI for input transcription.

use super::{AUDIO_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY, Flow, WsSink, WsSource};
use crate::audio_utils::{self, Pcm16Resampler};
use anyhow::{Context, Result, bail};
use async_openai::types::realtime::{
    self as oai_realtime, ClientEvent as OAIClientEvent, ServerEvent as OAIServerEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use relay_core::{
    AudioEncoding, BackendEvent, RecognitionConfig, RecognizeStream, TranscriptionBackend,
    TranscriptionEvent,
};
use std::time::Duration;
use tokio::{sync::mpsc, time::Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{Instrument, debug, error, info, warn};

/// A `TranscriptionBackend` backed by the OpenAI Realtime API.
///
/// Sessions are configured for input transcription only: the server detects
/// turns and never generates a response.
pub struct OpenAIRealtimeBackend {
    api_key: String,
    realtime_model: String,
    transcription_model: String,
    drain_timeout: Duration,
}

impl OpenAIRealtimeBackend {
    pub fn new(
        api_key: String,
        realtime_model: String,
        transcription_model: String,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            api_key,
            realtime_model,
            transcription_model,
            drain_timeout,
        }
    }

    fn session_update(&self, config: &RecognitionConfig) -> OAIClientEvent {
        let prompt = (!config.phrases.is_empty()).then(|| config.phrases.join(", "));
        let session_config = oai_realtime::SessionResource {
            model: Some(self.realtime_model.clone()),
            modalities: Some(vec!["text".to_string()]),
            input_audio_format: Some(oai_realtime::AudioFormat::PCM16),
            input_audio_transcription: Some(oai_realtime::AudioTranscription {
                model: Some(self.transcription_model.clone()),
                language: Some(config.primary_language().to_string()),
                prompt,
                ..Default::default()
            }),
            turn_detection: Some(oai_realtime::TurnDetection::ServerVAD {
                threshold: 0.5,
                prefix_padding_ms: 200,
                silence_duration_ms: 700,
                interrupt_response: Some(false),
                create_response: Some(false),
            }),
            ..Default::default()
        };
        OAIClientEvent::SessionUpdate(oai_realtime::SessionUpdateEvent {
            session: session_config,
            event_id: None,
        })
    }
}

#[async_trait]
impl TranscriptionBackend for OpenAIRealtimeBackend {
    async fn open(&self, config: &RecognitionConfig) -> Result<RecognizeStream> {
        if config.encoding != AudioEncoding::Linear16 {
            bail!(
                "OpenAI Realtime transcription requires LINEAR16 audio, got {}",
                config.encoding
            );
        }
        let resampler = Pcm16Resampler::new(
            config.sample_rate_hz as f64,
            audio_utils::OPENAI_REALTIME_API_PCM16_SAMPLE_RATE,
            audio_utils::RESAMPLER_CHUNK_SIZE,
        )?;
        if !config.alternative_language_codes.is_empty() {
            debug!(
                fallbacks = ?config.alternative_language_codes,
                "OpenAI transcription takes a single language; fallbacks are not sent."
            );
        }

        let url = format!(
            "wss://api.openai.com/v1/realtime?model={}",
            self.realtime_model
        );
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {}", self.api_key).parse()?);
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse()?);

        let (ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to OpenAI Realtime WebSocket")?;
        let (mut openai_tx, openai_rx) = ws_stream.split();
        info!("Connected to OpenAI Realtime API.");

        let event = self.session_update(config);
        openai_tx
            .send(WsMessage::Text(serde_json::to_string(&event)?.into()))
            .await
            .context("Failed to configure OpenAI Realtime session")?;

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let drain_timeout = self.drain_timeout;
        tokio::spawn(
            async move {
                let mut transcriber = Transcriber {
                    openai_tx,
                    openai_rx,
                    resampler,
                    partial: String::new(),
                };
                if let Err(e) = transcriber.run(audio_rx, &event_tx, drain_timeout).await {
                    error!(error = ?e, "OpenAI Realtime stream failed");
                    let _ = event_tx.send(BackendEvent::Error(format!("{e:#}"))).await;
                }
            }
            .in_current_span(),
        );

        Ok(RecognizeStream::new(audio_tx, event_rx))
    }
}

/// State of one OpenAI Realtime transcription stream.
struct Transcriber {
    openai_tx: WsSink,
    openai_rx: WsSource,
    resampler: Pcm16Resampler,
    /// Deltas of the utterance currently being transcribed.
    partial: String,
}

impl Transcriber {
    async fn run(
        &mut self,
        mut audio_rx: mpsc::Receiver<Bytes>,
        event_tx: &mpsc::Sender<BackendEvent>,
        drain_timeout: Duration,
    ) -> Result<()> {
        loop {
            tokio::select! {
                frame = audio_rx.recv() => match frame {
                    Some(frame) => self.append_audio(&frame).await?,
                    None => break,
                },
                msg = self.openai_rx.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if self.handle_server_event(&text, event_tx).await? == Flow::Stop {
                            return Ok(());
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "OpenAI Realtime connection closed by server.");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("Error reading from OpenAI Realtime WebSocket"),
                    None => return Ok(()),
                },
                _ = event_tx.closed() => {
                    let _ = self.openai_tx.close().await;
                    return Ok(());
                }
            }
        }

        // Commit whatever audio is buffered so the last utterance is transcribed.
        let tail = self.resampler.flush()?;
        self.send_samples(&tail).await?;
        debug!("End of input; committing audio buffer.");
        let commit = OAIClientEvent::InputAudioBufferCommit(
            oai_realtime::InputAudioBufferCommitEvent { event_id: None },
        );
        self.openai_tx
            .send(WsMessage::Text(serde_json::to_string(&commit)?.into()))
            .await?;

        let deadline = Instant::now() + drain_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.openai_rx.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    match self.handle_server_event(&text, event_tx).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => break,
                        Err(e) => {
                            // An empty buffer cannot be committed; nothing was pending.
                            debug!(error = %e, "OpenAI Realtime reported an error while draining.");
                            break;
                        }
                    }
                }
                Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => break,
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "OpenAI Realtime stream errored while draining.");
                    break;
                }
                Err(_) => {
                    warn!(?drain_timeout, "Timed out waiting for final transcription.");
                    break;
                }
            }
        }
        let _ = self.openai_tx.close().await;
        Ok(())
    }

    async fn append_audio(&mut self, frame: &[u8]) -> Result<()> {
        let resampled = self.resampler.process(frame)?;
        self.send_samples(&resampled).await
    }

    async fn send_samples(&mut self, samples: &[f32]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let append_event = oai_realtime::InputAudioBufferAppendEvent {
            audio: audio_utils::encode_f32_to_base64_i16(samples),
            event_id: None,
        };
        self.openai_tx
            .send(WsMessage::Text(
                serde_json::to_string(&OAIClientEvent::InputAudioBufferAppend(append_event))?
                    .into(),
            ))
            .await
            .context("Failed to forward audio to OpenAI")?;
        Ok(())
    }

    async fn handle_server_event(
        &mut self,
        text: &str,
        event_tx: &mpsc::Sender<BackendEvent>,
    ) -> Result<Flow> {
        let Ok(server_event) = serde_json::from_str::<OAIServerEvent>(text) else {
            return Ok(Flow::Continue);
        };
        let event = match server_event {
            OAIServerEvent::ConversationItemInputAudioTranscriptionDelta(e) => {
                self.partial.push_str(&e.delta);
                TranscriptionEvent::interim(self.partial.clone())
            }
            OAIServerEvent::ConversationItemInputAudioTranscriptionCompleted(e) => {
                self.partial.clear();
                TranscriptionEvent::final_result(e.transcript)
            }
            OAIServerEvent::Error(e) => bail!("OpenAI Realtime error: {}", e.error.message),
            _ => return Ok(Flow::Continue),
        };
        if event_tx.send(BackendEvent::Transcript(event)).await.is_err() {
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }
}
