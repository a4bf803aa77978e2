//! Streaming speech-recognition backends reached over outbound WebSockets.

pub mod gateway;
pub mod openai;

use crate::config::{Config, Provider};
use anyhow::{Context, Result};
use relay_core::TranscriptionBackend;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::protocol::Message};
use futures_util::stream::{SplitSink, SplitStream};

pub use gateway::SpeechGatewayBackend;
pub use openai::OpenAIRealtimeBackend;

/// Audio frames buffered between a session and its backend task.
pub(crate) const AUDIO_CHANNEL_CAPACITY: usize = 64;
/// Recognition events buffered between a backend task and its session.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// Whether a backend task should keep reading from its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Builds the process-wide backend selected by the configuration.
pub fn build_backend(config: &Config) -> Result<Arc<dyn TranscriptionBackend>> {
    let backend: Arc<dyn TranscriptionBackend> = match config.provider {
        Provider::Gateway => {
            let endpoint = config
                .speech_gateway_endpoint
                .clone()
                .context("Speech gateway endpoint not configured")?;
            Arc::new(SpeechGatewayBackend::new(
                endpoint,
                config.speech_gateway_api_key.clone(),
                config.backend_drain_timeout,
            ))
        }
        Provider::OpenAI => {
            let api_key = config
                .openai_api_key
                .clone()
                .context("OpenAI API key not found")?;
            Arc::new(OpenAIRealtimeBackend::new(
                api_key,
                config.openai_realtime_model.clone(),
                config.openai_transcription_model.clone(),
                config.backend_drain_timeout,
            ))
        }
    };
    Ok(backend)
}
