use relay_core::{RecognitionConfig, RelaySettings};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Defines the supported streaming speech-recognition backends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    /// A WebSocket speech gateway speaking the `StreamingRecognize` message shapes.
    Gateway,
    OpenAI,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gateway => "gateway",
            Provider::OpenAI => "openai",
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub relay_path: String,
    pub provider: Provider,
    pub speech_gateway_endpoint: Option<String>,
    pub speech_gateway_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_realtime_model: String,
    pub openai_transcription_model: String,
    pub speech_phrases: Vec<String>,
    pub client_buffer_capacity: usize,
    pub idle_timeout: Option<Duration>,
    pub backend_drain_timeout: Duration,
    pub backend_open_timeout: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:5000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let relay_path =
            std::env::var("RELAY_PATH").unwrap_or_else(|_| "/connection".to_string());
        if !relay_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(
                "RELAY_PATH".to_string(),
                format!("'{}' must start with '/'", relay_path),
            ));
        }

        let provider_str =
            std::env::var("SPEECH_PROVIDER").unwrap_or_else(|_| "gateway".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "gateway" => Provider::Gateway,
            "openai" => Provider::OpenAI,
            other => {
                return Err(ConfigError::InvalidValue(
                    "SPEECH_PROVIDER".to_string(),
                    format!("'{}' is not one of: gateway, openai", other),
                ));
            }
        };

        let speech_gateway_endpoint = std::env::var("SPEECH_GATEWAY_ENDPOINT").ok();
        let speech_gateway_api_key = std::env::var("SPEECH_GATEWAY_API_KEY").ok();
        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();

        let openai_realtime_model = std::env::var("OPENAI_REALTIME_MODEL")
            .unwrap_or_else(|_| "gpt-4o-realtime-preview-2024-10-01".to_string());
        let openai_transcription_model = std::env::var("OPENAI_TRANSCRIPTION_MODEL")
            .unwrap_or_else(|_| "whisper-1".to_string());

        let speech_phrases = std::env::var("SPEECH_PHRASES")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let client_buffer_capacity = parse_var("CLIENT_BUFFER_CAPACITY", 256usize)?;
        if client_buffer_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "CLIENT_BUFFER_CAPACITY".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let idle_timeout = match std::env::var("IDLE_TIMEOUT_SECS") {
            Ok(v) => Some(Duration::from_secs(v.parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue("IDLE_TIMEOUT_SECS".to_string(), e.to_string())
            })?)),
            Err(_) => None,
        };

        let backend_drain_timeout =
            Duration::from_millis(parse_var("BACKEND_DRAIN_TIMEOUT_MS", 5000u64)?);
        let backend_open_timeout =
            Duration::from_millis(parse_var("BACKEND_OPEN_TIMEOUT_MS", 10_000u64)?);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        match provider {
            Provider::Gateway => {
                if speech_gateway_endpoint.is_none() {
                    return Err(ConfigError::MissingVar(
                        "SPEECH_GATEWAY_ENDPOINT must be set for 'gateway' provider".to_string(),
                    ));
                }
            }
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            bind_address,
            relay_path,
            provider,
            speech_gateway_endpoint,
            speech_gateway_api_key,
            openai_api_key,
            openai_realtime_model,
            openai_transcription_model,
            speech_phrases,
            client_buffer_capacity,
            idle_timeout,
            backend_drain_timeout,
            backend_open_timeout,
            log_level,
        })
    }

    /// Builds the per-session relay settings from this configuration.
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            recognition: RecognitionConfig::default().with_phrases(self.speech_phrases.clone()),
            idle_timeout: self.idle_timeout,
            client_buffer: self.client_buffer_capacity,
            open_timeout: self.backend_open_timeout,
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
