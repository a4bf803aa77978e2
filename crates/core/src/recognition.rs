//! Recognition settings sent to the speech backend when a stream is opened.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sample encoding of the raw audio frames clients send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AudioEncoding {
    /// Uncompressed 16-bit signed little-endian PCM.
    Linear16,
    Flac,
    Mulaw,
}

impl AudioEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::Linear16 => "LINEAR16",
            AudioEncoding::Flac => "FLAC",
            AudioEncoding::Mulaw => "MULAW",
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed server-side configuration for every outbound recognition stream.
///
/// Clients never negotiate any of this; the relay applies the same settings
/// to every session it opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionConfig {
    pub encoding: AudioEncoding,
    pub sample_rate_hz: u32,
    /// BCP-47 tag of the primary language.
    pub language_code: String,
    /// Fallback languages, in order of preference.
    pub alternative_language_codes: Vec<String>,
    pub model: String,
    pub use_enhanced: bool,
    /// Domain vocabulary hints.
    pub phrases: Vec<String>,
    pub interim_results: bool,
    pub enable_automatic_punctuation: bool,
    pub single_utterance: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::Linear16,
            sample_rate_hz: 16000,
            language_code: "he-IL".to_string(),
            alternative_language_codes: vec![
                "en-US".to_string(),
                "ru-RU".to_string(),
                "es-ES".to_string(),
            ],
            model: "default".to_string(),
            use_enhanced: true,
            phrases: vec![
                "specific domain term".to_string(),
                "technical jargon".to_string(),
                "common names".to_string(),
            ],
            interim_results: true,
            enable_automatic_punctuation: true,
            single_utterance: false,
        }
    }
}

impl RecognitionConfig {
    /// Replaces the vocabulary hints. An empty list keeps the current ones.
    pub fn with_phrases(mut self, phrases: Vec<String>) -> Self {
        if !phrases.is_empty() {
            self.phrases = phrases;
        }
        self
    }

    /// ISO-639-1 part of the primary language tag (`"he-IL"` -> `"he"`).
    pub fn primary_language(&self) -> &str {
        self.language_code
            .split(['-', '_'])
            .next()
            .unwrap_or(&self.language_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_relay_settings() {
        let config = RecognitionConfig::default();

        assert_eq!(config.encoding, AudioEncoding::Linear16);
        assert_eq!(config.sample_rate_hz, 16000);
        assert_eq!(config.language_code, "he-IL");
        assert_eq!(
            config.alternative_language_codes,
            vec!["en-US", "ru-RU", "es-ES"]
        );
        assert!(config.interim_results);
        assert!(config.enable_automatic_punctuation);
        assert!(!config.single_utterance);
        assert_eq!(config.phrases.len(), 3);
    }

    #[test]
    fn test_with_phrases() {
        let config = RecognitionConfig::default().with_phrases(vec!["Kubernetes".to_string()]);
        assert_eq!(config.phrases, vec!["Kubernetes"]);

        let config = RecognitionConfig::default().with_phrases(vec![]);
        assert_eq!(config.phrases, RecognitionConfig::default().phrases);
    }

    #[test]
    fn test_primary_language() {
        let mut config = RecognitionConfig::default();
        assert_eq!(config.primary_language(), "he");

        config.language_code = "en".to_string();
        assert_eq!(config.primary_language(), "en");

        config.language_code = "pt_BR".to_string();
        assert_eq!(config.primary_language(), "pt");
    }

    #[test]
    fn test_serialization_uses_camel_case() {
        let value = serde_json::to_value(RecognitionConfig::default()).unwrap();
        assert_eq!(value["encoding"], "LINEAR16");
        assert_eq!(value["sampleRateHz"], 16000);
        assert_eq!(value["alternativeLanguageCodes"][0], "en-US");
        assert_eq!(value["enableAutomaticPunctuation"], true);
    }
}
