//! # Handshake parsing and the negotiated stream format
//!
//! The first message on a relay socket is a JSON object describing the audio the
//! client is about to send and how it wants it recognised. Any field the client
//! leaves out is taken from the `[audio]` configuration section; a field with no
//! configured default is required.
//!
//! ## Example handshake
//! ```json
//! {"encoding": "linear16", "sampleRate": 16000, "channels": 1, "interim_results": true}
//! ```

use crate::config::AudioDefaults;
use crate::relay::error::RelayError;
use serde::{Deserialize, Serialize};

/// Encodings accepted for raw (headerless) audio.
pub const SUPPORTED_ENCODINGS: &[&str] = &[
    "linear16", "linear32", "flac", "alaw", "mulaw", "amr-nb", "amr-wb", "opus", "ogg-opus",
    "speex", "g729",
];

const SAMPLE_RATE_RANGE: std::ops::RangeInclusive<u32> = 8_000..=192_000;
const MAX_CHANNELS: u16 = 8;

/// Negotiated audio format. Fixed once the session starts streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub interim_results: bool,
    pub language: String,
    pub model: String,
}

/// Recognition options that do not describe the audio itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecognitionOptions {
    pub smart_format: bool,
    pub punctuate: bool,
    pub diarize: bool,
    pub utterances: bool,
}

/// Everything the handshake resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub format: AudioFormat,
    pub options: RecognitionOptions,
}

/// Raw handshake as sent by clients. Both the snake_case names of the Python
/// client and the camelCase names of the mobile client are accepted.
#[derive(Debug, Default, Deserialize)]
struct HandshakeMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    language: Option<String>,
    model: Option<String>,
    #[serde(alias = "smartFormat")]
    smart_format: Option<bool>,
    #[serde(alias = "interimResults")]
    interim_results: Option<bool>,
    punctuate: Option<bool>,
    diarize: Option<bool>,
    utterances: Option<bool>,
    encoding: Option<String>,
    #[serde(alias = "sampleRate")]
    sample_rate: Option<u32>,
    #[serde(alias = "channelCount")]
    channels: Option<u16>,
}

impl StreamConfig {
    /// Parse and validate a handshake message against the configured defaults.
    pub fn from_handshake(text: &str, defaults: &AudioDefaults) -> Result<Self, RelayError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| RelayError::ConfigInvalid(format!("handshake is not valid JSON: {}", e)))?;

        if !value.is_object() {
            return Err(RelayError::ConfigInvalid(
                "handshake must be a JSON object".to_string(),
            ));
        }

        let message: HandshakeMessage = serde_json::from_value(value)
            .map_err(|e| RelayError::ConfigInvalid(e.to_string()))?;

        if let Some(kind) = message.kind.as_deref() {
            let kind = kind.to_ascii_lowercase();
            if !matches!(kind.as_str(), "config" | "configure" | "start") {
                return Err(RelayError::ConfigInvalid(format!(
                    "expected a configuration message, got '{}'",
                    kind
                )));
            }
        }

        let format = AudioFormat {
            encoding: required("encoding", message.encoding, &defaults.encoding)?
                .to_ascii_lowercase(),
            sample_rate: required("sample_rate", message.sample_rate, &defaults.sample_rate)?,
            channels: required("channels", message.channels, &defaults.channels)?,
            interim_results: required(
                "interim_results",
                message.interim_results,
                &defaults.interim_results,
            )?,
            language: required("language", message.language, &defaults.language)?,
            model: required("model", message.model, &defaults.model)?,
        };

        let options = RecognitionOptions {
            smart_format: required("smart_format", message.smart_format, &defaults.smart_format)?,
            punctuate: required("punctuate", message.punctuate, &defaults.punctuate)?,
            diarize: required("diarize", message.diarize, &defaults.diarize)?,
            utterances: required("utterances", message.utterances, &defaults.utterances)?,
        };

        format.validate()?;
        Ok(Self { format, options })
    }
}

impl AudioFormat {
    fn validate(&self) -> Result<(), RelayError> {
        if !SUPPORTED_ENCODINGS.contains(&self.encoding.as_str()) {
            return Err(RelayError::ConfigInvalid(format!(
                "unsupported encoding '{}'",
                self.encoding
            )));
        }

        if !SAMPLE_RATE_RANGE.contains(&self.sample_rate) {
            return Err(RelayError::ConfigInvalid(format!(
                "sample_rate {} outside {}..={}",
                self.sample_rate,
                SAMPLE_RATE_RANGE.start(),
                SAMPLE_RATE_RANGE.end()
            )));
        }

        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(RelayError::ConfigInvalid(format!(
                "channels must be between 1 and {}",
                MAX_CHANNELS
            )));
        }

        if self.language.trim().is_empty() || self.model.trim().is_empty() {
            return Err(RelayError::ConfigInvalid(
                "language and model must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn required<T: Clone>(name: &str, supplied: Option<T>, default: &Option<T>) -> Result<T, RelayError> {
    supplied
        .or_else(|| default.clone())
        .ok_or_else(|| RelayError::ConfigInvalid(format!("missing required field '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case_handshake() {
        let text = r#"{"encoding": "linear16", "sampleRate": 16000, "channels": 1}"#;
        let config = StreamConfig::from_handshake(text, &AudioDefaults::default()).unwrap();

        assert_eq!(config.format.encoding, "linear16");
        assert_eq!(config.format.sample_rate, 16_000);
        assert_eq!(config.format.channels, 1);
        // Remaining fields come from the defaults
        assert_eq!(config.format.model, "nova-3");
        assert_eq!(config.format.language, "en-US");
        assert!(config.format.interim_results);
        assert!(config.options.smart_format);
        assert!(!config.options.diarize);
    }

    #[test]
    fn test_snake_case_handshake() {
        let text = r#"{
            "language": "en-US", "model": "nova-2", "smart_format": false,
            "interim_results": false, "punctuate": true, "diarize": true,
            "encoding": "linear16", "sample_rate": 44100
        }"#;
        let config = StreamConfig::from_handshake(text, &AudioDefaults::default()).unwrap();

        assert_eq!(config.format.model, "nova-2");
        assert_eq!(config.format.sample_rate, 44_100);
        assert!(!config.format.interim_results);
        assert!(!config.options.smart_format);
        assert!(config.options.diarize);
    }

    #[test]
    fn test_missing_sample_rate_is_invalid() {
        let text = r#"{"encoding": "linear16", "channels": 1}"#;
        let err = StreamConfig::from_handshake(text, &AudioDefaults::default()).unwrap_err();
        assert_eq!(
            err,
            RelayError::ConfigInvalid("missing required field 'sample_rate'".to_string())
        );
    }

    #[test]
    fn test_configured_default_fills_sample_rate() {
        let defaults = AudioDefaults { sample_rate: Some(44_100), ..AudioDefaults::default() };
        let config = StreamConfig::from_handshake("{}", &defaults).unwrap();
        assert_eq!(config.format.sample_rate, 44_100);
    }

    #[test]
    fn test_malformed_handshakes() {
        let defaults = AudioDefaults::default();
        let cases = [
            "not json",
            "[1, 2, 3]",
            r#"{"sampleRate": "fast"}"#,
            r#"{"encoding": "wav", "sampleRate": 16000}"#,
            r#"{"encoding": "linear16", "sampleRate": 100}"#,
            r#"{"encoding": "linear16", "sampleRate": 16000, "channels": 0}"#,
            r#"{"type": "stop", "sampleRate": 16000}"#,
        ];

        for text in cases {
            let result = StreamConfig::from_handshake(text, &defaults);
            assert!(
                matches!(result, Err(RelayError::ConfigInvalid(_))),
                "expected ConfigInvalid for {}",
                text
            );
        }
    }

    #[test]
    fn test_encoding_is_case_insensitive() {
        let text = r#"{"type": "config", "encoding": "LINEAR16", "sampleRate": 16000}"#;
        let config = StreamConfig::from_handshake(text, &AudioDefaults::default()).unwrap();
        assert_eq!(config.format.encoding, "linear16");
    }
}
