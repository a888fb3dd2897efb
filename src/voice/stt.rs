//! Speech-to-text (STT) via the sound tokenizer endpoint

use async_trait::async_trait;

use crate::{Error, Result};

/// Marks chat input that carries sound tokens rather than typed text
pub const SOUND_SENTINEL: &str = "<|sound_start|>";

/// Response from the `/api/tokenize` endpoint
#[derive(serde::Deserialize)]
struct TokenizeResponse {
    tokens: String,
}

/// Anything that turns a recorded utterance into chat input tokens
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Tokenize WAV audio
    async fn tokenize(&self, wav: &[u8]) -> Result<String>;
}

/// Tokenizes recorded speech through the `/api/tokenize` endpoint
pub struct SpeechToText {
    client: reqwest::Client,
    endpoint: String,
}

impl SpeechToText {
    /// Create an STT client for the service at `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is empty
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        if base_url.is_empty() {
            return Err(Error::Config("STT base URL required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: format!("{base_url}/api/tokenize"),
        })
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn tokenize(&self, wav: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting tokenization");

        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(wav.to_vec())
                .file_name("audio.wav")
                .mime_str("audio/wav")
                .map_err(|e| Error::Stt(e.to_string()))?,
        );

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "tokenize request failed");
                e
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "tokenize API error");
            return Err(Error::Stt(format!("failed to tokenize audio ({status}): {body}")));
        }

        let result: TokenizeResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse tokenize response");
            e
        })?;

        tracing::info!(tokens = result.tokens.len(), "tokenization complete");
        Ok(result.tokens)
    }
}

/// Build the chat input for a tokenized utterance
#[must_use]
pub fn sound_input(tokens: &str) -> String {
    format!("{SOUND_SENTINEL}{tokens}")
}

/// Whether chat input carries sound tokens
#[must_use]
pub fn is_sound_input(input: &str) -> bool {
    input.starts_with(SOUND_SENTINEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sound_input_round_trip() {
        let input = sound_input("<|sound_0001|><|sound_0420|>");
        assert!(input.starts_with("<|sound_start|>"));
        assert!(is_sound_input(&input));
        assert!(!is_sound_input("hello <|sound_start|>"));
    }

    #[test]
    fn test_endpoint() {
        let stt = SpeechToText::new("http://api.local").unwrap();
        assert_eq!(stt.endpoint, "http://api.local/api/tokenize");
    }
}
