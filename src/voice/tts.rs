//! Text-to-speech (TTS) synthesis client

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::SynthesisOptions;
use crate::{Error, Result};

/// A synthesized audio payload ready for playback
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioResource {
    /// Encoded audio bytes (WAV)
    pub data: Bytes,

    /// Content type reported by the service, if any
    pub content_type: Option<String>,
}

impl AudioResource {
    /// Wrap encoded WAV bytes
    #[must_use]
    pub fn wav(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            content_type: Some("audio/wav".to_string()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Anything that turns one text chunk into audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text`, tagging the request with `reference_id`
    async fn synthesize(&self, text: &str, reference_id: &str) -> Result<AudioResource>;
}

/// Body of a `/api/tts` request
#[derive(Debug, serde::Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    reference_id: &'a str,
    #[serde(flatten)]
    options: &'a SynthesisOptions,
}

/// Synthesizes speech through the `/api/tts` endpoint
pub struct TextToSpeech {
    client: reqwest::Client,
    endpoint: String,
    options: SynthesisOptions,
}

impl TextToSpeech {
    /// Create a TTS client for the service at `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is empty
    pub fn new(base_url: &str, options: SynthesisOptions) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        if base_url.is_empty() {
            return Err(Error::Config("TTS base URL required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: format!("{base_url}/api/tts"),
            options,
        })
    }

    /// Request parameters sent with every call
    #[must_use]
    pub const fn options(&self) -> &SynthesisOptions {
        &self.options
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str, reference_id: &str) -> Result<AudioResource> {
        tracing::debug!(chars = text.len(), reference_id, "requesting synthesis");

        let request = TtsRequest {
            text,
            reference_id,
            options: &self.options,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "TTS request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "TTS API error");
            return Err(Error::Tts(format!("TTS error {status}: {body}")));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        let resource = AudioResource {
            data: response.bytes().await?,
            content_type,
        };
        if resource.is_empty() {
            return Err(Error::Tts("TTS returned an empty payload".to_string()));
        }

        tracing::debug!(bytes = resource.len(), "synthesis complete");
        Ok(resource)
    }
}
