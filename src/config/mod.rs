//! Configuration management for the Ichigo voice client

pub mod file;

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{Error, Result};

use self::file::IchigoConfigFile;

/// Ichigo client configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Speech service configuration
    pub voice: VoiceConfig,

    /// Parameters sent with every synthesis request
    pub synthesis: SynthesisOptions,

    /// Text chunking thresholds
    pub chunker: ChunkerConfig,

    /// Recording limits and push-to-talk timing
    pub recording: RecordingConfig,

    /// Chat backend configuration
    pub chat: ChatConfig,
}

/// Speech service configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Enable audio devices (microphone and speakers)
    pub enabled: bool,

    /// Base URL serving `/api/tts` and `/api/tokenize`
    pub api_base_url: String,

    /// Fixed `reference_id` for synthesis; the assistant message id is used when unset
    pub tts_reference_id: Option<String>,

    /// Maximum in-flight synthesis requests; `None` means unbounded
    pub tts_concurrency: Option<usize>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base_url: "http://localhost:3000".to_string(),
            tts_reference_id: None,
            tts_concurrency: None,
        }
    }
}

/// Constant synthesis parameters, serialized into the `/api/tts` body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisOptions {
    pub normalize: bool,
    pub format: String,
    pub latency: String,
    pub max_new_tokens: u32,
    pub chunk_length: u32,
    pub repetition_penalty: f32,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            normalize: true,
            format: "wav".to_string(),
            latency: "balanced".to_string(),
            max_new_tokens: 2048,
            chunk_length: 200,
            repetition_penalty: 1.5,
        }
    }
}

/// Chunk size plateaus, in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Threshold before the first flush
    pub opening: usize,

    /// Threshold after the first (punctuation) flush
    pub warm: usize,

    /// Threshold once the stream is established
    pub steady: usize,

    /// Punctuation only triggers an early flush below this many characters
    pub early_flush_ceiling: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            opening: 10,
            warm: 60,
            steady: 400,
            early_flush_ceiling: 60,
        }
    }
}

/// Recording configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingConfig {
    /// Recording ceiling in seconds; recording auto-stops and submits here
    pub max_duration_secs: u32,

    /// How long the talk key must be held before recording starts
    pub long_press_ms: u64,

    /// Number of live waveform bars
    pub waveform_bars: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 10,
            long_press_ms: 300,
            waveform_bars: 6,
        }
    }
}

/// Chat backend configuration (OpenAI-compatible)
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            model: "homebrewltd/llama3.1-s-instruct-v0.2".to_string(),
            api_key: None,
            system_prompt: None,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the config file, then environment
    ///
    /// The file path comes from `ICHIGO_CONFIG` or the platform config dir.
    ///
    /// # Errors
    ///
    /// Returns error if the config file is malformed or values are invalid
    pub fn load() -> Result<Self> {
        let path = std::env::var("ICHIGO_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(file::default_config_path);
        Self::load_from(path.as_deref(), |key| std::env::var(key).ok())
    }

    /// Load configuration with an explicit file path and environment source
    ///
    /// # Errors
    ///
    /// Returns error if the config file is malformed or values are invalid
    pub fn load_from<F>(path: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = path {
            if let Some(file) = file::load_config_file(path)? {
                config.apply_file(file);
            }
        }

        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    /// Overlay values present in a config file
    pub fn apply_file(&mut self, file: IchigoConfigFile) {
        let voice = file.voice;
        if let Some(enabled) = voice.enabled {
            self.voice.enabled = enabled;
        }
        if let Some(url) = voice.api_url {
            self.voice.api_base_url = url;
        }
        if voice.tts_reference_id.is_some() {
            self.voice.tts_reference_id = voice.tts_reference_id;
        }
        if let Some(n) = voice.tts_concurrency {
            self.voice.tts_concurrency = (n > 0).then_some(n);
        }

        let synthesis = file.synthesis;
        if let Some(v) = synthesis.normalize {
            self.synthesis.normalize = v;
        }
        if let Some(v) = synthesis.format {
            self.synthesis.format = v;
        }
        if let Some(v) = synthesis.latency {
            self.synthesis.latency = v;
        }
        if let Some(v) = synthesis.max_new_tokens {
            self.synthesis.max_new_tokens = v;
        }
        if let Some(v) = synthesis.chunk_length {
            self.synthesis.chunk_length = v;
        }
        if let Some(v) = synthesis.repetition_penalty {
            self.synthesis.repetition_penalty = v;
        }

        let chunker = file.chunker;
        if let Some(v) = chunker.opening {
            self.chunker.opening = v;
        }
        if let Some(v) = chunker.warm {
            self.chunker.warm = v;
        }
        if let Some(v) = chunker.steady {
            self.chunker.steady = v;
        }
        if let Some(v) = chunker.early_flush_ceiling {
            self.chunker.early_flush_ceiling = v;
        }

        let recording = file.recording;
        if let Some(v) = recording.max_duration_secs {
            self.recording.max_duration_secs = v;
        }
        if let Some(v) = recording.long_press_ms {
            self.recording.long_press_ms = v;
        }
        if let Some(v) = recording.waveform_bars {
            self.recording.waveform_bars = v;
        }

        let chat = file.chat;
        if let Some(v) = chat.url {
            self.chat.base_url = v;
        }
        if let Some(v) = chat.model {
            self.chat.model = v;
        }
        if chat.api_key.is_some() {
            self.chat.api_key = chat.api_key;
        }
        if chat.system_prompt.is_some() {
            self.chat.system_prompt = chat.system_prompt;
        }
    }

    /// Overlay values from environment variables
    pub fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = env("ICHIGO_API_URL") {
            self.voice.api_base_url = url;
        }
        if let Some(id) = env("ICHIGO_TTS_REFERENCE_ID") {
            self.voice.tts_reference_id = Some(id);
        }
        if let Some(n) = env("ICHIGO_TTS_CONCURRENCY").and_then(|s| s.parse::<usize>().ok()) {
            self.voice.tts_concurrency = (n > 0).then_some(n);
        }
        if let Some(v) = env("ICHIGO_DISABLE_VOICE") {
            if v == "1" || v.eq_ignore_ascii_case("true") {
                self.voice.enabled = false;
            }
        }
        if let Some(secs) = env("ICHIGO_MAX_RECORDING_SECS").and_then(|s| s.parse().ok()) {
            self.recording.max_duration_secs = secs;
        }
        if let Some(url) = env("ICHIGO_CHAT_URL") {
            self.chat.base_url = url;
        }
        if let Some(model) = env("ICHIGO_CHAT_MODEL") {
            self.chat.model = model;
        }
        if let Some(key) = env("ICHIGO_CHAT_API_KEY") {
            self.chat.api_key = Some(key);
        }
    }

    /// Check that the configured values are usable
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.voice.api_base_url.trim().is_empty() {
            return Err(Error::Config("speech API URL is empty".to_string()));
        }
        if self.chat.base_url.trim().is_empty() {
            return Err(Error::Config("chat URL is empty".to_string()));
        }

        let c = self.chunker;
        if c.opening == 0 {
            return Err(Error::Config("chunker opening plateau must be positive".to_string()));
        }
        if !(c.opening < c.warm && c.warm < c.steady) {
            return Err(Error::Config(format!(
                "chunker plateaus must increase: {} < {} < {}",
                c.opening, c.warm, c.steady
            )));
        }
        if c.early_flush_ceiling < c.opening {
            return Err(Error::Config(
                "early flush ceiling must not be below the opening plateau".to_string(),
            ));
        }

        if self.recording.max_duration_secs == 0 {
            return Err(Error::Config("recording ceiling must be positive".to_string()));
        }

        Ok(())
    }
}
