//! TOML configuration file loading
//!
//! Supports `~/.config/ichigo/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct IchigoConfigFile {
    /// Speech service configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Constant parameters sent with every synthesis request
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Text chunking thresholds
    #[serde(default)]
    pub chunker: ChunkerFileConfig,

    /// Recording limits
    #[serde(default)]
    pub recording: RecordingFileConfig,

    /// Chat backend configuration
    #[serde(default)]
    pub chat: ChatFileConfig,
}

/// Speech service configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Enable audio devices
    pub enabled: Option<bool>,

    /// Base URL serving `/api/tts` and `/api/tokenize`
    pub api_url: Option<String>,

    /// Fixed `reference_id` for synthesis (defaults to the message id)
    pub tts_reference_id: Option<String>,

    /// Maximum in-flight synthesis requests (0 = unbounded)
    pub tts_concurrency: Option<usize>,
}

/// Synthesis request parameters
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    pub normalize: Option<bool>,
    pub format: Option<String>,
    pub latency: Option<String>,
    pub max_new_tokens: Option<u32>,
    pub chunk_length: Option<u32>,
    pub repetition_penalty: Option<f32>,
}

/// Chunk plateau configuration
#[derive(Debug, Default, Deserialize)]
pub struct ChunkerFileConfig {
    pub opening: Option<usize>,
    pub warm: Option<usize>,
    pub steady: Option<usize>,
    pub early_flush_ceiling: Option<usize>,
}

/// Recording configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecordingFileConfig {
    /// Recording ceiling in seconds
    pub max_duration_secs: Option<u32>,

    /// Push-to-talk long press threshold in milliseconds
    pub long_press_ms: Option<u64>,

    /// Number of live waveform bars
    pub waveform_bars: Option<usize>,
}

/// Chat backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct ChatFileConfig {
    /// OpenAI-compatible base URL
    pub url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
}

/// Default config file location (`~/.config/ichigo/config.toml` on Linux)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("ai", "homebrew", "ichigo")
        .map(|d| d.config_dir().join("config.toml"))
}

/// Load a config file, returning `None` if it does not exist
///
/// # Errors
///
/// Returns error if the file exists but cannot be read or parsed
pub fn load_config_file(path: &Path) -> Result<Option<IchigoConfigFile>> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file");
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)?;
    let file: IchigoConfigFile = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(Some(file))
}
