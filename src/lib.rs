//! Ichigo Voice - Spoken chat client for sound-token assistants
//!
//! This library provides the core of the Ichigo voice client:
//! - Push-to-talk recording, tokenized into sound-token chat input
//! - Streaming chat with an OpenAI-compatible backend
//! - Chunking of the streamed reply, concurrent synthesis, and ordered playback
//! - A live spectrum feed for visualizers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Chat loop                        │
//! │   Recorder → /api/tokenize → input → chat backend     │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ assistant text (cumulative)
//! ┌────────────────────▼─────────────────────────────────┐
//! │                  Voice pipeline                       │
//! │   Chunker → /api/tts (concurrent) → Playback queue    │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ clips in index order
//! ┌────────────────────▼─────────────────────────────────┐
//! │            Playback engine → spectrum feed            │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod chat;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod voice;

pub use chat::{ChatBackend, ChatHistory, ChatInput, ChatMessage, OpenAiChat, Role};
pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{PipelineNotice, SynthesisJob, TurnController, VoicePipeline};
