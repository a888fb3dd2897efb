//! Shared test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ichigo_voice::voice::{
    AudioResource, AudioSink, DecodedClip, SAMPLE_RATE, SilentSink, SinkHandle, Synthesizer,
    samples_to_wav,
};
use ichigo_voice::{Error, Result};

/// Sample rate of synthesized test clips
pub const CLIP_RATE: u32 = 8_000;

/// Samples per character of synthesized text, so clips can be told apart
pub const SAMPLES_PER_CHAR: usize = 100;

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// WAV whose length identifies the text it was made for
#[allow(clippy::cast_precision_loss)]
pub fn clip_for(text: &str) -> Vec<u8> {
    let len = text.chars().count() * SAMPLES_PER_CHAR;
    let samples: Vec<f32> = (0..len)
        .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / CLIP_RATE as f32).sin())
        .collect();
    samples_to_wav(&samples, CLIP_RATE).expect("encode test clip")
}

#[derive(Clone)]
enum Script {
    Delay(Duration),
    Fail(Duration),
    Garbage(Duration),
}

/// Synthesizer with per-text latency and failures
#[derive(Default)]
pub struct ScriptedSynthesizer {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedSynthesizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Respond to `text` after `delay`
    pub fn delay(&self, text: &str, delay: Duration) {
        self.scripts
            .lock()
            .unwrap()
            .insert(text.to_string(), Script::Delay(delay));
    }

    /// Fail `text` after `delay`
    pub fn fail(&self, text: &str, delay: Duration) {
        self.scripts
            .lock()
            .unwrap()
            .insert(text.to_string(), Script::Fail(delay));
    }

    /// Return bytes that are not audio for `text`
    pub fn garbage(&self, text: &str, delay: Duration) {
        self.scripts
            .lock()
            .unwrap()
            .insert(text.to_string(), Script::Garbage(delay));
    }

    /// `(text, reference_id)` of every request, in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, text: &str, reference_id: &str) -> Result<AudioResource> {
        self.calls
            .lock()
            .unwrap()
            .push((text.to_string(), reference_id.to_string()));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(text)
            .cloned()
            .unwrap_or(Script::Delay(Duration::from_millis(10)));

        match script {
            Script::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(AudioResource::wav(clip_for(text)))
            }
            Script::Fail(delay) => {
                tokio::time::sleep(delay).await;
                Err(Error::Tts("TTS error 500: scripted failure".to_string()))
            }
            Script::Garbage(delay) => {
                tokio::time::sleep(delay).await;
                Ok(AudioResource::wav(b"definitely not a wav".to_vec()))
            }
        }
    }
}

/// Silent sink that logs the length of every clip it starts
#[derive(Default)]
pub struct RecordingSink {
    started: Mutex<Vec<usize>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sample counts of started clips, in start order
    pub fn started(&self) -> Vec<usize> {
        self.started.lock().unwrap().clone()
    }

    /// Texts of started clips, given the candidate texts
    pub fn started_texts<'a>(&self, candidates: &[&'a str]) -> Vec<&'a str> {
        self.started()
            .into_iter()
            .filter_map(|len| {
                candidates
                    .iter()
                    .find(|t| t.chars().count() * SAMPLES_PER_CHAR == len)
                    .copied()
            })
            .collect()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn start(&self, clip: Arc<DecodedClip>) -> Result<Box<dyn SinkHandle>> {
        self.started.lock().unwrap().push(clip.samples.len());
        SilentSink.start(clip).await
    }
}
