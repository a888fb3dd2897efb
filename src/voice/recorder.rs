//! Push-to-talk recording
//!
//! [`PushToTalk`] turns talk-key presses into start/stop decisions and
//! [`Recorder`] owns one microphone session: it enforces the recording
//! ceiling, drives the live waveform bars, and on stop hands the WAV to the
//! tokenizer to produce sound-token chat input.

use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::capture::{AudioSource, samples_to_wav};
use super::spectrum::{RECORDING_FFT_SIZE, SpectrumAnalyzer};
use super::stt::{Transcriber, sound_input};
use crate::config::RecordingConfig;
use crate::{Error, Result};

/// Bar height shown while not recording
pub const IDLE_BAR_HEIGHT: f32 = 10.0;

/// Microphone permission as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MicPermission {
    Granted,
    Denied,
    #[default]
    Prompt,
}

/// Talk key handling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TalkKeyState {
    Idle,
    /// Key is down; recording starts once the long-press threshold passes
    ArmedForLongPress { since: Instant },
    /// Long press fired and started a recording
    Recording,
    /// Long press fired but did not start a recording
    Held,
}

/// What the caller should do with the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TalkAction {
    StartRecording,
    StopRecording,
}

/// Long-press talk key state machine
#[derive(Debug)]
pub struct PushToTalk {
    state: TalkKeyState,
    long_press: Duration,
}

impl PushToTalk {
    #[must_use]
    pub const fn new(long_press: Duration) -> Self {
        Self {
            state: TalkKeyState::Idle,
            long_press,
        }
    }

    #[must_use]
    pub const fn state(&self) -> TalkKeyState {
        self.state
    }

    /// The talk key went down (or is auto-repeating)
    pub fn press(&mut self, now: Instant) {
        if self.state == TalkKeyState::Idle {
            self.state = TalkKeyState::ArmedForLongPress { since: now };
        }
    }

    /// Check whether the long press has fired
    ///
    /// A fired press toggles recording unless the assistant is busy.
    pub fn poll(&mut self, now: Instant, busy: bool, recording: bool) -> Option<TalkAction> {
        let TalkKeyState::ArmedForLongPress { since } = self.state else {
            return None;
        };
        if now.duration_since(since) < self.long_press {
            return None;
        }

        if busy {
            self.state = TalkKeyState::Held;
            return None;
        }
        if recording {
            self.state = TalkKeyState::Held;
            Some(TalkAction::StopRecording)
        } else {
            self.state = TalkKeyState::Recording;
            Some(TalkAction::StartRecording)
        }
    }

    /// The talk key went up; any recording stops
    pub fn release(&mut self, recording: bool) -> Option<TalkAction> {
        self.state = TalkKeyState::Idle;
        recording.then_some(TalkAction::StopRecording)
    }
}

/// Result of one recording timer tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingTick {
    /// Not recording
    Inactive,
    /// Seconds recorded so far
    Elapsed(u32),
    /// The ceiling was reached; stop and submit now
    CeilingReached,
}

/// One microphone, recorded with a time ceiling
pub struct Recorder<S: AudioSource> {
    source: S,
    config: RecordingConfig,
    permission: MicPermission,
    recording: bool,
    elapsed_secs: u32,
    analyzer: SpectrumAnalyzer,
    bars: watch::Sender<Vec<f32>>,
}

impl<S: AudioSource> Recorder<S> {
    #[must_use]
    pub fn new(source: S, config: RecordingConfig, permission: MicPermission) -> Self {
        let (bars, _) = watch::channel(vec![IDLE_BAR_HEIGHT; config.waveform_bars]);
        Self {
            source,
            config,
            permission,
            recording: false,
            elapsed_secs: 0,
            analyzer: SpectrumAnalyzer::new(RECORDING_FFT_SIZE),
            bars,
        }
    }

    #[must_use]
    pub const fn permission(&self) -> MicPermission {
        self.permission
    }

    /// Update the permission; losing it mid-recording discards the recording
    pub fn set_permission(&mut self, permission: MicPermission) {
        self.permission = permission;
        if permission != MicPermission::Granted && self.recording {
            tracing::warn!("microphone permission revoked while recording");
            self.stop_capture();
            drop(self.source.take_buffer());
        }
    }

    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.recording
    }

    #[must_use]
    pub const fn elapsed_secs(&self) -> u32 {
        self.elapsed_secs
    }

    #[must_use]
    pub const fn max_duration_secs(&self) -> u32 {
        self.config.max_duration_secs
    }

    /// Live waveform bar heights (0..=100)
    #[must_use]
    pub fn subscribe_waveform(&self) -> watch::Receiver<Vec<f32>> {
        self.bars.subscribe()
    }

    /// Begin recording
    ///
    /// # Errors
    ///
    /// Returns `Error::Permission` unless microphone access is granted, or
    /// the source's error if it cannot start
    pub fn start(&mut self) -> Result<()> {
        if self.permission != MicPermission::Granted {
            return Err(Error::Permission(format!(
                "microphone permission is {:?}",
                self.permission
            )));
        }
        if self.recording {
            return Ok(());
        }

        drop(self.source.take_buffer());
        if let Err(e) = self.source.start() {
            if matches!(e, Error::Permission(_)) {
                self.permission = MicPermission::Denied;
            }
            return Err(e);
        }

        self.recording = true;
        self.elapsed_secs = 0;
        tracing::info!(max_secs = self.config.max_duration_secs, "recording started");
        Ok(())
    }

    /// Advance the one-second recording timer
    pub fn tick(&mut self) -> RecordingTick {
        if !self.recording {
            return RecordingTick::Inactive;
        }
        if self.elapsed_secs < self.config.max_duration_secs {
            self.elapsed_secs += 1;
        }
        if self.elapsed_secs >= self.config.max_duration_secs {
            tracing::info!(secs = self.elapsed_secs, "recording ceiling reached");
            RecordingTick::CeilingReached
        } else {
            RecordingTick::Elapsed(self.elapsed_secs)
        }
    }

    /// Recompute the waveform bars from the most recent audio
    pub fn refresh_waveform(&self) -> Vec<f32> {
        if !self.recording {
            return self.bars.borrow().clone();
        }
        let recent = self.source.recent(RECORDING_FFT_SIZE);
        let bins = self.analyzer.frequency_data(&recent);
        let heights = waveform_bars(&bins, self.config.waveform_bars);
        self.bars.send_replace(heights.clone());
        heights
    }

    /// Stop recording and encode what was captured as WAV
    ///
    /// Returns `None` if nothing was being recorded.
    ///
    /// # Errors
    ///
    /// Returns error if no audio was captured or encoding fails
    pub fn stop(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.recording {
            return Ok(None);
        }
        self.stop_capture();

        let samples = self.source.take_buffer();
        if samples.is_empty() {
            return Err(Error::Audio("no audio captured".to_string()));
        }

        #[allow(clippy::cast_precision_loss)]
        let secs = samples.len() as f32 / self.source.sample_rate() as f32;
        tracing::info!(samples = samples.len(), secs, "recording stopped");
        samples_to_wav(&samples, self.source.sample_rate()).map(Some)
    }

    /// Stop recording and tokenize it into chat input
    ///
    /// On success the returned input starts with the sound sentinel.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the tokenizer call fails; no input is produced
    pub async fn finish<T>(&mut self, transcriber: &T) -> Result<Option<String>>
    where
        T: Transcriber + ?Sized,
    {
        let Some(wav) = self.stop()? else {
            return Ok(None);
        };
        let tokens = transcriber.tokenize(&wav).await?;
        Ok(Some(sound_input(&tokens)))
    }

    fn stop_capture(&mut self) {
        self.source.stop();
        self.recording = false;
        self.bars
            .send_replace(vec![IDLE_BAR_HEIGHT; self.config.waveform_bars]);
    }
}

/// Bar heights (0..=100) for the first `count` frequency bins
#[must_use]
pub fn waveform_bars(bins: &[u8], count: usize) -> Vec<f32> {
    (0..count)
        .map(|i| bins.get(i).map_or(0.0, |&v| f32::from(v) / 255.0 * 100.0))
        .collect()
}
