//! Audio playback engine
//!
//! [`PlaybackEngine`] owns the single clip that may be playing at any time.
//! Each clip goes `Idle → Loading → Playing → Ended`, or is cut short with
//! [`PlaybackEngine::stop`]. While a clip plays, its spectrum is sampled at
//! the current play position and the mean bin value is published for the
//! visualizer. The engine reports how each clip finished on a channel so the
//! caller can advance the ordered queue.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::queue::{ScheduledClip, SynthesisIndex, TurnId};
use super::spectrum::{PLAYBACK_FFT_SIZE, SpectrumAnalyzer, average};
use crate::{Error, Result};

/// How often the spectrum is sampled while playing (~60 fps)
const SAMPLE_INTERVAL: Duration = Duration::from_millis(16);

/// Decoded mono audio
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedClip {
    /// Clip length
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        #[allow(clippy::cast_precision_loss)]
        let secs = self.samples.len() as f64 / f64::from(self.sample_rate);
        Duration::from_secs_f64(secs)
    }
}

/// Output device abstraction
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Begin playing `clip`; playback stops when the handle is dropped
    ///
    /// Opening the device must not block the runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the output cannot be opened
    async fn start(&self, clip: Arc<DecodedClip>) -> Result<Box<dyn SinkHandle>>;
}

/// A clip being played by an [`AudioSink`]
pub trait SinkHandle: Send {
    /// Frames of the clip played so far
    fn position(&self) -> usize;

    /// Whether the whole clip has been played
    fn is_finished(&self) -> bool;
}

/// Lifecycle of the current clip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Ended,
    Stopped,
}

impl PlaybackState {
    /// Whether audio is loading or audible
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Loading | Self::Playing)
    }
}

/// How a clip finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Ended,
    Failed(String),
}

/// Sent once per clip that was not stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackReport {
    pub turn: TurnId,
    pub index: SynthesisIndex,
    pub outcome: PlaybackOutcome,
}

struct ActivePlayback {
    turn: TurnId,
    index: SynthesisIndex,
    task: JoinHandle<()>,
}

/// Plays one clip at a time and publishes its live spectrum
pub struct PlaybackEngine {
    sink: Arc<dyn AudioSink>,
    state: Arc<watch::Sender<PlaybackState>>,
    frequency: Arc<watch::Sender<f32>>,
    reports: mpsc::UnboundedSender<PlaybackReport>,
    current: Option<ActivePlayback>,
}

impl PlaybackEngine {
    /// Create an engine playing through `sink`, reporting on `reports`
    #[must_use]
    pub fn new(sink: Arc<dyn AudioSink>, reports: mpsc::UnboundedSender<PlaybackReport>) -> Self {
        let (state, _) = watch::channel(PlaybackState::Idle);
        let (frequency, _) = watch::channel(0.0);
        Self {
            sink,
            state: Arc::new(state),
            frequency: Arc::new(frequency),
            reports,
            current: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }

    /// Live mean spectrum value of the playing clip (the visualizer feed)
    #[must_use]
    pub fn subscribe_frequency(&self) -> watch::Receiver<f32> {
        self.frequency.subscribe()
    }

    /// Turn and index of the clip owned by the engine
    #[must_use]
    pub fn current(&self) -> Option<(TurnId, SynthesisIndex)> {
        self.current.as_ref().map(|a| (a.turn, a.index))
    }

    /// Start playing `clip`, replacing anything already playing
    pub fn play(&mut self, clip: ScheduledClip) {
        if self.current.is_some() {
            self.stop();
        }

        let ScheduledClip {
            turn,
            index,
            resource,
        } = clip;
        tracing::debug!(%turn, index, bytes = resource.len(), "loading clip");
        self.state.send_replace(PlaybackState::Loading);

        let sink = Arc::clone(&self.sink);
        let state = Arc::clone(&self.state);
        let frequency = Arc::clone(&self.frequency);
        let reports = self.reports.clone();

        let task = tokio::spawn(async move {
            let outcome = match play_clip(sink.as_ref(), &resource.data, &state, &frequency).await {
                Ok(()) => {
                    state.send_replace(PlaybackState::Ended);
                    PlaybackOutcome::Ended
                }
                Err(e) => {
                    tracing::warn!(%turn, index, error = %e, "clip playback failed");
                    state.send_replace(PlaybackState::Idle);
                    PlaybackOutcome::Failed(e.to_string())
                }
            };
            frequency.send_replace(0.0);

            if reports
                .send(PlaybackReport {
                    turn,
                    index,
                    outcome,
                })
                .is_err()
            {
                tracing::debug!("playback report dropped; pipeline gone");
            }
        });

        self.current = Some(ActivePlayback { turn, index, task });
    }

    /// Force-stop the current clip; no report is sent for it
    ///
    /// Returns `true` if something was playing.
    pub fn stop(&mut self) -> bool {
        let Some(active) = self.current.take() else {
            return false;
        };

        active.task.abort();
        self.state.send_replace(PlaybackState::Stopped);
        self.frequency.send_replace(0.0);
        self.state.send_replace(PlaybackState::Idle);

        tracing::debug!(turn = %active.turn, index = active.index, "playback stopped");
        true
    }

    /// Forget a clip whose report has been handled
    pub fn release(&mut self, turn: TurnId, index: SynthesisIndex) {
        if self.current() == Some((turn, index)) {
            self.current = None;
            self.state.send_replace(PlaybackState::Idle);
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        if let Some(active) = self.current.take() {
            active.task.abort();
        }
    }
}

/// Decode, play to completion, and publish spectrum samples along the way
async fn play_clip(
    sink: &dyn AudioSink,
    data: &[u8],
    state: &watch::Sender<PlaybackState>,
    frequency: &watch::Sender<f32>,
) -> Result<()> {
    let clip = Arc::new(decode_wav(data)?);
    let handle = sink.start(Arc::clone(&clip)).await?;
    state.send_replace(PlaybackState::Playing);

    let analyzer = SpectrumAnalyzer::new(PLAYBACK_FFT_SIZE);
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);

    loop {
        ticker.tick().await;
        if handle.is_finished() {
            break;
        }

        let bins = analyzer.frequency_data_at(&clip.samples, handle.position());
        if bins.iter().any(|&b| b > 0) {
            frequency.send_replace(average(&bins));
        }
    }

    tracing::debug!(samples = clip.samples.len(), "clip playback complete");
    Ok(())
}

/// Decode WAV bytes into mono f32 samples
///
/// # Errors
///
/// Returns `Error::Decode` if the payload is not a readable WAV file
pub fn decode_wav(data: &[u8]) -> Result<DecodedClip> {
    let reader =
        hound::WavReader::new(Cursor::new(data)).map_err(|e| Error::Decode(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Decode(e.to_string()))?,
        hound::SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let full_scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| {
                    #[allow(clippy::cast_precision_loss)]
                    s.map(|v| v as f32 / full_scale)
                })
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Decode(e.to_string()))?
        }
    };

    #[allow(clippy::cast_precision_loss)]
    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok(DecodedClip {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Plays clips in real time without an output device
///
/// Used when audio devices are disabled; the pipeline still runs with
/// realistic timing and the visualizer feed still moves.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSink;

struct SilentHandle {
    started: tokio::time::Instant,
    sample_rate: u32,
    frames: usize,
}

#[async_trait]
impl AudioSink for SilentSink {
    async fn start(&self, clip: Arc<DecodedClip>) -> Result<Box<dyn SinkHandle>> {
        Ok(Box::new(SilentHandle {
            started: tokio::time::Instant::now(),
            sample_rate: clip.sample_rate,
            frames: clip.samples.len(),
        }))
    }
}

impl SinkHandle for SilentHandle {
    fn position(&self) -> usize {
        let elapsed = self.started.elapsed().as_secs_f64();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let played = (elapsed * f64::from(self.sample_rate)) as usize;
        played.min(self.frames)
    }

    fn is_finished(&self) -> bool {
        self.position() >= self.frames
    }
}

/// Plays clips on the default output device
///
/// The cpal stream lives on its own thread so the handle can be sent
/// between tasks.
pub struct CpalSink {
    device_name: String,
}

impl CpalSink {
    /// Check that an output device exists
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;
        let device_name = device.name().unwrap_or_default();

        tracing::debug!(device = %device_name, "audio playback initialized");
        Ok(Self { device_name })
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

struct PlayState {
    position: AtomicUsize,
    finished: AtomicBool,
    stop: AtomicBool,
}

struct CpalHandle {
    state: Arc<PlayState>,
    /// Output frames per clip frame
    ratio: f64,
    frames: usize,
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn start(&self, clip: Arc<DecodedClip>) -> Result<Box<dyn SinkHandle>> {
        let state = Arc::new(PlayState {
            position: AtomicUsize::new(0),
            finished: AtomicBool::new(clip.samples.is_empty()),
            stop: AtomicBool::new(false),
        });
        let frames = clip.samples.len();
        let clip_rate = clip.sample_rate;
        let (ready_tx, ready_rx) = oneshot::channel::<Result<u32>>();

        let thread_state = Arc::clone(&state);
        std::thread::spawn(move || match open_output(&clip, &thread_state) {
            Ok((stream, rate)) => {
                let _ = ready_tx.send(Ok(rate));
                while !thread_state.stop.load(Ordering::Relaxed)
                    && !thread_state.finished.load(Ordering::Relaxed)
                {
                    std::thread::sleep(Duration::from_millis(20));
                }
                // Let the device drain its last buffer
                if !thread_state.stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(100));
                }
                drop(stream);
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        });

        let rate = ready_rx
            .await
            .map_err(|_| Error::Audio("playback thread exited".to_string()))??;
        let ratio = if clip_rate == 0 {
            1.0
        } else {
            f64::from(rate) / f64::from(clip_rate)
        };

        Ok(Box::new(CpalHandle {
            state,
            ratio,
            frames,
        }))
    }
}

impl SinkHandle for CpalHandle {
    fn position(&self) -> usize {
        let out = self.state.position.load(Ordering::Relaxed);
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let frame = (out as f64 / self.ratio) as usize;
        frame.min(self.frames)
    }

    fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Relaxed)
    }
}

impl Drop for CpalHandle {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::Relaxed);
    }
}

/// Open an output stream for `clip`, resampling if the device can't match its rate
fn open_output(clip: &DecodedClip, state: &Arc<PlayState>) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let rate = SampleRate(clip.sample_rate);
    let matching = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .min_by_key(|c| c.channels())
        .map(|c| c.with_sample_rate(rate).config());

    let (config, samples): (StreamConfig, Vec<f32>) = if let Some(config) = matching {
        (config, clip.samples.clone())
    } else {
        let config = device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?
            .config();
        let resampled = resample(&clip.samples, clip.sample_rate, config.sample_rate.0)?;
        (config, resampled)
    };

    let channels = usize::from(config.channels);
    let out_rate = config.sample_rate.0;
    let callback_state = Arc::clone(state);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut pos = callback_state.position.load(Ordering::Relaxed);
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(pos).copied().unwrap_or(0.0);
                    frame.fill(sample);
                    if pos < samples.len() {
                        pos += 1;
                    }
                }
                callback_state.position.store(pos, Ordering::Relaxed);
                if pos >= samples.len() {
                    callback_state.finished.store(true, Ordering::Relaxed);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    tracing::debug!(sample_rate = out_rate, channels, "output stream started");
    Ok((stream, out_rate))
}

/// Input frames per resampler pass
const RESAMPLE_CHUNK: usize = 1024;

/// Resample mono audio with rubato's FFT resampler
///
/// The output has exactly `len * to / from` frames; the resampler's delay is
/// trimmed and the last partial chunk is zero-padded.
///
/// # Errors
///
/// Returns `Error::Audio` if the resampler cannot handle these rates
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f64>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let expected = (samples.len() as f64 * f64::from(to) / f64::from(from)).round() as usize;
    let delay = resampler.output_delay();
    let mut output: Vec<f32> = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut pass = |frames: Vec<f64>, output: &mut Vec<f32>| -> Result<()> {
        let result = resampler
            .process(&[frames], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend(result[0].iter().map(|&s| s as f32));
        Ok(())
    };

    for chunk in samples.chunks(RESAMPLE_CHUNK) {
        let mut frames: Vec<f64> = chunk.iter().map(|&s| f64::from(s)).collect();
        frames.resize(RESAMPLE_CHUNK, 0.0);
        pass(frames, &mut output)?;
    }
    while output.len() < expected + delay {
        pass(vec![0.0; RESAMPLE_CHUNK], &mut output)?;
    }

    Ok(output.into_iter().skip(delay).take(expected).collect())
}
