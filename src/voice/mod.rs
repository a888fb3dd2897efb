//! Voice processing module
//!
//! Microphone capture and push-to-talk recording on the input side; chunking,
//! concurrent synthesis, ordered playback and the live spectrum on the output
//! side. Tokenization and synthesis are HTTP calls to the voice server.

mod capture;
mod chunker;
mod playback;
mod queue;
mod recorder;
mod spectrum;
mod stt;
mod tts;

pub use capture::{AudioCapture, AudioSource, SAMPLE_RATE, samples_to_wav};
pub use chunker::{ChunkState, PUNCTUATION, Plateau, is_punctuation};
pub use playback::{
    AudioSink, CpalSink, DecodedClip, PlaybackEngine, PlaybackOutcome, PlaybackReport,
    PlaybackState, SilentSink, SinkHandle, decode_wav, resample,
};
pub use queue::{Cursor, PlaybackQueue, PlaybackStep, ScheduledClip, SynthesisIndex, TurnId};
pub use recorder::{
    IDLE_BAR_HEIGHT, MicPermission, PushToTalk, Recorder, RecordingTick, TalkAction,
    TalkKeyState, waveform_bars,
};
pub use spectrum::{PLAYBACK_FFT_SIZE, RECORDING_FFT_SIZE, SpectrumAnalyzer, average};
pub use stt::{SOUND_SENTINEL, SpeechToText, Transcriber, is_sound_input, sound_input};
pub use tts::{AudioResource, Synthesizer, TextToSpeech};
