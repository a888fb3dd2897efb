use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use ichigo_voice::voice::{
    AudioCapture, AudioResource, AudioSink, AudioSource, CpalSink, MicPermission,
    PlaybackEngine, PlaybackOutcome, PushToTalk, RECORDING_FFT_SIZE, Recorder, RecordingTick,
    SAMPLE_RATE, ScheduledClip, SilentSink, SpectrumAnalyzer, SpeechToText, Synthesizer,
    TalkAction, TextToSpeech, Transcriber, TurnId, decode_wav, resample, samples_to_wav,
    sound_input, waveform_bars,
};
use ichigo_voice::{
    ChatBackend, ChatHistory, ChatInput, Config, Error, OpenAiChat, PipelineNotice, VoicePipeline,
};

/// Ichigo - talk to a sound-token assistant from the terminal
#[derive(Parser)]
#[command(name = "ichigo", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable audio devices (replies are still synthesized and timed)
    #[arg(long, env = "ICHIGO_DISABLE_VOICE")]
    disable_voice: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Interactive chat (default)
    Chat,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Tokenize a WAV file into sound-token input
    Transcribe {
        /// WAV file to send
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,ichigo_voice=info",
        1 => "info,ichigo_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if cli.disable_voice {
        config.voice.enabled = false;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => chat(config).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker(&config).await,
        Command::TestTts { text } => test_tts(&config, &text).await,
        Command::Transcribe { file } => transcribe(&config, &file).await,
    }
}

/// Speakers if available, otherwise silent real-time playback
fn output_sink(enabled: bool) -> Arc<dyn AudioSink> {
    if !enabled {
        tracing::info!("voice disabled; playing replies silently");
        return Arc::new(SilentSink);
    }
    match CpalSink::new() {
        Ok(sink) => {
            tracing::info!(device = sink.device_name(), "audio output ready");
            Arc::new(sink)
        }
        Err(e) => {
            tracing::warn!(error = %e, "no audio output; playing replies silently");
            Arc::new(SilentSink)
        }
    }
}

/// Forward stdin lines so they can be awaited alongside other events
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Interactive chat loop
#[allow(clippy::future_not_send)]
async fn chat(config: Config) -> anyhow::Result<()> {
    let tts = TextToSpeech::new(&config.voice.api_base_url, config.synthesis.clone())?;
    let stt = SpeechToText::new(&config.voice.api_base_url)?;
    let backend = OpenAiChat::new(&config.chat)?;
    let pipeline = VoicePipeline::spawn(Arc::new(tts), output_sink(config.voice.enabled), &config);

    let mut notices = pipeline.subscribe();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                PipelineNotice::SynthesisFailed { index, .. } => {
                    tracing::warn!(index, "a part of the reply could not be spoken");
                }
                other => tracing::debug!(?other, "pipeline"),
            }
        }
    });

    let mut recorder = if config.voice.enabled {
        match AudioCapture::new() {
            Ok(capture) => Some(Recorder::new(capture, config.recording, MicPermission::Granted)),
            Err(e) => {
                tracing::warn!(error = %e, "microphone unavailable; recording disabled");
                None
            }
        }
    } else {
        None
    };

    let mut lines = stdin_lines();
    let mut history = ChatHistory::new();
    let mut input = ChatInput::new();

    println!("Type a message, /record to talk, /stop to silence the reply, /quit to exit.");
    loop {
        prompt();
        let Some(line) = lines.recv().await else {
            break;
        };

        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/stop" => pipeline.stop_audio().await?,
            "/history" => {
                for message in history.messages() {
                    println!("{:?}: {}", message.role, message.display_text());
                }
            }
            "/record" => {
                let Some(recorder) = recorder.as_mut() else {
                    println!("Recording is unavailable (no microphone access).");
                    continue;
                };
                let long_press = Duration::from_millis(config.recording.long_press_ms);
                match record(recorder, &stt, &pipeline, &mut lines, long_press).await {
                    Ok(Some(tokens)) => {
                        if input.set_audio(tokens) {
                            println!("{}", input.masked());
                            send_turn(&mut history, &mut input, &backend, &pipeline, &mut lines)
                                .await?;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "recording failed");
                        println!("Recording failed: {e}");
                    }
                }
            }
            text => {
                input.set_typed(text);
                send_turn(&mut history, &mut input, &backend, &pipeline, &mut lines).await?;
            }
        }
    }

    pipeline.stop_audio().await?;
    Ok(())
}

/// Submit the input and stream the reply into the voice pipeline
///
/// `/stop` typed while the reply streams silences it; the text keeps coming.
/// Anything else typed meanwhile is dropped with a hint.
#[allow(clippy::future_not_send)]
async fn send_turn(
    history: &mut ChatHistory,
    input: &mut ChatInput,
    backend: &dyn ChatBackend,
    pipeline: &VoicePipeline,
    lines: &mut mpsc::Receiver<String>,
) -> anyhow::Result<()> {
    if input.is_blank() {
        return Ok(());
    }
    history.push_user(input.take());
    pipeline.submit().await?;

    let mut stream = match backend.stream_reply(history.messages()).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "chat request failed");
            println!("Chat failed: {e}");
            pipeline.assistant_finished().await?;
            return Ok(());
        }
    };

    let reply_id = history.begin_assistant();
    let message_id = reply_id.to_string();
    loop {
        tokio::select! {
            delta = stream.next() => match delta {
                Some(Ok(delta)) => {
                    print!("{delta}");
                    let _ = std::io::stdout().flush();
                    if let Some(content) = history.append_assistant(reply_id, &delta) {
                        pipeline.assistant_update(&message_id, content).await?;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "reply stream failed");
                    break;
                }
                None => break,
            },
            line = lines.recv() => {
                let Some(line) = line else { break };
                match StreamingLine::parse(&line) {
                    StreamingLine::Stop => pipeline.stop_audio().await?,
                    StreamingLine::Blank => {}
                    StreamingLine::Ignored(text) => {
                        tracing::debug!(line = text, "input ignored while reply streams");
                        println!("\n{}", StreamingLine::hint(text));
                    }
                }
            }
        }
    }
    println!();

    pipeline.assistant_finished().await?;
    history.discard_if_empty(reply_id);
    Ok(())
}

/// A line typed while a reply is streaming
#[derive(Debug, PartialEq, Eq)]
enum StreamingLine<'a> {
    Stop,
    Blank,
    Ignored(&'a str),
}

impl<'a> StreamingLine<'a> {
    fn parse(line: &'a str) -> Self {
        match line.trim() {
            "/stop" => Self::Stop,
            "" => Self::Blank,
            text => Self::Ignored(text),
        }
    }

    fn hint(text: &str) -> String {
        format!("(reply in progress; only /stop is accepted, resend \"{text}\" after it)")
    }
}

/// Hold-to-talk: recording runs until Enter or the ceiling
#[allow(clippy::future_not_send)]
async fn record(
    recorder: &mut Recorder<AudioCapture>,
    stt: &SpeechToText,
    pipeline: &VoicePipeline,
    lines: &mut mpsc::Receiver<String>,
    long_press: Duration,
) -> anyhow::Result<Option<String>> {
    let mut talk = PushToTalk::new(long_press);
    talk.press(Instant::now());
    tokio::time::sleep(long_press).await;

    if talk.poll(Instant::now(), pipeline.is_busy(), recorder.is_recording())
        != Some(TalkAction::StartRecording)
    {
        talk.release(false);
        println!("The assistant is speaking; /stop it first.");
        return Ok(None);
    }
    recorder.start()?;

    println!(
        "Recording... press Enter to send (max {}s)",
        recorder.max_duration_secs()
    );
    let mut seconds = tokio::time::interval(Duration::from_secs(1));
    seconds.tick().await;
    let mut frames = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = seconds.tick() => {
                if recorder.tick() == RecordingTick::CeilingReached {
                    println!();
                    println!("Time limit reached; sending.");
                    break;
                }
            }
            _ = frames.tick() => {
                let bars = recorder.refresh_waveform();
                print!("\r{:>2}s {}", recorder.elapsed_secs(), render_bars(&bars));
                let _ = std::io::stdout().flush();
            }
            _ = lines.recv() => {
                println!();
                break;
            }
        }
    }

    if talk.release(recorder.is_recording()) != Some(TalkAction::StopRecording) {
        return Ok(None);
    }
    Ok(recorder.finish(stt).await?)
}

/// Bar heights (0..=100) as block characters
fn render_bars(bars: &[f32]) -> String {
    const BLOCKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
    bars.iter()
        .map(|h| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let level = (h.clamp(0.0, 100.0) / 100.0 * 7.0).round() as usize;
            BLOCKS[level]
        })
        .collect()
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new()?;
    capture.start()?;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("---");

    let analyzer = SpectrumAnalyzer::new(RECORDING_FFT_SIZE);
    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.peek_buffer();
        let energy = calculate_rms(&samples);
        let bars = waveform_bars(&analyzer.frequency_data(&samples), 6);

        println!(
            "[{:2}s] RMS: {:.4} | {}",
            i + 1,
            energy,
            render_bars(&bars)
        );

        capture.clear_buffer();
    }

    capture.stop();

    println!("\n---");
    println!("If the bars moved, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Play one resource through the playback engine, showing the visualizer feed
async fn play_resource(sink: Arc<dyn AudioSink>, resource: AudioResource) -> anyhow::Result<()> {
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let mut engine = PlaybackEngine::new(sink, reports_tx);
    let mut frequency = engine.subscribe_frequency();

    engine.play(ScheduledClip {
        turn: TurnId::default(),
        index: 0,
        resource,
    });

    loop {
        tokio::select! {
            report = reports.recv() => {
                println!();
                let report = report.ok_or(Error::ChannelClosed("playback"))?;
                if let PlaybackOutcome::Failed(reason) = report.outcome {
                    anyhow::bail!("playback failed: {reason}");
                }
                return Ok(());
            }
            Ok(()) = frequency.changed() => {
                let level = *frequency.borrow_and_update();
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let width = (level / 255.0 * 50.0) as usize;
                print!("\r[{:<50}]", "█".repeat(width.min(50)));
                let _ = std::io::stdout().flush();
            }
        }
    }
}

/// Test speaker output with a sine wave
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24_000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    let wav = samples_to_wav(&samples, sample_rate)?;
    play_resource(output_sink(config.voice.enabled), AudioResource::wav(wav)).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Test TTS output
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let tts = TextToSpeech::new(&config.voice.api_base_url, config.synthesis.clone())?;
    let reference_id = config
        .voice
        .tts_reference_id
        .clone()
        .unwrap_or_else(|| "test-tts".to_string());

    println!("Synthesizing speech...");
    let resource = tts.synthesize(text, &reference_id).await?;
    println!(
        "Got {} bytes of audio ({})",
        resource.len(),
        resource.content_type.as_deref().unwrap_or("unknown type")
    );

    println!("Playing audio...");
    play_resource(output_sink(config.voice.enabled), resource).await?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

/// Send a WAV file to the tokenizer
async fn transcribe(config: &Config, file: &Path) -> anyhow::Result<()> {
    let data = tokio::fs::read(file).await?;
    let clip = decode_wav(&data)?;
    // The tokenizer expects 16 kHz mono
    let wav = if clip.sample_rate == SAMPLE_RATE {
        data
    } else {
        tracing::debug!(from = clip.sample_rate, to = SAMPLE_RATE, "resampling input");
        samples_to_wav(&resample(&clip.samples, clip.sample_rate, SAMPLE_RATE)?, SAMPLE_RATE)?
    };
    let stt = SpeechToText::new(&config.voice.api_base_url)?;

    let tokens = stt.tokenize(&wav).await?;
    println!("{}", sound_input(&tokens));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_typed_during_reply() {
        assert_eq!(StreamingLine::parse(" /stop "), StreamingLine::Stop);
        assert_eq!(StreamingLine::parse("   "), StreamingLine::Blank);
        assert_eq!(
            StreamingLine::parse("what about lifetimes?\n"),
            StreamingLine::Ignored("what about lifetimes?")
        );
        assert!(StreamingLine::hint("what about lifetimes?").contains("\"what about lifetimes?\""));
    }
}
