//! Voice pipeline integration tests
//!
//! Runs the full chunk → synthesize → ordered playback path on a paused
//! clock with scripted synthesis latency and a silent output sink.

use std::time::Duration;

use ichigo_voice::config::{ChunkerConfig, Config};
use ichigo_voice::voice::{PlaybackState, TurnId};
use ichigo_voice::{PipelineNotice, VoicePipeline};
use tokio::sync::broadcast;

mod common;

use common::{RecordingSink, ScriptedSynthesizer};

const REPLY: [&str; 8] = ["Hello", " there", ",", " how", " can", " I", " help", "?"];
const FIRST: &str = "Hello there,";
const SECOND: &str = " how can I help?";

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Plateaus small enough that every word becomes its own chunk
fn tiny_chunks() -> Config {
    let mut config = Config::default();
    config.chunker = ChunkerConfig {
        opening: 1,
        warm: 2,
        steady: 3,
        early_flush_ceiling: 1,
    };
    config
}

/// Feed tokens as cumulative assistant content
async fn stream_reply(pipeline: &VoicePipeline, message_id: &str, tokens: &[&str]) {
    let mut content = String::new();
    for token in tokens {
        content.push_str(token);
        pipeline.assistant_update(message_id, &content).await.unwrap();
    }
}

/// Collect notices until `done` matches one
async fn wait_for<F>(notices: &mut broadcast::Receiver<PipelineNotice>, mut done: F) -> Vec<PipelineNotice>
where
    F: FnMut(&PipelineNotice) -> bool,
{
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let notice = notices.recv().await.expect("pipeline notices closed");
            let matched = done(&notice);
            seen.push(notice);
            if matched {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for the pipeline");
    seen
}

fn complete(turn: TurnId) -> impl FnMut(&PipelineNotice) -> bool {
    move |n| *n == PipelineNotice::TurnComplete(turn)
}

fn playing_indices(notices: &[PipelineNotice]) -> Vec<usize> {
    notices
        .iter()
        .filter_map(|n| match n {
            PipelineNotice::Playing { index, .. } => Some(*index),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_later_chunk_ready_first_still_plays_second() {
    let synth = ScriptedSynthesizer::new();
    synth.delay(FIRST, ms(400));
    synth.delay(SECOND, ms(20));
    let sink = RecordingSink::new();

    let pipeline = VoicePipeline::spawn(synth.clone(), sink.clone(), &Config::default());
    let mut notices = pipeline.subscribe();

    let turn = pipeline.submit().await.unwrap();
    stream_reply(&pipeline, "msg-1", &REPLY).await;
    pipeline.assistant_finished().await.unwrap();

    let seen = wait_for(&mut notices, complete(turn)).await;

    assert_eq!(sink.started_texts(&[FIRST, SECOND]), vec![FIRST, SECOND]);
    assert_eq!(playing_indices(&seen), vec![0, 1]);

    let calls = synth.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(_, reference_id)| reference_id == "msg-1"));
}

#[tokio::test(start_paused = true)]
async fn test_every_arrival_order_plays_in_index_order() {
    let words = ["alfa", "bravos", "charlies", "hi"];
    let delays: [[u64; 4]; 5] = [
        [10, 20, 30, 40],
        [400, 300, 200, 100],
        [200, 10, 300, 20],
        [30, 400, 10, 200],
        [300, 100, 10, 200],
    ];

    for delay in delays {
        let synth = ScriptedSynthesizer::new();
        for (word, d) in words.iter().zip(delay) {
            synth.delay(word, ms(d));
        }
        let sink = RecordingSink::new();
        let pipeline = VoicePipeline::spawn(synth.clone(), sink.clone(), &tiny_chunks());
        let mut notices = pipeline.subscribe();

        let turn = pipeline.submit().await.unwrap();
        stream_reply(&pipeline, "msg", &words).await;
        pipeline.assistant_finished().await.unwrap();

        let seen = wait_for(&mut notices, complete(turn)).await;
        assert_eq!(sink.started_texts(&words), words.to_vec(), "delays {delay:?}");
        assert_eq!(playing_indices(&seen), vec![0, 1, 2, 3]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_new_turn_ignores_late_results_from_old_turn() {
    let synth = ScriptedSynthesizer::new();
    synth.delay(FIRST, ms(500));
    let fresh = "New turn now!";
    synth.delay(fresh, ms(10));
    let sink = RecordingSink::new();

    let pipeline = VoicePipeline::spawn(synth.clone(), sink.clone(), &Config::default());
    let mut notices = pipeline.subscribe();

    let old = pipeline.submit().await.unwrap();
    stream_reply(&pipeline, "old", &["Hello", " there", ","]).await;
    // The old request is in flight when the new turn starts
    tokio::time::sleep(ms(50)).await;

    let new = pipeline.submit().await.unwrap();
    assert_ne!(old, new);
    stream_reply(&pipeline, "new", &["New turn", " now", "!"]).await;
    pipeline.assistant_finished().await.unwrap();

    wait_for(&mut notices, complete(new)).await;
    // Let the old turn's request land
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(sink.started_texts(&[FIRST, fresh]), vec![fresh]);
    assert_eq!(synth.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_does_not_resume_or_synthesize_rest_of_reply() {
    let synth = ScriptedSynthesizer::new();
    synth.delay(FIRST, ms(10));
    synth.delay(SECOND, ms(50));
    let sink = RecordingSink::new();

    let pipeline = VoicePipeline::spawn(synth.clone(), sink.clone(), &Config::default());
    let mut notices = pipeline.subscribe();

    let turn = pipeline.submit().await.unwrap();
    stream_reply(&pipeline, "msg", &REPLY[..3]).await;
    wait_for(&mut notices, |n| matches!(n, PipelineNotice::Playing { index: 0, .. })).await;

    pipeline.stop_audio().await.unwrap();
    wait_for(&mut notices, |n| *n == PipelineNotice::Stopped(turn)).await;

    // The reply keeps streaming after the stop
    stream_reply(&pipeline, "msg", &REPLY).await;
    pipeline.assistant_finished().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(sink.started_texts(&[FIRST, SECOND]), vec![FIRST]);
    assert_eq!(synth.calls().len(), 1);
    assert_eq!(*pipeline.playback_state().borrow(), PlaybackState::Idle);
    assert!(notices.try_recv().is_err(), "nothing happens after a stop");
}

#[tokio::test(start_paused = true)]
async fn test_failed_synthesis_is_skipped() {
    let synth = ScriptedSynthesizer::new();
    synth.fail(FIRST, ms(30));
    synth.delay(SECOND, ms(10));
    let sink = RecordingSink::new();

    let pipeline = VoicePipeline::spawn(synth.clone(), sink.clone(), &Config::default());
    let mut notices = pipeline.subscribe();

    let turn = pipeline.submit().await.unwrap();
    stream_reply(&pipeline, "msg", &REPLY).await;
    pipeline.assistant_finished().await.unwrap();

    let seen = wait_for(&mut notices, complete(turn)).await;
    assert!(seen.contains(&PipelineNotice::SynthesisFailed { turn, index: 0 }));
    assert_eq!(playing_indices(&seen), vec![1]);
    assert_eq!(sink.started_texts(&[FIRST, SECOND]), vec![SECOND]);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_clip_is_skipped() {
    let synth = ScriptedSynthesizer::new();
    synth.garbage(FIRST, ms(10));
    synth.delay(SECOND, ms(10));
    let sink = RecordingSink::new();

    let pipeline = VoicePipeline::spawn(synth.clone(), sink.clone(), &Config::default());
    let mut notices = pipeline.subscribe();

    let turn = pipeline.submit().await.unwrap();
    stream_reply(&pipeline, "msg", &REPLY).await;
    pipeline.assistant_finished().await.unwrap();

    let seen = wait_for(&mut notices, complete(turn)).await;
    assert!(seen.contains(&PipelineNotice::PlaybackFailed { turn, index: 0 }));
    assert_eq!(playing_indices(&seen), vec![0, 1]);
    assert_eq!(sink.started_texts(&[FIRST, SECOND]), vec![SECOND]);
}

#[tokio::test(start_paused = true)]
async fn test_single_concurrency_serializes_requests() {
    let words = ["alfa", "bravos", "charlies", "hi"];
    let synth = ScriptedSynthesizer::new();
    for word in words {
        synth.delay(word, ms(100));
    }
    let sink = RecordingSink::new();

    let mut config = tiny_chunks();
    config.voice.tts_concurrency = Some(1);
    let pipeline = VoicePipeline::spawn(synth.clone(), sink.clone(), &config);
    let mut notices = pipeline.subscribe();

    let started = tokio::time::Instant::now();
    let turn = pipeline.submit().await.unwrap();
    stream_reply(&pipeline, "msg", &words).await;
    pipeline.assistant_finished().await.unwrap();

    let seen = wait_for(&mut notices, |n| {
        matches!(n, PipelineNotice::Playing { index: 3, .. })
    })
    .await;
    assert!(started.elapsed() >= ms(400));
    assert_eq!(playing_indices(&seen), vec![0, 1, 2, 3]);

    wait_for(&mut notices, complete(turn)).await;
}

#[tokio::test(start_paused = true)]
async fn test_visualizer_feed_moves_while_playing() {
    let synth = ScriptedSynthesizer::new();
    synth.delay(FIRST, ms(10));
    let sink = RecordingSink::new();

    let pipeline = VoicePipeline::spawn(synth.clone(), sink.clone(), &Config::default());
    let mut notices = pipeline.subscribe();
    let frequency = pipeline.frequency();

    let turn = pipeline.submit().await.unwrap();
    stream_reply(&pipeline, "msg", &REPLY[..3]).await;
    pipeline.assistant_finished().await.unwrap();

    wait_for(&mut notices, |n| matches!(n, PipelineNotice::Playing { .. })).await;
    tokio::time::sleep(ms(60)).await;
    assert!(*frequency.borrow() > 0.0);
    assert!(pipeline.is_busy());

    wait_for(&mut notices, complete(turn)).await;
    tokio::time::sleep(ms(20)).await;
    assert!(frequency.borrow().abs() < f32::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_busy_between_clips_until_turn_completes() {
    let synth = ScriptedSynthesizer::new();
    synth.delay(FIRST, ms(10));
    synth.delay(SECOND, Duration::from_secs(3));
    let sink = RecordingSink::new();

    let pipeline = VoicePipeline::spawn(synth.clone(), sink.clone(), &Config::default());
    let mut notices = pipeline.subscribe();
    assert!(!pipeline.is_busy());

    let turn = pipeline.submit().await.unwrap();
    assert!(pipeline.is_busy());
    stream_reply(&pipeline, "msg", &REPLY).await;
    pipeline.assistant_finished().await.unwrap();

    // First clip is done and the second is still being synthesized
    wait_for(&mut notices, |n| matches!(n, PipelineNotice::Awaiting { index: 1, .. })).await;
    assert_eq!(*pipeline.playback_state().borrow(), PlaybackState::Idle);
    assert!(pipeline.is_busy());

    wait_for(&mut notices, complete(turn)).await;
    assert!(!pipeline.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_stop_and_empty_reply_end_busy() {
    let synth = ScriptedSynthesizer::new();
    synth.delay(FIRST, Duration::from_secs(3));
    let sink = RecordingSink::new();

    let pipeline = VoicePipeline::spawn(synth.clone(), sink.clone(), &Config::default());
    let mut notices = pipeline.subscribe();

    let turn = pipeline.submit().await.unwrap();
    stream_reply(&pipeline, "msg", &REPLY[..3]).await;
    pipeline.stop_audio().await.unwrap();
    wait_for(&mut notices, |n| *n == PipelineNotice::Stopped(turn)).await;
    assert!(!pipeline.is_busy());

    // A reply that never produced text still closes its turn
    let turn = pipeline.submit().await.unwrap();
    pipeline.assistant_finished().await.unwrap();
    wait_for(&mut notices, complete(turn)).await;
    assert!(!pipeline.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_queued_jobs_of_discarded_turn_are_not_synthesized() {
    let words = ["alfa", "bravos", "charlies", "deltas"];
    let synth = ScriptedSynthesizer::new();
    for word in words {
        synth.delay(word, Duration::from_secs(1));
    }
    synth.delay("fresh", ms(10));
    let sink = RecordingSink::new();

    let mut config = tiny_chunks();
    config.voice.tts_concurrency = Some(1);
    let pipeline = VoicePipeline::spawn(synth.clone(), sink.clone(), &config);
    let mut notices = pipeline.subscribe();

    let started = tokio::time::Instant::now();
    pipeline.submit().await.unwrap();
    stream_reply(&pipeline, "old", &words).await;
    pipeline.assistant_finished().await.unwrap();
    tokio::time::sleep(ms(50)).await;

    let turn = pipeline.submit().await.unwrap();
    stream_reply(&pipeline, "new", &["fresh"]).await;
    pipeline.assistant_finished().await.unwrap();

    wait_for(&mut notices, |n| *n == PipelineNotice::Playing { turn, index: 0 }).await;
    // Only the request already in flight delays the new turn
    assert!(started.elapsed() < Duration::from_millis(1_500), "{:?}", started.elapsed());
    wait_for(&mut notices, complete(turn)).await;

    let calls: Vec<String> = synth.calls().into_iter().map(|(text, _)| text).collect();
    assert_eq!(calls, vec!["alfa", "fresh"]);
    assert_eq!(sink.started_texts(&["alfa", "fresh"]), vec!["fresh"]);
}
