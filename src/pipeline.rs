//! Assistant reply to speech
//!
//! [`TurnController`] is the synchronous core: it owns the chunker and the
//! playback queue for the current turn and turns each event into the next
//! thing to do. [`VoicePipeline`] runs it as a task: synthesis requests are
//! spawned concurrently, their results come back on a channel tagged with
//! turn and index, and the playback engine reports each clip's end so the
//! queue can advance.

use std::sync::Arc;

use tokio::sync::{Semaphore, broadcast, mpsc, oneshot, watch};

use crate::config::{ChunkerConfig, Config};
use crate::voice::{
    AudioResource, AudioSink, ChunkState, PlaybackEngine, PlaybackOutcome, PlaybackQueue,
    PlaybackReport, PlaybackState, PlaybackStep, SynthesisIndex, Synthesizer, TurnId,
};
use crate::{Error, Result};

/// Capacity of the command channel and the notice broadcast
const CHANNEL_CAPACITY: usize = 64;

/// One chunk to synthesize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisJob {
    pub turn: TurnId,
    pub index: SynthesisIndex,
    pub text: String,
    pub reference_id: String,
}

/// Turn-scoped chunking and ordering state
#[derive(Debug)]
pub struct TurnController {
    chunker: ChunkState,
    queue: PlaybackQueue,
    reference_id: Option<String>,
    message_id: Option<String>,
}

impl TurnController {
    /// `reference_id` overrides the assistant message id sent with synthesis requests
    #[must_use]
    pub fn new(chunker: ChunkerConfig, reference_id: Option<String>) -> Self {
        Self {
            chunker: ChunkState::new(chunker),
            queue: PlaybackQueue::new(),
            reference_id,
            message_id: None,
        }
    }

    #[must_use]
    pub const fn turn(&self) -> TurnId {
        self.queue.turn()
    }

    #[must_use]
    pub const fn queue(&self) -> &PlaybackQueue {
        &self.queue
    }

    #[must_use]
    pub const fn chunker(&self) -> &ChunkState {
        &self.chunker
    }

    /// The user submitted a message; everything from the last turn is dropped
    pub fn submit(&mut self) -> TurnId {
        self.chunker.reset();
        self.message_id = None;
        self.queue.begin_turn()
    }

    /// New cumulative content for the assistant message
    ///
    /// Nothing is produced once the turn has been stopped or completed.
    pub fn on_assistant_update(&mut self, message_id: &str, content: &str) -> Option<SynthesisJob> {
        if !self.queue.is_active() {
            return None;
        }
        self.message_id = Some(message_id.to_string());
        let text = self.chunker.observe(message_id, content)?;
        Some(self.job(text))
    }

    /// The assistant message is complete
    ///
    /// Returns the final chunk, if any text was left, and the queue's
    /// reaction to the stream closing.
    pub fn on_assistant_finished(&mut self) -> (Option<SynthesisJob>, PlaybackStep) {
        if !self.queue.is_active() {
            return (None, PlaybackStep::Stale);
        }
        let job = self.chunker.finish().map(|text| self.job(text));
        let step = self.queue.close_stream(self.queue.turn());
        (job, step)
    }

    /// A synthesis request finished
    pub fn on_synthesized(
        &mut self,
        turn: TurnId,
        index: SynthesisIndex,
        result: Result<AudioResource>,
    ) -> PlaybackStep {
        match result {
            Ok(resource) => {
                tracing::debug!(%turn, index, bytes = resource.len(), "chunk synthesized");
                self.queue.on_resource_ready(turn, index, resource)
            }
            Err(e) => {
                tracing::warn!(%turn, index, error = %e, "synthesis failed; skipping chunk");
                self.queue.on_synthesis_failed(turn, index)
            }
        }
    }

    /// The playback engine finished a clip
    pub fn on_playback_report(&mut self, report: &PlaybackReport) -> PlaybackStep {
        match &report.outcome {
            PlaybackOutcome::Ended => self.queue.on_playback_ended(report.turn, report.index),
            PlaybackOutcome::Failed(_) => self.queue.on_playback_failed(report.turn, report.index),
        }
    }

    /// Manual stop: the turn is retired and the rest of the reply stays silent
    pub fn stop(&mut self) -> TurnId {
        self.chunker.reset();
        self.queue.retire()
    }

    fn job(&mut self, text: String) -> SynthesisJob {
        let index = self.queue.issue_index();
        let reference_id = self
            .reference_id
            .clone()
            .or_else(|| self.message_id.clone())
            .unwrap_or_default();
        tracing::debug!(turn = %self.queue.turn(), index, chars = text.chars().count(), "chunk emitted");
        SynthesisJob {
            turn: self.queue.turn(),
            index,
            text,
            reference_id,
        }
    }
}

/// What the pipeline did; for display and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineNotice {
    TurnStarted(TurnId),
    ChunkEmitted {
        turn: TurnId,
        index: SynthesisIndex,
        text: String,
    },
    SynthesisFailed {
        turn: TurnId,
        index: SynthesisIndex,
    },
    Playing {
        turn: TurnId,
        index: SynthesisIndex,
    },
    Awaiting {
        turn: TurnId,
        index: SynthesisIndex,
    },
    PlaybackFailed {
        turn: TurnId,
        index: SynthesisIndex,
    },
    TurnComplete(TurnId),
    Stopped(TurnId),
}

enum Command {
    Submit(oneshot::Sender<TurnId>),
    AssistantUpdate { message_id: String, content: String },
    AssistantFinished,
    StopAudio,
}

struct Synthesized {
    turn: TurnId,
    index: SynthesisIndex,
    result: Result<AudioResource>,
}

/// Handle to a running voice pipeline; cheap to clone
#[derive(Clone)]
pub struct VoicePipeline {
    commands: mpsc::Sender<Command>,
    notices: broadcast::Sender<PipelineNotice>,
    frequency: watch::Receiver<f32>,
    state: watch::Receiver<PlaybackState>,
    live: watch::Receiver<Option<TurnId>>,
}

impl VoicePipeline {
    /// Start the pipeline task
    ///
    /// The task runs until every handle is dropped.
    #[must_use]
    pub fn spawn(
        synthesizer: Arc<dyn Synthesizer>,
        sink: Arc<dyn AudioSink>,
        config: &Config,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (synthesized_tx, synthesized_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (live_tx, live) = watch::channel(None);

        let engine = PlaybackEngine::new(sink, reports_tx);
        let frequency = engine.subscribe_frequency();
        let state = engine.subscribe_state();

        let limit = config
            .voice
            .tts_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let worker = PipelineWorker {
            controller: TurnController::new(config.chunker, config.voice.tts_reference_id.clone()),
            engine,
            synthesizer,
            limit,
            synthesized_tx,
            notices: notices.clone(),
            live: live_tx,
        };
        tokio::spawn(worker.run(commands_rx, synthesized_rx, reports_rx));

        Self {
            commands: commands_tx,
            notices,
            frequency,
            state,
            live,
        }
    }

    /// Start a new turn, stopping and discarding the previous one
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline task has exited
    pub async fn submit(&self) -> Result<TurnId> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Submit(tx)).await?;
        rx.await.map_err(|_| Error::ChannelClosed("pipeline"))
    }

    /// Feed the assistant message's full text so far
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline task has exited
    pub async fn assistant_update(&self, message_id: &str, content: &str) -> Result<()> {
        self.send(Command::AssistantUpdate {
            message_id: message_id.to_string(),
            content: content.to_string(),
        })
        .await
    }

    /// The assistant message is complete
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline task has exited
    pub async fn assistant_finished(&self) -> Result<()> {
        self.send(Command::AssistantFinished).await
    }

    /// Stop playback now; the rest of this turn is not played
    ///
    /// # Errors
    ///
    /// Returns error if the pipeline task has exited
    pub async fn stop_audio(&self) -> Result<()> {
        self.send(Command::StopAudio).await
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineNotice> {
        self.notices.subscribe()
    }

    /// Visualizer feed: mean spectrum value of the playing clip
    #[must_use]
    pub fn frequency(&self) -> watch::Receiver<f32> {
        self.frequency.clone()
    }

    #[must_use]
    pub fn playback_state(&self) -> watch::Receiver<PlaybackState> {
        self.state.clone()
    }

    /// Whether a reply is being spoken
    ///
    /// Stays `true` from submit until the turn completes or is stopped,
    /// including gaps where playback waits for the next chunk.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.live.borrow().is_some()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ChannelClosed("pipeline"))
    }
}

struct PipelineWorker {
    controller: TurnController,
    engine: PlaybackEngine,
    synthesizer: Arc<dyn Synthesizer>,
    limit: Option<Arc<Semaphore>>,
    synthesized_tx: mpsc::UnboundedSender<Synthesized>,
    notices: broadcast::Sender<PipelineNotice>,
    /// Turn being spoken; `None` once it completes or is stopped
    live: watch::Sender<Option<TurnId>>,
}

impl PipelineWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut synthesized: mpsc::UnboundedReceiver<Synthesized>,
        mut reports: mpsc::UnboundedReceiver<PlaybackReport>,
    ) {
        tracing::debug!("voice pipeline started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command);
                }
                Some(done) = synthesized.recv() => {
                    if done.result.is_err() {
                        self.notify(PipelineNotice::SynthesisFailed { turn: done.turn, index: done.index });
                    }
                    let step = self.controller.on_synthesized(done.turn, done.index, done.result);
                    self.apply(step);
                }
                Some(report) = reports.recv() => {
                    self.engine.release(report.turn, report.index);
                    if matches!(report.outcome, PlaybackOutcome::Failed(_)) {
                        self.notify(PipelineNotice::PlaybackFailed { turn: report.turn, index: report.index });
                    }
                    let step = self.controller.on_playback_report(&report);
                    self.apply(step);
                }
            }
        }
        self.engine.stop();
        tracing::debug!("voice pipeline stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit(reply) => {
                self.engine.stop();
                let turn = self.controller.submit();
                self.live.send_replace(Some(turn));
                self.notify(PipelineNotice::TurnStarted(turn));
                let _ = reply.send(turn);
            }
            Command::AssistantUpdate {
                message_id,
                content,
            } => {
                if let Some(job) = self.controller.on_assistant_update(&message_id, &content) {
                    self.dispatch(job);
                }
            }
            Command::AssistantFinished => {
                let (job, step) = self.controller.on_assistant_finished();
                if let Some(job) = job {
                    self.dispatch(job);
                }
                self.apply(step);
            }
            Command::StopAudio => {
                self.engine.stop();
                let turn = self.controller.stop();
                self.live.send_replace(None);
                tracing::info!(%turn, "audio stopped");
                self.notify(PipelineNotice::Stopped(turn));
            }
        }
    }

    /// Fire off a synthesis request; its result comes back on the channel
    fn dispatch(&self, job: SynthesisJob) {
        self.notify(PipelineNotice::ChunkEmitted {
            turn: job.turn,
            index: job.index,
            text: job.text.clone(),
        });

        let synthesizer = Arc::clone(&self.synthesizer);
        let limit = self.limit.clone();
        let results = self.synthesized_tx.clone();
        let live = self.live.subscribe();

        tokio::spawn(async move {
            let _permit = match limit {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            // Submit or stop may have dropped the turn while this job waited
            if *live.borrow() != Some(job.turn) {
                tracing::debug!(turn = %job.turn, index = job.index, "turn gone; synthesis skipped");
                return;
            }

            let result = synthesizer.synthesize(&job.text, &job.reference_id).await;
            if results
                .send(Synthesized {
                    turn: job.turn,
                    index: job.index,
                    result,
                })
                .is_err()
            {
                tracing::debug!(index = job.index, "synthesis result dropped; pipeline gone");
            }
        });
    }

    fn apply(&mut self, step: PlaybackStep) {
        match step {
            PlaybackStep::Play(clip) => {
                self.notify(PipelineNotice::Playing {
                    turn: clip.turn,
                    index: clip.index,
                });
                self.engine.play(clip);
            }
            PlaybackStep::Awaiting(index) => {
                self.notify(PipelineNotice::Awaiting {
                    turn: self.controller.turn(),
                    index,
                });
            }
            PlaybackStep::Complete => {
                let turn = self.controller.turn();
                tracing::info!(%turn, "reply playback complete");
                self.live.send_replace(None);
                self.notify(PipelineNotice::TurnComplete(turn));
            }
            PlaybackStep::Unchanged | PlaybackStep::Stale => {}
        }
    }

    fn notify(&self, notice: PipelineNotice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::ScheduledClip;

    fn controller() -> TurnController {
        TurnController::new(ChunkerConfig::default(), None)
    }

    fn clip() -> AudioResource {
        AudioResource::wav(vec![0; 8])
    }

    fn played(step: PlaybackStep) -> Option<ScheduledClip> {
        match step {
            PlaybackStep::Play(clip) => Some(clip),
            _ => None,
        }
    }

    /// Feed a token stream as cumulative updates, collecting emitted jobs
    fn stream(ctl: &mut TurnController, message_id: &str, tokens: &[&str]) -> Vec<SynthesisJob> {
        let mut content = String::new();
        let mut jobs = Vec::new();
        for token in tokens {
            content.push_str(token);
            jobs.extend(ctl.on_assistant_update(message_id, &content));
        }
        jobs
    }

    #[test]
    fn test_reply_chunks_get_contiguous_indices() {
        let mut ctl = controller();
        let turn = ctl.submit();

        let mut jobs = stream(
            &mut ctl,
            "msg-1",
            &["Hello", " there", ",", " how", " can", " I", " help", "?"],
        );
        let (last, step) = ctl.on_assistant_finished();
        jobs.extend(last);

        let texts: Vec<_> = jobs.iter().map(|j| j.text.as_str()).collect();
        assert_eq!(texts, vec!["Hello there,", " how can I help?"]);
        assert!(jobs.iter().enumerate().all(|(i, j)| j.index == i && j.turn == turn));
        assert!(jobs.iter().all(|j| j.reference_id == "msg-1"));
        assert!(matches!(step, PlaybackStep::Unchanged | PlaybackStep::Awaiting(0)));
    }

    #[test]
    fn test_configured_reference_id_wins() {
        let mut ctl = TurnController::new(ChunkerConfig::default(), Some("voice-a".to_string()));
        ctl.submit();
        ctl.on_assistant_update("msg-1", "Hi");
        let (job, _) = ctl.on_assistant_finished();
        assert_eq!(job.map(|j| j.reference_id), Some("voice-a".to_string()));
    }

    #[test]
    fn test_second_chunk_ready_first_still_plays_second() {
        let mut ctl = controller();
        let turn = ctl.submit();
        stream(&mut ctl, "m", &["Hello", " there", ",", " how", " can", " I", " help", "?"]);
        ctl.on_assistant_finished();

        assert!(played(ctl.on_synthesized(turn, 1, Ok(clip()))).is_none());
        let first = played(ctl.on_synthesized(turn, 0, Ok(clip()))).unwrap();
        assert_eq!(first.index, 0);

        let report = PlaybackReport {
            turn,
            index: 0,
            outcome: PlaybackOutcome::Ended,
        };
        assert_eq!(played(ctl.on_playback_report(&report)).map(|c| c.index), Some(1));

        let report = PlaybackReport {
            turn,
            index: 1,
            outcome: PlaybackOutcome::Ended,
        };
        assert!(matches!(ctl.on_playback_report(&report), PlaybackStep::Complete));
    }

    #[test]
    fn test_failed_synthesis_is_skipped() {
        let mut ctl = controller();
        let turn = ctl.submit();
        stream(&mut ctl, "m", &["Hello", " there", ",", " how", " can", " I", " help", "?"]);
        ctl.on_assistant_finished();

        let step = ctl.on_synthesized(turn, 0, Err(Error::Tts("boom".to_string())));
        assert!(matches!(step, PlaybackStep::Awaiting(1)));
        assert_eq!(played(ctl.on_synthesized(turn, 1, Ok(clip()))).map(|c| c.index), Some(1));
    }

    #[test]
    fn test_stop_silences_rest_of_reply() {
        let mut ctl = controller();
        let turn = ctl.submit();
        let jobs = stream(&mut ctl, "m", &["Hello", " there", ","]);
        assert_eq!(jobs.len(), 1);
        played(ctl.on_synthesized(turn, 0, Ok(clip()))).unwrap();

        let retired = ctl.stop();
        assert_eq!(retired, turn);

        // Late results and further text do nothing
        assert!(matches!(
            ctl.on_synthesized(turn, 0, Ok(clip())),
            PlaybackStep::Stale
        ));
        let more = stream(&mut ctl, "m", &["Hello there, and a lot more text after that"]);
        assert!(more.is_empty());
        assert!(ctl.on_assistant_finished().0.is_none());
    }

    #[test]
    fn test_submit_discards_previous_turn() {
        let mut ctl = controller();
        let old = ctl.submit();
        stream(&mut ctl, "a", &["Hello", " there", ","]);

        let new = ctl.submit();
        assert_ne!(old, new);
        assert!(matches!(ctl.on_synthesized(old, 0, Ok(clip())), PlaybackStep::Stale));

        let jobs = stream(&mut ctl, "b", &["Fresh", " start", "!"]);
        assert_eq!(jobs[0].index, 0);
        assert_eq!(jobs[0].turn, new);
    }
}
