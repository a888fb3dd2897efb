//! Ordered playback of synthesized chunks
//!
//! Synthesis requests for a turn run concurrently and finish in any order.
//! [`PlaybackQueue`] stores each result under its [`SynthesisIndex`] and
//! only ever hands out index `i + 1` after index `i` has finished playing.
//! Advancement happens in two places: when a clip ends naturally, and when
//! the result the queue has been waiting for finally arrives.

use std::collections::BTreeMap;

use super::tts::AudioResource;

/// Position of a chunk within its turn; contiguous from 0
pub type SynthesisIndex = usize;

/// Identifies one user-submit-to-reply cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TurnId(u64);

impl TurnId {
    #[must_use]
    const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where playback stands within the current turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// No turn is being played
    Idle,
    /// This index is playing
    Playing(SynthesisIndex),
    /// Playback is blocked until this index is synthesized
    Awaiting(SynthesisIndex),
}

#[derive(Debug, Clone)]
enum Slot {
    Ready(AudioResource),
    /// Synthesis or decoding failed; playback skips this index
    Tombstone,
}

/// A clip the playback engine should start now
#[derive(Debug, Clone)]
pub struct ScheduledClip {
    pub turn: TurnId,
    pub index: SynthesisIndex,
    pub resource: AudioResource,
}

/// Outcome of feeding an event to the queue
#[derive(Debug, Clone)]
pub enum PlaybackStep {
    /// Start playing this clip
    Play(ScheduledClip),
    /// Stored or noted; nothing to start
    Unchanged,
    /// Playback is stalled waiting for this index
    Awaiting(SynthesisIndex),
    /// Every chunk of the turn has been handled; turn state is cleared
    Complete,
    /// Event belongs to an earlier turn or an unexpected index; ignored
    Stale,
}

/// Turn-scoped reordering buffer for synthesized audio
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    turn: TurnId,
    slots: BTreeMap<SynthesisIndex, Slot>,
    cursor: Option<Cursor>,
    high_water: Option<SynthesisIndex>,
    stream_finished: bool,
}

impl PlaybackQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new turn, discarding everything from the previous one
    pub fn begin_turn(&mut self) -> TurnId {
        self.turn = self.turn.next();
        self.clear();
        self.cursor = Some(Cursor::Awaiting(0));
        tracing::debug!(turn = %self.turn, "playback turn started");
        self.turn
    }

    /// Abandon the current turn; results still in flight become stale
    pub fn retire(&mut self) -> TurnId {
        let retired = self.turn;
        self.turn = self.turn.next();
        self.clear();
        tracing::debug!(turn = %retired, "playback turn retired");
        retired
    }

    /// Assign the next index of the current turn to a freshly emitted chunk
    pub fn issue_index(&mut self) -> SynthesisIndex {
        let index = self.high_water.map_or(0, |h| h + 1);
        self.high_water = Some(index);
        index
    }

    /// The assistant stream for this turn has ended; no more indices follow
    pub fn close_stream(&mut self, turn: TurnId) -> PlaybackStep {
        if turn != self.turn || self.cursor.is_none() {
            return PlaybackStep::Stale;
        }
        self.stream_finished = true;

        match self.cursor() {
            Cursor::Awaiting(index) => self.advance_from(index),
            _ => PlaybackStep::Unchanged,
        }
    }

    /// A synthesis call finished successfully
    pub fn on_resource_ready(
        &mut self,
        turn: TurnId,
        index: SynthesisIndex,
        resource: AudioResource,
    ) -> PlaybackStep {
        self.store(turn, index, Slot::Ready(resource))
    }

    /// A synthesis call failed; record a tombstone so playback can move past it
    pub fn on_synthesis_failed(&mut self, turn: TurnId, index: SynthesisIndex) -> PlaybackStep {
        self.store(turn, index, Slot::Tombstone)
    }

    /// The clip at `index` finished playing
    pub fn on_playback_ended(&mut self, turn: TurnId, index: SynthesisIndex) -> PlaybackStep {
        if turn != self.turn || self.cursor() != Cursor::Playing(index) {
            return PlaybackStep::Stale;
        }
        self.advance_from(index + 1)
    }

    /// The clip at `index` could not be decoded or played
    pub fn on_playback_failed(&mut self, turn: TurnId, index: SynthesisIndex) -> PlaybackStep {
        if turn != self.turn || self.cursor() != Cursor::Playing(index) {
            return PlaybackStep::Stale;
        }
        self.slots.insert(index, Slot::Tombstone);
        self.advance_from(index + 1)
    }

    #[must_use]
    pub const fn turn(&self) -> TurnId {
        self.turn
    }

    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.cursor.unwrap_or(Cursor::Idle)
    }

    /// Index currently playing
    #[must_use]
    pub fn playing(&self) -> Option<SynthesisIndex> {
        match self.cursor() {
            Cursor::Playing(index) => Some(index),
            _ => None,
        }
    }

    /// Index playback is blocked on
    #[must_use]
    pub fn pending(&self) -> Option<SynthesisIndex> {
        match self.cursor() {
            Cursor::Awaiting(index) => Some(index),
            _ => None,
        }
    }

    /// Greatest index issued this turn
    #[must_use]
    pub const fn high_water(&self) -> Option<SynthesisIndex> {
        self.high_water
    }

    /// Number of synthesized clips held for this turn
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Whether a turn is in progress
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.cursor.is_some()
    }

    fn store(&mut self, turn: TurnId, index: SynthesisIndex, slot: Slot) -> PlaybackStep {
        if turn != self.turn || self.cursor.is_none() {
            tracing::debug!(%turn, index, current = %self.turn, "discarding stale synthesis result");
            return PlaybackStep::Stale;
        }
        if self.high_water.is_none_or(|h| index > h) {
            tracing::warn!(index, "synthesis result for an index that was never issued");
            return PlaybackStep::Stale;
        }
        if self.slots.contains_key(&index) {
            tracing::warn!(index, "duplicate synthesis result ignored");
            return PlaybackStep::Stale;
        }

        self.slots.insert(index, slot);

        if self.cursor() == Cursor::Awaiting(index) {
            self.advance_from(index)
        } else {
            PlaybackStep::Unchanged
        }
    }

    fn advance_from(&mut self, mut next: SynthesisIndex) -> PlaybackStep {
        loop {
            match self.slots.get(&next) {
                Some(Slot::Ready(resource)) => {
                    self.cursor = Some(Cursor::Playing(next));
                    return PlaybackStep::Play(ScheduledClip {
                        turn: self.turn,
                        index: next,
                        resource: resource.clone(),
                    });
                }
                Some(Slot::Tombstone) => {
                    tracing::debug!(index = next, "skipping failed chunk");
                    next += 1;
                }
                None => {
                    let issued = self.high_water.is_some_and(|h| next <= h);
                    if issued || !self.stream_finished {
                        self.cursor = Some(Cursor::Awaiting(next));
                        return PlaybackStep::Awaiting(next);
                    }
                    tracing::debug!(turn = %self.turn, "playback turn complete");
                    self.clear();
                    return PlaybackStep::Complete;
                }
            }
        }
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.cursor = None;
        self.high_water = None;
        self.stream_finished = false;
    }
}
