//! Incremental chunking of a streamed assistant reply into speakable text
//!
//! The chat backend hands us the full text of the assistant message so far
//! on every update. [`ChunkState`] strips the previously seen prefix to get
//! the new delta and decides when the buffered text is worth a synthesis
//! request. The first chunk is kept short so the reply starts speaking
//! quickly; later chunks grow so fewer requests are made.

use crate::config::ChunkerConfig;

/// Tokens that end a phrase naturally
pub const PUNCTUATION: [&str; 19] = [
    ".", ",", "!", "?", ":", ";", "\"", "'", "(", ")", "[", "]", "{", "}", "-", "--", "...", "/",
    "\\",
];

/// Current chunk size plateau
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plateau {
    /// Before the first flush; waits for punctuation
    Opening,
    /// After an early punctuation flush
    Warm,
    /// Established stream; largest chunks
    Steady,
}

/// Chunking state for one assistant message
#[derive(Debug, Clone)]
pub struct ChunkState {
    config: ChunkerConfig,
    accumulated: String,
    plateau: Plateau,
    chars_since_flush: usize,
    last_seen: String,
    message_id: Option<String>,
}

impl ChunkState {
    /// Create a fresh state at the opening plateau
    #[must_use]
    pub const fn new(config: ChunkerConfig) -> Self {
        Self {
            config,
            accumulated: String::new(),
            plateau: Plateau::Opening,
            chars_since_flush: 0,
            last_seen: String::new(),
            message_id: None,
        }
    }

    /// Discard buffered text and return to the opening plateau
    pub fn reset(&mut self) {
        *self = Self::new(self.config);
    }

    /// Current target chunk size in characters
    #[must_use]
    pub const fn threshold(&self) -> usize {
        match self.plateau {
            Plateau::Opening => self.config.opening,
            Plateau::Warm => self.config.warm,
            Plateau::Steady => self.config.steady,
        }
    }

    #[must_use]
    pub const fn plateau(&self) -> Plateau {
        self.plateau
    }

    /// Text buffered since the last flush
    #[must_use]
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    #[must_use]
    pub const fn chars_since_flush(&self) -> usize {
        self.chars_since_flush
    }

    /// Observe the cumulative content of an assistant message
    ///
    /// Returns a completed chunk when the new delta triggers a flush.
    pub fn observe(&mut self, message_id: &str, content: &str) -> Option<String> {
        if self.message_id.as_deref() != Some(message_id) {
            self.message_id = Some(message_id.to_string());
            self.last_seen.clear();
        }

        let delta = if let Some(rest) = content.strip_prefix(self.last_seen.as_str()) {
            rest.to_string()
        } else {
            tracing::debug!(
                message_id,
                "assistant text no longer extends what was seen; treating it as new"
            );
            content.to_string()
        };
        self.last_seen = content.to_string();

        self.push_delta(&delta)
    }

    /// Feed one newly arrived piece of text
    pub fn push_delta(&mut self, delta: &str) -> Option<String> {
        if delta.is_empty() {
            return None;
        }
        let len = delta.chars().count();

        if self.chars_since_flush < self.threshold() {
            self.append(delta, len);
            return None;
        }

        let under_ceiling = self.chars_since_flush < self.config.early_flush_ceiling;

        if self.plateau == Plateau::Opening && under_ceiling {
            if is_punctuation(delta) {
                self.accumulated.push_str(delta);
                let chunk = std::mem::take(&mut self.accumulated);
                self.chars_since_flush = 0;
                self.plateau = Plateau::Warm;
                return speakable(chunk);
            }
            self.append(delta, len);
            return None;
        }

        // The triggering delta starts the next chunk
        let chunk = std::mem::replace(&mut self.accumulated, delta.to_string());
        self.chars_since_flush = len;
        self.plateau = Plateau::Steady;
        speakable(chunk)
    }

    /// Flush whatever remains once the assistant message is complete
    pub fn finish(&mut self) -> Option<String> {
        self.chars_since_flush = 0;
        speakable(std::mem::take(&mut self.accumulated))
    }

    fn append(&mut self, delta: &str, len: usize) {
        self.accumulated.push_str(delta);
        self.chars_since_flush += len;
    }
}

/// Whether a delta ends on a punctuation mark
#[must_use]
pub fn is_punctuation(delta: &str) -> bool {
    let trimmed = delta.trim();
    !trimmed.is_empty() && PUNCTUATION.iter().any(|p| trimmed.ends_with(p))
}

fn speakable(chunk: String) -> Option<String> {
    if chunk.trim().is_empty() {
        None
    } else {
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ChunkState {
        ChunkState::new(ChunkerConfig::default())
    }

    #[test]
    fn test_buffers_below_opening_threshold() {
        let mut chunks = state();
        assert_eq!(chunks.push_delta("Hi"), None);
        assert_eq!(chunks.accumulated(), "Hi");
        assert_eq!(chunks.chars_since_flush(), 2);
        assert_eq!(chunks.plateau(), Plateau::Opening);
    }

    #[test]
    fn test_first_flush_waits_for_threshold_then_punctuation() {
        let mut chunks = state();
        assert_eq!(chunks.push_delta("Hello "), None);
        // Punctuation below the opening threshold does not flush
        assert_eq!(chunks.push_delta("world, "), None);
        assert_eq!(
            chunks.push_delta("how are you?").as_deref(),
            Some("Hello world, how are you?")
        );
        assert_eq!(chunks.plateau(), Plateau::Warm);
        assert_eq!(chunks.threshold(), 60);
        assert_eq!(chunks.chars_since_flush(), 0);
    }

    #[test]
    fn test_token_stream_flushes_first_clause_early() {
        let mut chunks = state();
        let mut emitted = Vec::new();
        for token in ["Hello", " there", ",", " how", " can", " I", " help", "?"] {
            emitted.extend(chunks.push_delta(token));
        }
        emitted.extend(chunks.finish());

        assert_eq!(emitted, vec!["Hello there,", " how can I help?"]);
    }

    #[test]
    fn test_regular_flush_seeds_next_chunk_with_trigger() {
        let mut chunks = state();
        chunks.push_delta("Okay, sure");
        assert_eq!(chunks.push_delta(".").as_deref(), Some("Okay, sure."));
        assert_eq!(chunks.plateau(), Plateau::Warm);

        let long = "x".repeat(60);
        assert_eq!(chunks.push_delta(&long), None);
        assert_eq!(chunks.push_delta(" next").as_deref(), Some(long.as_str()));
        assert_eq!(chunks.accumulated(), " next");
        assert_eq!(chunks.plateau(), Plateau::Steady);
        assert_eq!(chunks.threshold(), 400);
    }

    #[test]
    fn test_opening_without_punctuation_flushes_at_ceiling() {
        let mut chunks = state();
        let word = "abcdefghij";
        for _ in 0..6 {
            assert_eq!(chunks.push_delta(word), None);
        }
        assert_eq!(chunks.chars_since_flush(), 60);

        let flushed = chunks.push_delta(word).unwrap();
        assert_eq!(flushed.len(), 60);
        assert_eq!(chunks.accumulated(), word);
        assert_eq!(chunks.plateau(), Plateau::Steady);
    }

    #[test]
    fn test_observe_strips_seen_prefix() {
        let mut chunks = state();
        chunks.observe("m1", "Hello");
        chunks.observe("m1", "Hello there");
        assert_eq!(chunks.accumulated(), "Hello there");
        assert_eq!(chunks.chars_since_flush(), 11);
    }

    #[test]
    fn test_observe_empty_delta_is_noop() {
        let mut chunks = state();
        chunks.observe("m1", "Hello");
        assert_eq!(chunks.observe("m1", "Hello"), None);
        assert_eq!(chunks.chars_since_flush(), 5);
        assert_eq!(chunks.accumulated(), "Hello");
    }

    #[test]
    fn test_new_message_id_restarts_delta_tracking() {
        let mut chunks = state();
        chunks.observe("m1", "abc");
        chunks.observe("m2", "abc");
        assert_eq!(chunks.accumulated(), "abcabc");
    }

    #[test]
    fn test_finish_skips_blank_remainder() {
        let mut chunks = state();
        chunks.push_delta("   ");
        assert_eq!(chunks.finish(), None);
        assert_eq!(chunks.finish(), None);
    }

    #[test]
    fn test_reset_returns_to_opening() {
        let mut chunks = state();
        chunks.push_delta("Hello there");
        chunks.push_delta(",");
        assert_eq!(chunks.plateau(), Plateau::Warm);
        chunks.reset();
        assert_eq!(chunks.plateau(), Plateau::Opening);
        assert_eq!(chunks.accumulated(), "");
        assert_eq!(chunks.threshold(), 10);
    }

    #[test]
    fn test_is_punctuation() {
        assert!(is_punctuation("."));
        assert!(is_punctuation(" --"));
        assert!(is_punctuation("you?"));
        assert!(is_punctuation("...\n"));
        assert!(!is_punctuation("word"));
        assert!(!is_punctuation("  "));
    }
}
