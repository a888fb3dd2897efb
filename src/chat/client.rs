//! Streaming chat completions
//!
//! [`OpenAiChat`] talks to any OpenAI-compatible server (vLLM, llama.cpp,
//! the hosted API) with `stream: true` and yields the reply as text deltas.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::sse::{SseEvent, SseLineParser};
use super::{ChatMessage, Role};
use crate::config::ChatConfig;
use crate::{Error, Result};

/// Reply text as it streams in
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Something that answers a conversation with streamed text
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Start a reply to `history`; the last message is the user's turn
    async fn stream_reply(&self, history: &[ChatMessage]) -> Result<DeltaStream>;
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// OpenAI-compatible `/v1/chat/completions` client
pub struct OpenAiChat {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    system_prompt: Option<String>,
}

impl OpenAiChat {
    /// Create a client from chat configuration
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is empty
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/');
        if base_url.is_empty() {
            return Err(Error::Config("chat base URL required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: format!("{base_url}/v1/chat/completions"),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            system_prompt: config.system_prompt.clone(),
        })
    }

    fn request<'a>(&'a self, history: &'a [ChatMessage]) -> CompletionRequest<'a> {
        let system = self.system_prompt.as_deref().map(|content| WireMessage {
            role: Role::System,
            content,
        });
        let messages = system
            .into_iter()
            .chain(history.iter().map(|m| WireMessage {
                role: m.role,
                content: &m.content,
            }))
            .collect();

        CompletionRequest {
            model: &self.model,
            messages,
            stream: true,
        }
    }
}

#[async_trait]
impl ChatBackend for OpenAiChat {
    async fn stream_reply(&self, history: &[ChatMessage]) -> Result<DeltaStream> {
        tracing::debug!(messages = history.len(), model = %self.model, "requesting chat completion");

        let mut request = self.client.post(&self.endpoint).json(&self.request(history));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "chat request failed");
            e
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat API error");
            return Err(Error::Chat(format!("chat error {status}: {body}")));
        }

        Ok(Box::pin(delta_stream(response.bytes_stream())))
    }
}

struct StreamState<S> {
    bytes: Pin<Box<S>>,
    parser: SseLineParser,
    ready: VecDeque<Result<String>>,
    done: bool,
}

/// Turn an SSE byte stream into content deltas, ending at `[DONE]`
fn delta_stream<S>(bytes: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = StreamState {
        bytes: Box::pin(bytes),
        parser: SseLineParser::new(),
        ready: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = state.parser.push(&chunk);
                    state.queue(events);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(Error::Chat(format!("stream read error: {e}"))), state));
                }
                None => {
                    let tail = state.parser.flush();
                    state.queue(tail);
                    state.done = true;
                }
            }
        }
    })
}

impl<S> StreamState<S> {
    fn queue(&mut self, events: impl IntoIterator<Item = SseEvent>) {
        for event in events {
            if self.done {
                return;
            }
            if event.is_done() {
                self.done = true;
                return;
            }
            match parse_delta(&event.data) {
                Ok(Some(text)) => self.ready.push_back(Ok(text)),
                Ok(None) => {}
                Err(e) => self.ready.push_back(Err(e)),
            }
        }
    }
}

/// Content of one completion chunk, if it carries any
fn parse_delta(data: &str) -> Result<Option<String>> {
    let chunk: CompletionChunk = serde_json::from_str(data)?;
    Ok(chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .find(|content| !content.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> OpenAiChat {
        OpenAiChat::new(&ChatConfig {
            base_url: "http://localhost:8000/".to_string(),
            system_prompt: Some("Be brief.".to_string()),
            ..ChatConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_and_request_shape() {
        let chat = chat();
        assert_eq!(chat.endpoint, "http://localhost:8000/v1/chat/completions");

        let history = vec![ChatMessage::new(Role::User, "<|sound_start|><|sound_0001|>")];
        let body = serde_json::to_value(chat.request(&history)).unwrap();

        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        // Audio input goes out as the raw sentinel string
        assert_eq!(body["messages"][1]["content"], "<|sound_start|><|sound_0001|>");
    }

    #[test]
    fn test_empty_base_url_rejected() {
        let config = ChatConfig {
            base_url: String::new(),
            ..ChatConfig::default()
        };
        assert!(matches!(OpenAiChat::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(parse_delta(data).unwrap(), Some("Hi".to_string()));

        let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_delta(role_only).unwrap(), None);

        assert!(parse_delta("not json").is_err());
    }

    #[tokio::test]
    async fn test_delta_stream_stops_at_done() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        // Deliver in awkward pieces
        let pieces: Vec<reqwest::Result<Bytes>> = body
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let deltas: Vec<String> = delta_stream(futures::stream::iter(pieces))
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(deltas, vec!["Hello", " there"]);
    }
}
