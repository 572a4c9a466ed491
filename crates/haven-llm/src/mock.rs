use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use haven_core::errors::HavenError;
use haven_core::messages::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, Choice, DeltaChoice, FunctionDelta,
    MessageDelta, ToolCallDelta,
};

use crate::client::{ChatClient, ChatStream};

/// Pre-programmed replies for deterministic testing without API calls.
pub enum MockReply {
    /// Blocking completion.
    Message(ChatResponse),
    /// Streaming chunk sequence.
    Stream(Vec<ChatChunk>),
    /// Return an error from the call itself.
    Error(HavenError),
    /// Wait a duration, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    /// Blocking assistant text with finish_reason "stop".
    pub fn text(text: &str) -> Self {
        Self::Message(ChatResponse {
            choices: vec![Choice {
                index: 0,
                message: Some(ChatMessage::assistant_text(text)),
                finish_reason: Some("stop".into()),
            }],
        })
    }

    /// Streamed assistant text, split into per-word chunks, ending with
    /// finish_reason "stop".
    pub fn stream_text(text: &str) -> Self {
        let mut chunks: Vec<ChatChunk> = Vec::new();
        let words: Vec<&str> = text.split_inclusive(' ').collect();
        for word in words {
            chunks.push(content_chunk(word, None));
        }
        chunks.push(content_chunk("", Some("stop")));
        Self::Stream(chunks)
    }

    /// Streamed tool call assembled from argument fragments, ending with
    /// finish_reason "tool_calls".
    pub fn stream_tool_call(name: &str, argument_fragments: &[&str]) -> Self {
        let mut chunks = Vec::new();
        for (i, fragment) in argument_fragments.iter().enumerate() {
            let delta = ToolCallDelta {
                index: 0,
                id: None,
                kind: if i == 0 { Some("function".into()) } else { None },
                function: Some(FunctionDelta {
                    name: if i == 0 { Some(name.to_string()) } else { None },
                    arguments: Some(fragment.to_string()),
                }),
            };
            chunks.push(ChatChunk {
                choices: vec![DeltaChoice {
                    index: 0,
                    delta: MessageDelta {
                        role: None,
                        content: None,
                        tool_calls: Some(vec![delta]),
                    },
                    finish_reason: None,
                }],
            });
        }
        chunks.push(content_chunk("", Some("tool_calls")));
        Self::Stream(chunks)
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn content_chunk(text: &str, finish: Option<&str>) -> ChatChunk {
    ChatChunk {
        choices: vec![DeltaChoice {
            index: 0,
            delta: MessageDelta {
                role: None,
                content: if text.is_empty() {
                    None
                } else {
                    Some(text.to_string())
                },
                tool_calls: None,
            },
            finish_reason: finish.map(String::from),
        }],
    }
}

/// Mock client that pops pre-programmed replies in sequence.
pub struct MockChatClient {
    replies: Mutex<VecDeque<MockReply>>,
    call_count: AtomicUsize,
}

impl MockChatClient {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    fn next_reply(&self) -> Result<MockReply, HavenError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.replies.lock().pop_front().ok_or_else(|| {
            HavenError::InvalidRequest(format!("MockChatClient: no reply configured for call {idx}"))
        })
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    fn model(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, HavenError> {
        let mut reply = self.next_reply()?;
        loop {
            match reply {
                MockReply::Message(resp) => return Ok(resp),
                MockReply::Error(e) => return Err(e),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    reply = *inner;
                }
                MockReply::Stream(_) => {
                    return Err(HavenError::InvalidRequest(
                        "MockChatClient: streaming reply configured for blocking call".into(),
                    ))
                }
            }
        }
    }

    async fn stream(&self, _request: &ChatRequest) -> Result<ChatStream, HavenError> {
        let mut reply = self.next_reply()?;
        loop {
            match reply {
                MockReply::Stream(chunks) => {
                    return Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))));
                }
                MockReply::Error(e) => return Err(e),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    reply = *inner;
                }
                MockReply::Message(_) => {
                    return Err(HavenError::InvalidRequest(
                        "MockChatClient: blocking reply configured for streaming call".into(),
                    ))
                }
            }
        }
    }
}
