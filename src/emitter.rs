//! Protocol-shaped response bodies and SSE frame sequences.
//!
//! Token counts are estimates: `ceil(len / 4)` with `len` in UTF-16 code
//! units, not a tokenizer count.
//! Clients that bill on `usage` should treat the numbers as approximate.

use axum::response::sse::Event;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::ChunkStream;

/// Wire protocol a caller speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    OpenAi,
    Claude,
}

fn utf16_len(text: &str) -> u64 {
    text.encode_utf16().count() as u64
}

/// Approximate token count for `text`.
pub fn estimate_tokens(text: &str) -> u64 {
    utf16_len(text).div_ceil(4)
}

/// Identity shared by every object emitted for one response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseContext {
    pub id: String,
    pub created: u64,
    pub model: String,
}

impl ResponseContext {
    pub fn new(protocol: Protocol, model: impl Into<String>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let id = match protocol {
            Protocol::OpenAi => format!("chatcmpl-{}", now.as_millis()),
            Protocol::Claude => format!("msg_{}", now.as_millis()),
        };
        Self {
            id,
            created: now.as_secs(),
            model: model.into(),
        }
    }
}

// OpenAI shapes

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct Choice {
    pub message: AssistantMessage,
    pub index: u32,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChoiceChunk>,
}

#[derive(Debug, Serialize)]
pub struct ChoiceChunk {
    pub delta: Delta,
    pub index: u32,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

// Claude shapes

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub role: &'static str,
    pub content: Vec<TextBlock>,
    pub model: String,
    pub stop_reason: &'static str,
    pub stop_sequence: Option<String>,
    pub usage: MessageUsage,
}

#[derive(Debug, Serialize)]
pub struct TextBlock {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct MessageUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Serialize)]
struct ContentBlockDelta {
    #[serde(rename = "type")]
    kind: &'static str,
    delta: TextDelta,
    index: u32,
}

#[derive(Debug, Serialize)]
struct TextDelta {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

#[derive(Debug, Serialize)]
struct MessageDelta {
    #[serde(rename = "type")]
    kind: &'static str,
    delta: StopDelta,
    usage: OutputUsage,
}

#[derive(Debug, Serialize)]
struct StopDelta {
    stop_reason: &'static str,
    stop_sequence: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputUsage {
    output_tokens: u64,
}

/// Complete (non-streaming) response body.
pub fn final_body(protocol: Protocol, ctx: &ResponseContext, prompt: &str, text: &str) -> Value {
    let prompt_tokens = estimate_tokens(prompt);
    let completion_tokens = estimate_tokens(text);

    let body = match protocol {
        Protocol::OpenAi => serde_json::to_value(ChatCompletionResponse {
            id: ctx.id.clone(),
            object: "chat.completion",
            created: ctx.created,
            model: ctx.model.clone(),
            choices: vec![Choice {
                message: AssistantMessage {
                    role: "assistant",
                    content: text.to_string(),
                },
                index: 0,
                finish_reason: "stop",
            }],
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                // estimated over the concatenation, as a single ceil
                total_tokens: (utf16_len(prompt) + utf16_len(text)).div_ceil(4),
            },
        }),
        Protocol::Claude => serde_json::to_value(MessageResponse {
            id: ctx.id.clone(),
            kind: "message",
            role: "assistant",
            content: vec![TextBlock {
                kind: "text",
                text: text.to_string(),
            }],
            model: ctx.model.clone(),
            stop_reason: "end_turn",
            stop_sequence: None,
            usage: MessageUsage {
                input_tokens: prompt_tokens,
                output_tokens: completion_tokens,
            },
        }),
    };

    body.unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }))
}

/// One unit of an SSE response.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(Value),
    /// The `[DONE]` sentinel that follows the terminal frame.
    Done,
}

impl Frame {
    fn data<T: Serialize>(payload: T) -> Self {
        Frame::Data(serde_json::to_value(payload).unwrap_or(Value::Null))
    }

    fn error(message: impl Into<String>) -> Self {
        Frame::Data(serde_json::json!({ "error": message.into() }))
    }

    fn payload(&self) -> String {
        match self {
            Frame::Data(value) => value.to_string(),
            Frame::Done => "[DONE]".to_string(),
        }
    }

    /// Wire text, `data: <payload>\n\n`.
    pub fn render(&self) -> String {
        format!("data: {}\n\n", self.payload())
    }

    pub fn into_event(self) -> Event {
        Event::default().data(self.payload())
    }
}

fn delta_frame(protocol: Protocol, ctx: &ResponseContext, text: String) -> Frame {
    match protocol {
        Protocol::OpenAi => Frame::data(ChatCompletionChunk {
            id: ctx.id.clone(),
            object: "chat.completion.chunk",
            created: ctx.created,
            model: ctx.model.clone(),
            choices: vec![ChoiceChunk {
                delta: Delta {
                    content: Some(text),
                },
                index: 0,
                finish_reason: None,
            }],
        }),
        Protocol::Claude => Frame::data(ContentBlockDelta {
            kind: "content_block_delta",
            delta: TextDelta {
                kind: "text_delta",
                text,
            },
            index: 0,
        }),
    }
}

fn terminal_frame(protocol: Protocol, ctx: &ResponseContext, full_text: &str) -> Frame {
    match protocol {
        Protocol::OpenAi => Frame::data(ChatCompletionChunk {
            id: ctx.id.clone(),
            object: "chat.completion.chunk",
            created: ctx.created,
            model: ctx.model.clone(),
            choices: vec![ChoiceChunk {
                delta: Delta { content: None },
                index: 0,
                finish_reason: Some("stop"),
            }],
        }),
        Protocol::Claude => Frame::data(MessageDelta {
            kind: "message_delta",
            delta: StopDelta {
                stop_reason: "end_turn",
                stop_sequence: None,
            },
            usage: OutputUsage {
                output_tokens: estimate_tokens(full_text),
            },
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Streaming,
    Sentinel,
    Finished,
}

struct EmitState {
    protocol: Protocol,
    ctx: ResponseContext,
    chunks: ChunkStream,
    full_text: String,
    phase: Phase,
}

/// Maps a chunk stream onto protocol frames.
///
/// Each chunk is pulled only after the previous frame has been taken, so the
/// emitter holds at most one chunk. A clean end yields the terminal frame and
/// `[DONE]`; a failed chunk yields one error frame and ends the stream. Frames
/// already delivered stay delivered.
pub fn frames(
    protocol: Protocol,
    ctx: ResponseContext,
    chunks: ChunkStream,
) -> impl Stream<Item = Frame> + Send + 'static {
    let state = EmitState {
        protocol,
        ctx,
        chunks,
        full_text: String::new(),
        phase: Phase::Streaming,
    };

    stream::unfold(state, |mut state| async move {
        match state.phase {
            Phase::Streaming => match state.chunks.next().await {
                Some(Ok(text)) => {
                    state.full_text.push_str(&text);
                    let frame = delta_frame(state.protocol, &state.ctx, text);
                    Some((frame, state))
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        id = %state.ctx.id,
                        error = %e,
                        emitted_length = state.full_text.len(),
                        "Generation failed mid-stream"
                    );
                    state.phase = Phase::Finished;
                    Some((Frame::error(e.to_string()), state))
                }
                None => {
                    tracing::debug!(
                        id = %state.ctx.id,
                        response_length = state.full_text.len(),
                        "Stream complete"
                    );
                    state.phase = Phase::Sentinel;
                    let frame = terminal_frame(state.protocol, &state.ctx, &state.full_text);
                    Some((frame, state))
                }
            },
            Phase::Sentinel => {
                state.phase = Phase::Finished;
                Some((Frame::Done, state))
            }
            Phase::Finished => None,
        }
    })
}
