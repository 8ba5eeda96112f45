//! Incremental re-framing of Anthropic SSE streams into `OpenAI` chunk streams.
//!
//! The [`StreamTranscoder`] is fed the upstream body in whatever pieces the
//! transport hands over. It buffers bytes until a blank line closes a frame,
//! translates each complete `event:`/`data:` frame on its own, and returns the
//! resulting `data: <json>\n\n` frames. Nothing about earlier frames is
//! remembered; the only mutable state is the buffer holding the incomplete
//! tail.
//!
//! Usage:
//!   let mut transcoder = StreamTranscoder::new("claude-3-5-sonnet-20241022");
//!   for chunk in upstream_chunks {
//!       for frame in transcoder.feed(&chunk) {
//!           // write frame to the client
//!       }
//!   }
//!   transcoder.finish();

use memchr::memmem;
use thiserror::Error;

use super::anthropic_types::{Delta, ResponseContentBlock, StreamEvent};
use super::openai_types::{
    ChatCompletionChunk, ChatErrorResponse, ChatUsage, ChunkChoice, ChunkDelta, FinishReason,
};
use super::response::{map_stop_reason, tool_use_header};

/// Emitted in place of any frame that cannot be parsed.
pub const ERROR_FRAME: &str = "data: {\"error\":\"Error parsing message\"}\n\n";

/// Emitted when upstream signals `message_stop`.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// A blank line ends a frame; upstream may use either line ending.
const FRAME_DELIMITERS: [&[u8]; 2] = [b"\n\n", b"\r\n\r\n"];

/// Longest delimiter minus one: how far a match can reach back into old bytes.
const DELIMITER_OVERLAP: usize = 3;

#[derive(Debug, Error)]
enum FrameError {
    #[error("frame is not valid UTF-8")]
    Encoding,
    #[error("first line is not an `event:` field")]
    MissingEvent,
    #[error("second line is not a `data:` field")]
    MissingData,
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct StreamTranscoder {
    id: String,
    model: String,
    created: i64,
    buffer: Vec<u8>,
}

impl StreamTranscoder {
    /// Chunks carry a fresh `chatcmpl-` id and the requested model.
    pub fn new(model: &str) -> Self {
        Self::with_identity(
            format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model,
            chrono::Utc::now().timestamp(),
        )
    }

    pub fn with_identity(id: impl Into<String>, model: &str, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.to_string(),
            created,
            buffer: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk of upstream bytes and return every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        // A delimiter can straddle the old tail and the new chunk
        let mut search_from = self.buffer.len().saturating_sub(DELIMITER_OVERLAP);
        self.buffer.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(len) = frame_end(&self.buffer[search_from..]) {
            let end = search_from + len;
            let frame: Vec<u8> = self.buffer.drain(..end).collect();
            search_from = 0;

            match parse_frame(&frame) {
                Ok(event) => {
                    tracing::trace!(event = event.event_name(), "upstream event");
                    out.extend(self.event_frames(&event));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed upstream SSE frame");
                    out.push(ERROR_FRAME.to_string());
                }
            }
        }
        out
    }

    /// Upstream ended. Returns how many trailing bytes were dropped.
    pub fn finish(self) -> usize {
        let dropped = self.buffer.len();
        if dropped > 0 {
            tracing::debug!(bytes = dropped, "discarding incomplete trailing frame");
        }
        dropped
    }

    /// Translate one upstream event into zero or more client frames.
    pub fn event_frames(&self, event: &StreamEvent) -> Vec<String> {
        let mut frames = Vec::new();

        match event {
            StreamEvent::MessageStart { message } => {
                let delta = ChunkDelta {
                    role: Some("assistant".to_string()),
                    content: Some(String::new()),
                };
                let usage = ChatUsage::new(message.usage.input_tokens, message.usage.output_tokens);
                frames.extend(self.chunk_frame(delta, None, Some(usage)));
            }
            StreamEvent::ContentBlockStart { content_block, .. } => match content_block {
                ResponseContentBlock::Text { text } if !text.is_empty() => {
                    frames.extend(self.content_frame(text.clone()));
                }
                ResponseContentBlock::ToolUse { name, .. } => {
                    frames.extend(self.content_frame(tool_use_header(name)));
                }
                _ => {}
            },
            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                Delta::TextDelta { text } => frames.extend(self.content_frame(text.clone())),
                Delta::InputJsonDelta { partial_json } => {
                    frames.extend(self.content_frame(partial_json.clone()));
                }
                Delta::Other => {}
            },
            StreamEvent::MessageDelta { delta, usage } => {
                let usage = usage
                    .as_ref()
                    .map(|u| ChatUsage::new(u.input_tokens.unwrap_or(0), u.output_tokens));
                frames.extend(self.chunk_frame(
                    ChunkDelta::default(),
                    map_stop_reason(delta.stop_reason.as_deref()),
                    usage,
                ));
            }
            StreamEvent::MessageStop => frames.push(DONE_FRAME.to_string()),
            StreamEvent::Error { error } => {
                let body = ChatErrorResponse::new(&error.error_type, error.message.clone());
                if let Ok(json) = serde_json::to_string(&body) {
                    frames.push(data_frame(&json));
                }
            }
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping | StreamEvent::Unknown => {}
        }

        frames
    }

    fn content_frame(&self, content: String) -> Option<String> {
        let delta = ChunkDelta {
            role: None,
            content: Some(content),
        };
        self.chunk_frame(delta, None, None)
    }

    fn chunk_frame(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<FinishReason>,
        usage: Option<ChatUsage>,
    ) -> Option<String> {
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        };
        serde_json::to_string(&chunk).ok().map(|json| data_frame(&json))
    }
}

/// Length of the first complete frame in `buf`, delimiter included.
fn frame_end(buf: &[u8]) -> Option<usize> {
    FRAME_DELIMITERS
        .iter()
        .filter_map(|delim| memmem::find(buf, delim).map(|pos| (pos, pos + delim.len())))
        .min_by_key(|&(pos, _)| pos)
        .map(|(_, end)| end)
}

fn data_frame(json: &str) -> String {
    format!("data: {json}\n\n")
}

/// Split a complete frame into its `event:` and `data:` lines and decode the payload.
fn parse_frame(frame: &[u8]) -> Result<StreamEvent, FrameError> {
    let text = std::str::from_utf8(frame).map_err(|_| FrameError::Encoding)?;
    let mut lines = text.split('\n');

    lines
        .next()
        .and_then(|line| field_value(line, "event"))
        .ok_or(FrameError::MissingEvent)?;
    let data = lines
        .next()
        .and_then(|line| field_value(line, "data"))
        .ok_or(FrameError::MissingData)?;

    Ok(serde_json::from_str(data)?)
}

/// `event: ping` -> `Some("ping")` for name `event`.
fn field_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let value = line
        .trim_end_matches('\r')
        .strip_prefix(name)?
        .strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}
