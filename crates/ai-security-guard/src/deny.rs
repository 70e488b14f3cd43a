//! Refusal payloads returned in place of denied content.

use crate::ids;
use crate::verdict::ModerationData;
use serde_json::{json, Value};

/// Built-in refusal text.
pub const DEFAULT_DENY_MESSAGE: &str = "很抱歉，我无法回答您的问题";
/// `model` of synthetic completions.
pub const DENY_MODEL: &str = "from-security-guard";

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const SSE_CONTENT_TYPE: &str = "text/event-stream;charset=UTF-8";

/// Shape the client expects a refusal in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyProtocol {
    /// The message text alone, JSON-escaped but not quoted.
    Passthrough,
    /// An OpenAI-compatible chat completion.
    ChatCompletion,
}

/// A synthesized refusal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenialPayload {
    pub protocol: DenyProtocol,
    pub streaming: bool,
    pub status_code: u16,
    pub content_type: &'static str,
    pub message: String,
    /// `chatcmpl-…` id for chat-completion shapes.
    pub synthetic_id: Option<String>,
    pub body: Vec<u8>,
}

/// Pick the refusal text: operator message, then backend advice, then the
/// built-in default.
pub fn deny_message(configured: Option<&str>, verdict: &ModerationData) -> String {
    configured
        .filter(|m| !m.is_empty())
        .or_else(|| verdict.advice_answer())
        .unwrap_or(DEFAULT_DENY_MESSAGE)
        .to_string()
}

impl DenialPayload {
    pub fn build(
        protocol: DenyProtocol,
        streaming: bool,
        status_code: u16,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let (content_type, synthetic_id, body) = match protocol {
            DenyProtocol::Passthrough => (
                JSON_CONTENT_TYPE,
                None,
                escape_message(&message).into_bytes(),
            ),
            DenyProtocol::ChatCompletion => {
                let id = ids::chat_completion_id();
                let body = if streaming {
                    stream_body(&id, &message)
                } else {
                    completion_body(&id, &message)
                };
                let content_type = if streaming {
                    SSE_CONTENT_TYPE
                } else {
                    JSON_CONTENT_TYPE
                };
                (content_type, Some(id), body)
            }
        };
        Self {
            protocol,
            streaming,
            status_code,
            content_type,
            message,
            synthetic_id,
            body,
        }
    }
}

/// JSON string escaping without the surrounding quotes.
fn escape_message(message: &str) -> String {
    let quoted = Value::String(message.to_string()).to_string();
    quoted
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(&quoted)
        .to_string()
}

fn usage() -> Value {
    json!({"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0})
}

fn completion_body(id: &str, message: &str) -> Vec<u8> {
    json!({
        "id": id,
        "object": "chat.completion",
        "model": DENY_MODEL,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": message},
            "logprobs": null,
            "finish_reason": "stop",
        }],
        "usage": usage(),
    })
    .to_string()
    .into_bytes()
}

fn stream_body(id: &str, message: &str) -> Vec<u8> {
    let chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "model": DENY_MODEL,
        "choices": [{
            "index": 0,
            "delta": {"role": "assistant", "content": message},
            "logprobs": null,
            "finish_reason": null,
        }],
    });
    let end = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "model": DENY_MODEL,
        "choices": [{
            "index": 0,
            "delta": {},
            "logprobs": null,
            "finish_reason": "stop",
        }],
        "usage": usage(),
    });
    format!("data: {}\n\ndata: {}\n\ndata: [DONE]\n\n", chunk, end).into_bytes()
}
