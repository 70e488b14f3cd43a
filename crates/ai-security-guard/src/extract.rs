//! Content extraction from JSON bodies and SSE stream frames.
//!
//! Paths use a small dotted dialect: each segment is an object key or a
//! decimal array index, and `@reverse` reverses the array it is applied to,
//! so `messages.@reverse.0.content` selects the last message's content.

use crate::error::{GuardError, Result};
use serde_json::Value;
use std::borrow::Cow;

const REVERSE: &str = "@reverse";
const SSE_DATA_PREFIX: &str = "data:";
const SSE_DONE: &str = "[DONE]";

/// Resolve `path` against `root`.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<Cow<'a, Value>> {
    let mut current = root;
    let mut reversed = false;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        if segment == REVERSE {
            if current.is_array() {
                reversed = !reversed;
            }
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                if index >= items.len() {
                    return None;
                }
                let index = if reversed { items.len() - 1 - index } else { index };
                &items[index]
            }
            _ => return None,
        };
        reversed = false;
    }
    match current {
        Value::Array(items) if reversed => {
            Some(Cow::Owned(Value::Array(items.iter().rev().cloned().collect())))
        }
        other => Some(Cow::Borrowed(other)),
    }
}

/// Render a located value as checkable text. Strings are taken verbatim,
/// null as empty, anything else as its JSON text.
pub fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Text at `path`, or empty when absent.
pub fn text_at(root: &Value, path: &str) -> String {
    lookup(root, path)
        .map(|value| value_as_text(&value))
        .unwrap_or_default()
}

/// Parse a body as JSON.
pub fn parse_body(body: &[u8]) -> Result<Value> {
    serde_json::from_slice(body)
        .map_err(|e| GuardError::Extraction(format!("body is not valid JSON: {}", e)))
}

/// Checkable material found in one request or response body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedContent {
    pub text: String,
    pub image_url: Option<String>,
    pub image_base64: Option<String>,
}

impl ExtractedContent {
    pub fn has_image(&self) -> bool {
        self.image_url.is_some() || self.image_base64.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && !self.has_image()
    }
}

/// Extract text and images at `path`.
///
/// A multimodal content array contributes the concatenation of its `text`
/// parts; `image_url` parts are classified by prefix and the last one of
/// each kind wins.
pub fn extract_content(root: &Value, path: &str) -> ExtractedContent {
    let Some(located) = lookup(root, path) else {
        return ExtractedContent::default();
    };
    let Value::Array(parts) = located.as_ref() else {
        return ExtractedContent {
            text: value_as_text(&located),
            ..Default::default()
        };
    };

    let mut content = ExtractedContent::default();
    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = part.get("text") {
                    content.text.push_str(&value_as_text(text));
                }
            }
            Some("image_url") => {
                let url = part
                    .get("image_url")
                    .and_then(|image| image.get("url"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if url.starts_with("data:image") {
                    content.image_base64 = Some(url.to_string());
                } else if url.starts_with("http") {
                    content.image_url = Some(url.to_string());
                } else if !url.is_empty() {
                    tracing::debug!("ignoring image part with unsupported scheme");
                }
            }
            _ => {}
        }
    }
    content
}

/// Reassembles SSE events from arbitrarily split body chunks.
///
/// Frames are cut at the first blank line after some event content and are
/// returned byte for byte, line endings included, so concatenating every
/// frame reproduces the upstream stream. `\n`, `\r\n` and a lone `\r`
/// all end a line. Blank lines before an event travel with that event.
#[derive(Debug, Default)]
pub struct SseFrameSplitter {
    pending: Vec<u8>,
}

impl SseFrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and take every complete frame. A trailing partial frame
    /// is kept until more data arrives or `end_of_stream` flushes it.
    pub fn push(&mut self, data: &[u8], end_of_stream: bool) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(data);
        let mut frames = Vec::new();
        while let Some(end) = find_frame_end(&self.pending, end_of_stream) {
            frames.push(self.pending.drain(..end).collect());
        }
        if end_of_stream && !self.pending.is_empty() {
            frames.push(std::mem::take(&mut self.pending));
        }
        frames
    }
}

/// Offset just past the blank line closing the first event in `data`.
///
/// A `\r` as the last byte may be the first half of `\r\n`, so it only
/// counts as a line end once the stream has ended.
fn find_frame_end(data: &[u8], end_of_stream: bool) -> Option<usize> {
    let mut at_line_start = true;
    let mut has_content = false;
    let mut i = 0;
    while i < data.len() {
        let line_end = match data[i] {
            b'\n' => 1,
            b'\r' => match data.get(i + 1) {
                Some(b'\n') => 2,
                Some(_) => 1,
                None if end_of_stream => 1,
                None => return None,
            },
            _ => 0,
        };
        if line_end == 0 {
            has_content = true;
            at_line_start = false;
            i += 1;
            continue;
        }
        i += line_end;
        if at_line_start && has_content {
            return Some(i);
        }
        at_line_start = true;
    }
    None
}

/// Checkable text of one SSE frame.
///
/// The frame's `data:` lines are joined into the event payload; `[DONE]`
/// and payloads that are not JSON yield empty text.
pub fn frame_text(frame: &[u8], path: &str) -> String {
    let frame = String::from_utf8_lossy(frame)
        .replace("\r\n", "\n")
        .replace('\r', "\n");
    let payload = frame
        .lines()
        .filter_map(|line| line.strip_prefix(SSE_DATA_PREFIX))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect::<Vec<_>>()
        .join("\n");
    let payload = payload.trim();
    if payload.is_empty() || payload == SSE_DONE {
        return String::new();
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(event) => text_at(&event, path),
        Err(_) => String::new(),
    }
}

/// Concatenated text of every frame in a fully buffered SSE body.
pub fn extract_stream_body_text(body: &[u8], path: &str) -> String {
    let mut splitter = SseFrameSplitter::new();
    splitter
        .push(body, true)
        .iter()
        .map(|frame| frame_text(frame, path))
        .collect()
}
