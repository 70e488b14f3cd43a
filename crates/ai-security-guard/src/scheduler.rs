//! Chunk scheduling for moderation calls.
//!
//! Buffered bodies are planned up front as a queue of [`CheckStep`]s that
//! the exchange consumes one verdict at a time. Streaming bodies accumulate
//! SSE frames until enough text is pending, then drain as one batch.

use crate::extract::{frame_text, ExtractedContent, SseFrameSplitter};
use crate::image_generation::ImageGenerationRequest;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceKind {
    Text,
    ImageUrl,
    ImageBase64,
}

/// One checkable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPiece {
    pub kind: PieceKind,
    pub payload: String,
    /// Offset of a text slice in characters; zero for images.
    pub offset: usize,
}

impl ContentPiece {
    pub fn text(payload: impl Into<String>, offset: usize) -> Self {
        Self {
            kind: PieceKind::Text,
            payload: payload.into(),
            offset,
        }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self {
            kind: PieceKind::ImageUrl,
            payload: url.into(),
            offset: 0,
        }
    }

    pub fn image_base64(data: impl Into<String>) -> Self {
        Self {
            kind: PieceKind::ImageBase64,
            payload: data.into(),
            offset: 0,
        }
    }
}

/// Slice `content` left to right into pieces of at most `limit` characters.
///
/// Lengths count Unicode scalar values, so a slice never splits a
/// character. Every slice but the last has exactly `limit` characters.
pub fn slice_content(content: &str, limit: usize) -> Vec<ContentPiece> {
    let limit = limit.max(1);
    let mut pieces = Vec::new();
    let mut start_byte = 0;
    let mut start_char = 0;
    let mut count = 0;
    for (byte, _) in content.char_indices() {
        if count == limit {
            pieces.push(ContentPiece::text(&content[start_byte..byte], start_char));
            start_byte = byte;
            start_char += count;
            count = 0;
        }
        count += 1;
    }
    if count > 0 {
        pieces.push(ContentPiece::text(&content[start_byte..], start_char));
    }
    pieces
}

/// One pending moderation call of a buffered plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStep {
    /// Image pieces checked together in a single call.
    Image(Vec<ContentPiece>),
    Text(ContentPiece),
}

impl CheckStep {
    pub fn image_url(&self) -> Option<&str> {
        self.image_piece(PieceKind::ImageUrl)
    }

    pub fn image_base64(&self) -> Option<&str> {
        self.image_piece(PieceKind::ImageBase64)
    }

    fn image_piece(&self, kind: PieceKind) -> Option<&str> {
        match self {
            CheckStep::Image(pieces) => pieces
                .iter()
                .find(|piece| piece.kind == kind)
                .map(|piece| piece.payload.as_str()),
            CheckStep::Text(_) => None,
        }
    }
}

/// Queue of calls for a whole-body check: the image first, then each text
/// slice in order.
#[derive(Debug, Clone, Default)]
pub struct BufferedScheduler {
    steps: VecDeque<CheckStep>,
}

impl BufferedScheduler {
    pub fn new(content: &ExtractedContent, chunk_limit: usize, check_images: bool) -> Self {
        let mut steps = VecDeque::new();
        if check_images && content.has_image() {
            let mut pieces = Vec::with_capacity(2);
            if let Some(url) = &content.image_url {
                pieces.push(ContentPiece::image_url(url.clone()));
            }
            if let Some(data) = &content.image_base64 {
                pieces.push(ContentPiece::image_base64(data.clone()));
            }
            steps.push_back(CheckStep::Image(pieces));
        }
        steps.extend(
            slice_content(&content.text, chunk_limit)
                .into_iter()
                .map(CheckStep::Text),
        );
        Self { steps }
    }

    /// Plan for an image-generation request: the prompt slices first, then
    /// one call per image.
    pub fn for_image_generation(
        request: &ImageGenerationRequest,
        chunk_limit: usize,
        check_images: bool,
    ) -> Self {
        let mut steps: VecDeque<CheckStep> = slice_content(&request.text, chunk_limit)
            .into_iter()
            .map(CheckStep::Text)
            .collect();
        if check_images {
            steps.extend(
                request
                    .images
                    .iter()
                    .map(|image| CheckStep::Image(vec![image.clone()])),
            );
        }
        Self { steps }
    }

    /// One call per generated image URL.
    pub fn for_generated_images(urls: &[String]) -> Self {
        Self {
            steps: urls
                .iter()
                .map(|url| CheckStep::Image(vec![ContentPiece::image_url(url.clone())]))
                .collect(),
        }
    }

    /// Take the next call to issue.
    pub fn next_step(&mut self) -> Option<CheckStep> {
        self.steps.pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

/// A streaming batch taken off the pending queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamBatch {
    /// Raw frames in arrival order, held until the verdict.
    pub raw: Vec<u8>,
    /// Concatenated extracted text.
    pub text: String,
    pub frames: usize,
}

#[derive(Debug)]
struct PendingFrame {
    raw: Vec<u8>,
    text: String,
}

/// Ordered queue of SSE frames awaiting a check.
#[derive(Debug)]
pub struct StreamingScheduler {
    splitter: SseFrameSplitter,
    path: String,
    buffer_limit: usize,
    flush_interval: Option<Duration>,
    pending: VecDeque<PendingFrame>,
    pending_chars: usize,
    /// When the oldest pending frame was queued.
    window_started: Option<Instant>,
}

impl StreamingScheduler {
    pub fn new(path: impl Into<String>, buffer_limit: usize) -> Self {
        Self {
            splitter: SseFrameSplitter::new(),
            path: path.into(),
            buffer_limit,
            flush_interval: None,
            pending: VecDeque::new(),
            pending_chars: 0,
            window_started: None,
        }
    }

    /// Also check once the oldest pending frame has waited longer than
    /// `interval`, however little text is pending.
    pub fn with_flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Append the complete frames found in `data`.
    pub fn push(&mut self, data: &[u8], end_of_stream: bool) {
        for raw in self.splitter.push(data, end_of_stream) {
            let text = frame_text(&raw, &self.path);
            self.pending_chars += text.chars().count();
            self.pending.push_back(PendingFrame { raw, text });
            self.window_started.get_or_insert_with(Instant::now);
        }
    }

    /// Whether a batch should be checked now.
    pub fn should_check(&self, end_of_stream: bool) -> bool {
        self.should_check_at(end_of_stream, Instant::now())
    }

    pub fn should_check_at(&self, end_of_stream: bool, now: Instant) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        end_of_stream || self.pending_chars >= self.buffer_limit || self.window_elapsed(now)
    }

    fn window_elapsed(&self, now: Instant) -> bool {
        match (self.flush_interval, self.window_started) {
            (Some(interval), Some(started)) => now.saturating_duration_since(started) > interval,
            _ => false,
        }
    }

    /// Take every pending frame, in order.
    pub fn drain(&mut self) -> StreamBatch {
        let mut batch = StreamBatch::default();
        for frame in self.pending.drain(..) {
            batch.raw.extend_from_slice(&frame.raw);
            batch.text.push_str(&frame.text);
            batch.frames += 1;
        }
        self.pending_chars = 0;
        self.window_started = None;
        batch
    }

    /// Drop everything still queued or partially received.
    pub fn discard(&mut self) {
        self.pending.clear();
        self.pending_chars = 0;
        self.window_started = None;
        self.splitter = SseFrameSplitter::new();
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_chars(&self) -> usize {
        self.pending_chars
    }
}
