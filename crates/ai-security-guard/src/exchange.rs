//! Per-exchange orchestration.
//!
//! The host drives an [`Exchange`] through its header, body and completion
//! callbacks. At most one moderation call is outstanding at a time; while it
//! is, the affected phase stays paused (buffered bodies) or the drained
//! frames stay held (streaming bodies). Every completion resolves to exactly
//! one [`Resolution`].

use crate::audit::{AuditRecord, Outcome};
use crate::config::{CheckAction, GuardConfig};
use crate::deny::{deny_message, DenialPayload, DenyProtocol};
use crate::error::{GuardError, Result};
use crate::extract::{extract_content, extract_stream_body_text, parse_body, ExtractedContent};
use crate::guard::GuardContext;
use crate::host::{BodyAction, FilterHost, HeaderAction, Phase};
use crate::ids;
use crate::image_generation::{parse_qwen_request, parse_qwen_response};
use crate::metrics::{deny_counter, error_counter};
use crate::scheduler::{BufferedScheduler, CheckStep, StreamBatch, StreamingScheduler};
use crate::signer::{CanonicalRequest, ModerationRequest};
use crate::verdict::{HttpReply, ModerationResponse};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

const STATUS_HEADER: &str = ":status";
const CONTENT_TYPE_HEADER: &str = "content-type";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    HeadersSeen,
    BodyPending,
    Checking,
    Resumed,
    Denied,
}

/// Per-exchange flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeFlags {
    /// The request asked for a streamed completion.
    pub request_stream: bool,
    /// The response is an SSE stream.
    pub streaming: bool,
    pub end_of_stream_received: bool,
    /// The end-of-stream marker has been emitted downstream.
    pub stream_closed: bool,
    pub during_call: bool,
    pub risk_detected: bool,
    /// The request was refused; response hooks pass through.
    pub request_denied: bool,
    /// The response is not checked (disabled, or non-2xx upstream).
    pub skip_response: bool,
}

/// How a moderation completion was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The next planned call was issued.
    Advance,
    /// Content continues unmodified.
    Resume,
    /// A refusal replaced the content.
    Deny,
}

#[derive(Debug)]
enum InFlight {
    Buffered { phase: Phase, action: CheckAction },
    Stream { action: CheckAction, batch: StreamBatch },
}

/// State of one request/response pair.
pub struct Exchange {
    context: Arc<GuardContext>,
    state: ExchangeState,
    flags: ExchangeFlags,
    consumer: String,
    session_id: String,
    plan: BufferedScheduler,
    stream: Option<StreamingScheduler>,
    in_flight: Option<InFlight>,
    started_at: DateTime<Utc>,
}

impl Exchange {
    pub(crate) fn new(context: Arc<GuardContext>) -> Self {
        Self {
            context,
            state: ExchangeState::Idle,
            flags: ExchangeFlags::default(),
            consumer: String::new(),
            session_id: ids::session_id(),
            plan: BufferedScheduler::default(),
            stream: None,
            in_flight: None,
            started_at: Utc::now(),
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn flags(&self) -> &ExchangeFlags {
        &self.flags
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn config(&self) -> &GuardConfig {
        self.context.config()
    }

    pub fn on_request_headers(&mut self, host: &dyn FilterHost) -> HeaderAction {
        self.consumer = host
            .request_header(&self.config().consumer_header)
            .unwrap_or_default();
        self.state = ExchangeState::HeadersSeen;
        if self.config().check_request {
            HeaderAction::StopIteration
        } else {
            HeaderAction::Continue
        }
    }

    pub fn on_request_body(&mut self, host: &mut dyn FilterHost, body: &[u8]) -> BodyAction {
        if !self.config().check_request {
            self.state = ExchangeState::Resumed;
            return BodyAction::Continue;
        }
        self.state = ExchangeState::BodyPending;

        let root = match parse_body(body) {
            Ok(root) => root,
            Err(e) => {
                tracing::debug!(consumer = %self.consumer, error = %e, "request body not checkable, skip");
                self.state = ExchangeState::Resumed;
                return BodyAction::Continue;
            }
        };
        self.flags.request_stream = root.get("stream").and_then(Value::as_bool) == Some(true);

        if self.config().is_image_generation() {
            let request = parse_qwen_request(&root);
            tracing::debug!(
                consumer = %self.consumer,
                content = %request.text,
                images = request.images.len(),
                "raw image generation request"
            );
            if request.is_empty() {
                tracing::info!(consumer = %self.consumer, "request content is empty, skip");
                self.state = ExchangeState::Resumed;
                return BodyAction::Continue;
            }
            let plan = BufferedScheduler::for_image_generation(
                &request,
                self.config().chunk_limit,
                self.config().check_request_image,
            );
            return self.start_plan(host, Phase::Request, plan);
        }

        let content = extract_content(&root, &self.config().request_content_json_path);
        tracing::debug!(consumer = %self.consumer, content = %content.text, "raw request content");
        if content.is_empty() {
            tracing::info!(consumer = %self.consumer, "request content is empty, skip");
            self.state = ExchangeState::Resumed;
            return BodyAction::Continue;
        }

        self.begin_buffered(host, Phase::Request, &content)
    }

    pub fn on_response_headers(&mut self, host: &dyn FilterHost) -> HeaderAction {
        if self.flags.request_denied || !self.config().check_response {
            self.flags.skip_response = true;
            return HeaderAction::Continue;
        }
        let status = host
            .response_header(STATUS_HEADER)
            .and_then(|s| s.trim().parse::<u16>().ok())
            .unwrap_or(200);
        if !(200..300).contains(&status) {
            tracing::debug!(status, "upstream status is not success, skip response check");
            self.flags.skip_response = true;
            return HeaderAction::Continue;
        }

        self.state = ExchangeState::HeadersSeen;
        self.started_at = Utc::now();
        let content_type = host.response_header(CONTENT_TYPE_HEADER).unwrap_or_default();
        // Generated images are only checked once the whole body is known.
        if content_type.contains("event-stream") && !self.config().is_image_generation() {
            self.flags.streaming = true;
            self.stream = Some(
                StreamingScheduler::new(
                    self.config().response_stream_content_json_path.clone(),
                    self.config().buffer_limit,
                )
                .with_flush_interval(self.config().buffer_flush_interval),
            );
            HeaderAction::Continue
        } else {
            HeaderAction::StopIteration
        }
    }

    /// Whole-body response check. An SSE body the host buffered is checked
    /// as the concatenation of its frames' text.
    pub fn on_response_body(&mut self, host: &mut dyn FilterHost, body: &[u8]) -> BodyAction {
        if self.flags.skip_response {
            return BodyAction::Continue;
        }
        self.state = ExchangeState::BodyPending;

        if self.config().is_image_generation() {
            let urls = match parse_body(body) {
                Ok(root) => parse_qwen_response(&root),
                Err(e) => {
                    tracing::debug!(consumer = %self.consumer, error = %e, "response body not checkable, skip");
                    Vec::new()
                }
            };
            if urls.is_empty() {
                self.state = ExchangeState::Resumed;
                return BodyAction::Continue;
            }
            return self.start_plan(
                host,
                Phase::Response,
                BufferedScheduler::for_generated_images(&urls),
            );
        }

        let text = if self.flags.streaming {
            extract_stream_body_text(body, &self.config().response_stream_content_json_path)
        } else {
            match parse_body(body) {
                Ok(root) => extract_content(&root, &self.config().response_content_json_path).text,
                Err(e) => {
                    tracing::debug!(consumer = %self.consumer, error = %e, "response body not checkable, skip");
                    String::new()
                }
            }
        };
        if text.is_empty() {
            tracing::info!(consumer = %self.consumer, "response content is empty, skip");
            self.state = ExchangeState::Resumed;
            return BodyAction::Continue;
        }

        let content = ExtractedContent {
            text,
            ..Default::default()
        };
        self.begin_buffered(host, Phase::Response, &content)
    }

    /// Incremental SSE response check. Returns the bytes to forward now;
    /// checked frames are re-emitted through `inject_response_data`.
    pub fn on_streaming_response_body(
        &mut self,
        host: &mut dyn FilterHost,
        data: &[u8],
        end_of_stream: bool,
    ) -> Vec<u8> {
        if self.flags.skip_response || self.stream.is_none() {
            return data.to_vec();
        }
        if self.flags.risk_detected {
            return Vec::new();
        }
        if end_of_stream {
            self.flags.end_of_stream_received = true;
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.push(data, end_of_stream);
        }
        self.schedule_stream(host);
        Vec::new()
    }

    /// Feed the reply (or transport failure) of the outstanding call.
    pub fn on_moderation_response(
        &mut self,
        host: &mut dyn FilterHost,
        reply: Result<HttpReply>,
    ) -> Resolution {
        let Some(in_flight) = self.in_flight.take() else {
            tracing::warn!(session_id = %self.session_id, "moderation reply without an outstanding call");
            return Resolution::Resume;
        };
        self.flags.during_call = false;
        let verdict = reply.and_then(|reply| ModerationResponse::from_reply(&reply));

        match in_flight {
            InFlight::Buffered { phase, action } => match verdict {
                Err(e) => {
                    self.record_error(phase, &e);
                    if action == CheckAction::MultiModalGuardForBase64 {
                        // Image check failed; the text slices are still checked.
                        return self.advance_buffered(host, phase);
                    }
                    self.resume_phase(host, phase);
                    Resolution::Resume
                }
                Ok(response) => {
                    let decision =
                        self.context
                            .policy()
                            .evaluate(action, &response.data, &self.consumer);
                    if decision.allowed {
                        self.advance_buffered(host, phase)
                    } else {
                        tracing::info!(
                            consumer = %self.consumer,
                            session_id = %self.session_id,
                            phase = %phase,
                            reason = decision.reason.as_deref().unwrap_or_default(),
                            "content denied"
                        );
                        self.deny(host, phase, &response, false);
                        Resolution::Deny
                    }
                }
            },
            InFlight::Stream { action, batch } => match verdict {
                Err(e) => {
                    self.record_error(Phase::Response, &e);
                    self.emit_batch(host, batch);
                    self.schedule_stream(host);
                    Resolution::Resume
                }
                Ok(response) => {
                    let decision =
                        self.context
                            .policy()
                            .evaluate(action, &response.data, &self.consumer);
                    if decision.allowed {
                        self.emit_batch(host, batch);
                        self.schedule_stream(host);
                        Resolution::Resume
                    } else {
                        tracing::info!(
                            consumer = %self.consumer,
                            session_id = %self.session_id,
                            phase = %Phase::Response,
                            reason = decision.reason.as_deref().unwrap_or_default(),
                            "stream denied"
                        );
                        if let Some(stream) = self.stream.as_mut() {
                            stream.discard();
                        }
                        self.deny(host, Phase::Response, &response, true);
                        Resolution::Deny
                    }
                }
            },
        }
    }

    fn begin_buffered(
        &mut self,
        host: &mut dyn FilterHost,
        phase: Phase,
        content: &ExtractedContent,
    ) -> BodyAction {
        let plan = BufferedScheduler::new(
            content,
            self.config().chunk_limit,
            phase == Phase::Request && self.config().action.is_multimodal(),
        );
        self.start_plan(host, phase, plan)
    }

    fn start_plan(
        &mut self,
        host: &mut dyn FilterHost,
        phase: Phase,
        plan: BufferedScheduler,
    ) -> BodyAction {
        self.started_at = Utc::now();
        self.plan = plan;
        match self.issue_next(host, phase) {
            Some(true) => BodyAction::Pause,
            // Nothing was issued: the phase was never paused.
            Some(false) | None => {
                self.state = ExchangeState::Resumed;
                BodyAction::Continue
            }
        }
    }

    /// Issue the next planned step. `Some(true)` when a call is in flight,
    /// `Some(false)` when dispatch failed, `None` when the plan is done.
    fn issue_next(&mut self, host: &mut dyn FilterHost, phase: Phase) -> Option<bool> {
        let step = self.plan.next_step()?;
        let issued = self
            .build_step_request(phase, &step)
            .and_then(|(action, request)| {
                host.dispatch(request, self.config().timeout)?;
                Ok(action)
            });
        match issued {
            Ok(action) => {
                self.flags.during_call = true;
                self.in_flight = Some(InFlight::Buffered { phase, action });
                self.state = ExchangeState::Checking;
                Some(true)
            }
            Err(e) => {
                self.record_error(phase, &e);
                Some(false)
            }
        }
    }

    fn advance_buffered(&mut self, host: &mut dyn FilterHost, phase: Phase) -> Resolution {
        match self.issue_next(host, phase) {
            Some(true) => Resolution::Advance,
            Some(false) => {
                self.resume_phase(host, phase);
                Resolution::Resume
            }
            None => {
                let record = AuditRecord::new(
                    phase,
                    Outcome::Pass,
                    self.started_at,
                    &self.consumer,
                    &self.session_id,
                );
                host.write_audit(&record);
                self.resume_phase(host, phase);
                Resolution::Resume
            }
        }
    }

    fn build_step_request(
        &self,
        phase: Phase,
        step: &CheckStep,
    ) -> Result<(CheckAction, ModerationRequest)> {
        let config = self.config();
        let host = &config.endpoint.host;
        match step {
            CheckStep::Image(_) => {
                let action = CheckAction::MultiModalGuardForBase64;
                let service = match phase {
                    Phase::Request => config.request_image_check_service_for(&self.consumer),
                    Phase::Response => config
                        .response_image_check_service_for(&self.consumer)
                        .ok_or_else(|| {
                            GuardError::Config("no responseImageCheckService configured".into())
                        })?,
                };
                let request = CanonicalRequest::new(host, action)
                    .image_check(service, step.image_url(), step.image_base64())
                    .sign(&config.credentials)?;
                Ok((action, request))
            }
            CheckStep::Text(piece) => {
                tracing::debug!(offset = piece.offset, "current content piece");
                let request = self.text_request(phase, &piece.payload)?;
                Ok((config.action, request))
            }
        }
    }

    fn text_request(&self, phase: Phase, text: &str) -> Result<ModerationRequest> {
        let config = self.config();
        let service = match phase {
            Phase::Request => config.request_check_service_for(&self.consumer),
            Phase::Response => config.response_check_service_for(&self.consumer),
        };
        CanonicalRequest::new(&config.endpoint.host, config.action)
            .text_check(service, text, &self.session_id)
            .sign(&config.credentials)
    }

    /// Drain and check pending frames until a call is in flight or nothing
    /// is due.
    fn schedule_stream(&mut self, host: &mut dyn FilterHost) {
        loop {
            if self.flags.during_call || self.flags.risk_detected {
                return;
            }
            let end_of_stream = self.flags.end_of_stream_received;
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            if !stream.should_check(end_of_stream) {
                if end_of_stream && stream.pending_frames() == 0 && !self.flags.stream_closed {
                    self.close_stream(host, Vec::new());
                }
                if !self.flags.stream_closed {
                    self.state = ExchangeState::BodyPending;
                }
                return;
            }

            let batch = stream.drain();
            if batch.text.is_empty() {
                self.emit_batch(host, batch);
                continue;
            }

            let action = self.config().action;
            let issued = self
                .text_request(Phase::Response, &batch.text)
                .and_then(|request| host.dispatch(request, self.config().timeout));
            match issued {
                Ok(()) => {
                    self.flags.during_call = true;
                    self.state = ExchangeState::Checking;
                    self.in_flight = Some(InFlight::Stream { action, batch });
                    return;
                }
                Err(e) => {
                    self.record_error(Phase::Response, &e);
                    self.emit_batch(host, batch);
                }
            }
        }
    }

    /// Re-emit held frames, closing the stream when nothing else can follow.
    fn emit_batch(&mut self, host: &mut dyn FilterHost, batch: StreamBatch) {
        let nothing_pending = self
            .stream
            .as_ref()
            .map(|s| s.pending_frames() == 0)
            .unwrap_or(true);
        if self.flags.end_of_stream_received && nothing_pending {
            self.close_stream(host, batch.raw);
        } else if !batch.raw.is_empty() {
            host.inject_response_data(batch.raw, false);
        }
    }

    fn close_stream(&mut self, host: &mut dyn FilterHost, data: Vec<u8>) {
        host.inject_response_data(data, true);
        self.flags.stream_closed = true;
        self.state = ExchangeState::Resumed;
        let record = AuditRecord::new(
            Phase::Response,
            Outcome::Pass,
            self.started_at,
            &self.consumer,
            &self.session_id,
        );
        host.write_audit(&record);
    }

    fn resume_phase(&mut self, host: &mut dyn FilterHost, phase: Phase) {
        host.resume(phase);
        self.state = ExchangeState::Resumed;
    }

    fn deny(
        &mut self,
        host: &mut dyn FilterHost,
        phase: Phase,
        response: &ModerationResponse,
        mid_stream: bool,
    ) {
        let config = self.context.config();
        let streaming = match phase {
            Phase::Request => self.flags.request_stream,
            Phase::Response => self.flags.streaming,
        };
        let message = deny_message(config.deny_message.as_deref(), &response.data);
        // Image-generation clients get the bare message.
        let protocol = if config.is_image_generation() {
            DenyProtocol::Passthrough
        } else {
            config.protocol
        };
        let payload = DenialPayload::build(protocol, streaming, config.deny_code, message);

        if mid_stream {
            host.inject_response_data(payload.body, true);
            self.flags.stream_closed = true;
        } else {
            host.send_local_response(
                payload.status_code,
                vec![(CONTENT_TYPE_HEADER.to_string(), payload.content_type.to_string())],
                payload.body,
            );
        }

        self.flags.risk_detected = true;
        if phase == Phase::Request {
            self.flags.request_denied = true;
        }
        self.state = ExchangeState::Denied;
        self.context.metrics().increment(deny_counter(phase), 1);
        let record = AuditRecord::new(
            phase,
            Outcome::Deny,
            self.started_at,
            &self.consumer,
            &self.session_id,
        )
        .with_verdict(response);
        host.write_audit(&record);
    }

    fn record_error(&self, phase: Phase, error: &GuardError) {
        if error.is_fail_open() {
            tracing::warn!(
                consumer = %self.consumer,
                session_id = %self.session_id,
                phase = %phase,
                error = %error,
                "moderation check failed, passing content through"
            );
        } else {
            tracing::error!(
                consumer = %self.consumer,
                session_id = %self.session_id,
                phase = %phase,
                error = %error,
                "moderation call could not be built, passing content through"
            );
        }
        self.context.metrics().increment(error_counter(phase), 1);
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("consumer", &self.consumer)
            .field("session_id", &self.session_id)
            .field("pending_steps", &self.plan.remaining())
            .finish()
    }
}
