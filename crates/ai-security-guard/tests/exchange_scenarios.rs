//! End-to-end exchange scenarios against a recording host.

use ai_security_guard::metrics::{REQUEST_DENY, REQUEST_ERROR, RESPONSE_DENY};
use ai_security_guard::{
    AuditRecord, BodyAction, CheckAction, FilterHost, GuardConfig, GuardError, HeaderAction,
    HttpReply, InMemoryMetrics, ModerationRequest, Outcome, Phase, Resolution, Result,
    SecurityGuard,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingHost {
    request_headers: HashMap<String, String>,
    response_headers: HashMap<String, String>,
    dispatched: Vec<ModerationRequest>,
    resumed: Vec<Phase>,
    local_responses: Vec<(u16, Vec<(String, String)>, Vec<u8>)>,
    injected: Vec<(Vec<u8>, bool)>,
    audits: Vec<AuditRecord>,
    log: Vec<(&'static str, Value)>,
}

impl RecordingHost {
    fn with_consumer(consumer: &str) -> Self {
        let mut host = Self::default();
        host.request_headers
            .insert("x-mse-consumer".to_string(), consumer.to_string());
        host
    }

    fn streaming_response() -> Self {
        let mut host = Self::default();
        host.response_headers
            .insert(":status".to_string(), "200".to_string());
        host.response_headers
            .insert("content-type".to_string(), "text/event-stream".to_string());
        host
    }

    fn checked_content(&self, index: usize) -> String {
        let fields = self.dispatched[index].form_fields();
        let parameters: Value = serde_json::from_str(&fields["ServiceParameters"]).unwrap();
        parameters["content"].as_str().unwrap_or_default().to_string()
    }

    fn checked_image_url(&self, index: usize) -> Option<String> {
        let fields = self.dispatched[index].form_fields();
        let parameters: Value = serde_json::from_str(&fields["ServiceParameters"]).unwrap();
        parameters["imageUrls"][0].as_str().map(str::to_string)
    }

    fn injected_bytes(&self) -> Vec<u8> {
        self.injected
            .iter()
            .flat_map(|(data, _)| data.clone())
            .collect()
    }
}

impl FilterHost for RecordingHost {
    fn request_header(&self, name: &str) -> Option<String> {
        self.request_headers.get(name).cloned()
    }

    fn response_header(&self, name: &str) -> Option<String> {
        self.response_headers.get(name).cloned()
    }

    fn resume(&mut self, phase: Phase) {
        self.resumed.push(phase);
    }

    fn send_local_response(&mut self, status: u16, headers: Vec<(String, String)>, body: Vec<u8>) {
        self.local_responses.push((status, headers, body));
    }

    fn inject_response_data(&mut self, data: Vec<u8>, end_of_stream: bool) {
        self.injected.push((data, end_of_stream));
    }

    fn dispatch(&mut self, request: ModerationRequest, _timeout: Duration) -> Result<()> {
        self.dispatched.push(request);
        Ok(())
    }

    fn log_attribute(&mut self, key: &'static str, value: Value) {
        self.log.push((key, value));
    }

    fn write_audit(&mut self, record: &AuditRecord) {
        self.audits.push(record.clone());
        for (key, value) in record.attributes() {
            self.log_attribute(key, value);
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn guard(extra: Value) -> (SecurityGuard, Arc<InMemoryMetrics>) {
    init_tracing();
    let mut config = json!({
        "serviceName": "safecheck.dns",
        "servicePort": 443,
        "serviceHost": "green-cip.example.com",
        "accessKey": "test-ak",
        "secretKey": "test-sk",
    });
    if let (Some(target), Some(source)) = (config.as_object_mut(), extra.as_object()) {
        target.extend(source.clone());
    }
    let metrics = Arc::new(InMemoryMetrics::new());
    let guard = SecurityGuard::builder()
        .with_config(GuardConfig::from_value(config).unwrap())
        .with_metrics(metrics.clone())
        .build()
        .unwrap();
    (guard, metrics)
}

fn verdict(risk_level: &str) -> Result<HttpReply> {
    Ok(HttpReply::new(
        200,
        json!({
            "Code": 200,
            "Message": "OK",
            "RequestId": "req-1",
            "Data": {"RiskLevel": risk_level}
        })
        .to_string(),
    ))
}

fn risky_verdict() -> Result<HttpReply> {
    Ok(HttpReply::new(
        200,
        json!({
            "Code": 200,
            "RequestId": "req-2",
            "Data": {
                "RiskLevel": "high",
                "Result": [{"Label": "political_content", "RiskWords": "forbidden"}],
                "Advice": [{"Answer": "Let's talk about something else."}]
            }
        })
        .to_string(),
    ))
}

fn chat_request(text: &str) -> Vec<u8> {
    json!({"messages": [{"role": "user", "content": text}]})
        .to_string()
        .into_bytes()
}

fn delta_frame(token: &str) -> Vec<u8> {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"index": 0, "delta": {"content": token}}]})
    )
    .into_bytes()
}

#[test]
fn request_denied_with_chat_completion() {
    let (guard, metrics) = guard(json!({"checkRequest": true}));
    let mut host = RecordingHost::with_consumer("alice");
    let mut exchange = guard.new_exchange();

    assert_eq!(exchange.on_request_headers(&host), HeaderAction::StopIteration);
    assert_eq!(
        exchange.on_request_body(&mut host, &chat_request("something forbidden")),
        BodyAction::Pause
    );
    assert_eq!(host.dispatched.len(), 1);
    assert_eq!(host.dispatched[0].action, CheckAction::TextModerationPlus);
    assert_eq!(host.dispatched[0].service, "llm_query_moderation");
    assert_eq!(host.checked_content(0), "something forbidden");
    host.dispatched[0]
        .verify(
            "green-cip.example.com",
            &guard.config().credentials,
        )
        .unwrap();

    let resolution = exchange.on_moderation_response(&mut host, risky_verdict());
    assert_eq!(resolution, Resolution::Deny);
    assert!(host.resumed.is_empty());
    assert_eq!(host.local_responses.len(), 1);

    let (status, headers, body) = &host.local_responses[0];
    assert_eq!(*status, 200);
    assert_eq!(headers[0].1, "application/json");
    let body: Value = serde_json::from_slice(body).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "Let's talk about something else."
    );

    assert_eq!(metrics.get(REQUEST_DENY), 1);
    assert_eq!(host.audits.len(), 1);
    assert_eq!(host.audits[0].status, "request deny");
    assert_eq!(host.audits[0].consumer, "alice");
    assert_eq!(host.audits[0].risk_label.as_deref(), Some("political_content"));

    // Response hooks pass through after a refused request.
    assert_eq!(exchange.on_response_headers(&host), HeaderAction::Continue);
    assert!(exchange.flags().request_denied);
}

#[test]
fn streamed_request_denied_with_sse_refusal() {
    let (guard, _) = guard(json!({"checkRequest": true, "denyMessage": "blocked"}));
    let mut host = RecordingHost::default();
    let mut exchange = guard.new_exchange();
    let body = json!({"stream": true, "messages": [{"role": "user", "content": "bad"}]});

    exchange.on_request_headers(&host);
    exchange.on_request_body(&mut host, body.to_string().as_bytes());
    exchange.on_moderation_response(&mut host, verdict("max"));

    let (_, headers, body) = &host.local_responses[0];
    assert_eq!(headers[0].1, "text/event-stream;charset=UTF-8");
    let body = String::from_utf8(body.clone()).unwrap();
    assert!(body.contains("\"content\":\"blocked\""));
    assert!(body.ends_with("data: [DONE]\n\n"));
}

#[test]
fn passthrough_protocol_denies_with_bare_message() {
    let (guard, _) = guard(json!({
        "checkRequest": true,
        "protocol": "original",
        "denyMessage": "blocked",
        "denyCode": 403
    }));
    let mut host = RecordingHost::default();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    exchange.on_request_body(&mut host, &chat_request("bad"));
    exchange.on_moderation_response(&mut host, verdict("high"));

    let (status, _, body) = &host.local_responses[0];
    assert_eq!(*status, 403);
    assert_eq!(body.as_slice(), b"blocked");
}

#[test]
fn long_request_is_checked_slice_by_slice() {
    let (guard, _) = guard(json!({"checkRequest": true, "chunkLimit": 5}));
    let mut host = RecordingHost::default();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    assert_eq!(
        exchange.on_request_body(&mut host, &chat_request("abcdefghijkl")),
        BodyAction::Pause
    );

    // One call at a time.
    assert_eq!(host.dispatched.len(), 1);
    assert_eq!(
        exchange.on_moderation_response(&mut host, verdict("low")),
        Resolution::Advance
    );
    assert_eq!(host.dispatched.len(), 2);
    assert_eq!(
        exchange.on_moderation_response(&mut host, verdict("none")),
        Resolution::Advance
    );
    assert_eq!(
        exchange.on_moderation_response(&mut host, verdict("medium")),
        Resolution::Resume
    );

    let slices: Vec<String> = (0..3).map(|i| host.checked_content(i)).collect();
    assert_eq!(slices, vec!["abcde", "fghij", "kl"]);
    assert_eq!(host.resumed, vec![Phase::Request]);
    assert_eq!(host.audits.len(), 1);
    assert_eq!(host.audits[0].outcome, Outcome::Pass);
    assert_eq!(host.audits[0].status, "request pass");
}

#[test]
fn deny_on_later_slice_stops_the_plan() {
    let (guard, metrics) = guard(json!({"checkRequest": true, "chunkLimit": 4}));
    let mut host = RecordingHost::default();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    exchange.on_request_body(&mut host, &chat_request("safe then risky"));
    exchange.on_moderation_response(&mut host, verdict("none"));
    assert_eq!(
        exchange.on_moderation_response(&mut host, verdict("high")),
        Resolution::Deny
    );
    assert_eq!(host.dispatched.len(), 2);
    assert_eq!(metrics.get(REQUEST_DENY), 1);
    assert!(host.resumed.is_empty());
}

#[test]
fn backend_failure_fails_open() {
    let (guard, metrics) = guard(json!({"checkRequest": true}));
    let mut host = RecordingHost::default();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    exchange.on_request_body(&mut host, &chat_request("hello"));
    let resolution = exchange.on_moderation_response(
        &mut host,
        Err(GuardError::Transport("timed out".to_string())),
    );

    assert_eq!(resolution, Resolution::Resume);
    assert_eq!(host.resumed, vec![Phase::Request]);
    assert!(host.local_responses.is_empty());
    assert_eq!(metrics.get(REQUEST_ERROR), 1);
    assert!(host.audits.is_empty());
}

#[test]
fn backend_error_code_fails_open() {
    let (guard, metrics) = guard(json!({"checkRequest": true}));
    let mut host = RecordingHost::default();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    exchange.on_request_body(&mut host, &chat_request("hello"));
    let reply = HttpReply::new(200, json!({"Code": 400, "Message": "bad"}).to_string());
    assert_eq!(
        exchange.on_moderation_response(&mut host, Ok(reply)),
        Resolution::Resume
    );
    assert_eq!(metrics.get(REQUEST_ERROR), 1);
}

#[test]
fn consumer_override_raises_the_bar() {
    let (guard, _) = guard(json!({
        "checkRequest": true,
        "consumerRiskLevel": [
            {"name": "vip-", "matchType": "prefix", "riskLevelBar": "max"}
        ]
    }));

    let mut vip = RecordingHost::with_consumer("vip-42");
    let mut exchange = guard.new_exchange();
    exchange.on_request_headers(&vip);
    exchange.on_request_body(&mut vip, &chat_request("edgy"));
    assert_eq!(
        exchange.on_moderation_response(&mut vip, verdict("high")),
        Resolution::Resume
    );

    let mut regular = RecordingHost::with_consumer("guest");
    let mut exchange = guard.new_exchange();
    exchange.on_request_headers(&regular);
    exchange.on_request_body(&mut regular, &chat_request("edgy"));
    assert_eq!(
        exchange.on_moderation_response(&mut regular, verdict("high")),
        Resolution::Deny
    );
}

#[test]
fn consumer_override_picks_check_service() {
    let (guard, _) = guard(json!({
        "checkRequest": true,
        "consumerRequestCheckService": [
            {"name": "team-a", "matchType": "exact", "requestCheckService": "team_a_query"}
        ]
    }));
    let mut host = RecordingHost::with_consumer("team-a");
    let mut exchange = guard.new_exchange();
    exchange.on_request_headers(&host);
    exchange.on_request_body(&mut host, &chat_request("hi"));
    assert_eq!(host.dispatched[0].service, "team_a_query");
}

#[test]
fn multimodal_request_checks_image_then_text() {
    let (guard, _) = guard(json!({"checkRequest": true, "action": "MultiModalGuard"}));
    let mut host = RecordingHost::default();
    let mut exchange = guard.new_exchange();
    let body = json!({"messages": [{"role": "user", "content": [
        {"type": "text", "text": "describe this"},
        {"type": "image_url", "image_url": {"url": "https://img.example.com/cat.png"}}
    ]}]});

    exchange.on_request_headers(&host);
    exchange.on_request_body(&mut host, body.to_string().as_bytes());
    assert_eq!(host.dispatched.len(), 1);
    assert_eq!(host.dispatched[0].action, CheckAction::MultiModalGuardForBase64);
    assert_eq!(host.dispatched[0].service, "img_query_security_check");
    let fields = host.dispatched[0].form_fields();
    assert!(fields["ServiceParameters"].contains("https://img.example.com/cat.png"));

    // Image check failures still check the text.
    assert_eq!(
        exchange.on_moderation_response(
            &mut host,
            Err(GuardError::Transport("reset".to_string()))
        ),
        Resolution::Advance
    );
    assert_eq!(host.dispatched[1].action, CheckAction::MultiModalGuard);
    assert_eq!(host.dispatched[1].service, "query_security_check");
    assert_eq!(host.checked_content(1), "describe this");

    assert_eq!(
        exchange.on_moderation_response(&mut host, verdict("high")),
        Resolution::Resume
    );
    assert_eq!(host.resumed, vec![Phase::Request]);
}

#[test]
fn buffered_response_is_checked() {
    let (guard, metrics) = guard(json!({"checkResponse": true}));
    let mut host = RecordingHost::default();
    host.response_headers
        .insert(":status".to_string(), "200".to_string());
    host.response_headers
        .insert("content-type".to_string(), "application/json".to_string());
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    assert_eq!(exchange.on_request_body(&mut host, &chat_request("hi")), BodyAction::Continue);
    assert_eq!(exchange.on_response_headers(&host), HeaderAction::StopIteration);

    let body = json!({"choices": [{"message": {"role": "assistant", "content": "answer"}}]});
    assert_eq!(
        exchange.on_response_body(&mut host, body.to_string().as_bytes()),
        BodyAction::Pause
    );
    assert_eq!(host.dispatched[0].service, "llm_response_moderation");
    assert_eq!(host.checked_content(0), "answer");

    assert_eq!(
        exchange.on_moderation_response(&mut host, risky_verdict()),
        Resolution::Deny
    );
    assert_eq!(host.local_responses.len(), 1);
    assert_eq!(metrics.get(RESPONSE_DENY), 1);
    assert_eq!(host.audits[0].status, "response deny");
}

#[test]
fn stream_frames_held_until_batch_passes() {
    let (guard, _) = guard(json!({"checkResponse": true, "bufferLimit": 10}));
    let mut host = RecordingHost::streaming_response();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    assert_eq!(exchange.on_response_headers(&host), HeaderAction::Continue);
    assert!(exchange.flags().streaming);

    let first = delta_frame("Hello ");
    let second = delta_frame("world ");
    let third = delta_frame("again ");

    assert!(exchange
        .on_streaming_response_body(&mut host, &first, false)
        .is_empty());
    assert!(host.dispatched.is_empty());

    // Split mid-frame: only complete frames count.
    let (head, tail) = second.split_at(10);
    exchange.on_streaming_response_body(&mut host, head, false);
    assert!(host.dispatched.is_empty());
    exchange.on_streaming_response_body(&mut host, tail, false);
    assert_eq!(host.dispatched.len(), 1);
    assert_eq!(host.checked_content(0), "Hello world ");

    // Held while the call is in flight.
    exchange.on_streaming_response_body(&mut host, &third, false);
    assert_eq!(host.dispatched.len(), 1);
    assert!(host.injected.is_empty());

    assert_eq!(
        exchange.on_moderation_response(&mut host, verdict("low")),
        Resolution::Resume
    );
    let mut expected = first.clone();
    expected.extend_from_slice(&second);
    assert_eq!(host.injected, vec![(expected.clone(), false)]);

    exchange.on_streaming_response_body(&mut host, b"data: [DONE]\n\n", true);
    assert_eq!(host.dispatched.len(), 2);
    assert_eq!(host.checked_content(1), "again ");
    assert_eq!(
        exchange.on_moderation_response(&mut host, verdict("none")),
        Resolution::Resume
    );

    let (last, end_of_stream) = host.injected.last().unwrap();
    assert!(*end_of_stream);
    assert!(last.ends_with(b"data: [DONE]\n\n"));
    expected.extend_from_slice(&third);
    expected.extend_from_slice(b"data: [DONE]\n\n");
    assert_eq!(host.injected_bytes(), expected);
    assert_eq!(host.audits.len(), 1);
    assert_eq!(host.audits[0].status, "response pass");
}

#[test]
fn stream_denied_mid_way() {
    let (guard, metrics) = guard(json!({"checkResponse": true, "bufferLimit": 5}));
    let mut host = RecordingHost::streaming_response();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    exchange.on_response_headers(&host);

    exchange.on_streaming_response_body(&mut host, &delta_frame("fine! "), false);
    exchange.on_moderation_response(&mut host, verdict("none"));
    assert_eq!(host.injected.len(), 1);

    exchange.on_streaming_response_body(&mut host, &delta_frame("risky "), false);
    assert_eq!(
        exchange.on_moderation_response(&mut host, risky_verdict()),
        Resolution::Deny
    );

    let (refusal, end_of_stream) = host.injected.last().unwrap();
    assert!(*end_of_stream);
    let refusal = String::from_utf8(refusal.clone()).unwrap();
    assert!(refusal.contains("chat.completion.chunk"));
    assert!(refusal.contains("Let's talk about something else."));
    assert!(!refusal.contains("risky"));
    assert!(refusal.ends_with("data: [DONE]\n\n"));

    // Everything after the refusal is swallowed without further calls.
    let injected = host.injected.len();
    assert!(exchange
        .on_streaming_response_body(&mut host, &delta_frame("more text"), true)
        .is_empty());
    assert_eq!(host.injected.len(), injected);
    assert_eq!(host.dispatched.len(), 2);
    assert_eq!(metrics.get(RESPONSE_DENY), 1);
    assert_eq!(host.audits.last().unwrap().status, "response deny");
}

#[test]
fn stream_frames_without_text_skip_the_check() {
    let (guard, _) = guard(json!({"checkResponse": true, "bufferLimit": 5}));
    let mut host = RecordingHost::streaming_response();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    exchange.on_response_headers(&host);
    exchange.on_streaming_response_body(&mut host, b": keep-alive\n\ndata: [DONE]\n\n", true);

    assert!(host.dispatched.is_empty());
    assert_eq!(host.injected.len(), 1);
    assert!(host.injected[0].1);
    assert_eq!(host.audits[0].status, "response pass");
}

#[test]
fn buffered_sse_body_is_checked_as_a_whole() {
    let (guard, _) = guard(json!({"checkResponse": true}));
    let mut host = RecordingHost::streaming_response();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    exchange.on_response_headers(&host);
    let mut body = delta_frame("one ");
    body.extend_from_slice(&delta_frame("two"));
    body.extend_from_slice(b"data: [DONE]\n\n");

    assert_eq!(exchange.on_response_body(&mut host, &body), BodyAction::Pause);
    assert_eq!(host.checked_content(0), "one two");
}

#[test]
fn low_risk_request_resumes_unmodified() {
    let (guard, metrics) = guard(json!({"checkRequest": true, "riskLevelBar": "medium"}));
    let mut host = RecordingHost::default();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    exchange.on_request_body(&mut host, br#"{"messages":[{"role":"user","content":"hello"}]}"#);
    let reply = HttpReply::new(200, r#"{"Code":200,"Data":{"RiskLevel":"low"}}"#);

    assert_eq!(
        exchange.on_moderation_response(&mut host, Ok(reply)),
        Resolution::Resume
    );
    assert_eq!(host.resumed, vec![Phase::Request]);
    assert!(host.local_responses.is_empty());
    assert!(metrics.snapshot().is_empty());
}

#[test]
fn high_risk_request_denied_with_default_message() {
    let (guard, metrics) = guard(json!({
        "checkRequest": true,
        "riskLevelBar": "medium",
        "denyCode": 451
    }));
    let mut host = RecordingHost::default();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    exchange.on_request_body(&mut host, br#"{"messages":[{"role":"user","content":"hello"}]}"#);
    let reply = HttpReply::new(
        200,
        r#"{"Code":200,"Data":{"RiskLevel":"high","Result":[{"Label":"violence"}]}}"#,
    );

    assert_eq!(
        exchange.on_moderation_response(&mut host, Ok(reply)),
        Resolution::Deny
    );
    let (status, _, body) = &host.local_responses[0];
    assert_eq!(*status, 451);
    let body: Value = serde_json::from_slice(body).unwrap();
    assert_eq!(
        body["choices"][0]["message"]["content"],
        ai_security_guard::deny::DEFAULT_DENY_MESSAGE
    );
    assert_eq!(metrics.get(REQUEST_DENY), 1);
    assert_eq!(host.audits[0].risk_label.as_deref(), Some("violence"));
}

#[test]
fn first_stream_check_waits_for_buffer_limit() {
    let (guard, _) = guard(json!({"checkResponse": true, "bufferLimit": 10}));
    let mut host = RecordingHost::streaming_response();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    exchange.on_response_headers(&host);

    let tokens = ["one", "two", "six", "ten", "red"];
    for token in &tokens[..3] {
        exchange.on_streaming_response_body(&mut host, &delta_frame(token), false);
    }
    assert!(host.dispatched.is_empty());

    exchange.on_streaming_response_body(&mut host, &delta_frame(tokens[3]), false);
    assert_eq!(host.dispatched.len(), 1);
    assert_eq!(host.checked_content(0), "onetwosixten");

    exchange.on_streaming_response_body(&mut host, &delta_frame(tokens[4]), true);
    assert_eq!(host.dispatched.len(), 1);
    exchange.on_moderation_response(&mut host, verdict("none"));
    assert_eq!(host.dispatched.len(), 2);
    assert_eq!(host.checked_content(1), "red");
}

#[test]
fn image_request_carries_url_and_inline_data() {
    let (guard, _) = guard(json!({"checkRequest": true, "action": "MultiModalGuard"}));
    let mut host = RecordingHost::default();
    let mut exchange = guard.new_exchange();
    let body = json!({"messages": [{"role": "user", "content": [
        {"type": "image_url", "image_url": {"url": "https://img.example.com/a.png"}},
        {"type": "image_url", "image_url": {"url": "data:image/png;base64,iVBORw0KGgo="}}
    ]}]});

    exchange.on_request_headers(&host);
    assert_eq!(
        exchange.on_request_body(&mut host, body.to_string().as_bytes()),
        BodyAction::Pause
    );

    let fields = host.dispatched[0].form_fields();
    let parameters: Value = serde_json::from_str(&fields["ServiceParameters"]).unwrap();
    assert_eq!(parameters["imageUrls"], json!(["https://img.example.com/a.png"]));
    assert_eq!(fields["ImageBase64Str"], "data:image/png;base64,iVBORw0KGgo=");

    // No text: the image verdict completes the request check.
    assert_eq!(
        exchange.on_moderation_response(&mut host, verdict("none")),
        Resolution::Resume
    );
    assert_eq!(host.dispatched.len(), 1);
}

fn image_generation(extra: Value) -> Value {
    let mut config = json!({
        "action": "MultiModalGuard",
        "apiType": "image_generation",
        "providerType": "qwen",
    });
    if let (Some(target), Some(source)) = (config.as_object_mut(), extra.as_object()) {
        target.extend(source.clone());
    }
    config
}

#[test]
fn image_generation_request_checks_prompt_then_images() {
    let (guard, metrics) = guard(image_generation(json!({
        "checkRequest": true,
        "checkRequestImage": true,
    })));
    let mut host = RecordingHost::default();
    let mut exchange = guard.new_exchange();
    let body = json!({
        "model": "wanx2.1-imageedit",
        "input": {
            "prompt": "a red fox",
            "base_image_url": "https://img.example/base.png",
            "images": ["data:image/png;base64,AAAA"],
        },
    });

    exchange.on_request_headers(&host);
    assert_eq!(
        exchange.on_request_body(&mut host, body.to_string().as_bytes()),
        BodyAction::Pause
    );
    assert_eq!(host.dispatched[0].action, CheckAction::MultiModalGuard);
    assert_eq!(host.dispatched[0].service, "query_security_check");
    assert_eq!(host.checked_content(0), "a red fox");

    assert_eq!(
        exchange.on_moderation_response(&mut host, verdict("low")),
        Resolution::Advance
    );
    assert_eq!(host.dispatched[1].action, CheckAction::MultiModalGuardForBase64);
    assert_eq!(host.dispatched[1].service, "img_query_security_check");
    assert_eq!(
        host.checked_image_url(1).as_deref(),
        Some("https://img.example/base.png")
    );

    // A failed image check moves on to the next image.
    assert_eq!(
        exchange.on_moderation_response(&mut host, Ok(HttpReply::new(503, Vec::new()))),
        Resolution::Advance
    );
    let fields = host.dispatched[2].form_fields();
    assert_eq!(fields["ImageBase64Str"], "data:image/png;base64,AAAA");
    assert_eq!(host.checked_image_url(2), None);

    assert_eq!(
        exchange.on_moderation_response(&mut host, verdict("none")),
        Resolution::Resume
    );
    assert_eq!(host.resumed, vec![Phase::Request]);
    assert_eq!(host.audits[0].status, "request pass");
    assert_eq!(metrics.get(REQUEST_ERROR), 1);
}

#[test]
fn image_generation_image_denied_with_bare_message() {
    let (guard, metrics) = guard(image_generation(json!({
        "checkRequest": true,
        "checkRequestImage": true,
        "denyCode": 403,
    })));
    let mut host = RecordingHost::with_consumer("bob");
    let mut exchange = guard.new_exchange();
    let body = json!({"input": {"prompt": "portrait", "person_image_url": "https://img.example/p.png"}});

    exchange.on_request_headers(&host);
    exchange.on_request_body(&mut host, body.to_string().as_bytes());
    exchange.on_moderation_response(&mut host, verdict("none"));
    assert_eq!(host.dispatched.len(), 2);

    assert_eq!(
        exchange.on_moderation_response(&mut host, risky_verdict()),
        Resolution::Deny
    );
    let (status, headers, body) = &host.local_responses[0];
    assert_eq!(*status, 403);
    assert_eq!(headers[0].1, "application/json");
    assert_eq!(body.as_slice(), b"Let's talk about something else.");
    assert!(host.resumed.is_empty());
    assert_eq!(metrics.get(REQUEST_DENY), 1);
    assert_eq!(host.audits[0].risk_label.as_deref(), Some("political_content"));
}

#[test]
fn image_generation_images_need_opt_in() {
    let (guard, _) = guard(image_generation(json!({"checkRequest": true})));
    let mut host = RecordingHost::default();

    let mut exchange = guard.new_exchange();
    exchange.on_request_headers(&host);
    let images_only = json!({"input": {"images": ["https://img.example/a.png"]}});
    assert_eq!(
        exchange.on_request_body(&mut host, images_only.to_string().as_bytes()),
        BodyAction::Continue
    );
    assert!(host.dispatched.is_empty());

    let mut exchange = guard.new_exchange();
    exchange.on_request_headers(&host);
    let with_prompt = json!({"input": {"prompt": "sunset", "images": ["https://img.example/a.png"]}});
    exchange.on_request_body(&mut host, with_prompt.to_string().as_bytes());
    assert_eq!(host.dispatched.len(), 1);
    assert_eq!(
        exchange.on_moderation_response(&mut host, verdict("none")),
        Resolution::Resume
    );
    assert_eq!(host.dispatched.len(), 1);
}

#[test]
fn generated_images_checked_one_by_one() {
    let (guard, metrics) = guard(image_generation(json!({
        "checkResponse": true,
        "responseImageCheckService": "img_response_check",
        "consumerResponseCheckService": [
            {"name": "designer", "matchType": "exact", "responseImageCheckService": "designer_img_check"},
        ],
    })));
    let mut host = RecordingHost::with_consumer("designer");
    host.response_headers
        .insert(":status".to_string(), "200".to_string());
    host.response_headers
        .insert("content-type".to_string(), "application/json".to_string());
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    assert_eq!(exchange.on_response_headers(&host), HeaderAction::StopIteration);
    let body = json!({"output": {
        "task_status": "SUCCEEDED",
        "results": [{"url": "https://out.example/1.png"}, {"url": "https://out.example/2.png"}],
    }});
    assert_eq!(
        exchange.on_response_body(&mut host, body.to_string().as_bytes()),
        BodyAction::Pause
    );
    assert_eq!(host.dispatched[0].action, CheckAction::MultiModalGuardForBase64);
    assert_eq!(host.dispatched[0].service, "designer_img_check");
    assert_eq!(
        host.checked_image_url(0).as_deref(),
        Some("https://out.example/1.png")
    );

    assert_eq!(
        exchange.on_moderation_response(&mut host, verdict("none")),
        Resolution::Advance
    );
    assert_eq!(
        host.checked_image_url(1).as_deref(),
        Some("https://out.example/2.png")
    );

    assert_eq!(
        exchange.on_moderation_response(&mut host, risky_verdict()),
        Resolution::Deny
    );
    let (status, _, body) = &host.local_responses[0];
    assert_eq!(*status, 200);
    assert_eq!(body.as_slice(), b"Let's talk about something else.");
    assert_eq!(metrics.get(RESPONSE_DENY), 1);
}

#[test]
fn stream_flushed_after_interval() {
    let (guard, _) = guard(json!({"checkResponse": true, "bufferFlushTimeInterval": 50}));
    let mut host = RecordingHost::streaming_response();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    exchange.on_response_headers(&host);

    exchange.on_streaming_response_body(&mut host, &delta_frame("slow "), false);
    assert!(host.dispatched.is_empty());

    std::thread::sleep(Duration::from_millis(80));
    exchange.on_streaming_response_body(&mut host, &delta_frame("tokens"), false);
    assert_eq!(host.dispatched.len(), 1);
    assert_eq!(host.checked_content(0), "slow tokens");
}

#[test]
fn crlf_stream_reemitted_unchanged() {
    let (guard, _) = guard(json!({"checkResponse": true, "bufferLimit": 1}));
    let mut host = RecordingHost::streaming_response();
    let mut exchange = guard.new_exchange();

    exchange.on_request_headers(&host);
    exchange.on_response_headers(&host);

    let frame = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\r\n\r\n";
    let done = b"data: [DONE]\r\n\r\n";
    exchange.on_streaming_response_body(&mut host, frame, false);
    assert_eq!(host.checked_content(0), "Hi");
    exchange.on_moderation_response(&mut host, verdict("none"));
    exchange.on_streaming_response_body(&mut host, done, true);

    assert_eq!(host.injected.len(), 2);
    assert_eq!(host.injected[0], (frame.to_vec(), false));
    assert_eq!(host.injected[1], (done.to_vec(), true));
    assert_eq!(host.injected_bytes(), [&frame[..], &done[..]].concat());
}
