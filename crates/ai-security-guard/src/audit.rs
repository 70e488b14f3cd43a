//! Per-exchange audit attributes.

use crate::host::Phase;
use crate::verdict::ModerationResponse;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Pass,
    Deny,
}

/// One terminal check result, as written to the access log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    #[serde(skip)]
    pub phase: Phase,
    #[serde(skip)]
    pub outcome: Outcome,
    pub status: String,
    pub latency_ms: i64,
    pub risk_label: Option<String>,
    pub risk_words: Option<String>,
    pub consumer: String,
    pub session_id: String,
    pub backend_request_id: Option<String>,
}

impl AuditRecord {
    pub fn new(
        phase: Phase,
        outcome: Outcome,
        started_at: DateTime<Utc>,
        consumer: &str,
        session_id: &str,
    ) -> Self {
        let status = match outcome {
            Outcome::Pass => format!("{} pass", phase),
            Outcome::Deny => format!("{} deny", phase),
        };
        Self {
            phase,
            outcome,
            status,
            latency_ms: (Utc::now() - started_at).num_milliseconds().max(0),
            risk_label: None,
            risk_words: None,
            consumer: consumer.to_string(),
            session_id: session_id.to_string(),
            backend_request_id: None,
        }
    }

    /// Attach the matched label and words of the deciding verdict.
    pub fn with_verdict(mut self, response: &ModerationResponse) -> Self {
        if let Some(result) = response.data.primary_result() {
            self.risk_label = Some(result.label.clone());
            self.risk_words = Some(result.risk_words.clone());
        }
        if !response.request_id.is_empty() {
            self.backend_request_id = Some(response.request_id.clone());
        }
        self
    }

    /// Attribute name/value pairs for the host's AI log.
    pub fn attributes(&self) -> Vec<(&'static str, Value)> {
        let latency_key = match self.phase {
            Phase::Request => "safecheck_request_rt",
            Phase::Response => "safecheck_response_rt",
        };
        let mut attributes = vec![
            (latency_key, json!(self.latency_ms)),
            ("safecheck_status", json!(self.status)),
        ];
        if let Some(label) = &self.risk_label {
            attributes.push(("safecheck_riskLabel", json!(label)));
        }
        if let Some(words) = &self.risk_words {
            attributes.push(("safecheck_riskWords", json!(words)));
        }
        attributes
    }
}
