//! Moderation backend response model.
//!
//! A reply is only a verdict when the HTTP status is 200 *and* the body's
//! `Code` is 200. Everything else is a backend or decode failure.

use crate::error::{GuardError, Result};
use serde::{Deserialize, Serialize};

/// Raw HTTP reply from the moderation backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Top-level moderation response envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ModerationResponse {
    pub code: i64,
    pub message: String,
    pub request_id: String,
    pub data: ModerationData,
}

/// Verdict payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ModerationData {
    pub risk_level: String,
    pub attack_level: Option<String>,
    pub result: Vec<RiskResult>,
    pub advice: Vec<Advice>,
    pub detail: Vec<Detail>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RiskResult {
    pub label: String,
    pub risk_words: String,
    pub confidence: f64,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Advice {
    pub answer: String,
    pub hit_label: String,
    pub hit_lib_name: String,
}

/// Per-category rating returned by MultiModalGuard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Detail {
    #[serde(rename = "Type")]
    pub kind: String,
    pub level: String,
    pub suggestion: String,
}

impl ModerationResponse {
    /// Decode a backend reply into a verdict.
    pub fn from_reply(reply: &HttpReply) -> Result<Self> {
        if reply.status != 200 {
            return Err(GuardError::Backend {
                status: reply.status,
                code: None,
            });
        }
        let response: ModerationResponse = serde_json::from_slice(&reply.body)?;
        if response.code != 200 {
            return Err(GuardError::Backend {
                status: reply.status,
                code: Some(response.code),
            });
        }
        Ok(response)
    }
}

impl ModerationData {
    /// First non-empty advice answer, if the backend suggested one.
    pub fn advice_answer(&self) -> Option<&str> {
        self.advice
            .first()
            .map(|advice| advice.answer.as_str())
            .filter(|answer| !answer.is_empty())
    }

    /// Label and risk words of the first matched result.
    pub fn primary_result(&self) -> Option<&RiskResult> {
        self.result.first()
    }
}
