//! Plugin configuration.
//!
//! The host hands the filter a camelCase JSON document once at start-up.
//! It is deserialized into [`RawConfig`] and then validated into an
//! immutable [`GuardConfig`]; every validation failure is a
//! [`GuardError::Config`].

use crate::consumer::{resolve_override, ConsumerMatcher, ConsumerOverride};
use crate::deny::DenyProtocol;
use crate::error::{GuardError, Result};
use crate::policy::{BarOverrides, LevelBar, LevelBars, ThresholdPolicy};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_DENY_CODE: u16 = 200;
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_BUFFER_LIMIT: usize = 1000;
pub const DEFAULT_CHUNK_LIMIT: usize = 1800;
pub const DEFAULT_CONSUMER_HEADER: &str = "x-mse-consumer";

pub const DEFAULT_REQUEST_JSON_PATH: &str = "messages.@reverse.0.content";
pub const DEFAULT_RESPONSE_JSON_PATH: &str = "choices.0.message.content";
pub const DEFAULT_STREAMING_RESPONSE_JSON_PATH: &str = "choices.0.delta.content";

/// Moderation backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckAction {
    TextModerationPlus,
    MultiModalGuard,
    /// Image checks issued on behalf of a `MultiModalGuard` configuration.
    MultiModalGuardForBase64,
}

impl CheckAction {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "TextModerationPlus" => Ok(CheckAction::TextModerationPlus),
            "MultiModalGuard" => Ok(CheckAction::MultiModalGuard),
            "MultiModalGuardForBase64" => Ok(CheckAction::MultiModalGuardForBase64),
            other => Err(GuardError::Config(format!(
                "invalid action {:?}, value must be one of [TextModerationPlus, MultiModalGuard]",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckAction::TextModerationPlus => "TextModerationPlus",
            CheckAction::MultiModalGuard => "MultiModalGuard",
            CheckAction::MultiModalGuardForBase64 => "MultiModalGuardForBase64",
        }
    }

    pub fn is_multimodal(&self) -> bool {
        matches!(
            self,
            CheckAction::MultiModalGuard | CheckAction::MultiModalGuardForBase64
        )
    }

    fn default_request_service(&self) -> &'static str {
        if self.is_multimodal() {
            "query_security_check"
        } else {
            "llm_query_moderation"
        }
    }

    fn default_response_service(&self) -> &'static str {
        if self.is_multimodal() {
            "response_security_check"
        } else {
            "llm_response_moderation"
        }
    }

    fn default_request_image_service(&self) -> &'static str {
        "img_query_security_check"
    }
}

impl fmt::Display for CheckAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of upstream API the guarded route serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiType {
    #[default]
    TextGeneration,
    ImageGeneration,
}

impl ApiType {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "text_generation" => Ok(ApiType::TextGeneration),
            "image_generation" => Ok(ApiType::ImageGeneration),
            other => Err(GuardError::Config(format!(
                "invalid apiType {:?}, value must be one of [text_generation, image_generation]",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::TextGeneration => "text_generation",
            ApiType::ImageGeneration => "image_generation",
        }
    }
}

/// Body dialect of the upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderType {
    #[default]
    OpenAi,
    Qwen,
}

impl ProviderType {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "openai" => Ok(ProviderType::OpenAi),
            "qwen" => Ok(ProviderType::Qwen),
            other => Err(GuardError::Config(format!(
                "invalid providerType {:?}, value must be one of [openai, qwen]",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAi => "openai",
            ProviderType::Qwen => "qwen",
        }
    }
}

/// Where the moderation backend lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Cluster name the host routes to.
    pub name: String,
    pub port: u16,
    /// Value of the `host` header, also part of the signature.
    pub host: String,
}

/// Access key pair plus optional session token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub security_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            security_token: None,
        }
    }

    pub fn with_security_token(mut self, token: impl Into<String>) -> Self {
        self.security_token = Some(token.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("security_token", &self.security_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Check services a consumer override entry may replace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceOverrides {
    pub request_check_service: Option<String>,
    pub request_image_check_service: Option<String>,
    pub response_check_service: Option<String>,
    pub response_image_check_service: Option<String>,
}

/// Validated, immutable filter configuration.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub endpoint: ServiceEndpoint,
    pub credentials: Credentials,
    pub action: CheckAction,
    pub api_type: ApiType,
    pub provider_type: ProviderType,
    pub check_request: bool,
    /// Check request images of image-generation calls.
    pub check_request_image: bool,
    pub check_response: bool,
    pub request_check_service: String,
    pub request_image_check_service: String,
    pub response_check_service: String,
    /// Present whenever generated images are checked.
    pub response_image_check_service: Option<String>,
    pub request_content_json_path: String,
    pub response_content_json_path: String,
    pub response_stream_content_json_path: String,
    pub deny_code: u16,
    /// Operator message; takes precedence over backend advice.
    pub deny_message: Option<String>,
    pub protocol: DenyProtocol,
    pub policy: ThresholdPolicy,
    pub timeout: Duration,
    /// Extracted stream characters that trigger a check.
    pub buffer_limit: usize,
    /// Age of the oldest held frame that triggers a check regardless of
    /// `buffer_limit`.
    pub buffer_flush_interval: Option<Duration>,
    /// Maximum characters per moderation call in buffered mode.
    pub chunk_limit: usize,
    pub consumer_header: String,
    pub consumer_request_check_service: Vec<ConsumerOverride<ServiceOverrides>>,
    pub consumer_response_check_service: Vec<ConsumerOverride<ServiceOverrides>>,
}

impl GuardConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(json)
            .map_err(|e| GuardError::Config(format!("malformed configuration: {}", e)))?;
        raw.validate()
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let raw: RawConfig = serde_json::from_value(value)
            .map_err(|e| GuardError::Config(format!("malformed configuration: {}", e)))?;
        raw.validate()
    }

    pub fn request_check_service_for(&self, consumer: &str) -> &str {
        resolve_override(&self.consumer_request_check_service, consumer, |o| {
            o.request_check_service.as_deref()
        })
        .unwrap_or(&self.request_check_service)
    }

    pub fn request_image_check_service_for(&self, consumer: &str) -> &str {
        resolve_override(&self.consumer_request_check_service, consumer, |o| {
            o.request_image_check_service.as_deref()
        })
        .unwrap_or(&self.request_image_check_service)
    }

    pub fn response_check_service_for(&self, consumer: &str) -> &str {
        resolve_override(&self.consumer_response_check_service, consumer, |o| {
            o.response_check_service.as_deref()
        })
        .unwrap_or(&self.response_check_service)
    }

    pub fn response_image_check_service_for(&self, consumer: &str) -> Option<&str> {
        resolve_override(&self.consumer_response_check_service, consumer, |o| {
            o.response_image_check_service.as_deref()
        })
        .or(self.response_image_check_service.as_deref())
    }

    pub fn is_image_generation(&self) -> bool {
        self.api_type == ApiType::ImageGeneration
    }
}

/// Configuration document as written by the operator.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    pub service_name: Option<String>,
    pub service_port: Option<u16>,
    pub service_host: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    #[serde(alias = "token")]
    pub security_token: Option<String>,
    pub action: Option<String>,
    pub api_type: Option<String>,
    pub provider_type: Option<String>,
    pub check_request: bool,
    pub check_request_image: bool,
    pub check_response: bool,
    pub request_check_service: Option<String>,
    pub request_image_check_service: Option<String>,
    pub response_check_service: Option<String>,
    pub response_image_check_service: Option<String>,
    pub request_content_json_path: Option<String>,
    pub response_content_json_path: Option<String>,
    pub response_stream_content_json_path: Option<String>,
    pub deny_code: Option<u16>,
    pub deny_message: Option<String>,
    pub protocol: Option<String>,
    pub protocol_original: Option<bool>,
    pub risk_level_bar: Option<String>,
    pub content_moderation_level_bar: Option<String>,
    pub prompt_attack_level_bar: Option<String>,
    pub sensitive_data_level_bar: Option<String>,
    pub malicious_url_level_bar: Option<String>,
    pub model_hallucination_level_bar: Option<String>,
    pub timeout: Option<u64>,
    pub buffer_limit: Option<usize>,
    /// Milliseconds; zero disables the time-based flush.
    pub buffer_flush_time_interval: Option<u64>,
    pub chunk_limit: Option<usize>,
    pub consumer_header: Option<String>,
    pub consumer_request_check_service: Vec<RawConsumerEntry>,
    pub consumer_response_check_service: Vec<RawConsumerEntry>,
    pub consumer_risk_level: Vec<RawConsumerEntry>,
}

/// One entry of a `consumer*` override list.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConsumerEntry {
    pub name: Option<String>,
    pub match_type: Option<String>,
    pub request_check_service: Option<String>,
    pub request_image_check_service: Option<String>,
    pub response_check_service: Option<String>,
    pub response_image_check_service: Option<String>,
    pub risk_level_bar: Option<String>,
    pub content_moderation_level_bar: Option<String>,
    pub prompt_attack_level_bar: Option<String>,
    pub sensitive_data_level_bar: Option<String>,
    pub malicious_url_level_bar: Option<String>,
    pub model_hallucination_level_bar: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn required(value: Option<String>, what: &str) -> Result<String> {
    non_empty(value).ok_or_else(|| GuardError::Config(format!("missing {}", what)))
}

fn parse_bar(value: Option<&str>, field: &str, default: &LevelBar) -> Result<LevelBar> {
    match value {
        Some(label) => LevelBar::parse(label)
            .map_err(|e| GuardError::Config(format!("{}: {}", field, e))),
        None => Ok(default.clone()),
    }
}

fn parse_optional_bar(value: Option<&str>, field: &str) -> Result<Option<LevelBar>> {
    value
        .map(|label| {
            LevelBar::parse(label).map_err(|e| GuardError::Config(format!("{}: {}", field, e)))
        })
        .transpose()
}

/// Compile override entries, skipping those without `name` or `matchType`
/// and those with an unknown `matchType`.
fn compile_overrides<T>(
    list: &str,
    entries: Vec<RawConsumerEntry>,
    mut fields: impl FnMut(&RawConsumerEntry) -> Result<T>,
) -> Result<Vec<ConsumerOverride<T>>> {
    let mut compiled = Vec::with_capacity(entries.len());
    for entry in entries {
        let (Some(name), Some(match_type)) = (entry.name.as_deref(), entry.match_type.as_deref())
        else {
            tracing::warn!(list, "skipping consumer override without name or matchType");
            continue;
        };
        if !matches!(match_type, "exact" | "prefix" | "regexp") {
            tracing::warn!(list, match_type, "skipping consumer override with unknown matchType");
            continue;
        }
        let matcher = ConsumerMatcher::parse(match_type, name)?;
        compiled.push(ConsumerOverride::new(matcher, fields(&entry)?));
    }
    Ok(compiled)
}

impl RawConfig {
    pub fn validate(self) -> Result<GuardConfig> {
        let service_name = non_empty(self.service_name);
        let service_host = non_empty(self.service_host);
        let (name, port, host) = match (service_name, self.service_port, service_host) {
            (Some(name), Some(port), Some(host)) if port != 0 => (name, port, host),
            _ => {
                return Err(GuardError::Config(
                    "invalid service config: serviceName, servicePort and serviceHost are required"
                        .into(),
                ))
            }
        };

        let access_key = required(self.access_key, "accessKey")?;
        let secret_key = required(self.secret_key, "secretKey")?;
        let credentials = Credentials {
            access_key,
            secret_key,
            security_token: non_empty(self.security_token),
        };

        let action = match self.action.as_deref() {
            Some(value) => CheckAction::parse(value)?,
            None => CheckAction::TextModerationPlus,
        };
        if action == CheckAction::MultiModalGuardForBase64 {
            return Err(GuardError::Config(
                "MultiModalGuardForBase64 is selected automatically for image checks".into(),
            ));
        }

        let api_type = match non_empty(self.api_type) {
            Some(value) => ApiType::parse(&value)?,
            None => ApiType::default(),
        };
        let provider_type = match non_empty(self.provider_type) {
            Some(value) => ProviderType::parse(&value)?,
            None => ProviderType::default(),
        };
        let response_image_check_service = non_empty(self.response_image_check_service);
        if api_type == ApiType::ImageGeneration {
            if provider_type != ProviderType::Qwen {
                return Err(GuardError::Config(format!(
                    "apiType image_generation is not supported for providerType {}",
                    provider_type.as_str()
                )));
            }
            if action != CheckAction::MultiModalGuard {
                return Err(GuardError::Config(
                    "apiType image_generation requires action MultiModalGuard".into(),
                ));
            }
            if self.check_response && response_image_check_service.is_none() {
                return Err(GuardError::Config(
                    "missing responseImageCheckService for image_generation response checks"
                        .into(),
                ));
            }
        }

        let chunk_limit = self.chunk_limit.unwrap_or(DEFAULT_CHUNK_LIMIT);
        if chunk_limit == 0 {
            return Err(GuardError::Config("chunkLimit must be positive".into()));
        }

        let base = LevelBars::default();
        let defaults = LevelBars {
            risk_level: parse_bar(self.risk_level_bar.as_deref(), "riskLevelBar", &base.risk_level)?,
            content_moderation: parse_bar(
                self.content_moderation_level_bar.as_deref(),
                "contentModerationLevelBar",
                &base.content_moderation,
            )?,
            prompt_attack: parse_bar(
                self.prompt_attack_level_bar.as_deref(),
                "promptAttackLevelBar",
                &base.prompt_attack,
            )?,
            sensitive_data: parse_bar(
                self.sensitive_data_level_bar.as_deref(),
                "sensitiveDataLevelBar",
                &base.sensitive_data,
            )?,
            malicious_url: parse_bar(
                self.malicious_url_level_bar.as_deref(),
                "maliciousUrlLevelBar",
                &base.malicious_url,
            )?,
            model_hallucination: parse_bar(
                self.model_hallucination_level_bar.as_deref(),
                "modelHallucinationLevelBar",
                &base.model_hallucination,
            )?,
        };

        let bar_overrides = compile_overrides("consumerRiskLevel", self.consumer_risk_level, |e| {
            Ok(BarOverrides {
                risk_level: parse_optional_bar(e.risk_level_bar.as_deref(), "riskLevelBar")?,
                content_moderation: parse_optional_bar(
                    e.content_moderation_level_bar.as_deref(),
                    "contentModerationLevelBar",
                )?,
                prompt_attack: parse_optional_bar(
                    e.prompt_attack_level_bar.as_deref(),
                    "promptAttackLevelBar",
                )?,
                sensitive_data: parse_optional_bar(
                    e.sensitive_data_level_bar.as_deref(),
                    "sensitiveDataLevelBar",
                )?,
                malicious_url: parse_optional_bar(
                    e.malicious_url_level_bar.as_deref(),
                    "maliciousUrlLevelBar",
                )?,
                model_hallucination: parse_optional_bar(
                    e.model_hallucination_level_bar.as_deref(),
                    "modelHallucinationLevelBar",
                )?,
            })
        })?;

        let service_fields = |e: &RawConsumerEntry| -> Result<ServiceOverrides> {
            Ok(ServiceOverrides {
                request_check_service: e.request_check_service.clone(),
                request_image_check_service: e.request_image_check_service.clone(),
                response_check_service: e.response_check_service.clone(),
                response_image_check_service: e.response_image_check_service.clone(),
            })
        };
        let consumer_request_check_service = compile_overrides(
            "consumerRequestCheckService",
            self.consumer_request_check_service,
            service_fields,
        )?;
        let consumer_response_check_service = compile_overrides(
            "consumerResponseCheckService",
            self.consumer_response_check_service,
            service_fields,
        )?;

        let protocol = if self.protocol.as_deref() == Some("original")
            || self.protocol_original == Some(true)
        {
            DenyProtocol::Passthrough
        } else {
            DenyProtocol::ChatCompletion
        };

        Ok(GuardConfig {
            endpoint: ServiceEndpoint { name, port, host },
            credentials,
            action,
            api_type,
            provider_type,
            check_request: self.check_request,
            check_request_image: self.check_request_image,
            check_response: self.check_response,
            request_check_service: non_empty(self.request_check_service)
                .unwrap_or_else(|| action.default_request_service().to_string()),
            request_image_check_service: non_empty(self.request_image_check_service)
                .unwrap_or_else(|| action.default_request_image_service().to_string()),
            response_check_service: non_empty(self.response_check_service)
                .unwrap_or_else(|| action.default_response_service().to_string()),
            response_image_check_service,
            request_content_json_path: non_empty(self.request_content_json_path)
                .unwrap_or_else(|| DEFAULT_REQUEST_JSON_PATH.to_string()),
            response_content_json_path: non_empty(self.response_content_json_path)
                .unwrap_or_else(|| DEFAULT_RESPONSE_JSON_PATH.to_string()),
            response_stream_content_json_path: non_empty(self.response_stream_content_json_path)
                .unwrap_or_else(|| DEFAULT_STREAMING_RESPONSE_JSON_PATH.to_string()),
            deny_code: self.deny_code.unwrap_or(DEFAULT_DENY_CODE),
            deny_message: non_empty(self.deny_message),
            protocol,
            policy: ThresholdPolicy::new(defaults, bar_overrides),
            timeout: Duration::from_millis(self.timeout.unwrap_or(DEFAULT_TIMEOUT_MS)),
            buffer_limit: self.buffer_limit.unwrap_or(DEFAULT_BUFFER_LIMIT),
            buffer_flush_interval: self
                .buffer_flush_time_interval
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            chunk_limit,
            consumer_header: non_empty(self.consumer_header)
                .map(|h| h.to_ascii_lowercase())
                .unwrap_or_else(|| DEFAULT_CONSUMER_HEADER.to_string()),
            consumer_request_check_service,
            consumer_response_check_service,
        })
    }
}
