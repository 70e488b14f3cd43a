//! # AI-Security-Guard
//!
//! Content-safety filter for LLM traffic passing through an API gateway.
//!
//! ## Overview
//!
//! Each exchange is checked against an external moderation backend:
//!
//! - **Signed calls**: every call is signed with ACS3-HMAC-SHA256
//! - **Threshold policy**: verdict levels are compared with per-consumer bars
//! - **Chunked checks**: long bodies are sliced, SSE streams are checked in
//!   batches with frames held until their batch passes
//! - **Fail open**: backend failures never block traffic
//! - **Image generation**: Qwen prompts, reference images and generated
//!   images are checked when `apiType` is `image_generation`
//!
//! The guard never talks to the network itself. The host runtime implements
//! [`FilterHost`] and feeds moderation replies back into the [`Exchange`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ai_security_guard::{FilterHost, SecurityGuard};
//!
//! let guard = SecurityGuard::from_json_str(&plugin_config)?;
//!
//! // Per exchange
//! let mut exchange = guard.new_exchange();
//! exchange.on_request_headers(&host);
//! exchange.on_request_body(&mut host, &body);
//!
//! // When the moderation reply arrives
//! exchange.on_moderation_response(&mut host, reply);
//! ```
//!
//! ## Custom Policy
//!
//! ```rust,ignore
//! use ai_security_guard::{CheckAction, ModerationData, PolicyDecision, RiskPolicy};
//!
//! struct BlockPromptAttacks;
//!
//! impl RiskPolicy for BlockPromptAttacks {
//!     fn evaluate(&self, _: CheckAction, verdict: &ModerationData, _: &str) -> PolicyDecision {
//!         match verdict.attack_level.as_deref() {
//!             Some("none") | Some("low") | None => PolicyDecision::allow(),
//!             Some(_) => PolicyDecision::deny("prompt attack"),
//!         }
//!     }
//! }
//!
//! let guard = SecurityGuard::builder()
//!     .with_config(config)
//!     .with_policy(Box::new(BlockPromptAttacks))
//!     .build()?;
//! ```

pub mod audit;
pub mod config;
pub mod consumer;
pub mod deny;
pub mod error;
pub mod exchange;
pub mod extract;
pub mod guard;
pub mod host;
pub mod ids;
pub mod image_generation;
pub mod metrics;
pub mod policy;
pub mod scheduler;
pub mod signer;
#[cfg(feature = "http-transport")]
pub mod transport;
pub mod verdict;

// Primary exports
pub use audit::{AuditRecord, Outcome};
pub use config::{ApiType, CheckAction, Credentials, GuardConfig, ProviderType, ServiceEndpoint};
pub use deny::{DenialPayload, DenyProtocol};
pub use error::{GuardError, Result};
pub use exchange::{Exchange, ExchangeFlags, ExchangeState, Resolution};
pub use guard::{SecurityGuard, SecurityGuardBuilder};
pub use host::{BodyAction, FilterHost, HeaderAction, Phase};
pub use metrics::{InMemoryMetrics, MetricSink, MetricsFacade};
pub use policy::{LevelBar, LevelBars, PolicyDecision, RiskPolicy, ThresholdPolicy};
pub use signer::{CanonicalRequest, ModerationRequest};
pub use verdict::{HttpReply, ModerationData, ModerationResponse};

#[cfg(feature = "http-transport")]
pub use transport::{Completion, ModerationTransport};
