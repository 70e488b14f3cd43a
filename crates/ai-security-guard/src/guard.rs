//! Guard entry point.
//!
//! A [`SecurityGuard`] holds the validated configuration together with the
//! risk policy and metric sink. It is built once at plugin start and shared
//! read-only by every [`Exchange`] it creates.

use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::exchange::Exchange;
use crate::metrics::{MetricSink, MetricsFacade};
use crate::policy::RiskPolicy;
use std::sync::Arc;

/// Shared, immutable state behind every exchange.
pub struct GuardContext {
    config: GuardConfig,
    policy: Box<dyn RiskPolicy>,
    metrics: Arc<dyn MetricSink>,
}

impl GuardContext {
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn policy(&self) -> &dyn RiskPolicy {
        self.policy.as_ref()
    }

    pub fn metrics(&self) -> &dyn MetricSink {
        self.metrics.as_ref()
    }
}

impl std::fmt::Debug for GuardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct SecurityGuard {
    context: Arc<GuardContext>,
}

impl SecurityGuard {
    /// Guard with the threshold policy from `config` and the `metrics`
    /// crate facade.
    pub fn new(config: GuardConfig) -> Self {
        let policy = Box::new(config.policy.clone());
        Self {
            context: Arc::new(GuardContext {
                config,
                policy,
                metrics: Arc::new(MetricsFacade),
            }),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(Self::new(GuardConfig::from_json_str(json)?))
    }

    pub fn builder() -> SecurityGuardBuilder {
        SecurityGuardBuilder::default()
    }

    pub fn config(&self) -> &GuardConfig {
        self.context.config()
    }

    /// Start tracking a new request/response pair.
    pub fn new_exchange(&self) -> Exchange {
        Exchange::new(Arc::clone(&self.context))
    }
}

#[derive(Default)]
pub struct SecurityGuardBuilder {
    config: Option<GuardConfig>,
    policy: Option<Box<dyn RiskPolicy>>,
    metrics: Option<Arc<dyn MetricSink>>,
}

impl SecurityGuardBuilder {
    pub fn with_config(mut self, config: GuardConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the threshold policy built from the configuration.
    pub fn with_policy(mut self, policy: Box<dyn RiskPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<SecurityGuard> {
        let config = self
            .config
            .ok_or_else(|| GuardError::Config("Guard configuration is required".to_string()))?;
        let policy = self
            .policy
            .unwrap_or_else(|| Box::new(config.policy.clone()));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(MetricsFacade));

        tracing::info!(
            action = %config.action,
            check_request = config.check_request,
            check_response = config.check_response,
            "security guard configured"
        );

        Ok(SecurityGuard {
            context: Arc::new(GuardContext {
                config,
                policy,
                metrics,
            }),
        })
    }
}
