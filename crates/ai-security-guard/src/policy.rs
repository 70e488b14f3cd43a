//! Risk threshold policy.
//!
//! Verdict labels from both the risk scale (`none`..`max`) and the sensitive
//! data scale (`s0`..`s4`) map onto one ordinal range so a single comparison
//! decides every category.

use crate::config::CheckAction;
use crate::consumer::{resolve_override, ConsumerOverride};
use crate::error::{GuardError, Result};
use crate::verdict::ModerationData;

/// Ordinal of any label outside both scales, including an absent level.
pub const UNRECOGNIZED_LEVEL: i32 = -1;

/// Map a verdict or bar label onto its ordinal. Case-insensitive.
pub fn level_ordinal(label: &str) -> i32 {
    match label.to_ascii_lowercase().as_str() {
        "max" | "s4" => 4,
        "high" | "s3" => 3,
        "medium" | "s2" => 2,
        "low" | "s1" => 1,
        "none" | "s0" => 0,
        _ => UNRECOGNIZED_LEVEL,
    }
}

/// A configured threshold. A verdict level at or above it is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelBar {
    label: String,
    ordinal: i32,
}

impl LevelBar {
    /// Parse a configured bar. Only recognized labels with ordinal ≥ 1 are
    /// valid; a `none` bar would reject every verdict.
    pub fn parse(label: &str) -> Result<Self> {
        let ordinal = level_ordinal(label);
        if ordinal < 1 {
            return Err(GuardError::Config(format!(
                "invalid level bar {:?}, value must be one of [max, high, medium, low] or [S4, S3, S2, S1]",
                label
            )));
        }
        Ok(Self {
            label: label.to_string(),
            ordinal,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    /// Whether `level` reaches this bar. Unrecognized levels never do.
    pub fn is_reached_by(&self, level: &str) -> bool {
        let ordinal = level_ordinal(level);
        ordinal != UNRECOGNIZED_LEVEL && ordinal >= self.ordinal
    }
}

/// Categories rated individually in a MultiModalGuard `Detail` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskCategory {
    ContentModeration,
    PromptAttack,
    SensitiveData,
    MaliciousUrl,
    ModelHallucination,
}

impl RiskCategory {
    pub fn from_detail_type(kind: &str) -> Option<Self> {
        match kind {
            "contentModeration" => Some(RiskCategory::ContentModeration),
            "promptAttack" => Some(RiskCategory::PromptAttack),
            "sensitiveData" => Some(RiskCategory::SensitiveData),
            "maliciousUrl" => Some(RiskCategory::MaliciousUrl),
            "modelHallucination" => Some(RiskCategory::ModelHallucination),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCategory::ContentModeration => "contentModeration",
            RiskCategory::PromptAttack => "promptAttack",
            RiskCategory::SensitiveData => "sensitiveData",
            RiskCategory::MaliciousUrl => "maliciousUrl",
            RiskCategory::ModelHallucination => "modelHallucination",
        }
    }
}

/// The full set of bars in effect for one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelBars {
    pub risk_level: LevelBar,
    pub content_moderation: LevelBar,
    pub prompt_attack: LevelBar,
    pub sensitive_data: LevelBar,
    pub malicious_url: LevelBar,
    pub model_hallucination: LevelBar,
}

impl LevelBars {
    pub fn for_category(&self, category: RiskCategory) -> &LevelBar {
        match category {
            RiskCategory::ContentModeration => &self.content_moderation,
            RiskCategory::PromptAttack => &self.prompt_attack,
            RiskCategory::SensitiveData => &self.sensitive_data,
            RiskCategory::MaliciousUrl => &self.malicious_url,
            RiskCategory::ModelHallucination => &self.model_hallucination,
        }
    }
}

impl Default for LevelBars {
    fn default() -> Self {
        let bar = |label: &str| LevelBar {
            label: label.to_string(),
            ordinal: level_ordinal(label),
        };
        Self {
            risk_level: bar("high"),
            content_moderation: bar("max"),
            prompt_attack: bar("max"),
            sensitive_data: bar("S4"),
            malicious_url: bar("max"),
            model_hallucination: bar("max"),
        }
    }
}

/// Bars a `consumerRiskLevel` entry may override.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarOverrides {
    pub risk_level: Option<LevelBar>,
    pub content_moderation: Option<LevelBar>,
    pub prompt_attack: Option<LevelBar>,
    pub sensitive_data: Option<LevelBar>,
    pub malicious_url: Option<LevelBar>,
    pub model_hallucination: Option<LevelBar>,
}

/// Result of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Whether the content may continue.
    pub allowed: bool,
    /// Which bar was reached, when denied.
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Decides whether a verdict is acceptable for a consumer.
///
/// Implement this trait to replace the threshold comparison with custom
/// logic (allow lists, label-specific rules and so on).
pub trait RiskPolicy: Send + Sync {
    /// `action` is the action the verdict was produced by, which may differ
    /// from the configured one for image checks.
    fn evaluate(&self, action: CheckAction, verdict: &ModerationData, consumer: &str)
        -> PolicyDecision;
}

/// Ordinal threshold comparison with per-consumer bar overrides.
#[derive(Debug, Clone, Default)]
pub struct ThresholdPolicy {
    defaults: LevelBars,
    overrides: Vec<ConsumerOverride<BarOverrides>>,
}

impl ThresholdPolicy {
    pub fn new(defaults: LevelBars, overrides: Vec<ConsumerOverride<BarOverrides>>) -> Self {
        Self {
            defaults,
            overrides,
        }
    }

    pub fn defaults(&self) -> &LevelBars {
        &self.defaults
    }

    /// Bars in effect for `consumer`. Each field is resolved independently.
    pub fn resolve(&self, consumer: &str) -> LevelBars {
        let pick = |field: fn(&BarOverrides) -> Option<&LevelBar>, default: &LevelBar| {
            resolve_override(&self.overrides, consumer, field)
                .unwrap_or(default)
                .clone()
        };
        let d = &self.defaults;
        LevelBars {
            risk_level: pick(|o| o.risk_level.as_ref(), &d.risk_level),
            content_moderation: pick(|o| o.content_moderation.as_ref(), &d.content_moderation),
            prompt_attack: pick(|o| o.prompt_attack.as_ref(), &d.prompt_attack),
            sensitive_data: pick(|o| o.sensitive_data.as_ref(), &d.sensitive_data),
            malicious_url: pick(|o| o.malicious_url.as_ref(), &d.malicious_url),
            model_hallucination: pick(|o| o.model_hallucination.as_ref(), &d.model_hallucination),
        }
    }

    fn evaluate_multimodal(verdict: &ModerationData, bars: &LevelBars) -> PolicyDecision {
        if bars.content_moderation.is_reached_by(&verdict.risk_level) {
            return PolicyDecision::deny(format!(
                "RiskLevel {} reached contentModeration bar {}",
                verdict.risk_level,
                bars.content_moderation.label()
            ));
        }
        if let Some(attack) = verdict.attack_level.as_deref() {
            if bars.prompt_attack.is_reached_by(attack) {
                return PolicyDecision::deny(format!(
                    "AttackLevel {} reached promptAttack bar {}",
                    attack,
                    bars.prompt_attack.label()
                ));
            }
        }
        for detail in &verdict.detail {
            let Some(category) = RiskCategory::from_detail_type(&detail.kind) else {
                continue;
            };
            let bar = bars.for_category(category);
            if bar.is_reached_by(&detail.level) {
                return PolicyDecision::deny(format!(
                    "{} level {} reached bar {}",
                    category.as_str(),
                    detail.level,
                    bar.label()
                ));
            }
        }
        PolicyDecision::allow()
    }
}

impl RiskPolicy for ThresholdPolicy {
    fn evaluate(
        &self,
        action: CheckAction,
        verdict: &ModerationData,
        consumer: &str,
    ) -> PolicyDecision {
        let bars = self.resolve(consumer);
        if action.is_multimodal() {
            return Self::evaluate_multimodal(verdict, &bars);
        }
        if bars.risk_level.is_reached_by(&verdict.risk_level) {
            PolicyDecision::deny(format!(
                "RiskLevel {} reached riskLevelBar {}",
                verdict.risk_level,
                bars.risk_level.label()
            ))
        } else {
            PolicyDecision::allow()
        }
    }
}
