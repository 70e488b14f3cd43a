//! Consumer matchers for per-tenant overrides.
//!
//! Override lists are walked in configuration order. The first entry whose
//! matcher accepts the consumer decides: if it overrides the requested field
//! that value wins, otherwise the global default applies. Later entries are
//! never consulted once one has matched.

use crate::error::{GuardError, Result};
use regex::Regex;

/// Selects the consumers an override entry applies to.
#[derive(Debug, Clone)]
pub enum ConsumerMatcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl ConsumerMatcher {
    /// Build a matcher from its configured `matchType` and `name`.
    pub fn parse(match_type: &str, pattern: &str) -> Result<Self> {
        match match_type {
            "exact" => Ok(ConsumerMatcher::Exact(pattern.to_string())),
            "prefix" => Ok(ConsumerMatcher::Prefix(pattern.to_string())),
            "regexp" => Regex::new(pattern).map(ConsumerMatcher::Regex).map_err(|e| {
                GuardError::Config(format!("invalid consumer regexp {:?}: {}", pattern, e))
            }),
            other => Err(GuardError::Config(format!(
                "invalid matchType {:?}, value must be one of [exact, prefix, regexp]",
                other
            ))),
        }
    }

    pub fn matches(&self, consumer: &str) -> bool {
        match self {
            ConsumerMatcher::Exact(name) => consumer == name,
            ConsumerMatcher::Prefix(prefix) => consumer.starts_with(prefix.as_str()),
            ConsumerMatcher::Regex(re) => re.is_match(consumer),
        }
    }
}

/// One override entry: a matcher plus the fields it overrides.
#[derive(Debug, Clone)]
pub struct ConsumerOverride<T> {
    pub matcher: ConsumerMatcher,
    pub fields: T,
}

impl<T> ConsumerOverride<T> {
    pub fn new(matcher: ConsumerMatcher, fields: T) -> Self {
        Self { matcher, fields }
    }
}

/// Resolve one field for `consumer` against an ordered override list.
///
/// Returns `None` when no entry matches or the first matching entry leaves
/// the field unset; callers then fall back to their global default.
pub fn resolve_override<'a, T, V: ?Sized>(
    overrides: &'a [ConsumerOverride<T>],
    consumer: &str,
    field: impl Fn(&'a T) -> Option<&'a V>,
) -> Option<&'a V> {
    overrides
        .iter()
        .find(|entry| entry.matcher.matches(consumer))
        .and_then(|entry| field(&entry.fields))
}
