//! Error types for the security guard filter.

/// Errors that can occur while configuring the guard or checking an exchange.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// Missing or invalid configuration (fatal at plugin start).
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Nothing checkable was found in a body.
    #[error("No checkable content: {0}")]
    Extraction(String),

    /// The moderation call could not be dispatched or did not complete.
    #[error("Moderation transport failed: {0}")]
    Transport(String),

    /// The moderation backend answered with a non-200 status or `Code`.
    #[error("Moderation backend rejected the call (status {status}, code {code:?})")]
    Backend { status: u16, code: Option<i64> },

    /// The moderation backend answered with malformed JSON.
    #[error("Malformed moderation response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The request could not be signed.
    #[error("Signing failed: {0}")]
    Signing(String),
}

impl GuardError {
    /// Whether this error must resolve to an unmodified resume.
    ///
    /// Configuration and signing errors are not part of the data path
    /// verdict and are reported to the caller instead.
    pub fn is_fail_open(&self) -> bool {
        matches!(
            self,
            GuardError::Extraction(_)
                | GuardError::Transport(_)
                | GuardError::Backend { .. }
                | GuardError::Decode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;
