//! Primitives the proxy runtime provides to the filter.

use crate::audit::AuditRecord;
use crate::error::Result;
use crate::signer::ModerationRequest;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Which half of the exchange is being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Request,
    Response,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Request => "request",
            Phase::Response => "response",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a header callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderAction {
    Continue,
    /// Hold the headers until the body has been buffered and checked.
    StopIteration,
}

/// Answer to a body callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyAction {
    Continue,
    /// Hold the body until a moderation completion resumes the phase.
    Pause,
}

/// Host runtime operations used by an exchange.
///
/// A host instance is scoped to one exchange: `resume`, `send_local_response`
/// and `inject_response_data` act on the exchange being handled.
pub trait FilterHost {
    fn request_header(&self, name: &str) -> Option<String>;

    fn response_header(&self, name: &str) -> Option<String>;

    /// Continue a phase previously paused.
    fn resume(&mut self, phase: Phase);

    /// Reply to the client directly, ending the exchange.
    fn send_local_response(&mut self, status: u16, headers: Vec<(String, String)>, body: Vec<u8>);

    /// Emit bytes into the response stream toward the client.
    fn inject_response_data(&mut self, data: Vec<u8>, end_of_stream: bool);

    /// Send a moderation call. The reply comes back through
    /// [`crate::Exchange::on_moderation_response`].
    fn dispatch(&mut self, request: ModerationRequest, timeout: Duration) -> Result<()>;

    /// Set one attribute on the exchange's AI access log entry.
    fn log_attribute(&mut self, key: &'static str, value: Value);

    /// Attach audit attributes to the exchange's access log.
    fn write_audit(&mut self, record: &AuditRecord) {
        for (key, value) in record.attributes() {
            self.log_attribute(key, value);
        }
    }
}
