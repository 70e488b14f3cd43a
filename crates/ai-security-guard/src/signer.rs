//! ACS3-HMAC-SHA256 request signing for the moderation backend.
//!
//! A [`CanonicalRequest`] collects the action, query parameters and form
//! body of one call; [`CanonicalRequest::sign`] turns it into a
//! [`ModerationRequest`] ready for dispatch. The `host` header takes part in
//! the signature but is not emitted, since the host runtime's cluster client
//! adds it on the wire.

use crate::config::{CheckAction, Credentials};
use crate::error::{GuardError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "ACS3-HMAC-SHA256";
pub const API_VERSION: &str = "2022-03-02";
/// Caller tag carried inside text `ServiceParameters`.
pub const REQUEST_FROM: &str = "CIPFrom/AIGateway";

const METHOD: &str = "POST";
const CANONICAL_URI: &str = "/";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// An unsigned moderation call.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    action: CheckAction,
    service: String,
    headers: BTreeMap<String, String>,
    query: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl CanonicalRequest {
    /// Start a call stamped with the current time and a fresh nonce.
    pub fn new(host: &str, action: CheckAction) -> Self {
        Self::with_clock(host, action, Utc::now(), crate::ids::signature_nonce())
    }

    /// Start a call with a fixed date and nonce.
    pub fn with_clock(
        host: &str,
        action: CheckAction,
        date: DateTime<Utc>,
        nonce: impl Into<String>,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host.to_string());
        headers.insert("x-acs-action".to_string(), action.as_str().to_string());
        headers.insert("x-acs-version".to_string(), API_VERSION.to_string());
        headers.insert(
            "x-acs-date".to_string(),
            date.format(DATE_FORMAT).to_string(),
        );
        headers.insert("x-acs-signature-nonce".to_string(), nonce.into());
        Self {
            action,
            service: String::new(),
            headers,
            query: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Add a query parameter. Maps and arrays are flattened.
    pub fn query_param(mut self, key: &str, value: &Value) -> Self {
        flatten_params(key, value, &mut self.query);
        self
    }

    /// Replace the body with the form encoding of `fields`.
    pub fn form_body(mut self, fields: &Value) -> Self {
        let mut flat = BTreeMap::new();
        flatten_params("", fields, &mut flat);
        self.body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(flat.iter())
            .finish()
            .into_bytes();
        self.headers
            .insert("content-type".to_string(), FORM_CONTENT_TYPE.to_string());
        self
    }

    /// Text moderation payload: `ServiceParameters={content, sessionId, requestFrom}`.
    pub fn text_check(self, service: &str, content: &str, session_id: &str) -> Self {
        let parameters = json!({
            "content": content,
            "sessionId": session_id,
            "requestFrom": REQUEST_FROM,
        });
        self.service(service)
            .form_body(&json!({ "ServiceParameters": parameters.to_string() }))
    }

    /// Image moderation payload. URL and inline base64 may both be present.
    pub fn image_check(
        self,
        service: &str,
        image_url: Option<&str>,
        image_base64: Option<&str>,
    ) -> Self {
        let mut parameters = serde_json::Map::new();
        if let Some(url) = image_url.filter(|u| !u.is_empty()) {
            parameters.insert("imageUrls".to_string(), json!([url]));
        }
        let mut form = serde_json::Map::new();
        form.insert(
            "ServiceParameters".to_string(),
            Value::String(Value::Object(parameters).to_string()),
        );
        if let Some(data) = image_base64.filter(|d| !d.is_empty()) {
            form.insert("ImageBase64Str".to_string(), Value::String(data.to_string()));
        }
        self.service(service).form_body(&Value::Object(form))
    }

    fn service(mut self, service: &str) -> Self {
        self.service = service.to_string();
        self.query_param("Service", &Value::String(service.to_string()))
    }

    /// Sign the call.
    pub fn sign(mut self, credentials: &Credentials) -> Result<ModerationRequest> {
        if credentials.access_key.is_empty() || credentials.secret_key.is_empty() {
            return Err(GuardError::Signing("access key pair must not be empty".into()));
        }

        let hashed_payload = sha256_hex(&self.body);
        self.headers
            .insert("x-acs-content-sha256".to_string(), hashed_payload.clone());
        if let Some(token) = credentials.security_token.as_deref() {
            self.headers
                .insert("x-acs-security-token".to_string(), token.to_string());
        }

        let (signed_headers, string_to_sign) =
            string_to_sign(&self.query, &self.headers, &hashed_payload);
        let signature = hmac_sha256_hex(&credentials.secret_key, &string_to_sign)?;
        let authorization = format!(
            "{} Credential={},SignedHeaders={},Signature={}",
            ALGORITHM, credentials.access_key, signed_headers, signature
        );

        let path = format!(
            "{}?{}",
            CANONICAL_URI,
            form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.query.iter())
                .finish()
        );
        let mut headers: Vec<(String, String)> = self
            .headers
            .into_iter()
            .filter(|(name, _)| name != "host")
            .collect();
        headers.push(("Authorization".to_string(), authorization));

        Ok(ModerationRequest {
            action: self.action,
            service: self.service,
            path,
            headers,
            body: self.body,
        })
    }
}

/// A signed call, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationRequest {
    pub action: CheckAction,
    pub service: String,
    /// `/?` followed by the form-encoded query.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ModerationRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Form fields of the body, decoded.
    pub fn form_fields(&self) -> BTreeMap<String, String> {
        form_urlencoded::parse(&self.body).into_owned().collect()
    }

    /// Recompute the signature from the emitted path, headers and body.
    pub fn verify(&self, host: &str, credentials: &Credentials) -> Result<()> {
        let authorization = self
            .header("authorization")
            .ok_or_else(|| GuardError::Signing("missing Authorization header".into()))?;
        let parts = AuthorizationParts::parse(authorization)?;
        if parts.credential != credentials.access_key {
            return Err(GuardError::Signing("credential mismatch".into()));
        }

        let mut headers: BTreeMap<String, String> = self
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("authorization"))
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();
        headers.insert("host".to_string(), host.to_string());

        let hashed_payload = sha256_hex(&self.body);
        if headers.get("x-acs-content-sha256") != Some(&hashed_payload) {
            return Err(GuardError::Signing("payload hash mismatch".into()));
        }

        let query_string = self
            .path
            .split_once('?')
            .map(|(_, query)| query)
            .unwrap_or("");
        let query: BTreeMap<String, String> = form_urlencoded::parse(query_string.as_bytes())
            .into_owned()
            .collect();

        let (signed_headers, string_to_sign) = string_to_sign(&query, &headers, &hashed_payload);
        if signed_headers != parts.signed_headers {
            return Err(GuardError::Signing("signed header list mismatch".into()));
        }

        let signature = hex::decode(parts.signature)
            .map_err(|_| GuardError::Signing("signature is not valid hex".into()))?;
        let mut mac = HmacSha256::new_from_slice(credentials.secret_key.as_bytes())
            .map_err(|e| GuardError::Signing(format!("HMAC error: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| GuardError::Signing("signature mismatch".into()))
    }
}

struct AuthorizationParts<'a> {
    credential: &'a str,
    signed_headers: &'a str,
    signature: &'a str,
}

impl<'a> AuthorizationParts<'a> {
    fn parse(value: &'a str) -> Result<Self> {
        let rest = value
            .strip_prefix(ALGORITHM)
            .map(str::trim_start)
            .ok_or_else(|| GuardError::Signing("unsupported signature algorithm".into()))?;
        let mut credential = None;
        let mut signed_headers = None;
        let mut signature = None;
        for field in rest.split(',') {
            match field.split_once('=') {
                Some(("Credential", v)) => credential = Some(v),
                Some(("SignedHeaders", v)) => signed_headers = Some(v),
                Some(("Signature", v)) => signature = Some(v),
                _ => {}
            }
        }
        match (credential, signed_headers, signature) {
            (Some(credential), Some(signed_headers), Some(signature)) => Ok(Self {
                credential,
                signed_headers,
                signature,
            }),
            _ => Err(GuardError::Signing("malformed Authorization header".into())),
        }
    }
}

/// Build the signed-header list and string-to-sign.
fn string_to_sign(
    query: &BTreeMap<String, String>,
    headers: &BTreeMap<String, String>,
    hashed_payload: &str,
) -> (String, String) {
    let canonical_query = query
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let signed: Vec<(&String, &String)> = headers
        .iter()
        .filter(|(name, _)| {
            name.as_str() == "host" || name.starts_with("x-acs-") || name.as_str() == "content-type"
        })
        .collect();
    let canonical_headers: String = signed
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect();
    let signed_headers = signed
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        METHOD, CANONICAL_URI, canonical_query, canonical_headers, signed_headers, hashed_payload
    );
    let string_to_sign = format!("{}\n{}", ALGORITHM, sha256_hex(canonical_request.as_bytes()));
    (signed_headers, string_to_sign)
}

/// Flatten nested maps and arrays into dotted keys. Array indexes start at 1
/// and null values are dropped.
pub fn flatten_params(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    let join = |segment: &str| {
        if prefix.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{}", prefix, segment)
        }
    };
    match value {
        Value::Null => {}
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_params(&join(&(i + 1).to_string()), item, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                flatten_params(&join(key), item, out);
            }
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

/// RFC3986 percent-encoding with the `+`, `*` and `~` substitutions the
/// backend expects.
pub fn percent_encode(value: &str) -> String {
    urlencoding::encode(value)
        .replace('+', "%20")
        .replace('*', "%2A")
        .replace("%7E", "~")
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn hmac_sha256_hex(key: &str, message: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| GuardError::Signing(format!("HMAC error: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
