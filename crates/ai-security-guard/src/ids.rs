//! Identifiers minted per exchange and per call.

use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};

pub const CHAT_ID_PREFIX: &str = "chatcmpl-";
const CHAT_ID_SUFFIX_LEN: usize = 29;
const SESSION_ID_LEN: usize = 20;

/// Random 20-character lower-case hex session id, shared by every
/// moderation call of one exchange.
pub fn session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Synthetic completion id for denial payloads.
pub fn chat_completion_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CHAT_ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}{}", CHAT_ID_PREFIX, suffix)
}

/// `x-acs-signature-nonce` value.
pub fn signature_nonce() -> String {
    uuid::Uuid::new_v4().to_string()
}
