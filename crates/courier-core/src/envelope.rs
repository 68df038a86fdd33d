//! Incoming message envelope parsing.
//!
//! Brokers deliver opaque JSON bodies; this module turns them into a
//! [`MessagePointer`] with routing defaults applied. Unparseable bodies are
//! reported as errors so consumers can ack-and-drop them instead of letting
//! a poison frame loop forever.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::{MessagePointer, DEFAULT_MESSAGE_GROUP};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("missing message id")]
    MissingMessageId,

    #[error("missing callback URL for message {0}")]
    MissingCallbackUrl(String),
}

/// Wire shape of a broker message body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(alias = "id")]
    message_id: Option<String>,
    pool_code: Option<String>,
    message_group_id: Option<String>,
    payload: Option<serde_json::Value>,
    auth_token: Option<String>,
    #[serde(alias = "callbackUrl")]
    mediation_target: Option<String>,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    high_priority: bool,
}

/// Result of parsing one broker frame body.
#[derive(Debug, Clone)]
pub struct ParsedEnvelope {
    pub message_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub pointer: MessagePointer,
}

/// Parse a broker body, filling in `default_pool_code` and the default
/// message group where the envelope is silent.
pub fn parse_envelope(body: &str, default_pool_code: &str) -> Result<ParsedEnvelope, EnvelopeError> {
    let envelope: Envelope = serde_json::from_str(body)?;

    let message_id = envelope
        .message_id
        .filter(|id| !id.is_empty())
        .ok_or(EnvelopeError::MissingMessageId)?;

    let callback_url = envelope
        .mediation_target
        .filter(|url| !url.is_empty())
        .ok_or_else(|| EnvelopeError::MissingCallbackUrl(message_id.clone()))?;

    let pool_code = envelope
        .pool_code
        .filter(|code| !code.is_empty())
        .unwrap_or_else(|| default_pool_code.to_string());

    let message_group_id = envelope
        .message_group_id
        .filter(|group| !group.is_empty())
        .unwrap_or_else(|| DEFAULT_MESSAGE_GROUP.to_string());

    Ok(ParsedEnvelope {
        message_id,
        created_at: envelope.created_at,
        pointer: MessagePointer {
            pool_code,
            message_group_id,
            callback_url,
            auth_token: envelope.auth_token,
            payload: envelope.payload.unwrap_or(serde_json::Value::Null),
            high_priority: envelope.high_priority,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_envelope() {
        let body = r#"{
            "messageId": "m-1",
            "poolCode": "POOL-HIGH",
            "messageGroupId": "order-42",
            "callbackUrl": "https://downstream.example/hook",
            "authToken": "tok",
            "payload": {"k": 1},
            "highPriority": true
        }"#;

        let parsed = parse_envelope(body, "DEFAULT").unwrap();
        assert_eq!(parsed.message_id, "m-1");
        assert_eq!(parsed.pointer.pool_code, "POOL-HIGH");
        assert_eq!(parsed.pointer.message_group_id, "order-42");
        assert_eq!(parsed.pointer.callback_url, "https://downstream.example/hook");
        assert!(parsed.pointer.high_priority);
    }

    #[test]
    fn accepts_id_and_mediation_target_aliases() {
        let body = r#"{"id": "m-2", "mediationTarget": "https://x.example/cb"}"#;
        let parsed = parse_envelope(body, "DEFAULT").unwrap();
        assert_eq!(parsed.message_id, "m-2");
        assert_eq!(parsed.pointer.callback_url, "https://x.example/cb");
    }

    #[test]
    fn applies_routing_defaults() {
        let body = r#"{"messageId": "m-3", "callbackUrl": "https://x.example/cb"}"#;
        let parsed = parse_envelope(body, "POOL-MEDIUM").unwrap();
        assert_eq!(parsed.pointer.pool_code, "POOL-MEDIUM");
        assert_eq!(parsed.pointer.message_group_id, DEFAULT_MESSAGE_GROUP);
        assert!(!parsed.pointer.high_priority);
        assert_eq!(parsed.pointer.payload, serde_json::Value::Null);
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(matches!(
            parse_envelope("not json", "DEFAULT"),
            Err(EnvelopeError::InvalidJson(_))
        ));
    }

    #[test]
    fn rejects_missing_id_or_target() {
        assert!(matches!(
            parse_envelope(r#"{"callbackUrl": "https://x.example"}"#, "DEFAULT"),
            Err(EnvelopeError::MissingMessageId)
        ));
        assert!(matches!(
            parse_envelope(r#"{"messageId": "m"}"#, "DEFAULT"),
            Err(EnvelopeError::MissingCallbackUrl(_))
        ));
    }

    #[test]
    fn empty_group_falls_back_to_default() {
        let body = r#"{"messageId": "m-4", "messageGroupId": "", "callbackUrl": "https://x.example"}"#;
        let parsed = parse_envelope(body, "DEFAULT").unwrap();
        assert_eq!(parsed.pointer.message_group_id, DEFAULT_MESSAGE_GROUP);
    }
}
