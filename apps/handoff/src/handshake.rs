//! Session-description payloads and their optical-code-safe text form.
//!
//! The text form is standard base64 over a JSON document:
//! `{"description":{"type":"offer","sdp":"..."},"createdAt":1735689600000}`.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{HandoffError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

/// Finalized description produced by the platform connection once candidate
/// gathering has completed. Never mutated after encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub description: SessionDescription,
    /// Unix milliseconds.
    pub created_at: u64,
}

impl HandshakePayload {
    pub fn new(description: SessionDescription) -> Self {
        Self {
            description,
            created_at: unix_millis(SystemTime::now()),
        }
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        Duration::from_millis(unix_millis(now).saturating_sub(self.created_at))
    }

    /// True when the payload is older than `max_age`, or claims to be from
    /// further than `max_age` in the future.
    pub fn is_expired(&self, max_age: Duration, now: SystemTime) -> bool {
        let now_ms = unix_millis(now);
        let max_ms = max_age.as_millis() as u64;
        if self.created_at > now_ms {
            return self.created_at - now_ms > max_ms;
        }
        now_ms - self.created_at > max_ms
    }
}

/// Stamps `description` with the current time and encodes it.
pub fn encode(description: &SessionDescription) -> Result<String> {
    encode_payload(&HandshakePayload::new(description.clone()))
}

pub fn encode_payload(payload: &HandshakePayload) -> Result<String> {
    let json = serde_json::to_vec(payload)
        .map_err(|err| HandoffError::MalformedPayload(format!("serialize failed: {err}")))?;
    Ok(BASE64_STANDARD.encode(json))
}

pub fn decode(text: &str) -> Result<HandshakePayload> {
    let raw = BASE64_STANDARD
        .decode(text.trim().as_bytes())
        .map_err(|err| HandoffError::MalformedPayload(format!("invalid encoding: {err}")))?;
    serde_json::from_slice(&raw)
        .map_err(|err| HandoffError::MalformedPayload(format!("invalid structure: {err}")))
}

/// Decodes and checks the description kind and freshness in one step.
pub fn decode_expecting(
    text: &str,
    kind: SdpKind,
    max_age: Duration,
) -> Result<HandshakePayload> {
    let payload = decode(text)?;
    if payload.description.kind != kind {
        return Err(HandoffError::MalformedPayload(format!(
            "expected {kind}, found {}",
            payload.description.kind
        )));
    }
    if payload.is_expired(max_age, SystemTime::now()) {
        return Err(HandoffError::MalformedPayload(
            "handshake code expired".into(),
        ));
    }
    Ok(payload)
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=candidate:1 1 udp 2130706431 192.168.1.20 50000 typ host\r\n";

    #[test]
    fn round_trip_preserves_description() {
        for description in [
            SessionDescription::offer(SAMPLE_SDP),
            SessionDescription::answer(SAMPLE_SDP),
            SessionDescription::offer("ünïcödé ✓"),
            SessionDescription::answer(""),
        ] {
            let text = encode(&description).expect("encode");
            let payload = decode(&text).expect("decode");
            assert_eq!(payload.description, description);
        }
    }

    #[test]
    fn encoded_text_is_base64_alphabet_only() {
        let text = encode(&SessionDescription::offer(SAMPLE_SDP)).expect("encode");
        assert!(
            text.bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
        );
    }

    #[test]
    fn wire_shape_uses_type_and_created_at() {
        let payload = HandshakePayload {
            description: SessionDescription::offer("sdp"),
            created_at: 42,
        };
        let text = encode_payload(&payload).expect("encode");
        let json = BASE64_STANDARD.decode(text).expect("base64");
        let value: serde_json::Value = serde_json::from_slice(&json).expect("json");
        assert_eq!(value["description"]["type"], "offer");
        assert_eq!(value["createdAt"], 42);
    }

    #[test]
    fn decode_tolerates_surrounding_whitespace() {
        let text = encode(&SessionDescription::answer("x")).expect("encode");
        let payload = decode(&format!("  {text}\n")).expect("decode");
        assert_eq!(payload.description.kind, SdpKind::Answer);
    }

    #[test]
    fn rejects_invalid_encoding() {
        let err = decode("not base64 at all!").expect_err("should fail");
        assert!(matches!(err, HandoffError::MalformedPayload(_)));
    }

    #[test]
    fn rejects_missing_description() {
        let text = BASE64_STANDARD.encode(br#"{"createdAt":1}"#);
        assert!(matches!(decode(&text), Err(HandoffError::MalformedPayload(_))));
    }

    #[test]
    fn rejects_unknown_description_type() {
        let text =
            BASE64_STANDARD.encode(br#"{"description":{"type":"rollback","sdp":""},"createdAt":1}"#);
        assert!(matches!(decode(&text), Err(HandoffError::MalformedPayload(_))));
    }

    #[test]
    fn decode_expecting_checks_kind() {
        let text = encode(&SessionDescription::answer("x")).expect("encode");
        let err = decode_expecting(&text, SdpKind::Offer, Duration::from_secs(60))
            .expect_err("kind mismatch");
        assert!(matches!(err, HandoffError::MalformedPayload(reason) if reason.contains("expected offer")));
    }

    #[test]
    fn decode_expecting_rejects_stale_codes() {
        let stale = HandshakePayload {
            description: SessionDescription::offer("x"),
            created_at: unix_millis(SystemTime::now()) - 120_000,
        };
        let text = encode_payload(&stale).expect("encode");
        assert!(decode_expecting(&text, SdpKind::Offer, Duration::from_secs(60)).is_err());
        assert!(decode_expecting(&text, SdpKind::Offer, Duration::from_secs(600)).is_ok());
    }

    #[test]
    fn expiry_handles_future_timestamps() {
        let now = SystemTime::now();
        let payload = HandshakePayload {
            description: SessionDescription::offer("x"),
            created_at: unix_millis(now) + 5_000,
        };
        assert!(!payload.is_expired(Duration::from_secs(10), now));
        assert!(payload.is_expired(Duration::from_secs(1), now));
        assert_eq!(payload.age(now), Duration::ZERO);
    }
}
