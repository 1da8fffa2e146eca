//! Stripe webhook signature verification and event dispatch.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// Minimal view of a webhook event envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// What a processed event amounted to, returned to the provider as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookOutcome {
    SubscriptionCreated {
        customer_email: Option<String>,
        plan_id: Option<String>,
    },
    SubscriptionCancelled {
        revoked: u64,
    },
    Ignored {
        #[serde(rename = "type")]
        event_type: String,
    },
}

/// Verify a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`) against the raw payload.
///
/// The signed message is `"{t}.{payload}"`; any matching `v1` entry is accepted as long as
/// `t` is within `tolerance_secs` of `now`.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), GatewayError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| GatewayError::InvalidSignature("missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(GatewayError::InvalidSignature("no v1 signature".to_string()));
    }
    // Header timestamp is untrusted input.
    if now.abs_diff(timestamp) > u64::try_from(tolerance_secs).unwrap_or(0) {
        return Err(GatewayError::InvalidSignature(
            "timestamp outside tolerance".to_string(),
        ));
    }

    let signed = format!("{}.{}", timestamp, payload);
    let valid = signatures.iter().any(|sig| {
        let Some(expected) = hex::decode(sig) else {
            return false;
        };
        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(signed.as_bytes());
        // Constant-time comparison inside verify_slice.
        mac.verify_slice(&expected).is_ok()
    });

    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidSignature(
            "no signature matches the payload".to_string(),
        ))
    }
}

/// Compute the `v1` signature for a payload, as the provider does when sending events.
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn parse_event(payload: &str) -> Result<WebhookEvent, GatewayError> {
    serde_json::from_str(payload)
        .map_err(|e| GatewayError::Validation(format!("invalid webhook payload: {}", e)))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().fold(String::new(), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{b:02x}");
            s
        })
    }

    pub fn decode(s: &str) -> Option<Vec<u8>> {
        if s.len() % 2 != 0 || !s.is_ascii() {
            return None;
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"ping","data":{"object":{}}}"#;

    #[test]
    fn accepts_valid_signature() {
        let sig = sign_payload(PAYLOAD, SECRET, 1_700_000_000);
        let header = format!("t=1700000000,v1={}", sig);
        assert!(verify_signature(PAYLOAD, &header, SECRET, 300, 1_700_000_100).is_ok());
    }

    #[test]
    fn accepts_any_of_several_signatures() {
        let sig = sign_payload(PAYLOAD, SECRET, 1_700_000_000);
        let header = format!("t=1700000000,v1={},v1={},v0=legacy", "00".repeat(32), sig);
        assert!(verify_signature(PAYLOAD, &header, SECRET, 300, 1_700_000_000).is_ok());
    }

    #[test]
    fn rejects_tampered_payload_and_wrong_secret() {
        let sig = sign_payload(PAYLOAD, SECRET, 1_700_000_000);
        let header = format!("t=1700000000,v1={}", sig);
        assert!(verify_signature("{}", &header, SECRET, 300, 1_700_000_000).is_err());
        assert!(verify_signature(PAYLOAD, &header, "whsec_other", 300, 1_700_000_000).is_err());
    }

    #[test]
    fn rejects_stale_timestamp_and_garbage() {
        let sig = sign_payload(PAYLOAD, SECRET, 1_700_000_000);
        let header = format!("t=1700000000,v1={}", sig);
        assert!(verify_signature(PAYLOAD, &header, SECRET, 300, 1_700_000_301).is_err());
        assert!(verify_signature(PAYLOAD, "v1=zz", SECRET, 300, 1_700_000_000).is_err());
        assert!(verify_signature(PAYLOAD, "t=1700000000", SECRET, 300, 1_700_000_000).is_err());
        assert!(verify_signature(PAYLOAD, "t=1700000000,v1=not-hex", SECRET, 300, 1_700_000_000).is_err());
    }

    #[test]
    fn extreme_timestamps_are_rejected_without_overflow() {
        for t in [i64::MIN, i64::MAX] {
            let header = format!("t={},v1={}", t, "00".repeat(32));
            let err = verify_signature(PAYLOAD, &header, SECRET, 300, 1_700_000_000).unwrap_err();
            assert!(matches!(err, GatewayError::InvalidSignature(_)));
        }
        let err = verify_signature(PAYLOAD, "t=-9223372036854775808,v1=00", SECRET, 300, i64::MAX).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidSignature(_)));
    }

    #[test]
    fn parses_event_envelope() {
        let event = parse_event(PAYLOAD).expect("event");
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "ping");
        assert!(parse_event("not json").is_err());
    }

    #[test]
    fn outcome_serializes_with_event_tag() {
        let json = serde_json::to_value(WebhookOutcome::SubscriptionCancelled { revoked: 2 }).unwrap();
        assert_eq!(json["event"], "subscription_cancelled");
        assert_eq!(json["revoked"], 2);
        let json = serde_json::to_value(WebhookOutcome::Ignored { event_type: "invoice.paid".into() }).unwrap();
        assert_eq!(json["event"], "ignored");
        assert_eq!(json["type"], "invoice.paid");
    }
}
