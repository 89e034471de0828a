//! Turns an inbound request into at most one typed [`PaymentEnvelope`].
//!
//! Clients put the signed authorization in different places. The rules are
//! tried in a fixed order and the first one that finds a candidate wins:
//!
//! 1. `X-PAYMENT` header, base64 JSON or raw JSON
//! 2. body `paymentPayload`
//! 3. body `payment` (usually sent with `"status": "payment-submitted"`)
//! 4. body `x402`
//! 5. the body itself, when it looks like an envelope
//!
//! A candidate that does not parse is malformed input. It never falls through
//! to a later rule.

use crate::types::{InvalidReason, PaymentEnvelope, X402_VERSION};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::debug;

pub const PAYMENT_HEADER: &str = "X-PAYMENT";
pub const PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";
pub const PAYMENT_SUBMITTED: &str = "payment-submitted";

const BODY_FIELDS: [&str; 3] = ["paymentPayload", "payment", "x402"];

/// What the HTTP layer hands over: the raw header value and the parsed JSON body.
#[derive(Debug, Clone, Default)]
pub struct InboundPayment {
    pub payment_header: Option<String>,
    pub body: Option<Value>,
}

impl InboundPayment {
    pub fn from_header(header: impl Into<String>) -> Self {
        Self {
            payment_header: Some(header.into()),
            body: None,
        }
    }

    pub fn from_body(body: Value) -> Self {
        Self {
            payment_header: None,
            body: Some(body),
        }
    }

    /// Body shaped as `{"status": "payment-submitted", "payment": <envelope>}`.
    pub fn submitted(envelope: &PaymentEnvelope) -> Self {
        Self::from_body(serde_json::json!({
            "status": PAYMENT_SUBMITTED,
            "payment": envelope,
        }))
    }
}

/// `Ok(None)` means no payment was offered at all.
pub fn extract_payment(inbound: &InboundPayment) -> Result<Option<PaymentEnvelope>, InvalidReason> {
    if let Some(header) = inbound
        .payment_header
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
    {
        debug!("payment found in {} header", PAYMENT_HEADER);
        return decode_header(header).map(Some);
    }

    let Some(body) = inbound.body.as_ref().filter(|b| b.is_object()) else {
        return Ok(None);
    };

    for field in BODY_FIELDS {
        match body.get(field) {
            None | Some(Value::Null) => continue,
            Some(candidate) => {
                debug!("payment found in body field {}", field);
                return parse_envelope(candidate.clone()).map(Some);
            }
        }
    }

    if body.pointer("/payload/authorization").is_some() {
        debug!("payment found as request body");
        return parse_envelope(body.clone()).map(Some);
    }
    Ok(None)
}

/// Decode an `X-PAYMENT` header value.
pub fn decode_header(header: &str) -> Result<PaymentEnvelope, InvalidReason> {
    let json = if header.starts_with('{') {
        header.as_bytes().to_vec()
    } else {
        STANDARD
            .decode(header)
            .map_err(|e| InvalidReason::Malformed(format!("{} header is not base64: {}", PAYMENT_HEADER, e)))?
    };
    let value: Value = serde_json::from_slice(&json)
        .map_err(|e| InvalidReason::Malformed(format!("{} header is not JSON: {}", PAYMENT_HEADER, e)))?;
    parse_envelope(value)
}

/// Encode an envelope the way clients send it in `X-PAYMENT`.
pub fn encode_header(envelope: &PaymentEnvelope) -> Result<String, serde_json::Error> {
    Ok(STANDARD.encode(serde_json::to_vec(envelope)?))
}

fn parse_envelope(value: Value) -> Result<PaymentEnvelope, InvalidReason> {
    // some clients double-encode the envelope as a JSON string
    let value = match value {
        Value::String(text) => serde_json::from_str(&text)
            .map_err(|e| InvalidReason::Malformed(e.to_string()))?,
        other => other,
    };
    let envelope: PaymentEnvelope =
        serde_json::from_value(value).map_err(|e| InvalidReason::Malformed(e.to_string()))?;
    if envelope.x402_version != X402_VERSION {
        return Err(InvalidReason::Malformed(format!(
            "unsupported x402Version {}",
            envelope.x402_version
        )));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope_json() -> Value {
        json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "base-sepolia",
            "payload": {
                "signature": "0xdeadbeef",
                "authorization": {
                    "from": "0x1111111111111111111111111111111111111111",
                    "to": "0x2222222222222222222222222222222222222222",
                    "value": "10000",
                    "validAfter": "0",
                    "validBefore": "9999999999",
                    "nonce": "0x00"
                }
            }
        })
    }

    fn envelope() -> PaymentEnvelope {
        serde_json::from_value(envelope_json()).unwrap()
    }

    #[test]
    fn test_nothing_offered() {
        assert_eq!(extract_payment(&InboundPayment::default()), Ok(None));
        assert_eq!(
            extract_payment(&InboundPayment::from_body(json!({"prompt": "a cat"}))),
            Ok(None)
        );
        assert_eq!(extract_payment(&InboundPayment::from_header("   ")), Ok(None));
    }

    #[test]
    fn test_header_base64_and_raw() {
        let encoded = encode_header(&envelope()).unwrap();
        assert_eq!(
            extract_payment(&InboundPayment::from_header(encoded)),
            Ok(Some(envelope()))
        );
        let raw = envelope_json().to_string();
        assert_eq!(extract_payment(&InboundPayment::from_header(raw)), Ok(Some(envelope())));
    }

    #[test]
    fn test_header_wins_over_body() {
        let mut other = envelope_json();
        other["network"] = json!("base");
        let inbound = InboundPayment {
            payment_header: Some(encode_header(&envelope()).unwrap()),
            body: Some(json!({ "paymentPayload": other })),
        };
        assert_eq!(extract_payment(&inbound).unwrap().unwrap().network, "base-sepolia");
    }

    #[test]
    fn test_body_fields_in_order() {
        let mut second = envelope_json();
        second["network"] = json!("base");
        let body = json!({ "x402": second, "paymentPayload": envelope_json() });
        let found = extract_payment(&InboundPayment::from_body(body)).unwrap().unwrap();
        assert_eq!(found.network, "base-sepolia");

        let submitted = InboundPayment::submitted(&envelope());
        assert_eq!(extract_payment(&submitted), Ok(Some(envelope())));

        let bare = InboundPayment::from_body(envelope_json());
        assert_eq!(extract_payment(&bare), Ok(Some(envelope())));
    }

    #[test]
    fn test_string_encoded_candidate() {
        let body = json!({ "payment": envelope_json().to_string() });
        assert_eq!(extract_payment(&InboundPayment::from_body(body)), Ok(Some(envelope())));
    }

    #[test]
    fn test_bad_candidate_is_malformed_not_skipped() {
        let body = json!({ "paymentPayload": {"scheme": "exact"}, "x402": envelope_json() });
        assert!(matches!(
            extract_payment(&InboundPayment::from_body(body)),
            Err(InvalidReason::Malformed(_))
        ));
        assert!(matches!(
            extract_payment(&InboundPayment::from_header("%%%not-base64")),
            Err(InvalidReason::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_other_versions() {
        let mut v2 = envelope_json();
        v2["x402Version"] = json!(2);
        let err = extract_payment(&InboundPayment::from_body(json!({ "payment": v2 }))).unwrap_err();
        assert_eq!(
            err,
            InvalidReason::Malformed("unsupported x402Version 2".to_string())
        );
    }
}
