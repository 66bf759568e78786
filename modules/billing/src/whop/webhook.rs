use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::WhopError;

type HmacSha256 = Hmac<Sha256>;

/// Verify a Whop webhook signature.
///
/// Whop signs webhooks with HMAC-SHA256 over `timestamp.raw_body` and sends
/// the result in a `whop-signature` header of the form
/// `t=<timestamp>,v1=<hex signature>`. Verification must happen on the raw
/// body before any processing; an invalid signature rejects the delivery
/// with no side effects.
pub fn verify_webhook_signature(
    payload: &[u8],
    signature_header: Option<&str>,
    secret: &str,
) -> Result<(), WhopError> {
    let signature = signature_header.ok_or(WhopError::WebhookVerificationFailed)?;

    let mut timestamp = "";
    let mut sig_value = "";

    for part in signature.split(',') {
        if let Some(value) = part.strip_prefix("t=") {
            timestamp = value;
        } else if let Some(value) = part.strip_prefix("v1=") {
            sig_value = value;
        }
    }

    if timestamp.is_empty() || sig_value.is_empty() {
        return Err(WhopError::WebhookVerificationFailed);
    }

    // Signed payload is "timestamp.body"
    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WhopError::WebhookVerificationFailed)?;
    mac.update(signed_payload.as_bytes());
    let expected_sig = hex::encode(mac.finalize().into_bytes());

    if expected_sig != sig_value {
        return Err(WhopError::WebhookVerificationFailed);
    }

    Ok(())
}

/// Build the signature header for a payload. Used by tests and the mock
/// gateway's webhook simulator.
pub fn sign_payload(payload: &[u8], timestamp: &str, secret: &str) -> String {
    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(signed_payload.as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"type":"payment.completed","data":{"id":"pay_1"}}"#;
        let header = sign_payload(body, "1700000000", "whsec_test");

        assert!(verify_webhook_signature(body, Some(&header), "whsec_test").is_ok());
    }

    #[test]
    fn rejects_missing_header() {
        let err = verify_webhook_signature(b"{}", None, "whsec_test").unwrap_err();
        assert!(matches!(err, WhopError::WebhookVerificationFailed));
    }

    #[test]
    fn rejects_malformed_header() {
        let err = verify_webhook_signature(b"{}", Some("v1=abc"), "whsec_test").unwrap_err();
        assert!(matches!(err, WhopError::WebhookVerificationFailed));
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = br#"{"type":"payment.completed"}"#;
        let header = sign_payload(body, "1700000000", "whsec_other");

        assert!(verify_webhook_signature(body, Some(&header), "whsec_test").is_err());
    }

    #[test]
    fn rejects_tampered_body() {
        let header = sign_payload(b"original", "1700000000", "whsec_test");

        assert!(verify_webhook_signature(b"tampered", Some(&header), "whsec_test").is_err());
    }
}
