//! Webhook payload signing.
//!
//! Receivers verify `X-Signature: sha256=<hex(hmac-sha256(secret, body))>`
//! and reject events older than their staleness window.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Produce the signature header value for a webhook body.
pub fn sign_webhook(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of a received signature header.
pub fn verify_webhook(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let secret = b"topsecret";
        let body = br#"{"uuid":"abc","status":"ACCEPTED"}"#;
        let header = sign_webhook(secret, body);
        assert!(header.starts_with("sha256="));
        assert!(verify_webhook(secret, body, &header));
    }

    #[test]
    fn tampered_body_fails() {
        let secret = b"topsecret";
        let header = sign_webhook(secret, b"payload");
        assert!(!verify_webhook(secret, b"payload2", &header));
    }

    #[test]
    fn malformed_header_fails() {
        assert!(!verify_webhook(b"s", b"b", "md5=00"));
        assert!(!verify_webhook(b"s", b"b", "sha256=zz"));
    }
}
