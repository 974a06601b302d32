use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::hmac;

/// HMAC-SHA256 over `payload`, base64 encoded as the payment processor expects.
pub fn sign(payload: &str, key: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, payload.as_bytes());
    STANDARD.encode(tag.as_ref())
}

/// Constant-time check of a base64 HMAC-SHA256 signature.
pub fn verify(payload: &str, signature: &str, key: &[u8]) -> bool {
    let Ok(tag) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&key, payload.as_bytes(), &tag).is_ok()
}
