use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Sign the exact body bytes sent to the receiver.
/// Returns a header value like "sha256=<hex>".
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a "sha256=<hex>" header against the body. The final comparison is
/// the MAC's own constant-time check.
pub fn verify(payload: &[u8], secret: &str, signature_header: &str) -> bool {
    let expected_hex = match signature_header.strip_prefix(SIGNATURE_PREFIX) {
        Some(h) => h,
        None => return false,
    };
    let expected = match hex::decode(expected_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
