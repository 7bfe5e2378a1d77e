//! Transport-parameter HMAC signing.
//!
//! Signs the values carried through the return URL (claimed
//! identifier, original location) so the engine can recognize its own
//! callback without server-side session state. Signatures are
//! deterministic: freshness comes from the nonce store, not from the
//! signature itself.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::context::{hex_encode, SecretProvider};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer over a process-wide secret, namespaced by a
/// purpose string so signatures from different subsystems of the host
/// never collide.
pub struct ParamSigner {
    secret: Vec<u8>,
}

impl ParamSigner {
    pub fn new(secrets: &dyn SecretProvider) -> Self {
        Self {
            secret: secrets.secret().to_vec(),
        }
    }

    /// Hex HMAC-SHA256 over `purpose || 0x00 || payload`.
    pub fn sign(&self, payload: &str, purpose: &str) -> String {
        // new_from_slice accepts any key length for HMAC.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(purpose.as_bytes());
        mac.update(&[0u8]);
        mac.update(payload.as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }

    /// Recompute and compare in constant time. Never panics; garbage
    /// signatures simply verify false.
    pub fn verify(&self, payload: &str, purpose: &str, signature: &str) -> bool {
        let expected = self.sign(payload, purpose);
        if expected.len() != signature.len() {
            return false;
        }
        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }
}

impl std::fmt::Debug for ParamSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of Debug output.
        f.debug_struct("ParamSigner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StaticSecret;

    fn signer() -> ParamSigner {
        ParamSigner::new(&StaticSecret::new(b"0123456789abcdef".to_vec()))
    }

    #[test]
    fn test_sign_is_deterministic() {
        let s = signer();
        assert_eq!(
            s.sign("https://example.com/alice/", "openid"),
            s.sign("https://example.com/alice/", "openid")
        );
    }

    #[test]
    fn test_sign_output_is_hex_sha256() {
        let sig = signer().sign("payload", "openid");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_verify_roundtrip() {
        let s = signer();
        let sig = s.sign("https://example.com/", "openid");
        assert!(s.verify("https://example.com/", "openid", &sig));
    }

    #[test]
    fn test_purpose_scopes_the_signature() {
        let s = signer();
        let sig = s.sign("payload", "openid");
        assert!(!s.verify("payload", "other", &sig));
    }

    #[test]
    fn test_different_secrets_disagree() {
        let a = signer();
        let b = ParamSigner::new(&StaticSecret::new(b"another-key".to_vec()));
        let sig = a.sign("payload", "openid");
        assert!(!b.verify("payload", "openid", &sig));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let s = signer();
        assert!(!s.verify("payload", "openid", ""));
        assert!(!s.verify("payload", "openid", "not-hex"));
        assert!(!s.verify("payload", "openid", &"0".repeat(64)));
    }

    #[test]
    fn test_empty_payload_signs() {
        let s = signer();
        let sig = s.sign("", "openid");
        assert!(s.verify("", "openid", &sig));
    }
}
