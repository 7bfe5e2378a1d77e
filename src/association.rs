//! Associations: shared secrets negotiated with a provider.
//!
//! An association lets the consumer verify provider response
//! signatures locally, without a network round trip per login. The
//! persisted form is a versioned JSON envelope so the on-disk contract
//! is explicit rather than whatever the serializer happens to emit.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// The consumer treats an association as dead this many seconds before
/// the provider does, so a response signed near the provider-side
/// expiry never races an already-deleted local row.
pub const ASSOCIATION_SAFETY_INTERVAL_SECS: i64 = 120;

/// Current version of the persisted envelope.
const ENCODING_VERSION: u8 = 1;

/// MAC algorithm negotiated for an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssocType {
    /// OpenID 1.1 `HMAC-SHA1`.
    HmacSha1,
    /// OpenID 2.0 `HMAC-SHA256`.
    HmacSha256,
}

impl AssocType {
    /// Wire name as used in `openid.assoc_type`.
    pub fn wire_name(self) -> &'static str {
        match self {
            AssocType::HmacSha1 => "HMAC-SHA1",
            AssocType::HmacSha256 => "HMAC-SHA256",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "HMAC-SHA1" => Some(AssocType::HmacSha1),
            "HMAC-SHA256" => Some(AssocType::HmacSha256),
            _ => None,
        }
    }
}

/// A shared secret negotiated with one provider endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct Association {
    /// Provider-assigned identifier for this secret.
    pub handle: String,
    /// MAC key. Never logged.
    pub secret: Vec<u8>,
    /// Unix seconds at issue time.
    pub issued: i64,
    /// Provider-declared lifetime in seconds.
    pub lifetime: i64,
    pub assoc_type: AssocType,
}

/// Persisted envelope. Kept separate from [`Association`] so schema
/// evolution is a deliberate change to this struct, not an accident of
/// field renames.
#[derive(Serialize, Deserialize)]
struct StoredAssociation {
    v: u8,
    handle: String,
    secret_b64: String,
    issued: i64,
    lifetime: i64,
    assoc_type: AssocType,
}

impl Association {
    /// When this consumer stops trusting the association: provider
    /// expiry minus the safety interval.
    pub fn expires_at(&self) -> i64 {
        self.issued + self.lifetime - ASSOCIATION_SAFETY_INTERVAL_SECS
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at() <= now
    }

    /// Versioned binary encoding for persistence.
    pub fn encode(&self) -> Vec<u8> {
        let stored = StoredAssociation {
            v: ENCODING_VERSION,
            handle: self.handle.clone(),
            secret_b64: BASE64.encode(&self.secret),
            issued: self.issued,
            lifetime: self.lifetime,
            assoc_type: self.assoc_type,
        };
        // Serialization of a plain struct cannot fail.
        serde_json::to_vec(&stored).expect("association envelope serializes")
    }

    /// Decode a persisted envelope. Returns `None` for undecodable
    /// content or an unknown version; stores treat that as "row not
    /// found" rather than an error.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let stored: StoredAssociation = serde_json::from_slice(bytes).ok()?;
        if stored.v != ENCODING_VERSION {
            return None;
        }
        let secret = BASE64.decode(stored.secret_b64).ok()?;
        Some(Association {
            handle: stored.handle,
            secret,
            issued: stored.issued,
            lifetime: stored.lifetime,
            assoc_type: stored.assoc_type,
        })
    }

    /// MAC over the OpenID key-value signing form, base64-encoded as
    /// carried in `openid.sig`.
    pub fn sign_kv(&self, message: &str) -> String {
        let mac = match self.assoc_type {
            AssocType::HmacSha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&self.secret)
                    .expect("HMAC accepts keys of any length");
                mac.update(message.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
            AssocType::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
                    .expect("HMAC accepts keys of any length");
                mac.update(message.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
        };
        BASE64.encode(mac)
    }

    /// Verify a provider signature over the signing form, in constant
    /// time.
    pub fn verify_kv(&self, message: &str, signature_b64: &str) -> bool {
        let Ok(claimed) = BASE64.decode(signature_b64) else {
            return false;
        };
        let Ok(expected) = BASE64.decode(self.sign_kv(message)) else {
            return false;
        };
        if claimed.len() != expected.len() {
            return false;
        }
        claimed.as_slice().ct_eq(expected.as_slice()).into()
    }
}

impl std::fmt::Debug for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The MAC key stays out of Debug output.
        f.debug_struct("Association")
            .field("handle", &self.handle)
            .field("issued", &self.issued)
            .field("lifetime", &self.lifetime)
            .field("assoc_type", &self.assoc_type)
            .finish_non_exhaustive()
    }
}

/// Build the OpenID signing form: for each field in `signed_fields`,
/// one `name:value\n` line, in list order. Returns `None` if any
/// listed field is absent from `value_of` — a response that signs a
/// field it did not send is unverifiable and must fail closed.
pub fn kv_signing_form<'a>(
    signed_fields: &[&str],
    mut value_of: impl FnMut(&str) -> Option<&'a str>,
) -> Option<String> {
    let mut form = String::new();
    for field in signed_fields {
        let value = value_of(field)?;
        form.push_str(field);
        form.push(':');
        form.push_str(value);
        form.push('\n');
    }
    Some(form)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn assoc(assoc_type: AssocType) -> Association {
        Association {
            handle: "{HMAC}{abc123}".into(),
            secret: b"twenty-byte-mac-key!".to_vec(),
            issued: 1_700_000_000,
            lifetime: 3600,
            assoc_type,
        }
    }

    #[test]
    fn test_expires_at_applies_safety_interval() {
        let a = assoc(AssocType::HmacSha256);
        assert_eq!(a.expires_at(), 1_700_000_000 + 3600 - 120);
        assert!(!a.is_expired(a.expires_at() - 1));
        assert!(a.is_expired(a.expires_at()));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let a = assoc(AssocType::HmacSha1);
        let decoded = Association::decode(&a.encode()).unwrap();
        assert_eq!(decoded, a);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Association::decode(b"").is_none());
        assert!(Association::decode(b"not json").is_none());
        assert!(Association::decode(b"{\"v\":1}").is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&assoc(AssocType::HmacSha256).encode()).unwrap();
        value["v"] = serde_json::json!(99);
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(Association::decode(&bytes).is_none());
    }

    #[test]
    fn test_sign_verify_kv_both_mac_types() {
        for ty in [AssocType::HmacSha1, AssocType::HmacSha256] {
            let a = assoc(ty);
            let message = "op_endpoint:https://op.example.net/\nreturn_to:https://rp.example.org/return\n";
            let sig = a.sign_kv(message);
            assert!(a.verify_kv(message, &sig));
            assert!(!a.verify_kv("tampered:message\n", &sig));
            assert!(!a.verify_kv(message, "AAAA"));
            assert!(!a.verify_kv(message, "%%%not-base64%%%"));
        }
    }

    #[test]
    fn test_mac_types_are_not_interchangeable() {
        let message = "mode:id_res\n";
        let sha1 = assoc(AssocType::HmacSha1).sign_kv(message);
        let sha256 = assoc(AssocType::HmacSha256).sign_kv(message);
        assert_ne!(sha1, sha256);
    }

    #[test]
    fn test_kv_signing_form_order_and_content() {
        let params: HashMap<&str, &str> = [
            ("mode", "id_res"),
            ("identity", "https://example.com/alice/"),
            ("return_to", "https://rp.example.org/return"),
        ]
        .into_iter()
        .collect();
        let form =
            kv_signing_form(&["return_to", "mode"], |f| params.get(f).copied()).unwrap();
        assert_eq!(form, "return_to:https://rp.example.org/return\nmode:id_res\n");
    }

    #[test]
    fn test_kv_signing_form_missing_field_fails_closed() {
        let form = kv_signing_form(&["mode", "absent"], |f| {
            (f == "mode").then_some("id_res")
        });
        assert!(form.is_none());
    }

    #[test]
    fn test_assoc_type_wire_names() {
        assert_eq!(AssocType::HmacSha256.wire_name(), "HMAC-SHA256");
        assert_eq!(
            AssocType::from_wire_name("HMAC-SHA1"),
            Some(AssocType::HmacSha1)
        );
        assert_eq!(AssocType::from_wire_name("DH-SHA1"), None);
    }

    #[test]
    fn test_debug_hides_secret() {
        let dbg = format!("{:?}", assoc(AssocType::HmacSha256));
        assert!(!dbg.contains("twenty-byte-mac-key"));
        assert!(dbg.contains("{HMAC}{abc123}"));
    }
}
