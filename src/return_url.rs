//! Signed callback URL construction and verification.
//!
//! The return URL is the only state that survives the trip through the
//! provider, so everything it carries is HMAC-signed with the
//! process-wide secret. Continuation payloads are referenced by an
//! opaque token id rather than inlined, keeping caller state out of
//! provider logs and `Referer` headers.

use url::Url;

use crate::signer::ParamSigner;

pub const PARAM_MODE: &str = "tx_openid_mode";
pub const PARAM_CLAIMED: &str = "tx_openid_claimed";
pub const PARAM_SIGNATURE: &str = "tx_openid_signature";
pub const PARAM_LOCATION: &str = "tx_openid_location";
pub const PARAM_LOCATION_SIGNATURE: &str = "tx_openid_location_signature";
pub const PARAM_TOKEN: &str = "tx_openid_token";

const MODE_FINISH: &str = "finish";

/// Signature namespace for all return-URL parameters.
const SIGNING_PURPOSE: &str = "openid";

/// Verified contents of a callback URL we built ourselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnContext {
    /// Claimed identifier as it was at the start of the handshake.
    pub claimed: String,
    /// Where the user agent should end up after authentication.
    pub location: String,
    /// Reference to a stored continuation payload, if one was carried.
    pub token_id: Option<String>,
}

/// Builds and verifies the callback URL's `tx_openid_*` parameters.
pub struct ReturnUrlCodec {
    signer: ParamSigner,
}

impl ReturnUrlCodec {
    pub fn new(signer: ParamSigner) -> Self {
        Self { signer }
    }

    /// Append the finish-mode parameters to the site's return endpoint.
    /// Deterministic apart from `token_id`, which the caller mints.
    pub fn build(
        &self,
        return_endpoint: &Url,
        claimed: &str,
        location: &str,
        token_id: Option<&str>,
    ) -> Url {
        let mut url = return_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(PARAM_MODE, MODE_FINISH);
            query.append_pair(PARAM_CLAIMED, claimed);
            query.append_pair(PARAM_SIGNATURE, &self.signer.sign(claimed, SIGNING_PURPOSE));
            query.append_pair(PARAM_LOCATION, location);
            query.append_pair(
                PARAM_LOCATION_SIGNATURE,
                &self.signer.sign(location, SIGNING_PURPOSE),
            );
            if let Some(token_id) = token_id {
                query.append_pair(PARAM_TOKEN, token_id);
            }
        }
        url
    }

    /// True when the URL carries `tx_openid_mode=finish` at all, i.e.
    /// when a request is a callback rather than a fresh login.
    pub fn is_finish_request(url: &Url) -> bool {
        url.query_pairs()
            .any(|(k, v)| k == PARAM_MODE && v == MODE_FINISH)
    }

    /// Recompute both signatures and hand back the carried fields.
    /// Returns `None` on any missing field or signature mismatch; this
    /// must gate every use of the carried values, since an attacker can
    /// fabricate a callback without ever visiting the provider.
    pub fn parse_and_verify(&self, url: &Url) -> Option<ReturnContext> {
        let mut mode = None;
        let mut claimed = None;
        let mut signature = None;
        let mut location = None;
        let mut location_signature = None;
        let mut token_id = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                PARAM_MODE => mode = Some(value.into_owned()),
                PARAM_CLAIMED => claimed = Some(value.into_owned()),
                PARAM_SIGNATURE => signature = Some(value.into_owned()),
                PARAM_LOCATION => location = Some(value.into_owned()),
                PARAM_LOCATION_SIGNATURE => location_signature = Some(value.into_owned()),
                PARAM_TOKEN => token_id = Some(value.into_owned()),
                _ => {}
            }
        }

        if mode.as_deref() != Some(MODE_FINISH) {
            return None;
        }
        let claimed = claimed?;
        let location = location?;
        if !self
            .signer
            .verify(&claimed, SIGNING_PURPOSE, signature?.as_str())
        {
            return None;
        }
        if !self
            .signer
            .verify(&location, SIGNING_PURPOSE, location_signature?.as_str())
        {
            return None;
        }
        Some(ReturnContext {
            claimed,
            location,
            token_id,
        })
    }

    /// Verify a standalone location/signature pair and parse it as the
    /// bounce target for the final 303. Separate from
    /// [`parse_and_verify`](Self::parse_and_verify) because the bounce
    /// happens after the OpenID fields have been consumed and stripped.
    pub fn verify_bounce_target(&self, location: &str, signature: &str) -> Option<Url> {
        if !self.signer.verify(location, SIGNING_PURPOSE, signature) {
            return None;
        }
        Url::parse(location).ok()
    }
}

impl std::fmt::Debug for ReturnUrlCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReturnUrlCodec").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StaticSecret;

    fn codec() -> ReturnUrlCodec {
        let secrets = StaticSecret::new(b"return-url-test-secret".to_vec());
        ReturnUrlCodec::new(ParamSigner::new(&secrets))
    }

    fn endpoint() -> Url {
        Url::parse("https://rp.example.org/login").unwrap()
    }

    #[test]
    fn test_roundtrip_recovers_fields() {
        let c = codec();
        let url = c.build(
            &endpoint(),
            "https://example.com/alice/",
            "https://rp.example.org/account?page=2",
            None,
        );
        let ctx = c.parse_and_verify(&url).unwrap();
        assert_eq!(ctx.claimed, "https://example.com/alice/");
        assert_eq!(ctx.location, "https://rp.example.org/account?page=2");
        assert_eq!(ctx.token_id, None);
    }

    #[test]
    fn test_token_id_carried_through() {
        let c = codec();
        let url = c.build(
            &endpoint(),
            "https://example.com/alice/",
            "https://rp.example.org/",
            Some("f3a1b2c4d5e6f7a8b9c0d1e2"),
        );
        let ctx = c.parse_and_verify(&url).unwrap();
        assert_eq!(ctx.token_id.as_deref(), Some("f3a1b2c4d5e6f7a8b9c0d1e2"));
    }

    #[test]
    fn test_tampered_claimed_rejected() {
        let c = codec();
        let url = c.build(
            &endpoint(),
            "https://example.com/alice/",
            "https://rp.example.org/",
            None,
        );
        let tampered = url
            .as_str()
            .replace("alice", "mallory");
        let tampered = Url::parse(&tampered).unwrap();
        assert!(c.parse_and_verify(&tampered).is_none());
    }

    #[test]
    fn test_tampered_location_rejected() {
        let c = codec();
        let url = c.build(
            &endpoint(),
            "https://example.com/alice/",
            "https://rp.example.org/account",
            None,
        );
        let tampered = url.as_str().replace("account", "attacker");
        let tampered = Url::parse(&tampered).unwrap();
        assert!(c.parse_and_verify(&tampered).is_none());
    }

    #[test]
    fn test_missing_mode_rejected() {
        let c = codec();
        let url = c.build(&endpoint(), "a", "b", None);
        let without_mode = url.as_str().replace("tx_openid_mode=finish", "x=y");
        let without_mode = Url::parse(&without_mode).unwrap();
        assert!(c.parse_and_verify(&without_mode).is_none());
    }

    #[test]
    fn test_missing_signature_rejected() {
        let c = codec();
        let mut url = endpoint();
        url.query_pairs_mut()
            .append_pair(PARAM_MODE, "finish")
            .append_pair(PARAM_CLAIMED, "https://example.com/alice/")
            .append_pair(PARAM_LOCATION, "https://rp.example.org/");
        assert!(c.parse_and_verify(&url).is_none());
    }

    #[test]
    fn test_parse_is_order_insensitive() {
        let c = codec();
        let built = c.build(
            &endpoint(),
            "https://example.com/alice/",
            "https://rp.example.org/",
            None,
        );
        // Reassemble the query in reverse parameter order, with the
        // provider's own parameters interleaved.
        let mut reordered = endpoint();
        {
            let mut pairs: Vec<(String, String)> = built
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            pairs.reverse();
            let mut query = reordered.query_pairs_mut();
            query.append_pair("openid_mode", "id_res");
            for (k, v) in &pairs {
                query.append_pair(k, v);
            }
        }
        let ctx = c.parse_and_verify(&reordered).unwrap();
        assert_eq!(ctx.claimed, "https://example.com/alice/");
    }

    #[test]
    fn test_different_secret_rejects() {
        let c = codec();
        let url = c.build(&endpoint(), "a", "b", None);
        let other = ReturnUrlCodec::new(ParamSigner::new(&StaticSecret::new(
            b"some-other-secret".to_vec(),
        )));
        assert!(other.parse_and_verify(&url).is_none());
    }

    #[test]
    fn test_is_finish_request() {
        let c = codec();
        let url = c.build(&endpoint(), "a", "b", None);
        assert!(ReturnUrlCodec::is_finish_request(&url));
        assert!(!ReturnUrlCodec::is_finish_request(&endpoint()));
    }

    #[test]
    fn test_bounce_target_requires_valid_signature() {
        let c = codec();
        let secrets = StaticSecret::new(b"return-url-test-secret".to_vec());
        let signer = ParamSigner::new(&secrets);
        let sig = signer.sign("https://rp.example.org/next", "openid");
        let target = c
            .verify_bounce_target("https://rp.example.org/next", &sig)
            .unwrap();
        assert_eq!(target.as_str(), "https://rp.example.org/next");
        assert!(c
            .verify_bounce_target("https://attacker.example/", &sig)
            .is_none());
    }
}
