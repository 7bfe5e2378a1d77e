//! Provider endpoint discovery and association negotiation.
//!
//! The network seam is the [`ProviderClient`] trait; the engine never
//! talks HTTP directly. [`HttpProviderClient`] is the production
//! implementation: blocking requests with an explicit timeout, so a
//! stalled provider turns into a retryable error instead of a hung
//! login request.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, warn};
use url::Url;

use crate::association::{AssocType, Association};
use crate::context::Clock;
use crate::error::{DiscoveryError, ProviderError};

/// Default timeout for provider-facing HTTP calls.
const HTTP_TIMEOUT_SECS: u64 = 10;

/// Maximum identifier page size the discovery scanner will read.
const MAX_DISCOVERY_BODY_BYTES: usize = 256 * 1024;

/// Protocol generation advertised by the endpoint. Decides request
/// delivery: 1.1 gets a 303 redirect, 2.0 an auto-submitting POST form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1_1,
    V2_0,
}

impl ProtocolVersion {
    /// OpenID 1.1 requests are small enough for a GET redirect; 2.0
    /// requests go by POST form.
    pub fn should_send_redirect(self) -> bool {
        matches!(self, ProtocolVersion::V1_1)
    }
}

/// A resolved provider endpoint for a claimed identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoint {
    /// The provider's OpenID server URL.
    pub server_url: Url,
    pub version: ProtocolVersion,
    /// Provider-local identifier (`openid2.local_id` / delegate) when
    /// the claimed identifier delegates to a different identity at the
    /// provider.
    pub local_id: Option<String>,
}

/// Network-facing operations against the provider.
pub trait ProviderClient: Send + Sync {
    /// Resolve a normalized claimed identifier to its provider
    /// endpoint.
    fn discover(&self, claimed: &str) -> Result<ProviderEndpoint, DiscoveryError>;

    /// Negotiate a fresh association with the endpoint.
    fn associate(&self, endpoint: &ProviderEndpoint) -> Result<Association, ProviderError>;
}

/// Production client over blocking reqwest.
pub struct HttpProviderClient {
    client: reqwest::blocking::Client,
    clock: Arc<dyn Clock>,
}

impl HttpProviderClient {
    pub fn new(clock: Arc<dyn Clock>) -> Result<Self, ProviderError> {
        Self::with_timeout(clock, Duration::from_secs(HTTP_TIMEOUT_SECS))
    }

    pub fn with_timeout(clock: Arc<dyn Clock>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;
        Ok(Self { client, clock })
    }

    fn request_association(
        &self,
        endpoint: &ProviderEndpoint,
        assoc_type: AssocType,
    ) -> Result<AssociateOutcome, ProviderError> {
        let mut form: Vec<(&str, String)> = vec![
            ("openid.mode", "associate".into()),
            ("openid.assoc_type", assoc_type.wire_name().into()),
            ("openid.session_type", "no-encryption".into()),
        ];
        if endpoint.version == ProtocolVersion::V2_0 {
            form.push(("openid.ns", OPENID2_NS.into()));
        }

        let response = self
            .client
            .post(endpoint.server_url.clone())
            .form(&form)
            .send()
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;

        let body = response
            .text()
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;
        let fields = parse_kv_form(&body);

        if let Some(error) = fields.iter().find(|(k, _)| k == "error").map(|(_, v)| v) {
            let code = fields
                .iter()
                .find(|(k, _)| k == "error_code")
                .map(|(_, v)| v.as_str());
            if code == Some("unsupported-type") {
                return Ok(AssociateOutcome::UnsupportedType);
            }
            return Err(ProviderError::Rejected(error.clone()));
        }

        let get = |key: &str| {
            fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .ok_or_else(|| ProviderError::MalformedResponse(format!("missing {key}")))
        };

        let negotiated = AssocType::from_wire_name(get("assoc_type")?).ok_or_else(|| {
            ProviderError::MalformedResponse("unknown assoc_type in response".into())
        })?;
        let handle = get("assoc_handle")?.to_string();
        let lifetime: i64 = get("expires_in")?
            .parse()
            .map_err(|_| ProviderError::MalformedResponse("unparsable expires_in".into()))?;
        let secret = BASE64
            .decode(get("mac_key")?)
            .map_err(|_| ProviderError::MalformedResponse("undecodable mac_key".into()))?;

        Ok(AssociateOutcome::Established(Association {
            handle,
            secret,
            issued: self.clock.now_ts(),
            lifetime,
            assoc_type: negotiated,
        }))
    }
}

enum AssociateOutcome {
    Established(Association),
    UnsupportedType,
}

pub(crate) const OPENID2_NS: &str = "http://specs.openid.net/auth/2.0";

impl ProviderClient for HttpProviderClient {
    fn discover(&self, claimed: &str) -> Result<ProviderEndpoint, DiscoveryError> {
        let response = self
            .client
            .get(claimed)
            .send()
            .map_err(|e| DiscoveryError::Fetch(e.to_string()))?;
        let body = response
            .text()
            .map_err(|e| DiscoveryError::Fetch(e.to_string()))?;
        let body = truncate_on_char_boundary(&body, MAX_DISCOVERY_BODY_BYTES);

        let endpoint = endpoint_from_html(body)
            .ok_or_else(|| DiscoveryError::NoEndpoint(claimed.to_string()))?;
        debug!(
            server_url = %endpoint.server_url,
            version = ?endpoint.version,
            "discovered provider endpoint"
        );
        Ok(endpoint)
    }

    fn associate(&self, endpoint: &ProviderEndpoint) -> Result<Association, ProviderError> {
        // The MAC key travels in the clear under no-encryption, so the
        // channel has to provide the confidentiality.
        if endpoint.server_url.scheme() != "https" {
            return Err(ProviderError::InsecureEndpoint(
                endpoint.server_url.to_string(),
            ));
        }

        match self.request_association(endpoint, AssocType::HmacSha256)? {
            AssociateOutcome::Established(assoc) => Ok(assoc),
            AssociateOutcome::UnsupportedType => {
                warn!(server_url = %endpoint.server_url, "provider declined HMAC-SHA256, retrying with HMAC-SHA1");
                match self.request_association(endpoint, AssocType::HmacSha1)? {
                    AssociateOutcome::Established(assoc) => Ok(assoc),
                    AssociateOutcome::UnsupportedType => Err(ProviderError::Rejected(
                        "no mutually supported association type".into(),
                    )),
                }
            }
        }
    }
}

/// Cap `s` at `max` bytes without slicing through a multibyte
/// character: the cut point walks back to the nearest char boundary.
fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    let mut cut = s.len().min(max);
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

/// Parse an OpenID key-value form body: one `key:value` pair per line.
pub fn parse_kv_form(body: &str) -> Vec<(String, String)> {
    body.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Extract a provider endpoint from HTML `<link>` tags: the
/// `openid2.provider`/`openid2.local_id` pair (2.0), falling back to
/// `openid.server`/`openid.delegate` (1.1). Deliberately minimal; full
/// Yadis/XRDS resolution is out of scope.
pub fn endpoint_from_html(html: &str) -> Option<ProviderEndpoint> {
    if let Some(server) = link_href_for_rel(html, "openid2.provider") {
        let server_url = Url::parse(&server).ok()?;
        return Some(ProviderEndpoint {
            server_url,
            version: ProtocolVersion::V2_0,
            local_id: link_href_for_rel(html, "openid2.local_id"),
        });
    }
    if let Some(server) = link_href_for_rel(html, "openid.server") {
        let server_url = Url::parse(&server).ok()?;
        return Some(ProviderEndpoint {
            server_url,
            version: ProtocolVersion::V1_1,
            local_id: link_href_for_rel(html, "openid.delegate"),
        });
    }
    None
}

/// Find the `href` of the first `<link>` tag whose `rel` list contains
/// `rel`. Tolerates attribute order, quoting style and case.
fn link_href_for_rel(html: &str, rel: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(start) = lower[search_from..].find("<link") {
        let start = search_from + start;
        let end = lower[start..].find('>').map(|e| start + e)?;
        let tag = &html[start..end];
        search_from = end;

        let Some(rels) = attr_value(tag, "rel") else {
            continue;
        };
        if rels
            .split_ascii_whitespace()
            .any(|r| r.eq_ignore_ascii_case(rel))
        {
            return attr_value(tag, "href");
        }
    }
    None
}

/// Pull a quoted attribute value out of a single tag's text.
fn attr_value(tag: &str, name: &str) -> Option<String> {
    let lower = tag.to_ascii_lowercase();
    let needle = format!("{name}=");
    let mut from = 0;
    while let Some(pos) = lower[from..].find(&needle) {
        let pos = from + pos;
        // Must be at a word boundary, not a suffix of another attribute.
        let at_boundary = pos == 0
            || !lower.as_bytes()[pos - 1].is_ascii_alphanumeric() && lower.as_bytes()[pos - 1] != b'.';
        from = pos + needle.len();
        if !at_boundary {
            continue;
        }
        let rest = &tag[pos + needle.len()..];
        let mut chars = rest.chars();
        return match chars.next() {
            Some(quote @ ('"' | '\'')) => {
                let rest = &rest[1..];
                rest.find(quote).map(|end| rest[..end].to_string())
            }
            Some(_) => {
                let end = rest
                    .find(|c: char| c.is_ascii_whitespace() || c == '>' || c == '/')
                    .unwrap_or(rest.len());
                Some(rest[..end].to_string())
            }
            None => None,
        };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kv_form() {
        let body = "assoc_handle:{HMAC}{abc}\nassoc_type:HMAC-SHA256\nexpires_in:14400\nmac_key:dGVzdA==\n";
        let fields = parse_kv_form(body);
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], ("assoc_handle".into(), "{HMAC}{abc}".into()));
        assert_eq!(fields[3], ("mac_key".into(), "dGVzdA==".into()));
    }

    #[test]
    fn test_parse_kv_form_value_may_contain_colons() {
        let fields = parse_kv_form("op_endpoint:https://op.example.net/auth\n");
        assert_eq!(
            fields,
            vec![("op_endpoint".into(), "https://op.example.net/auth".into())]
        );
    }

    #[test]
    fn test_parse_kv_form_skips_junk_lines() {
        let fields = parse_kv_form("no separator here\n:empty key\nok:1\n");
        assert_eq!(fields, vec![("ok".into(), "1".into())]);
    }

    #[test]
    fn test_discover_openid2_links() {
        let html = r#"<html><head>
            <link rel="openid2.provider" href="https://op.example.net/auth">
            <link rel="openid2.local_id" href="https://op.example.net/alice">
            </head><body></body></html>"#;
        let ep = endpoint_from_html(html).unwrap();
        assert_eq!(ep.server_url.as_str(), "https://op.example.net/auth");
        assert_eq!(ep.version, ProtocolVersion::V2_0);
        assert_eq!(ep.local_id.as_deref(), Some("https://op.example.net/alice"));
    }

    #[test]
    fn test_discover_openid1_fallback() {
        let html = r#"<link rel="openid.server" href="https://op.example.net/v1">
                      <link rel="openid.delegate" href="https://op.example.net/alice">"#;
        let ep = endpoint_from_html(html).unwrap();
        assert_eq!(ep.version, ProtocolVersion::V1_1);
        assert_eq!(ep.local_id.as_deref(), Some("https://op.example.net/alice"));
    }

    #[test]
    fn test_openid2_preferred_over_openid1() {
        let html = r#"<link rel="openid.server" href="https://op.example.net/v1">
                      <link rel="openid2.provider" href="https://op.example.net/v2">"#;
        let ep = endpoint_from_html(html).unwrap();
        assert_eq!(ep.server_url.as_str(), "https://op.example.net/v2");
        assert_eq!(ep.version, ProtocolVersion::V2_0);
    }

    #[test]
    fn test_discover_tolerates_attribute_order_and_quotes() {
        let html = "<LINK HREF='https://op.example.net/' REL='openid2.provider'/>";
        let ep = endpoint_from_html(html).unwrap();
        assert_eq!(ep.server_url.as_str(), "https://op.example.net/");
    }

    #[test]
    fn test_discover_rel_list_membership() {
        let html = r#"<link rel="stylesheet openid2.provider" href="https://op.example.net/">"#;
        assert!(endpoint_from_html(html).is_some());
    }

    #[test]
    fn test_rel_less_link_does_not_stop_scan() {
        let html = r#"<link href="/favicon.ico">
                      <link rel="openid2.provider" href="https://op.example.net/">"#;
        assert!(endpoint_from_html(html).is_some());
    }

    #[test]
    fn test_no_endpoint_in_plain_page() {
        assert!(endpoint_from_html("<html><body>hello</body></html>").is_none());
        assert!(endpoint_from_html("").is_none());
    }

    #[test]
    fn test_truncation_backs_off_to_char_boundary() {
        // 3 ASCII bytes then a 2-byte character; a cut at byte 4 lands
        // mid-character and must retreat to 3.
        let page = "aaaé<link rel=\"openid2.provider\" href=\"https://op.example.net/\">";
        assert_eq!(truncate_on_char_boundary(page, 4), "aaa");
        assert_eq!(truncate_on_char_boundary(page, 5), "aaaé");
        assert_eq!(truncate_on_char_boundary(page, page.len() + 10), page);
        assert_eq!(truncate_on_char_boundary("é", 1), "");
    }

    #[test]
    fn test_version_delivery_choice() {
        assert!(ProtocolVersion::V1_1.should_send_redirect());
        assert!(!ProtocolVersion::V2_0.should_send_redirect());
    }
}
