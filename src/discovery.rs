//! Identifier normalization (OpenID 2.0 §7.2, the subset the engine
//! relies on).
//!
//! Every identifier is normalized before it is stored, compared or
//! sent on the wire. Providers may echo an identifier back with or
//! without a trailing slash, so equality checks always consider both
//! forms (see [`equivalent_forms`]).

use url::Url;

use crate::context::IdentityLookup;
use crate::error::DiscoveryError;

/// An identifier that went through [`normalize`]: an absolute http(s)
/// URL with a non-empty path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedIdentifier(String);

impl NormalizedIdentifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NormalizedIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<NormalizedIdentifier> for String {
    fn from(id: NormalizedIdentifier) -> Self {
        id.0
    }
}

/// The four URL variants a bare handle could have been registered
/// under. Hosts probe these against their user table to implement
/// [`IdentityLookup::find_identifier_alias_candidates`].
pub fn alias_probe_forms(bare: &str) -> [String; 4] {
    [
        format!("http://{bare}"),
        format!("http://{bare}/"),
        format!("https://{bare}"),
        format!("https://{bare}/"),
    ]
}

/// The normalized identifier plus its trailing-slash-stripped twin.
/// Stored identifiers may carry either form, so both must be checked
/// wherever equality matters.
pub fn equivalent_forms(normalized: &str) -> [String; 2] {
    [
        normalized.to_string(),
        normalized.trim_end_matches('/').to_string(),
    ]
}

/// True when the two identifiers differ at most by a trailing slash.
pub fn identifiers_match(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

/// Normalize a user-supplied identifier.
///
/// In order: strip everything from the first `#` onward; resolve bare
/// handles (no `http(s)://` scheme) through the host's alias lookup,
/// failing closed when no stored identifier matches; append `/` to a
/// bare authority so the result always has a path component.
pub fn normalize(
    identifier: &str,
    lookup: &dyn IdentityLookup,
) -> Result<NormalizedIdentifier, DiscoveryError> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return Err(DiscoveryError::InvalidIdentifier(String::new()));
    }

    let mut identifier = match identifier.find('#') {
        Some(pos) => &identifier[..pos],
        None => identifier,
    }
    .to_string();

    if !has_http_scheme(&identifier) {
        // A bare handle is a local alias for a previously registered
        // identifier. No scheme guessing: unknown handles fail.
        identifier = lookup
            .find_identifier_alias_candidates(&identifier)
            .into_iter()
            .next()
            .ok_or_else(|| DiscoveryError::InvalidIdentifier(identifier.clone()))?;
    }

    let parsed = Url::parse(&identifier)
        .map_err(|_| DiscoveryError::MalformedUrl(identifier.clone()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(DiscoveryError::MalformedUrl(identifier));
    }

    // scheme://host with no path gets a trailing slash.
    if is_bare_authority(&identifier) {
        identifier.push('/');
    }

    Ok(NormalizedIdentifier(identifier))
}

fn has_http_scheme(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn is_bare_authority(s: &str) -> bool {
    let rest = match s.split_once("://") {
        Some((_, rest)) => rest,
        None => return false,
    };
    !rest.is_empty() && !rest.contains('/')
}
