//! Error types for the relying-party engine.
//!
//! Provider- and network-facing failures never cross the engine
//! boundary as `Err`: `ConsumerEngine::complete` folds them into an
//! `AuthenticationResponse` so the hosting application's auth chain
//! always receives a definite outcome.

use thiserror::Error;

/// Errors from identifier normalization and endpoint discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The supplied identifier is empty, or a bare handle with no
    /// stored alias to resolve it against.
    #[error("identifier is neither a stored alias nor a valid URL: {0:?}")]
    InvalidIdentifier(String),

    /// The normalized identifier does not parse as an absolute URL.
    #[error("identifier does not parse as a URL: {0}")]
    MalformedUrl(String),

    /// The identifier resolved but no usable provider endpoint was
    /// advertised at it.
    #[error("no OpenID provider endpoint found at {0}")]
    NoEndpoint(String),

    /// The identifier page could not be fetched.
    #[error("discovery fetch failed: {0}")]
    Fetch(String),
}

/// Errors from talking to the provider (association negotiation,
/// endpoint discovery transport).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Request timed out or the connection failed. Retryable.
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    /// Association negotiation requires a confidential channel; the
    /// endpoint is not https.
    #[error("refusing to negotiate an association over insecure endpoint {0}")]
    InsecureEndpoint(String),

    /// The provider answered but the response was not a usable
    /// key-value form or lacked required fields.
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    /// The provider rejected the association request.
    #[error("provider rejected association: {0}")]
    Rejected(String),
}

/// Errors from the persistent stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Why `begin()` could not hand control to the user agent.
#[derive(Debug, Error)]
pub enum BeginError {
    /// Identifier unresolvable. Recoverable: another auth mechanism
    /// may claim the login attempt.
    #[error("discovery failed: {0}")]
    DiscoveryFailed(#[from] DiscoveryError),

    /// The handshake could not be started (no association obtainable,
    /// malformed endpoint). Recoverable.
    #[error("could not construct authentication request: {0}")]
    RequestConstructionFailed(String),

    /// Persistence layer failure. Fatal for this handshake only.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Classification of a failed `complete()` call.
///
/// `SignatureMismatch` and `ReplayedNonce` are security events and
/// must never fall through to other authentication mechanisms; the
/// remaining kinds are ordinary fall-through failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// A transport or OpenID-level signature did not verify. Tampered
    /// or fabricated response; fail closed.
    SignatureMismatch,

    /// The response nonce was already consumed. Replay; fail closed.
    ReplayedNonce,

    /// The response nonce timestamp falls outside the skew window.
    /// Rejected, but typically a misconfigured provider clock rather
    /// than an attack.
    StaleNonce,

    /// The response references an association handle this consumer
    /// does not hold (unknown or expired). The caller may restart
    /// `begin()` from scratch.
    AssociationNotFound,

    /// Persistence layer failure while verifying.
    StoreUnavailable,

    /// The signed `return_to` does not match this consumer's callback
    /// endpoint.
    ReturnToMismatch,

    /// The response is structurally unusable (missing mode, undecodable
    /// nonce, signed field absent from the parameter set).
    MalformedResponse(String),

    /// The provider reported an error mode with the given message.
    ProviderReported(String),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::SignatureMismatch => write!(f, "signature mismatch"),
            FailureKind::ReplayedNonce => write!(f, "replayed nonce"),
            FailureKind::StaleNonce => write!(f, "nonce outside acceptance window"),
            FailureKind::AssociationNotFound => write!(f, "association not found"),
            FailureKind::StoreUnavailable => write!(f, "store unavailable"),
            FailureKind::ReturnToMismatch => write!(f, "return_to mismatch"),
            FailureKind::MalformedResponse(why) => write!(f, "malformed response: {why}"),
            FailureKind::ProviderReported(msg) => write!(f, "provider error: {msg}"),
        }
    }
}

impl FailureKind {
    /// True for failure kinds that indicate an attack rather than an
    /// ordinary protocol breakdown.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            FailureKind::SignatureMismatch | FailureKind::ReplayedNonce
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_event_classification() {
        assert!(FailureKind::SignatureMismatch.is_security_event());
        assert!(FailureKind::ReplayedNonce.is_security_event());
        assert!(!FailureKind::StaleNonce.is_security_event());
        assert!(!FailureKind::AssociationNotFound.is_security_event());
        assert!(!FailureKind::StoreUnavailable.is_security_event());
        assert!(!FailureKind::MalformedResponse("x".into()).is_security_event());
    }

    #[test]
    fn test_begin_error_from_discovery() {
        let err: BeginError = DiscoveryError::InvalidIdentifier("bob".into()).into();
        assert!(matches!(err, BeginError::DiscoveryFailed(_)));
        assert!(err.to_string().contains("bob"));
    }
}
