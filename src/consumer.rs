//! The consumer engine: begin/complete orchestration.
//!
//! Each call is a fresh, stateless invocation; everything the engine
//! needs between the two HTTP round trips lives either in the signed
//! return URL or in the persistent stores. `begin` hands control to
//! the user agent (redirect or auto-submitting form) and `complete`
//! reconstructs the handshake from the callback URL.
//!
//! Verification order in `complete` is load-bearing: the transport
//! signatures over the carried fields are checked before anything else
//! touches a store, so a fabricated callback costs no nonce and no
//! association lookup.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use tracing::{debug, info, warn};
use url::Url;

use crate::association::{kv_signing_form, Association};
use crate::context::{AccountRecord, ConsumerContext};
use crate::discovery::{self, NormalizedIdentifier};
use crate::error::{BeginError, FailureKind};
use crate::provider::{ProtocolVersion, ProviderClient, ProviderEndpoint, OPENID2_NS};
use crate::return_url::ReturnUrlCodec;
use crate::signer::ParamSigner;
use crate::store::NonceOutcome;

/// Hex length of a minted request-token id.
const TOKEN_ID_HEX_LEN: usize = 24;

/// RFC 3339 `YYYY-MM-DDTHH:MM:SSZ` prefix length of a response nonce.
const NONCE_TIMESTAMP_LEN: usize = 20;

/// Site-level configuration for the engine.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Trust realm presented to the provider (`openid.realm` /
    /// `openid.trust_root`).
    pub realm: Url,
    /// The callback endpoint all return URLs are built on. A signed
    /// `return_to` that does not match this endpoint is rejected.
    pub return_endpoint: Url,
}

/// How `begin` wants the authentication request delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginInstruction {
    /// Send an HTTP 303 to this URL. 303, not 302: the login form was
    /// POSTed, and the user agent must not replay that POST.
    Redirect { url: Url },
    /// Serve an auto-submitting POST form to the provider.
    Form {
        action: Url,
        fields: Vec<(String, String)>,
    },
}

impl BeginInstruction {
    /// Minimal self-submitting HTML document for the form variant.
    pub fn auto_submit_html(&self) -> Option<String> {
        let BeginInstruction::Form { action, fields } = self else {
            return None;
        };
        let mut html = String::from(
            "<!DOCTYPE html><html><body onload=\"document.forms[0].submit()\">\
             <form method=\"post\" accept-charset=\"UTF-8\" action=\"",
        );
        html.push_str(&escape_html(action.as_str()));
        html.push_str("\">");
        for (name, value) in fields {
            html.push_str("<input type=\"hidden\" name=\"");
            html.push_str(&escape_html(name));
            html.push_str("\" value=\"");
            html.push_str(&escape_html(value));
            html.push_str("\"/>");
        }
        html.push_str(
            "<noscript><input type=\"submit\" value=\"Continue\"/></noscript>\
             </form></body></html>",
        );
        Some(html)
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// A verified positive response from `complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessResponse {
    /// `claimed_id`, when it was in the provider's signed field list.
    pub signed_claimed_id: Option<String>,
    /// `identity`, when it was in the provider's signed field list.
    pub signed_identity: Option<String>,
    /// The claimed identifier carried in the return URL under our own
    /// transport signature.
    pub transport_claimed: String,
    /// Where the user agent was headed before authentication started.
    pub original_location: String,
    /// Continuation payload restored from the token store, if the
    /// handshake carried one. Single use.
    pub carry_through: Option<Vec<u8>>,
}

/// Outcome of `complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationResponse {
    Success(SuccessResponse),
    /// The user declined at the provider.
    Cancelled,
    Failure(FailureKind),
}

/// What the surrounding authentication chain should do with this
/// outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainDecision {
    /// Authenticated; stop the chain.
    Accept,
    /// Attack indicator; stop the chain without authenticating.
    Reject,
    /// Not ours to decide; let the next mechanism try.
    Defer,
}

impl AuthenticationResponse {
    /// The authenticated identifier, in precedence order: signed
    /// `claimed_id`, then signed `identity`, then the transport-signed
    /// claimed identifier from the return URL. `None` unless the
    /// response is a success.
    pub fn final_identifier(&self) -> Option<&str> {
        let AuthenticationResponse::Success(success) = self else {
            return None;
        };
        Some(
            success
                .signed_claimed_id
                .as_deref()
                .or(success.signed_identity.as_deref())
                .unwrap_or(&success.transport_claimed),
        )
    }

    /// Tri-state for composition into an ordered list of
    /// authentication mechanisms. Security failures reject outright;
    /// everything else defers so another mechanism may claim the login.
    pub fn chain_decision(&self) -> ChainDecision {
        match self {
            AuthenticationResponse::Success(_) => ChainDecision::Accept,
            AuthenticationResponse::Cancelled => ChainDecision::Defer,
            AuthenticationResponse::Failure(kind) if kind.is_security_event() => {
                ChainDecision::Reject
            }
            AuthenticationResponse::Failure(_) => ChainDecision::Defer,
        }
    }
}

/// Relying-party engine over injectable stores, clock, randomness and
/// provider transport.
pub struct ConsumerEngine {
    ctx: ConsumerContext,
    config: ConsumerConfig,
    provider: Arc<dyn ProviderClient>,
    codec: ReturnUrlCodec,
}

impl ConsumerEngine {
    pub fn new(
        ctx: ConsumerContext,
        config: ConsumerConfig,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        let codec = ReturnUrlCodec::new(ParamSigner::new(ctx.secrets.as_ref()));
        Self {
            ctx,
            config,
            provider,
            codec,
        }
    }

    /// Start a handshake: resolve the identifier, obtain an
    /// association, and build the request the user agent delivers to
    /// the provider. `original_location` is where the user should land
    /// after authentication; `carry_through` is opaque continuation
    /// state stored server-side and referenced by token id.
    ///
    /// On success, control belongs to the user agent. The caller must
    /// treat the instruction as terminal for the current request.
    pub fn begin(
        &self,
        raw_identifier: &str,
        original_location: &str,
        carry_through: Option<&[u8]>,
    ) -> Result<BeginInstruction, BeginError> {
        let claimed = discovery::normalize(raw_identifier, self.ctx.lookup.as_ref())?;
        let endpoint = self.provider.discover(claimed.as_str())?;

        let association = self.obtain_association(&endpoint)?;

        let token_id = match carry_through {
            Some(payload) => {
                let id = self.ctx.random.random_hex(TOKEN_ID_HEX_LEN);
                self.ctx.tokens.store_token(&id, payload)?;
                Some(id)
            }
            None => None,
        };

        let return_to = self.codec.build(
            &self.config.return_endpoint,
            claimed.as_str(),
            original_location,
            token_id.as_deref(),
        );

        let fields = self.request_fields(&claimed, &endpoint, &association, &return_to);

        info!(
            claimed = %claimed,
            server_url = %endpoint.server_url,
            version = ?endpoint.version,
            "authentication request constructed"
        );

        if endpoint.version.should_send_redirect() {
            let mut url = endpoint.server_url.clone();
            {
                let mut query = url.query_pairs_mut();
                for (name, value) in &fields {
                    query.append_pair(name, value);
                }
            }
            Ok(BeginInstruction::Redirect { url })
        } else {
            Ok(BeginInstruction::Form {
                action: endpoint.server_url.clone(),
                fields,
            })
        }
    }

    /// Reuse a live stored association or negotiate a fresh one.
    fn obtain_association(
        &self,
        endpoint: &ProviderEndpoint,
    ) -> Result<Association, BeginError> {
        let server_url = endpoint.server_url.as_str();
        if let Some(existing) = self.ctx.associations.get_association(server_url, None)? {
            debug!(server_url, handle = %existing.handle, "reusing stored association");
            return Ok(existing);
        }
        let fresh = self
            .provider
            .associate(endpoint)
            .map_err(|e| BeginError::RequestConstructionFailed(e.to_string()))?;
        self.ctx.associations.store(server_url, &fresh)?;
        debug!(server_url, handle = %fresh.handle, "negotiated new association");
        Ok(fresh)
    }

    fn request_fields(
        &self,
        claimed: &NormalizedIdentifier,
        endpoint: &ProviderEndpoint,
        association: &Association,
        return_to: &Url,
    ) -> Vec<(String, String)> {
        let identity = endpoint
            .local_id
            .clone()
            .unwrap_or_else(|| claimed.as_str().to_string());

        let mut fields: Vec<(String, String)> = Vec::with_capacity(8);
        match endpoint.version {
            ProtocolVersion::V2_0 => {
                fields.push(("openid.ns".into(), OPENID2_NS.into()));
                fields.push(("openid.mode".into(), "checkid_setup".into()));
                fields.push(("openid.claimed_id".into(), claimed.as_str().into()));
                fields.push(("openid.identity".into(), identity));
                fields.push(("openid.realm".into(), self.config.realm.to_string()));
            }
            ProtocolVersion::V1_1 => {
                fields.push(("openid.mode".into(), "checkid_setup".into()));
                fields.push(("openid.identity".into(), identity));
                fields.push(("openid.trust_root".into(), self.config.realm.to_string()));
            }
        }
        fields.push(("openid.assoc_handle".into(), association.handle.clone()));
        fields.push(("openid.return_to".into(), return_to.to_string()));
        fields
    }

    /// Verify a provider callback. The full URL, as received, including
    /// all provider-appended parameters.
    pub fn complete(&self, return_url: &Url) -> AuthenticationResponse {
        if !ReturnUrlCodec::is_finish_request(return_url) {
            return self.failure(FailureKind::MalformedResponse(
                "not a finish-mode callback".into(),
            ));
        }

        // Transport signatures first. Nothing below runs for a
        // fabricated callback.
        let Some(carried) = self.codec.parse_and_verify(return_url) else {
            return self.failure(FailureKind::SignatureMismatch);
        };

        let params = openid_params(return_url);

        match params.get("mode").map(String::as_str) {
            Some("id_res") => {}
            Some("cancel") => {
                debug!(claimed = %carried.claimed, "authentication cancelled at provider");
                return AuthenticationResponse::Cancelled;
            }
            Some("error") => {
                let message = params
                    .get("error")
                    .cloned()
                    .unwrap_or_else(|| "unspecified provider error".into());
                return self.failure(FailureKind::ProviderReported(message));
            }
            Some(other) => {
                return self.failure(FailureKind::MalformedResponse(format!(
                    "unexpected mode {other}"
                )))
            }
            None => {
                return self.failure(FailureKind::MalformedResponse("missing mode".into()))
            }
        }

        let Some(signed_list) = params.get("signed") else {
            return self.failure(FailureKind::MalformedResponse(
                "missing signed field list".into(),
            ));
        };
        let signed_fields: Vec<&str> = signed_list.split(',').map(str::trim).collect();
        let Some(sig) = params.get("sig") else {
            return self.failure(FailureKind::MalformedResponse("missing sig".into()));
        };
        let Some(handle) = params.get("assoc_handle") else {
            return self.failure(FailureKind::MalformedResponse(
                "missing assoc_handle".into(),
            ));
        };

        // The association is keyed by the provider's server URL. 2.0
        // responses name it; for older providers it is rediscovered
        // from the transport-signed claimed identifier.
        let server_url = match params.get("op_endpoint") {
            Some(op_endpoint) => op_endpoint.clone(),
            None => match self.provider.discover(&carried.claimed) {
                Ok(endpoint) => endpoint.server_url.to_string(),
                Err(e) => {
                    debug!(claimed = %carried.claimed, error = %e, "endpoint rediscovery failed");
                    return self.failure(FailureKind::AssociationNotFound);
                }
            },
        };

        let association = match self.ctx.associations.get_association(&server_url, Some(handle)) {
            Ok(Some(association)) => association,
            Ok(None) => return self.failure(FailureKind::AssociationNotFound),
            Err(e) => {
                warn!(error = %e, "association store unavailable during complete");
                return self.failure(FailureKind::StoreUnavailable);
            }
        };

        let Some(message) =
            kv_signing_form(&signed_fields, |f| params.get(f).map(String::as_str))
        else {
            return self.failure(FailureKind::MalformedResponse(
                "signed field absent from response".into(),
            ));
        };
        if !association.verify_kv(&message, sig) {
            return self.failure(FailureKind::SignatureMismatch);
        }

        // From here on the parameters are provider-authenticated.
        if let Some(return_to) = params.get("return_to") {
            if !self.return_to_matches(return_to) {
                return self.failure(FailureKind::ReturnToMismatch);
            }
        }

        let Some(nonce) = params.get("response_nonce") else {
            return self.failure(FailureKind::MalformedResponse(
                "missing response_nonce".into(),
            ));
        };
        let Some((timestamp, salt)) = decompose_nonce(nonce) else {
            return self.failure(FailureKind::MalformedResponse(
                "undecodable response_nonce".into(),
            ));
        };
        match self.ctx.nonces.use_nonce(&server_url, timestamp, salt) {
            NonceOutcome::Accepted => {}
            NonceOutcome::Duplicate => return self.failure(FailureKind::ReplayedNonce),
            NonceOutcome::OutsideWindow => return self.failure(FailureKind::StaleNonce),
            NonceOutcome::Unavailable => return self.failure(FailureKind::StoreUnavailable),
        }

        // Identity claims are only trusted from signed parameters.
        let signed_value = |field: &str| {
            signed_fields
                .contains(&field)
                .then(|| params.get(field).cloned())
                .flatten()
        };
        let signed_claimed_id = signed_value("claimed_id");
        let signed_identity = signed_value("identity");

        let carry_through = carried.token_id.as_deref().and_then(|token_id| {
            match self.ctx.tokens.take_token(token_id) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "request token store unavailable");
                    None
                }
            }
        });

        let response = AuthenticationResponse::Success(SuccessResponse {
            signed_claimed_id,
            signed_identity,
            transport_claimed: carried.claimed,
            original_location: carried.location,
            carry_through,
        });
        info!(
            identifier = response.final_identifier().unwrap_or_default(),
            "authentication response verified"
        );
        response
    }

    /// Map a verified response to the hosting application's account
    /// records, trying both trailing-slash forms of the identifier.
    pub fn resolve_account(&self, response: &AuthenticationResponse) -> Option<AccountRecord> {
        let identifier = response.final_identifier()?;
        discovery::equivalent_forms(identifier)
            .iter()
            .find_map(|form| self.ctx.lookup.find_account_by_identifier(form))
    }

    /// Verify a detached location/signature pair and return the bounce
    /// target for the post-authentication 303.
    pub fn bounce_target(&self, location: &str, signature: &str) -> Option<Url> {
        let target = self.codec.verify_bounce_target(location, signature);
        if target.is_none() {
            warn!("rejected bounce target with invalid signature");
        }
        target
    }

    fn return_to_matches(&self, return_to: &str) -> bool {
        let Ok(parsed) = Url::parse(return_to) else {
            return false;
        };
        let expected = &self.config.return_endpoint;
        parsed.scheme() == expected.scheme()
            && parsed.host_str() == expected.host_str()
            && parsed.port_or_known_default() == expected.port_or_known_default()
            && parsed.path() == expected.path()
    }

    fn failure(&self, kind: FailureKind) -> AuthenticationResponse {
        if kind.is_security_event() {
            warn!(failure = %kind, "rejected authentication response");
        } else {
            debug!(failure = %kind, "authentication response failed");
        }
        AuthenticationResponse::Failure(kind)
    }
}

/// Collect `openid.*` / `openid_*` query parameters, keyed by bare
/// field name. Hosting frameworks routinely rewrite the dotted form to
/// underscores, so both spellings are accepted; the dotted (original
/// wire) form wins when both are present.
fn openid_params(url: &Url) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (key, value) in url.query_pairs() {
        if let Some(field) = key.strip_prefix("openid_") {
            params.entry(field.to_string()).or_insert(value.into_owned());
        }
    }
    for (key, value) in url.query_pairs() {
        if let Some(field) = key.strip_prefix("openid.") {
            params.insert(field.to_string(), value.into_owned());
        }
    }
    params
}

/// Split a response nonce into its Unix timestamp and salt. The wire
/// form is an RFC 3339 UTC second (`2026-08-30T12:00:00Z`) followed by
/// provider salt.
fn decompose_nonce(nonce: &str) -> Option<(i64, &str)> {
    // The boundary check also rejects a multibyte character straddling
    // byte 20, which would otherwise panic the slice.
    if nonce.len() < NONCE_TIMESTAMP_LEN || !nonce.is_char_boundary(NONCE_TIMESTAMP_LEN) {
        return None;
    }
    let (stamp, salt) = nonce.split_at(NONCE_TIMESTAMP_LEN);
    let parsed = DateTime::parse_from_rfc3339(stamp).ok()?;
    Some((parsed.timestamp(), salt))
}
