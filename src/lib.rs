//! OpenID 1.1/2.0 relying-party engine.
//!
//! Implements the consumer side of the association-based (smart mode)
//! OpenID handshake: identifier normalization, provider discovery,
//! association negotiation and storage, signed return URLs, response
//! signature verification and nonce-based replay protection.
//!
//! The engine is stateless across requests. [`ConsumerEngine::begin`]
//! builds the authentication request and hands control to the user
//! agent; [`ConsumerEngine::complete`] reconstructs and verifies the
//! handshake from the callback URL plus the persistent stores.
//!
//! Hosting applications supply their environment through the traits in
//! [`context`] (clock, randomness, secret material, user lookup) and
//! [`store`] (associations, nonces, request tokens); in-memory and
//! file-backed store implementations ship with the crate.
//!
//! ```no_run
//! use std::sync::Arc;
//! use openid_rp::consumer::{ConsumerConfig, ConsumerEngine};
//! use openid_rp::context::{ConsumerContext, OsRandom, StaticSecret, SystemClock};
//! use openid_rp::provider::HttpProviderClient;
//! use openid_rp::store::MemoryStore;
//! # use openid_rp::context::{AccountRecord, IdentityLookup};
//! # struct Users;
//! # impl IdentityLookup for Users {
//! #     fn find_identifier_alias_candidates(&self, _: &str) -> Vec<String> { Vec::new() }
//! #     fn find_account_by_identifier(&self, _: &str) -> Option<AccountRecord> { None }
//! # }
//!
//! let clock = Arc::new(SystemClock);
//! let store = Arc::new(MemoryStore::new(clock.clone()));
//! let ctx = ConsumerContext {
//!     clock: clock.clone(),
//!     random: Arc::new(OsRandom),
//!     secrets: Arc::new(StaticSecret::new(b"site-secret".to_vec())),
//!     lookup: Arc::new(Users),
//!     associations: store.clone(),
//!     nonces: store.clone(),
//!     tokens: store,
//! };
//! let config = ConsumerConfig {
//!     realm: "https://rp.example.org/".parse().unwrap(),
//!     return_endpoint: "https://rp.example.org/login".parse().unwrap(),
//! };
//! let provider = Arc::new(HttpProviderClient::new(clock).unwrap());
//! let engine = ConsumerEngine::new(ctx, config, provider);
//! let instruction = engine.begin("https://example.com/alice/", "https://rp.example.org/", None);
//! ```

pub mod association;
pub mod consumer;
pub mod context;
pub mod discovery;
pub mod error;
pub mod provider;
pub mod return_url;
pub mod signer;
pub mod store;

pub use association::{AssocType, Association};
pub use consumer::{
    AuthenticationResponse, BeginInstruction, ChainDecision, ConsumerConfig, ConsumerEngine,
    SuccessResponse,
};
pub use context::ConsumerContext;
pub use discovery::NormalizedIdentifier;
pub use error::{BeginError, DiscoveryError, FailureKind, ProviderError, StoreError};
pub use provider::{HttpProviderClient, ProtocolVersion, ProviderClient, ProviderEndpoint};
pub use return_url::{ReturnContext, ReturnUrlCodec};
pub use signer::ParamSigner;
pub use store::{
    AssociationStore, FileStore, MemoryStore, NonceOutcome, NonceStore, RequestTokenStore,
};
