//! Persistent state behind the handshake: associations, nonces and
//! request-token carry-through.
//!
//! Two backends ship with the crate:
//! - [`memory::MemoryStore`] — in-process, for single-node hosts and
//!   tests
//! - [`file::FileStore`] — one row per file under a private directory,
//!   surviving process restarts
//!
//! The nonce gate is the only concurrency-sensitive correctness point
//! in the whole engine: implementations must make `use_nonce` an
//! atomic unique insert, never a check-then-insert.

pub mod file;
pub mod memory;

use crate::association::Association;
pub use crate::error::StoreError;

/// Nonces older than this are garbage and get reclaimed by cleanup.
/// Correctness does not depend on the sweep; the uniqueness constraint
/// carries it.
pub const NONCE_STORAGE_TIME_SECS: i64 = 864_000; // 10 days

/// Accepted clock skew between provider-stamped nonce timestamps and
/// our clock (the php-openid `Auth_OpenID_SKEW` default).
pub const NONCE_SKEW_SECS: i64 = 18_000; // 5 hours

/// Request tokens expire after this many seconds; expired rows are
/// purged opportunistically whenever the token store is touched.
pub const REQUEST_TOKEN_LIFETIME_SECS: i64 = 600; // 10 minutes

/// Shared-secret associations keyed by `(server_url, handle)`.
pub trait AssociationStore: Send + Sync {
    /// Upsert by `(server_url, handle)`. Two callers racing to insert
    /// the same pair both succeed: the content is identical by
    /// protocol construction, so the loser's insert is swallowed.
    fn store(&self, server_url: &str, association: &Association) -> Result<(), StoreError>;

    /// Look up a live association, purging expired rows first. With a
    /// handle: exact match. Without: the most recently touched live
    /// association for the server. A hit bumps the touch timestamp but
    /// never the expiry. Undecodable stored content reads as absent.
    fn get_association(
        &self,
        server_url: &str,
        handle: Option<&str>,
    ) -> Result<Option<Association>, StoreError>;

    /// True iff a row was deleted.
    fn remove_association(&self, server_url: &str, handle: &str) -> Result<bool, StoreError>;

    /// Delete every row with `expires_at <= now`. Returns the count.
    fn cleanup_associations(&self) -> Result<usize, StoreError>;

    /// Destroy all rows unconditionally.
    fn reset(&self) -> Result<(), StoreError>;
}

/// Verdict of the nonce gate. Only [`NonceOutcome::Accepted`] lets a
/// response through; the rejecting variants are kept apart because a
/// duplicate is an attack indicator while a skewed timestamp is
/// usually a misconfigured provider clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceOutcome {
    /// First use of this triple; atomically recorded.
    Accepted,
    /// Timestamp outside the skew window. Storage was not touched.
    OutsideWindow,
    /// The exact triple was already consumed.
    Duplicate,
    /// Storage failure; freshness could not be proven.
    Unavailable,
}

/// One-time-use nonces keyed by `(server_url, timestamp, salt)`.
pub trait NonceStore: Send + Sync {
    /// The replay gate. Rejects without touching storage when the
    /// timestamp is outside the skew window; otherwise accepts iff
    /// this exact triple was atomically recorded for the first time.
    /// Anything but [`NonceOutcome::Accepted`] means the response is
    /// not proven fresh and must not be accepted.
    fn use_nonce(&self, server_url: &str, timestamp: i64, salt: &str) -> NonceOutcome;

    /// Delete rows older than [`NONCE_STORAGE_TIME_SECS`].
    fn cleanup_nonces(&self) -> Result<usize, StoreError>;

    /// Destroy all rows unconditionally.
    fn reset(&self) -> Result<(), StoreError>;
}

/// Opaque caller state that must survive the provider round trip
/// without appearing in the redirect URL.
pub trait RequestTokenStore: Send + Sync {
    /// Persist `payload` under `token_id`, purging expired rows first.
    fn store_token(&self, token_id: &str, payload: &[u8]) -> Result<(), StoreError>;

    /// Fetch and delete in one step: a token id redeems exactly once.
    /// Expired and unknown ids read as `None`.
    fn take_token(&self, token_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Destroy all rows unconditionally.
    fn reset(&self) -> Result<(), StoreError>;
}

pub use file::FileStore;
pub use memory::MemoryStore;
