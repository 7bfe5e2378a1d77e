//! Injectable collaborators supplied by the hosting application.
//!
//! The engine holds no global state: clock, randomness, HMAC key
//! material, user lookup and the store handles all arrive through this
//! context at construction time, so every seam can be replaced by a
//! deterministic fake in tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::store::{AssociationStore, NonceStore, RequestTokenStore};

/// Wall-clock source for every `now()` reference in the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as Unix seconds.
    fn now_ts(&self) -> i64 {
        self.now().timestamp()
    }
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for deterministic tests.
#[derive(Debug)]
pub struct FixedClock(std::sync::atomic::AtomicI64);

impl FixedClock {
    pub fn new(ts: i64) -> Self {
        Self(std::sync::atomic::AtomicI64::new(ts))
    }

    pub fn set(&self, ts: i64) {
        self.0.store(ts, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.0.load(std::sync::atomic::Ordering::SeqCst), 0)
            .single()
            .unwrap_or_default()
    }
}

/// Cryptographically strong random generator for handles, token ids
/// and salts.
pub trait RandomSource: Send + Sync {
    /// Fill `buf` with random bytes.
    fn fill(&self, buf: &mut [u8]);

    /// `len` lowercase hex characters of randomness.
    fn random_hex(&self, len: usize) -> String {
        let mut bytes = vec![0u8; len.div_ceil(2)];
        self.fill(&mut bytes);
        let mut out = hex_encode(&bytes);
        out.truncate(len);
        out
    }
}

/// OS CSPRNG via `getrandom`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, buf: &mut [u8]) {
        // getrandom should never fail; a failure indicates a severely
        // broken system where generating predictable values would be
        // worse than aborting.
        getrandom::getrandom(buf).expect("OS random source unavailable");
    }
}

/// Lowercase hex encoding.
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Supplies the process-wide HMAC key material for transport-parameter
/// signing. Must be stable across requests and kept out of logs.
pub trait SecretProvider: Send + Sync {
    fn secret(&self) -> &[u8];
}

/// A secret held in memory, typically loaded from the host's
/// configuration at startup.
pub struct StaticSecret {
    key: Vec<u8>,
}

impl StaticSecret {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }
}

impl SecretProvider for StaticSecret {
    fn secret(&self) -> &[u8] {
        &self.key
    }
}

impl std::fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of Debug output.
        f.debug_struct("StaticSecret").finish_non_exhaustive()
    }
}

/// A user record as far as this engine cares: the account and the
/// identifier it was registered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub account_id: String,
    pub identifier: String,
}

/// User-record lookup implemented by the hosting application.
pub trait IdentityLookup: Send + Sync {
    /// Stored identifiers that could correspond to a bare handle, in
    /// preference order. Hosts typically probe the four variants from
    /// [`crate::discovery::alias_probe_forms`] against their user
    /// table. An empty result means the handle is unknown.
    fn find_identifier_alias_candidates(&self, bare: &str) -> Vec<String>;

    /// Account registered under the normalized identifier, if any.
    /// Implementations must compare against both the normalized form
    /// and the form without its trailing slash (see
    /// [`crate::discovery::equivalent_forms`]).
    fn find_account_by_identifier(&self, normalized: &str) -> Option<AccountRecord>;
}

/// Everything the engine needs from its environment, bundled.
#[derive(Clone)]
pub struct ConsumerContext {
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
    pub secrets: Arc<dyn SecretProvider>,
    pub lookup: Arc<dyn IdentityLookup>,
    pub associations: Arc<dyn AssociationStore>,
    pub nonces: Arc<dyn NonceStore>,
    pub tokens: Arc<dyn RequestTokenStore>,
}
