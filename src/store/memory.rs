//! In-process store backend.
//!
//! Rows live behind `RwLock`ed maps; the nonce gate is a single insert
//! under the write lock, which is exactly the atomic unique insert the
//! replay property needs inside one process. Hosts that run several
//! processes against shared state want [`super::FileStore`] instead.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::association::Association;
use crate::context::Clock;
use crate::error::StoreError;
use crate::store::{
    AssociationStore, NonceOutcome, NonceStore, RequestTokenStore, NONCE_SKEW_SECS,
    NONCE_STORAGE_TIME_SECS, REQUEST_TOKEN_LIFETIME_SECS,
};

struct AssocRow {
    /// Versioned envelope, decoded lazily so stale unknown-version
    /// rows read as absent instead of failing the lookup.
    content: Vec<u8>,
    expires_at: i64,
    tstamp: i64,
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    associations: RwLock<HashMap<(String, String), AssocRow>>,
    nonces: RwLock<HashMap<(String, i64, String), i64>>,
    tokens: RwLock<HashMap<String, (Vec<u8>, i64)>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            associations: RwLock::new(HashMap::new()),
            nonces: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_ts()
    }
}

impl AssociationStore for MemoryStore {
    fn store(&self, server_url: &str, association: &Association) -> Result<(), StoreError> {
        let now = self.now();
        let mut rows = self
            .associations
            .write()
            .map_err(|_| StoreError::Backend("association lock poisoned".into()))?;
        // Upsert keyed strictly on (server_url, handle); a concurrent
        // insert of the same pair just overwrites with identical
        // content.
        rows.insert(
            (server_url.to_string(), association.handle.clone()),
            AssocRow {
                content: association.encode(),
                expires_at: association.expires_at(),
                tstamp: now,
            },
        );
        Ok(())
    }

    fn get_association(
        &self,
        server_url: &str,
        handle: Option<&str>,
    ) -> Result<Option<Association>, StoreError> {
        self.cleanup_associations()?;
        let now = self.now();
        let mut rows = self
            .associations
            .write()
            .map_err(|_| StoreError::Backend("association lock poisoned".into()))?;

        let key = match handle {
            Some(handle) => {
                let key = (server_url.to_string(), handle.to_string());
                rows.contains_key(&key).then_some(key)
            }
            None => rows
                .iter()
                .filter(|((url, _), row)| url == server_url && row.expires_at > now)
                .max_by_key(|(_, row)| row.tstamp)
                .map(|(key, _)| key.clone()),
        };

        let Some(key) = key else {
            return Ok(None);
        };
        let Some(row) = rows.get_mut(&key) else {
            return Ok(None);
        };
        if row.expires_at <= now {
            return Ok(None);
        }
        let Some(association) = Association::decode(&row.content) else {
            return Ok(None);
        };
        row.tstamp = now;
        Ok(Some(association))
    }

    fn remove_association(&self, server_url: &str, handle: &str) -> Result<bool, StoreError> {
        let mut rows = self
            .associations
            .write()
            .map_err(|_| StoreError::Backend("association lock poisoned".into()))?;
        Ok(rows
            .remove(&(server_url.to_string(), handle.to_string()))
            .is_some())
    }

    fn cleanup_associations(&self) -> Result<usize, StoreError> {
        let now = self.now();
        let mut rows = self
            .associations
            .write()
            .map_err(|_| StoreError::Backend("association lock poisoned".into()))?;
        let before = rows.len();
        rows.retain(|_, row| row.expires_at > now);
        Ok(before - rows.len())
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.associations
            .write()
            .map_err(|_| StoreError::Backend("association lock poisoned".into()))?
            .clear();
        Ok(())
    }
}

impl NonceStore for MemoryStore {
    fn use_nonce(&self, server_url: &str, timestamp: i64, salt: &str) -> NonceOutcome {
        let now = self.now();
        if (timestamp - now).abs() >= NONCE_SKEW_SECS {
            return NonceOutcome::OutsideWindow;
        }
        let Ok(mut rows) = self.nonces.write() else {
            return NonceOutcome::Unavailable;
        };
        let key = (server_url.to_string(), timestamp, salt.to_string());
        if rows.contains_key(&key) {
            return NonceOutcome::Duplicate;
        }
        rows.insert(key, now);
        NonceOutcome::Accepted
    }

    fn cleanup_nonces(&self) -> Result<usize, StoreError> {
        let cutoff = self.now() - NONCE_STORAGE_TIME_SECS;
        let mut rows = self
            .nonces
            .write()
            .map_err(|_| StoreError::Backend("nonce lock poisoned".into()))?;
        let before = rows.len();
        rows.retain(|_, created_at| *created_at >= cutoff);
        Ok(before - rows.len())
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.nonces
            .write()
            .map_err(|_| StoreError::Backend("nonce lock poisoned".into()))?
            .clear();
        Ok(())
    }
}

impl RequestTokenStore for MemoryStore {
    fn store_token(&self, token_id: &str, payload: &[u8]) -> Result<(), StoreError> {
        let now = self.now();
        let cutoff = now - REQUEST_TOKEN_LIFETIME_SECS;
        let mut rows = self
            .tokens
            .write()
            .map_err(|_| StoreError::Backend("token lock poisoned".into()))?;
        rows.retain(|_, (_, created_at)| *created_at >= cutoff);
        rows.insert(token_id.to_string(), (payload.to_vec(), now));
        Ok(())
    }

    fn take_token(&self, token_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cutoff = self.now() - REQUEST_TOKEN_LIFETIME_SECS;
        let mut rows = self
            .tokens
            .write()
            .map_err(|_| StoreError::Backend("token lock poisoned".into()))?;
        rows.retain(|_, (_, created_at)| *created_at >= cutoff);
        Ok(rows.remove(token_id).map(|(payload, _)| payload))
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.tokens
            .write()
            .map_err(|_| StoreError::Backend("token lock poisoned".into()))?
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::AssocType;
    use crate::context::FixedClock;

    const NOW: i64 = 1_700_000_000;
    const SERVER: &str = "https://op.example.net/";

    fn store_at(now: i64) -> (MemoryStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(now));
        (MemoryStore::new(clock.clone()), clock)
    }

    fn assoc(handle: &str, issued: i64, lifetime: i64) -> Association {
        Association {
            handle: handle.into(),
            secret: b"mac-key-material-abc".to_vec(),
            issued,
            lifetime,
            assoc_type: AssocType::HmacSha256,
        }
    }

    #[test]
    fn test_store_and_get_by_handle() {
        let (store, _) = store_at(NOW);
        store.store(SERVER, &assoc("h1", NOW, 3600)).unwrap();
        let got = store.get_association(SERVER, Some("h1")).unwrap().unwrap();
        assert_eq!(got.handle, "h1");
    }

    #[test]
    fn test_get_without_handle_prefers_most_recently_touched() {
        let (store, clock) = store_at(NOW);
        store.store(SERVER, &assoc("first", NOW, 3600)).unwrap();
        clock.advance(10);
        store.store(SERVER, &assoc("second", NOW, 3600)).unwrap();
        let got = store.get_association(SERVER, None).unwrap().unwrap();
        assert_eq!(got.handle, "second");

        // Touching "first" bumps its tstamp past "second".
        clock.advance(10);
        store.get_association(SERVER, Some("first")).unwrap();
        let got = store.get_association(SERVER, None).unwrap().unwrap();
        assert_eq!(got.handle, "first");
    }

    #[test]
    fn test_touch_does_not_extend_expiry() {
        let (store, clock) = store_at(NOW);
        store.store(SERVER, &assoc("h1", NOW, 300)).unwrap();
        store.get_association(SERVER, Some("h1")).unwrap();
        // expires_at = NOW + 300 - 120 = NOW + 180
        clock.set(NOW + 180);
        assert!(store.get_association(SERVER, Some("h1")).unwrap().is_none());
    }

    #[test]
    fn test_expired_association_invisible_even_with_explicit_handle() {
        let (store, _) = store_at(NOW);
        // lifetime 60 - safety interval 120 puts expiry in the past.
        store.store(SERVER, &assoc("stale", NOW, 60)).unwrap();
        assert!(store.get_association(SERVER, Some("stale")).unwrap().is_none());
    }

    #[test]
    fn test_idempotent_upsert_leaves_one_row() {
        let (store, _) = store_at(NOW);
        let a = assoc("h1", NOW, 3600);
        store.store(SERVER, &a).unwrap();
        store.store(SERVER, &a).unwrap();
        assert!(store.remove_association(SERVER, "h1").unwrap());
        assert!(!store.remove_association(SERVER, "h1").unwrap());
    }

    #[test]
    fn test_associations_scoped_by_server_url() {
        let (store, _) = store_at(NOW);
        store.store(SERVER, &assoc("h1", NOW, 3600)).unwrap();
        assert!(store
            .get_association("https://other.example.com/", Some("h1"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_cleanup_associations_counts_deletions() {
        let (store, _) = store_at(NOW);
        store.store(SERVER, &assoc("live", NOW, 3600)).unwrap();
        store.store(SERVER, &assoc("dead", NOW - 7200, 3600)).unwrap();
        assert_eq!(store.cleanup_associations().unwrap(), 1);
    }

    #[test]
    fn test_association_reset() {
        let (store, _) = store_at(NOW);
        store.store(SERVER, &assoc("h1", NOW, 3600)).unwrap();
        AssociationStore::reset(&store).unwrap();
        assert!(store.get_association(SERVER, Some("h1")).unwrap().is_none());
    }

    #[test]
    fn test_nonce_first_use_accepted_second_is_duplicate() {
        let (store, _) = store_at(NOW);
        assert_eq!(store.use_nonce(SERVER, NOW, "salt1"), NonceOutcome::Accepted);
        assert_eq!(store.use_nonce(SERVER, NOW, "salt1"), NonceOutcome::Duplicate);
    }

    #[test]
    fn test_nonce_distinct_triples_independent() {
        let (store, _) = store_at(NOW);
        assert_eq!(store.use_nonce(SERVER, NOW, "salt1"), NonceOutcome::Accepted);
        assert_eq!(store.use_nonce(SERVER, NOW, "salt2"), NonceOutcome::Accepted);
        assert_eq!(store.use_nonce(SERVER, NOW + 1, "salt1"), NonceOutcome::Accepted);
        assert_eq!(
            store.use_nonce("https://other.example.com/", NOW, "salt1"),
            NonceOutcome::Accepted
        );
    }

    #[test]
    fn test_nonce_outside_skew_rejected_without_storing() {
        let (store, _) = store_at(NOW);
        assert_eq!(
            store.use_nonce(SERVER, NOW - NONCE_SKEW_SECS, "old"),
            NonceOutcome::OutsideWindow
        );
        assert_eq!(
            store.use_nonce(SERVER, NOW + NONCE_SKEW_SECS, "future"),
            NonceOutcome::OutsideWindow
        );
        // Nothing was recorded, so a cleanup removes nothing.
        assert_eq!(store.cleanup_nonces().unwrap(), 0);
    }

    #[test]
    fn test_nonce_just_inside_skew_accepted() {
        let (store, _) = store_at(NOW);
        assert_eq!(
            store.use_nonce(SERVER, NOW - NONCE_SKEW_SECS + 1, "ok"),
            NonceOutcome::Accepted
        );
    }

    #[test]
    fn test_nonce_replay_under_concurrency() {
        use std::thread;
        let (store, _) = store_at(NOW);
        let store = Arc::new(store);
        let successes: usize = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = Arc::clone(&store);
                    scope.spawn(move || {
                        (store.use_nonce(SERVER, NOW, "contested") == NonceOutcome::Accepted)
                            as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(successes, 1);
    }

    #[test]
    fn test_cleanup_nonces_reclaims_old_rows() {
        let (store, clock) = store_at(NOW);
        assert_eq!(store.use_nonce(SERVER, NOW, "salt"), NonceOutcome::Accepted);
        assert_eq!(store.cleanup_nonces().unwrap(), 0);
        clock.advance(NONCE_STORAGE_TIME_SECS + 100);
        assert_eq!(store.cleanup_nonces().unwrap(), 1);
    }

    #[test]
    fn test_token_take_exactly_once() {
        let (store, _) = store_at(NOW);
        store.store_token("tok1", b"payload").unwrap();
        assert_eq!(store.take_token("tok1").unwrap().as_deref(), Some(&b"payload"[..]));
        assert!(store.take_token("tok1").unwrap().is_none());
    }

    #[test]
    fn test_token_unknown_id_is_none() {
        let (store, _) = store_at(NOW);
        assert!(store.take_token("missing").unwrap().is_none());
    }

    #[test]
    fn test_expired_token_purged_on_touch() {
        let (store, clock) = store_at(NOW);
        store.store_token("tok1", b"payload").unwrap();
        clock.advance(REQUEST_TOKEN_LIFETIME_SECS + 1);
        assert!(store.take_token("tok1").unwrap().is_none());
    }
}
