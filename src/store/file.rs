//! File-backed store: one row per file under a private base directory.
//!
//! Survives process restarts and is safe for several processes sharing
//! the same directory: the nonce gate relies on `create_new` (O_EXCL),
//! which the filesystem guarantees to succeed for exactly one creator.
//!
//! Layout: `<base>/assoc/<digest>`, `<base>/nonce/<digest>`,
//! `<base>/token/<id>`. Digest filenames keep arbitrary server URLs
//! and salts out of path handling.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::association::Association;
use crate::context::{hex_encode, Clock};
use crate::error::StoreError;
use crate::store::{
    AssociationStore, NonceOutcome, NonceStore, RequestTokenStore, NONCE_SKEW_SECS,
    NONCE_STORAGE_TIME_SECS, REQUEST_TOKEN_LIFETIME_SECS,
};

#[derive(Serialize, Deserialize)]
struct AssocRow {
    server_url: String,
    handle: String,
    content_b64: String,
    expires_at: i64,
    tstamp: i64,
}

#[derive(Serialize, Deserialize)]
struct NonceRow {
    server_url: String,
    timestamp: i64,
    salt: String,
    created_at: i64,
}

#[derive(Serialize, Deserialize)]
struct TokenRow {
    payload_b64: String,
    created_at: i64,
}

pub struct FileStore {
    base_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `base_dir`. The
    /// base directory is restricted to the owning user.
    pub fn open(base_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        for sub in ["assoc", "nonce", "token"] {
            fs::create_dir_all(base_dir.join(sub))?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&base_dir, fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self { base_dir, clock })
    }

    fn now(&self) -> i64 {
        self.clock.now_ts()
    }

    fn assoc_path(&self, server_url: &str, handle: &str) -> PathBuf {
        self.base_dir
            .join("assoc")
            .join(digest(&[server_url, handle]))
    }

    fn nonce_path(&self, server_url: &str, timestamp: i64, salt: &str) -> PathBuf {
        self.base_dir
            .join("nonce")
            .join(digest(&[server_url, &timestamp.to_string(), salt]))
    }

    fn token_path(&self, token_id: &str) -> PathBuf {
        // Token ids are engine-generated hex, but sanitize anyway so a
        // hostile id cannot traverse out of the directory.
        let safe: String = token_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.base_dir.join("token").join(safe)
    }

    fn write_row<T: Serialize>(&self, path: &Path, row: &T) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(row).map_err(|e| StoreError::Encoding(e.to_string()))?;
        let mut file = File::create(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    fn read_row<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Option<T> {
        let bytes = fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn for_each_row<T, F>(&self, sub: &str, mut f: F) -> Result<(), StoreError>
    where
        T: for<'de> Deserialize<'de>,
        F: FnMut(&Path, T),
    {
        for entry in fs::read_dir(self.base_dir.join(sub))? {
            let path = entry?.path();
            // Undecodable rows are skipped, not surfaced: a truncated
            // or stale-format file must not wedge every lookup.
            if let Some(row) = self.read_row::<T>(&path) {
                f(&path, row);
            }
        }
        Ok(())
    }

    fn clear_dir(&self, sub: &str) -> Result<(), StoreError> {
        for entry in fs::read_dir(self.base_dir.join(sub))? {
            let _ = fs::remove_file(entry?.path());
        }
        Ok(())
    }
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex_encode(&hasher.finalize())
}

impl AssociationStore for FileStore {
    fn store(&self, server_url: &str, association: &Association) -> Result<(), StoreError> {
        use base64::Engine;
        let row = AssocRow {
            server_url: server_url.to_string(),
            handle: association.handle.clone(),
            content_b64: base64::engine::general_purpose::STANDARD.encode(association.encode()),
            expires_at: association.expires_at(),
            tstamp: self.now(),
        };
        // Plain overwrite: the path is a function of (server_url,
        // handle), so racing writers land on the same row with
        // identical content.
        self.write_row(&self.assoc_path(server_url, &association.handle), &row)
    }

    fn get_association(
        &self,
        server_url: &str,
        handle: Option<&str>,
    ) -> Result<Option<Association>, StoreError> {
        self.cleanup_associations()?;
        let now = self.now();

        let found: Option<(PathBuf, AssocRow)> = match handle {
            Some(handle) => {
                let path = self.assoc_path(server_url, handle);
                self.read_row::<AssocRow>(&path).map(|row| (path, row))
            }
            None => {
                let mut best: Option<(PathBuf, AssocRow)> = None;
                self.for_each_row::<AssocRow, _>("assoc", |path, row| {
                    if row.server_url == server_url
                        && row.expires_at > now
                        && best.as_ref().map_or(true, |(_, b)| row.tstamp > b.tstamp)
                    {
                        best = Some((path.to_path_buf(), row));
                    }
                })?;
                best
            }
        };

        let Some((path, mut row)) = found else {
            return Ok(None);
        };
        if row.expires_at <= now {
            return Ok(None);
        }
        use base64::Engine;
        let Some(association) = base64::engine::general_purpose::STANDARD
            .decode(&row.content_b64)
            .ok()
            .and_then(|bytes| Association::decode(&bytes))
        else {
            return Ok(None);
        };
        row.tstamp = now;
        self.write_row(&path, &row)?;
        Ok(Some(association))
    }

    fn remove_association(&self, server_url: &str, handle: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.assoc_path(server_url, handle)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn cleanup_associations(&self) -> Result<usize, StoreError> {
        let now = self.now();
        let mut removed = 0;
        self.for_each_row::<AssocRow, _>("assoc", |path, row| {
            if row.expires_at <= now && fs::remove_file(path).is_ok() {
                removed += 1;
            }
        })?;
        Ok(removed)
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.clear_dir("assoc")
    }
}

impl NonceStore for FileStore {
    fn use_nonce(&self, server_url: &str, timestamp: i64, salt: &str) -> NonceOutcome {
        let now = self.now();
        if (timestamp - now).abs() >= NONCE_SKEW_SECS {
            return NonceOutcome::OutsideWindow;
        }
        let path = self.nonce_path(server_url, timestamp, salt);
        // create_new is the uniqueness constraint: exactly one caller
        // ever gets Ok for a given triple.
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return NonceOutcome::Duplicate;
            }
            Err(_) => return NonceOutcome::Unavailable,
        };
        let row = NonceRow {
            server_url: server_url.to_string(),
            timestamp,
            salt: salt.to_string(),
            created_at: now,
        };
        match serde_json::to_vec(&row) {
            Ok(bytes) if file.write_all(&bytes).is_ok() => NonceOutcome::Accepted,
            _ => NonceOutcome::Unavailable,
        }
    }

    fn cleanup_nonces(&self) -> Result<usize, StoreError> {
        let cutoff = self.now() - NONCE_STORAGE_TIME_SECS;
        let mut removed = 0;
        self.for_each_row::<NonceRow, _>("nonce", |path, row| {
            if row.created_at < cutoff && fs::remove_file(path).is_ok() {
                removed += 1;
            }
        })?;
        Ok(removed)
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.clear_dir("nonce")
    }
}

impl RequestTokenStore for FileStore {
    fn store_token(&self, token_id: &str, payload: &[u8]) -> Result<(), StoreError> {
        use base64::Engine;
        self.purge_expired_tokens()?;
        let row = TokenRow {
            payload_b64: base64::engine::general_purpose::STANDARD.encode(payload),
            created_at: self.now(),
        };
        self.write_row(&self.token_path(token_id), &row)
    }

    fn take_token(&self, token_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        use base64::Engine;
        self.purge_expired_tokens()?;
        let path = self.token_path(token_id);
        let Some(row) = self.read_row::<TokenRow>(&path) else {
            return Ok(None);
        };
        // Delete before handing the payload out; a second taker finds
        // nothing even if it raced the read.
        if fs::remove_file(&path).is_err() {
            return Ok(None);
        }
        Ok(base64::engine::general_purpose::STANDARD
            .decode(&row.payload_b64)
            .ok())
    }

    fn reset(&self) -> Result<(), StoreError> {
        self.clear_dir("token")
    }
}

impl FileStore {
    fn purge_expired_tokens(&self) -> Result<(), StoreError> {
        let cutoff = self.now() - REQUEST_TOKEN_LIFETIME_SECS;
        self.for_each_row::<TokenRow, _>("token", |path, row| {
            if row.created_at < cutoff {
                let _ = fs::remove_file(path);
            }
        })
    }
}
