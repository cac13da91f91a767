use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idgate_core::ObjectLocation;
use hmac::{Hmac, Mac};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;
use thiserror::Error;
use tokio_rusqlite::Connection;
use url::Url;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::providers::{ObjectStorage, ProviderError};

const NONCE_LEN: usize = 12;

/// Everything outside the RFC 3986 unreserved set.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("object encryption failed")]
    EncryptionFailed,
    #[error("object decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid object blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
    #[error("no object at {0}")]
    NotFound(String),
    #[error("malformed object URL: {0}")]
    BadUrl(String),
    #[error("object URL expired")]
    Expired,
    #[error("object URL signature mismatch")]
    BadSignature,
    #[error("URL signing key rejected: {0}")]
    SigningKey(String),
}

/// A stored object, decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub location: ObjectLocation,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub created_at: String,
}

/// SQLite-backed object storage with AES-256-GCM encryption at rest.
///
/// Blobs are encrypted before storage and decrypted on retrieval. A
/// per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600). The same key signs retrieval URLs, so a URL
/// minted by one installation is useless against another.
#[derive(Clone)]
pub struct SqliteObjectStore {
    conn: Connection,
    enc_key: [u8; 32],
    base_url: Url,
}

impl SqliteObjectStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, base_url: &str) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| StoreError::BadUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::BadUrl(base_url.to_string()));
        }

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/idgate"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS objects (
                     bucket TEXT NOT NULL,
                     key TEXT NOT NULL,
                     content_type TEXT NOT NULL,
                     size INTEGER NOT NULL,
                     blob BLOB NOT NULL,
                     created_at TEXT NOT NULL,
                     PRIMARY KEY (bucket, key)
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            enc_key,
            base_url,
        })
    }

    /// Insert or replace the object at `location`.
    pub async fn put_object(
        &self,
        location: &ObjectLocation,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StoreError> {
        let blob = self.encrypt_blob(bytes)?;
        let size = bytes.len() as i64;
        let created_at = Utc::now().to_rfc3339();
        let bucket = location.bucket.clone();
        let key = location.key.clone();
        let content_type = content_type.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO objects (bucket, key, content_type, size, blob, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![bucket, key, content_type, size, blob, created_at],
                )?;
                Ok(())
            })
            .await?;

        tracing::debug!(%location, size, "object stored");
        Ok(())
    }

    pub async fn get_object(&self, location: &ObjectLocation) -> Result<StoredObject, StoreError> {
        let bucket = location.bucket.clone();
        let key = location.key.clone();

        // Fetch the raw row; decrypt outside the blocking closure
        let row: Option<(String, Vec<u8>, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT content_type, blob, created_at FROM objects
                     WHERE bucket = ?1 AND key = ?2",
                )?;
                let mut rows = stmt.query_map([&bucket, &key], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                let first = rows.next().transpose()?;
                Ok(first)
            })
            .await?;

        let (content_type, blob, created_at) =
            row.ok_or_else(|| StoreError::NotFound(location.to_string()))?;
        Ok(StoredObject {
            location: location.clone(),
            content_type,
            bytes: self.decrypt_blob(&blob)?,
            created_at,
        })
    }

    /// Returns whether anything was removed.
    pub async fn delete_object(&self, location: &ObjectLocation) -> Result<bool, StoreError> {
        let bucket = location.bucket.clone();
        let key = location.key.clone();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM objects WHERE bucket = ?1 AND key = ?2",
                    [&bucket, &key],
                )?;
                Ok(n)
            })
            .await?;
        tracing::debug!(%location, removed, "object deleted");
        Ok(removed > 0)
    }

    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── URLs ──────────────────────────────────────────────────────────────────

    pub fn object_url(&self, location: &ObjectLocation) -> String {
        self.location_url(location).to_string()
    }

    /// `<base>/<bucket>/<key>?expires=<unix>&sig=<hex>`, valid until `now + ttl`.
    pub fn signed_url(
        &self,
        location: &ObjectLocation,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let expires = now.timestamp() + ttl.as_secs() as i64;
        let sig = self.mac(location, expires)?.finalize().into_bytes();

        let mut url = self.location_url(location);
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("sig", &hex::encode(sig));
        Ok(url.to_string())
    }

    /// Check a URL minted by [`signed_url`](Self::signed_url) and return the
    /// object it points at.
    pub async fn fetch_signed(&self, url: &str, now: DateTime<Utc>) -> Result<StoredObject, StoreError> {
        let (location, expires, sig) = self.parse_signed(url)?;
        let mac = self.mac(&location, expires)?;
        let verified = hex::decode(sig)
            .map(|sig| mac.verify_slice(&sig).is_ok())
            .unwrap_or(false);
        if !verified {
            tracing::warn!(%location, "rejected object URL with bad signature");
            return Err(StoreError::BadSignature);
        }
        if now.timestamp() > expires {
            return Err(StoreError::Expired);
        }
        self.get_object(&location).await
    }

    /// Bucket and key segments are percent-encoded one by one, so a `/`
    /// inside the key is the only thing that turns into a path separator.
    fn location_url(&self, location: &ObjectLocation) -> Url {
        let mut path = self.base_url.path().trim_end_matches('/').to_string();
        for segment in std::iter::once(location.bucket.as_str()).chain(location.key.split('/')) {
            path.push('/');
            path.extend(utf8_percent_encode(segment, PATH_SEGMENT));
        }

        let mut url = self.base_url.clone();
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);
        url
    }

    fn parse_signed(&self, url: &str) -> Result<(ObjectLocation, i64, String), StoreError> {
        let bad = || StoreError::BadUrl(url.to_string());
        let parsed = Url::parse(url).map_err(|_| bad())?;
        if parsed.scheme() != self.base_url.scheme()
            || parsed.host() != self.base_url.host()
            || parsed.port_or_known_default() != self.base_url.port_or_known_default()
        {
            return Err(bad());
        }

        let mut segments = parsed.path_segments().ok_or_else(bad)?;
        let base = self
            .base_url
            .path_segments()
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty());
        for expected in base {
            if segments.next() != Some(expected) {
                return Err(bad());
            }
        }
        let bucket = segments.next().and_then(decode_segment).ok_or_else(bad)?;
        let key = segments
            .map(decode_segment)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(bad)?
            .join("/");
        if bucket.is_empty() || key.is_empty() {
            return Err(bad());
        }

        let mut expires = None;
        let mut sig = None;
        for (name, value) in parsed.query_pairs() {
            let slot = match &*name {
                "expires" => &mut expires,
                "sig" => &mut sig,
                _ => continue,
            };
            // A repeated parameter is ambiguous about which value was signed.
            if slot.replace(value.into_owned()).is_some() {
                return Err(bad());
            }
        }
        let expires = expires
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(bad)?;
        let sig = sig.ok_or_else(bad)?;
        Ok((ObjectLocation::new(bucket, key), expires, sig))
    }

    fn mac(&self, location: &ObjectLocation, expires: i64) -> Result<HmacSha256, StoreError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.enc_key)
            .map_err(|e| StoreError::SigningKey(e.to_string()))?;
        mac.update(location.bucket.as_bytes());
        mac.update(b"\n");
        mac.update(location.key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_blob(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_blob(&self, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)
    }
}

#[async_trait]
impl ObjectStorage for SqliteObjectStore {
    async fn put(
        &self,
        location: &ObjectLocation,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ProviderError> {
        self.put_object(location, &bytes, content_type)
            .await
            .map_err(|e| ProviderError::Storage(e.to_string()))
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<(), ProviderError> {
        self.delete_object(location)
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::Storage(e.to_string()))
    }

    async fn retrieval_url(&self, location: &ObjectLocation, ttl: Duration) -> Result<String, ProviderError> {
        self.signed_url(location, ttl, Utc::now())
            .map_err(|e| ProviderError::Storage(e.to_string()))
    }

    fn public_url(&self, location: &ObjectLocation) -> String {
        self.object_url(location)
    }
}

fn decode_segment(segment: &str) -> Option<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}
