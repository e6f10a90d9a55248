//! Content-addressed object store on local disk.
//!
//! Objects are keyed by their SHA-256 oid and laid out as
//! `<root>/<oid[0..2]>/<oid[2..4]>/<oid>`. Downloads are written to
//! `<root>/tmp` first and only renamed into place once the digest matches.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use axum::body::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::{OBJECT_TMP_DIR, OID_HEX_LEN};

/// A validated LFS object id (lowercase hex SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Oid(String);

impl Oid {
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == OID_HEX_LEN
            && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(raw.to_string()))
    }

    /// Extract the oid from a `.../objects/<oid>` request path.
    pub fn from_object_path(path: &str) -> Option<Self> {
        let mut segments = path.trim_end_matches('/').rsplit('/');
        let oid = segments.next()?;
        match segments.next() {
            Some("objects") => Self::parse(oid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("upstream body error: {0}")]
    Body(String),

    #[error("digest mismatch for {expected}: got {actual}")]
    DigestMismatch { expected: Oid, actual: String },
}

/// On-disk object store rooted at the cache directory
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open the store, creating the directory layout if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(OBJECT_TMP_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        let oid = oid.as_str();
        self.root.join(&oid[0..2]).join(&oid[2..4]).join(oid)
    }

    pub async fn contains(&self, oid: &Oid) -> bool {
        fs::try_exists(self.object_path(oid)).await.unwrap_or(false)
    }

    /// Write a body stream into the store, verifying it hashes to `oid`.
    ///
    /// Returns the final object path. Nothing is left behind on failure.
    pub async fn insert<S, E>(&self, oid: &Oid, body: S) -> Result<PathBuf, StoreError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let tmp_path = self
            .root
            .join(OBJECT_TMP_DIR)
            .join(format!("{}-{}", oid, Uuid::new_v4()));

        let result = self.write_verified(oid, &tmp_path, body).await;
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        result
    }

    async fn write_verified<S, E>(
        &self,
        oid: &Oid,
        tmp_path: &Path,
        body: S,
    ) -> Result<PathBuf, StoreError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let mut body = std::pin::pin!(body);
        let mut file = fs::File::create(tmp_path).await?;
        let mut hasher = Sha256::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| StoreError::Body(e.to_string()))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);

        let actual = format!("{:x}", hasher.finalize());
        if actual != oid.as_str() {
            return Err(StoreError::DigestMismatch {
                expected: oid.clone(),
                actual,
            });
        }

        let path = self.object_path(oid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(tmp_path, &path).await?;

        Ok(path)
    }
}
