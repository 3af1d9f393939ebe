//! src/services/object_store.rs
//!
//! Object store adapter: binary payloads addressed by key. The [`ObjectStore`]
//! trait is what the transaction managers depend on; [`LocalObjectStore`] is the
//! on-disk implementation, sharded beneath
//! `base_path/{shard}/{shard}/users/{owner}/{file}`.

use crate::models::file_record::Locator;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{
    StreamExt,
    channel::mpsc::{self, UnboundedSender},
    stream::{self, BoxStream},
};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Source bytes of an upload.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Events of one resumable write; ends with `Complete` or an error.
pub type WriteStream = BoxStream<'static, ObjectStoreResult<WriteEvent>>;

pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEvent {
    Progress {
        bytes_transferred: u64,
        total_bytes: u64,
    },
    Complete {
        locator: Locator,
        bytes_written: u64,
        checksum: String,
    },
}

/// One payload found while listing a namespace.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub locator: Locator,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("write cancelled")]
    Cancelled,
    #[error("expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("write ended before the store acknowledged it")]
    Interrupted,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Binary object store.
///
/// A write only yields `Complete` once the payload is durable and exactly
/// `total_bytes` long; any other outcome leaves no object behind.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Start writing `source` under `key`. The write runs independently of the
    /// returned stream: dropping the stream does not stop it, `cancel` does.
    fn begin_resumable_write(
        &self,
        key: &str,
        source: ByteStream,
        total_bytes: u64,
        cancel: CancellationToken,
    ) -> WriteStream;

    async fn delete_by_locator(&self, locator: &Locator) -> ObjectStoreResult<()>;

    /// Size of the object, or `None` when it does not exist.
    async fn content_length(&self, locator: &Locator) -> ObjectStoreResult<Option<u64>>;

    async fn open_reader(&self, locator: &Locator) -> ObjectStoreResult<ObjectReader>;

    /// Every completed object whose key lives directly under `namespace`.
    async fn list_namespace(&self, namespace: &str) -> ObjectStoreResult<Vec<StoredObject>>;

    /// Readiness check.
    async fn probe(&self) -> ObjectStoreResult<()>;
}

/// Key prefix under which all of one owner's objects live.
pub fn owner_namespace(owner: Uuid) -> String {
    format!("users/{}", owner)
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const TMP_PREFIX: &str = ".tmp-";

#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    base_path: PathBuf,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Reject keys that could escape the storage root or that lack a namespace.
    fn ensure_key_safe(key: &str) -> ObjectStoreResult<()> {
        let invalid = || ObjectStoreError::InvalidKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key.starts_with('/') || key.ends_with('/') || key.contains("..") {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        match key.rsplit_once('/') {
            Some((namespace, file)) if !namespace.is_empty() && !file.starts_with(TMP_PREFIX) => {
                Ok(())
            }
            _ => Err(invalid()),
        }
    }

    /// Two-level shard for a namespace: first two bytes of MD5, as hex.
    ///
    /// Sharding on the namespace keeps one owner's objects in a single
    /// directory so they can be listed without a full walk.
    fn namespace_shards(namespace: &str) -> (String, String) {
        let digest = md5::compute(namespace);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::namespace_shards(namespace);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(namespace);
        path
    }

    fn object_path(&self, key: &str) -> ObjectStoreResult<PathBuf> {
        Self::ensure_key_safe(key)?;
        let (namespace, file) = key
            .rsplit_once('/')
            .ok_or_else(|| ObjectStoreError::InvalidKey(key.to_string()))?;
        Ok(self.namespace_dir(namespace).join(file))
    }

    /// Stream `source` into a temp file, fsync, and rename into place.
    ///
    /// Returns the byte count and MD5 hex digest. The temp file is removed on
    /// every failure path.
    async fn write_object(
        &self,
        key: &str,
        source: ByteStream,
        total_bytes: u64,
        cancel: &CancellationToken,
        events: &UnboundedSender<ObjectStoreResult<WriteEvent>>,
    ) -> ObjectStoreResult<(u64, String)> {
        let file_path = self.object_path(key)?;
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ObjectStoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let written =
            match Self::copy_with_progress(&mut file, source, total_bytes, cancel, events).await {
                Ok(written) => written,
                Err(err) => {
                    drop(file);
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            };
        let (size_bytes, digest) = written;

        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }
        drop(file);

        if cancel.is_cancelled() {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Cancelled);
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }

        Ok((size_bytes, digest))
    }

    async fn copy_with_progress(
        file: &mut File,
        mut source: ByteStream,
        total_bytes: u64,
        cancel: &CancellationToken,
        events: &UnboundedSender<ObjectStoreResult<WriteEvent>>,
    ) -> ObjectStoreResult<(u64, String)> {
        let mut written: u64 = 0;
        let mut digest = Context::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ObjectStoreError::Cancelled),
                chunk = source.next() => chunk,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            written += chunk.len() as u64;
            if written > total_bytes {
                return Err(ObjectStoreError::SizeMismatch {
                    expected: total_bytes,
                    actual: written,
                });
            }
            digest.consume(&chunk);
            file.write_all(&chunk).await?;

            // Nobody listening is fine; the write carries on.
            let _ = events.unbounded_send(Ok(WriteEvent::Progress {
                bytes_transferred: written,
                total_bytes,
            }));
        }

        if written != total_bytes {
            return Err(ObjectStoreError::SizeMismatch {
                expected: total_bytes,
                actual: written,
            });
        }

        Ok((written, format!("{:x}", digest.compute())))
    }

    /// Remove empty directories from `start` up to, but not including, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn begin_resumable_write(
        &self,
        key: &str,
        source: ByteStream,
        total_bytes: u64,
        cancel: CancellationToken,
    ) -> WriteStream {
        if let Err(err) = Self::ensure_key_safe(key) {
            return stream::once(async move { Err(err) }).boxed();
        }

        let (tx, rx) = mpsc::unbounded();
        let store = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let outcome = store
                .write_object(&key, source, total_bytes, &cancel, &tx)
                .await;
            match &outcome {
                Ok((bytes, _)) => debug!(key = %key, size_bytes = bytes, "object written"),
                Err(err) => debug!(key = %key, error = %err, "object write failed"),
            }
            let event = outcome.map(|(bytes_written, checksum)| WriteEvent::Complete {
                locator: Locator::new(key),
                bytes_written,
                checksum,
            });
            let _ = tx.unbounded_send(event);
        });

        rx.boxed()
    }

    async fn delete_by_locator(&self, locator: &Locator) -> ObjectStoreResult<()> {
        let file_path = self.object_path(locator.as_str())?;
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound(locator.to_string()));
            }
            Err(err) => return Err(ObjectStoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }

    async fn content_length(&self, locator: &Locator) -> ObjectStoreResult<Option<u64>> {
        let file_path = self.object_path(locator.as_str())?;
        match fs::metadata(&file_path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }

    async fn open_reader(&self, locator: &Locator) -> ObjectStoreResult<ObjectReader> {
        let file_path = self.object_path(locator.as_str())?;
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::NotFound(locator.to_string())
            } else {
                ObjectStoreError::Io(err)
            }
        })?;
        Ok(Box::pin(file))
    }

    async fn list_namespace(&self, namespace: &str) -> ObjectStoreResult<Vec<StoredObject>> {
        let dir = self.namespace_dir(namespace.trim_end_matches('/'));
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ObjectStoreError::Io(err)),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TMP_PREFIX) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            objects.push(StoredObject {
                locator: Locator::new(format!("{}/{}", namespace.trim_end_matches('/'), name)),
                size_bytes: meta.len(),
                modified,
            });
        }

        objects.sort_by(|a, b| a.locator.as_str().cmp(b.locator.as_str()));
        Ok(objects)
    }

    /// Write, read back and remove a scratch file under the storage root.
    async fn probe(&self) -> ObjectStoreResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self
            .base_path
            .join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let bytes = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if bytes? != b"readyz" {
            return Err(ObjectStoreError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "file content mismatch",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn source(chunks: Vec<&'static [u8]>) -> ByteStream {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c)))).boxed()
    }

    async fn drain(mut events: WriteStream) -> (Vec<u64>, ObjectStoreResult<WriteEvent>) {
        let mut progress = Vec::new();
        while let Some(event) = events.next().await {
            match event {
                Ok(WriteEvent::Progress {
                    bytes_transferred, ..
                }) => progress.push(bytes_transferred),
                other => return (progress, other),
            }
        }
        (progress, Err(ObjectStoreError::Interrupted))
    }

    #[tokio::test]
    async fn write_reports_progress_then_locator() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let events = store.begin_resumable_write(
            "users/alice/1-a_notes.txt",
            source(vec![b"hello ", b"world"]),
            11,
            CancellationToken::new(),
        );

        let (progress, outcome) = drain(events).await;
        assert_eq!(progress, vec![6, 11]);
        let WriteEvent::Complete {
            locator,
            bytes_written,
            checksum,
        } = outcome.unwrap()
        else {
            panic!("expected completion");
        };
        assert_eq!(bytes_written, 11);
        assert_eq!(checksum, format!("{:x}", md5::compute(b"hello world")));
        assert_eq!(store.content_length(&locator).await.unwrap(), Some(11));

        let mut body = String::new();
        store
            .open_reader(&locator)
            .await
            .unwrap()
            .read_to_string(&mut body)
            .await
            .unwrap();
        assert_eq!(body, "hello world");
    }

    #[tokio::test]
    async fn size_mismatch_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        let short = store.begin_resumable_write(
            "users/bob/1-a_short.bin",
            source(vec![b"abc"]),
            10,
            CancellationToken::new(),
        );
        let (_, outcome) = drain(short).await;
        assert!(matches!(
            outcome,
            Err(ObjectStoreError::SizeMismatch {
                expected: 10,
                actual: 3
            })
        ));

        let long = store.begin_resumable_write(
            "users/bob/1-b_long.bin",
            source(vec![b"abcdef"]),
            2,
            CancellationToken::new(),
        );
        let (_, outcome) = drain(long).await;
        assert!(matches!(outcome, Err(ObjectStoreError::SizeMismatch { .. })));

        assert!(store.list_namespace("users/bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_write_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let pending: ByteStream = stream::pending::<io::Result<Bytes>>().boxed();
        let events =
            store.begin_resumable_write("users/carol/1-a_big.bin", pending, 100, cancel);
        let (_, outcome) = drain(events).await;
        assert!(matches!(outcome, Err(ObjectStoreError::Cancelled)));
        assert!(store.list_namespace("users/carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_and_list_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for key in ["users/dave/1-a_x", "users/dave/2-b_y", "users/erin/1-c_z"] {
            let (_, outcome) = drain(store.begin_resumable_write(
                key,
                source(vec![b"1"]),
                1,
                CancellationToken::new(),
            ))
            .await;
            outcome.unwrap();
        }

        let listed = store.list_namespace("users/dave").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.locator.as_str()).collect();
        assert_eq!(keys, vec!["users/dave/1-a_x", "users/dave/2-b_y"]);

        let locator = Locator::new("users/dave/1-a_x");
        store.delete_by_locator(&locator).await.unwrap();
        assert_eq!(store.content_length(&locator).await.unwrap(), None);
        assert!(matches!(
            store.delete_by_locator(&locator).await,
            Err(ObjectStoreError::NotFound(_))
        ));
        assert_eq!(store.list_namespace("users/dave").await.unwrap().len(), 1);
    }

    #[test]
    fn rejects_unsafe_keys() {
        for key in [
            "",
            "/abs/path",
            "users/../etc/passwd",
            "nonamespace",
            "users/x/",
            "users/x/.tmp-123",
            "users/x/a\\b",
        ] {
            assert!(
                LocalObjectStore::ensure_key_safe(key).is_err(),
                "{key} should be rejected"
            );
        }
        assert!(LocalObjectStore::ensure_key_safe("users/x/1-abc_report.pdf").is_ok());
    }

    #[tokio::test]
    async fn probe_succeeds_on_writable_root() {
        let dir = tempfile::tempdir().unwrap();
        LocalObjectStore::new(dir.path().join("objects"))
            .probe()
            .await
            .unwrap();
    }
}
