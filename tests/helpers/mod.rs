#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use cloud_backup::{
    db,
    models::{
        file_record::{FileRecord, Locator, NewFileRecord, UsageSummary},
        session::{Credentials, Session},
    },
    services::{
        identity::{IdentityConfig, IdentityProvider, SqliteIdentityProvider},
        ledger::{FileLedger, LedgerError, LedgerResult, SqliteLedger},
        object_store::{
            ByteStream, LocalObjectStore, ObjectReader, ObjectStore, ObjectStoreError,
            ObjectStoreResult, StoredObject, WriteStream,
        },
        session_gate::SessionGate,
    },
};
use futures::{StreamExt, stream};
use sqlx::SqlitePool;
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// In-memory ledger and identity database plus a temporary object directory.
pub struct Harness {
    pub db: Arc<SqlitePool>,
    pub dir: TempDir,
    pub provider: Arc<dyn IdentityProvider>,
    pub store: Arc<FlakyStore>,
    pub ledger: Arc<FlakyLedger>,
}

impl Harness {
    pub async fn new() -> Self {
        let db = db::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn IdentityProvider> = Arc::new(SqliteIdentityProvider::new(
            db.clone(),
            IdentityConfig::default(),
        ));
        let store = Arc::new(FlakyStore::new(Arc::new(LocalObjectStore::new(dir.path()))));
        let ledger = Arc::new(FlakyLedger::new(Arc::new(SqliteLedger::new(db.clone()))));
        Self {
            db,
            dir,
            provider,
            store,
            ledger,
        }
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub fn ledger(&self) -> Arc<dyn FileLedger> {
        self.ledger.clone()
    }

    /// New account with a signed-in gate.
    pub async fn sign_up(&self, email: &str) -> (SessionGate, Session) {
        let gate = SessionGate::new(self.provider.clone());
        let session = gate
            .signup(&Credentials::new(email, "correct horse battery"))
            .await
            .unwrap();
        (gate, session)
    }
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Stream `data` in `chunk`-sized pieces.
pub fn chunked(data: Vec<u8>, chunk: usize) -> ByteStream {
    let chunks: Vec<io::Result<Bytes>> = data
        .chunks(chunk)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks).boxed()
}

/// Yields `prefix`, then never finishes.
pub fn stalled(prefix: &'static [u8]) -> ByteStream {
    stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(prefix))])
        .chain(stream::pending())
        .boxed()
}

/// Object store wrapper that fails writes or deletes on demand, or finishes
/// writes even after they were cancelled.
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
    ignore_cancel: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            ignore_cancel: AtomicBool::new(false),
        }
    }

    pub fn ignore_cancel(&self, on: bool) {
        self.ignore_cancel.store(on, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, on: bool) {
        self.fail_deletes.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    fn begin_resumable_write(
        &self,
        key: &str,
        source: ByteStream,
        total_bytes: u64,
        cancel: CancellationToken,
    ) -> WriteStream {
        if self.fail_writes.load(Ordering::SeqCst) {
            let err = ObjectStoreError::Io(io::Error::other("injected write failure"));
            return stream::iter(vec![Err(err)]).boxed();
        }
        let cancel = if self.ignore_cancel.load(Ordering::SeqCst) {
            CancellationToken::new()
        } else {
            cancel
        };
        self.inner
            .begin_resumable_write(key, source, total_bytes, cancel)
    }

    async fn delete_by_locator(&self, locator: &Locator) -> ObjectStoreResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Io(io::Error::other(
                "injected delete failure",
            )));
        }
        self.inner.delete_by_locator(locator).await
    }

    async fn content_length(&self, locator: &Locator) -> ObjectStoreResult<Option<u64>> {
        self.inner.content_length(locator).await
    }

    async fn open_reader(&self, locator: &Locator) -> ObjectStoreResult<ObjectReader> {
        self.inner.open_reader(locator).await
    }

    async fn list_namespace(&self, namespace: &str) -> ObjectStoreResult<Vec<StoredObject>> {
        self.inner.list_namespace(namespace).await
    }

    async fn probe(&self) -> ObjectStoreResult<()> {
        self.inner.probe().await
    }
}

/// Ledger wrapper that fails inserts or deletes on demand.
pub struct FlakyLedger {
    inner: Arc<dyn FileLedger>,
    fail_inserts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FlakyLedger {
    pub fn new(inner: Arc<dyn FileLedger>) -> Self {
        Self {
            inner,
            fail_inserts: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn fail_inserts(&self, on: bool) {
        self.fail_inserts.store(on, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, on: bool) {
        self.fail_deletes.store(on, Ordering::SeqCst);
    }
}

fn unavailable() -> LedgerError {
    LedgerError::StoreUnavailable(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl FileLedger for FlakyLedger {
    async fn insert(&self, record: NewFileRecord) -> LedgerResult<FileRecord> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.insert(record).await
    }

    async fn list_for(&self, owner: uuid::Uuid) -> LedgerResult<Vec<FileRecord>> {
        self.inner.list_for(owner).await
    }

    async fn get(&self, owner: uuid::Uuid, id: uuid::Uuid) -> LedgerResult<FileRecord> {
        self.inner.get(owner, id).await
    }

    async fn delete_by_id(&self, owner: uuid::Uuid, id: uuid::Uuid) -> LedgerResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.delete_by_id(owner, id).await
    }

    async fn usage_for(&self, owner: uuid::Uuid) -> LedgerResult<UsageSummary> {
        self.inner.usage_for(owner).await
    }

    async fn probe(&self) -> LedgerResult<()> {
        self.inner.probe().await
    }
}
