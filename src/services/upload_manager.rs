//! Upload transaction manager.
//!
//! Adding a file is two writes to two independent systems: the payload goes
//! to the object store, then a record goes to the ledger. The ledger write
//! only happens after the store acknowledges a durable object, so a failed or
//! cancelled write never produces a record. The reverse partial failure, a
//! stored object whose record could not be written, is reported as
//! [`VaultError::MetadataWriteFailed`] with the locator and the object is left
//! for the reconciliation sweep; it is not deleted here because a failed
//! ledger write may still have been persisted.

use crate::{
    errors::{VaultError, VaultResult},
    models::{
        file_record::{FileRecord, NewFileRecord},
        session::Session,
        upload::{UploadProgress, UploadState},
    },
    services::{
        identity::AuthError,
        ledger::FileLedger,
        object_store::{
            ByteStream, ObjectStore, ObjectStoreError, WriteEvent, owner_namespace,
        },
        session_gate::SessionGate,
    },
};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};
use uuid::Uuid;

const MAX_NAME_BYTES: usize = 255;

/// One file to upload.
pub struct UploadRequest {
    pub name: String,
    /// Declared size; the write fails unless exactly this many bytes arrive.
    pub size_bytes: u64,
    pub source: ByteStream,
}

/// A running upload.
///
/// Dropping the handle, or any progress receiver, stops observation only;
/// the upload keeps running. Use [`UploadHandle::cancel`] to abort it.
pub struct UploadHandle {
    upload_id: Uuid,
    key: String,
    progress: watch::Receiver<UploadProgress>,
    cancel: CancellationToken,
    outcome: JoinHandle<VaultResult<FileRecord>>,
}

impl UploadHandle {
    pub fn upload_id(&self) -> Uuid {
        self.upload_id
    }

    /// Storage key the object will be written under.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn progress(&self) -> watch::Receiver<UploadProgress> {
        self.progress.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Guard that cancels the upload when dropped, for callers whose source
    /// goes away with them.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }

    /// Wait for the upload to finish.
    pub async fn finish(self) -> VaultResult<FileRecord> {
        match self.outcome.await {
            Ok(result) => result,
            Err(join_err) => Err(VaultError::ObjectWriteFailed {
                key: self.key,
                source: ObjectStoreError::Io(std::io::Error::other(join_err)),
            }),
        }
    }
}

/// Transient state of one in-flight upload.
struct UploadSession {
    id: Uuid,
    owner: Uuid,
    name: String,
    key: String,
    total_bytes: u64,
    progress: watch::Sender<UploadProgress>,
}

impl UploadSession {
    /// Progress only moves forward.
    fn advance(&self, bytes_transferred: u64) {
        self.progress.send_if_modified(|p| {
            let next = bytes_transferred.min(p.total_bytes);
            if next > p.bytes_transferred {
                p.bytes_transferred = next;
                true
            } else {
                false
            }
        });
    }

    fn settle(&self, state: UploadState) {
        self.progress.send_modify(|p| {
            p.state = state;
            if state == UploadState::Completed {
                p.bytes_transferred = p.total_bytes;
            }
        });
    }
}

#[derive(Clone)]
pub struct UploadTransactionManager {
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn FileLedger>,
}

impl UploadTransactionManager {
    pub fn new(store: Arc<dyn ObjectStore>, ledger: Arc<dyn FileLedger>) -> Self {
        Self { store, ledger }
    }

    /// Upload and wait for the ledger acknowledgement.
    pub async fn upload(
        &self,
        gate: &SessionGate,
        session: &Session,
        request: UploadRequest,
    ) -> VaultResult<FileRecord> {
        self.start(gate, session, request).await?.finish().await
    }

    /// Validate the request and start the upload in the background.
    ///
    /// The session is re-checked with the gate rather than trusted as passed.
    /// A logout published by the gate while the payload is still streaming
    /// cancels the upload.
    pub async fn start(
        &self,
        gate: &SessionGate,
        session: &Session,
        request: UploadRequest,
    ) -> VaultResult<UploadHandle> {
        let current = gate.require_session().await?;
        if current.principal != session.principal {
            return Err(AuthError::Unauthenticated.into());
        }

        if request.size_bytes == 0 {
            return Err(VaultError::InvalidUpload("file is empty".into()));
        }
        if i64::try_from(request.size_bytes).is_err() {
            return Err(VaultError::InvalidUpload("file is too large".into()));
        }
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(VaultError::InvalidUpload("file name is required".into()));
        }

        let key = object_key(current.principal, &name);
        let (progress_tx, progress_rx) =
            watch::channel(UploadProgress::started(request.size_bytes));
        let cancel = CancellationToken::new();
        let upload = UploadSession {
            id: Uuid::new_v4(),
            owner: current.principal,
            name,
            key: key.clone(),
            total_bytes: request.size_bytes,
            progress: progress_tx,
        };
        let upload_id = upload.id;

        info!(
            upload_id = %upload_id,
            owner = %upload.owner,
            key = %key,
            size_bytes = request.size_bytes,
            "upload started"
        );

        let outcome = tokio::spawn(run_upload(
            self.store.clone(),
            self.ledger.clone(),
            upload,
            request.source,
            cancel.clone(),
            gate.subscribe(),
        ));

        Ok(UploadHandle {
            upload_id,
            key,
            progress: progress_rx,
            cancel,
            outcome,
        })
    }
}

async fn run_upload(
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn FileLedger>,
    upload: UploadSession,
    source: ByteStream,
    cancel: CancellationToken,
    mut session_changes: watch::Receiver<Option<Session>>,
) -> VaultResult<FileRecord> {
    let mut events =
        store.begin_resumable_write(&upload.key, source, upload.total_bytes, cancel.clone());
    let mut watching = true;

    let written = loop {
        tokio::select! {
            biased;
            changed = session_changes.changed(), if watching => match changed {
                Ok(()) => {
                    if session_changes.borrow_and_update().is_none() {
                        info!(upload_id = %upload.id, "session ended, cancelling upload");
                        cancel.cancel();
                        watching = false;
                    }
                }
                Err(_) => watching = false,
            },
            event = events.next() => match event {
                Some(Ok(WriteEvent::Progress { bytes_transferred, .. })) => {
                    upload.advance(bytes_transferred);
                }
                Some(Ok(WriteEvent::Complete { locator, bytes_written, checksum })) => {
                    upload.advance(bytes_written);
                    break Ok((locator, checksum));
                }
                Some(Err(err)) => break Err(err),
                None => break Err(ObjectStoreError::Interrupted),
            },
        }
    };

    // A cancel or logout that lands after the store made the object durable
    // still wins: the object has no record yet, so it is removed.
    let signed_out = session_changes.borrow().is_none();
    let written = match written {
        Ok((locator, _)) if cancel.is_cancelled() || signed_out => {
            if let Err(err) = store.delete_by_locator(&locator).await {
                warn!(
                    upload_id = %upload.id,
                    locator = %locator,
                    error = %err,
                    "could not remove object of cancelled upload; left for reconciliation"
                );
            }
            Err(ObjectStoreError::Cancelled)
        }
        other => other,
    };

    let (locator, checksum) = match written {
        Ok(done) => done,
        Err(source) => {
            let state = if matches!(source, ObjectStoreError::Cancelled) {
                UploadState::Cancelled
            } else {
                UploadState::Failed
            };
            upload.settle(state);
            warn!(
                upload_id = %upload.id,
                key = %upload.key,
                error = %source,
                "object write failed; nothing recorded"
            );
            return Err(VaultError::ObjectWriteFailed {
                key: upload.key,
                source,
            });
        }
    };

    let record = NewFileRecord {
        owner_id: upload.owner,
        name: upload.name.clone(),
        size_bytes: upload.total_bytes as i64,
        locator: locator.clone(),
        checksum,
        created_at: Utc::now(),
    };

    match ledger.insert(record).await {
        Ok(record) => {
            upload.settle(UploadState::Completed);
            info!(
                upload_id = %upload.id,
                record_id = %record.id,
                locator = %record.locator,
                "upload recorded"
            );
            Ok(record)
        }
        Err(source) => {
            upload.settle(UploadState::Failed);
            warn!(
                upload_id = %upload.id,
                locator = %locator,
                error = %source,
                "object stored but ledger insert failed; object is orphaned until reconciled"
            );
            Err(VaultError::MetadataWriteFailed { locator, source })
        }
    }
}

/// Storage key for a new upload: `users/{owner}/{unix_millis}-{uuid}_{name}`.
///
/// The random component keeps keys distinct even for same-millisecond
/// uploads of the same name.
pub fn object_key(owner: Uuid, name: &str) -> String {
    format!(
        "{}/{}-{}_{}",
        owner_namespace(owner),
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple(),
        sanitize_file_name(name)
    )
}

/// Make a user-supplied name safe to use as the last key segment.
fn sanitize_file_name(name: &str) -> String {
    let mut cleaned = String::new();
    for c in name.chars() {
        if cleaned.len() + c.len_utf8() > MAX_NAME_BYTES {
            break;
        }
        if c == '/' || c == '\\' || c.is_control() {
            cleaned.push('_');
        } else {
            cleaned.push(c);
        }
    }
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", "_");
    }
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}
