//! Delete transaction manager.
//!
//! The object is removed before the ledger entry. If the object delete fails
//! the record still points at a live object and the whole operation can be
//! retried. The opposite order could lose the record while the object
//! survives, leaving nothing to drive a retry. Do not swap the two steps.

use crate::{
    errors::{VaultError, VaultResult},
    models::{file_record::FileRecord, session::Session},
    services::{
        identity::AuthError,
        ledger::{FileLedger, LedgerError},
        object_store::{ObjectStore, ObjectStoreError},
        session_gate::SessionGate,
    },
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct DeleteTransactionManager {
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn FileLedger>,
}

impl DeleteTransactionManager {
    pub fn new(store: Arc<dyn ObjectStore>, ledger: Arc<dyn FileLedger>) -> Self {
        Self { store, ledger }
    }

    /// Delete `record` and its object.
    ///
    /// Records owned by someone else are reported as [`VaultError::NotFound`].
    pub async fn delete(
        &self,
        gate: &SessionGate,
        session: &Session,
        record: &FileRecord,
    ) -> VaultResult<()> {
        let principal = authorize(gate, session).await?;
        self.delete_owned(principal, record).await
    }

    /// Look up `id` in the caller's files and delete it.
    pub async fn delete_by_id(
        &self,
        gate: &SessionGate,
        session: &Session,
        id: Uuid,
    ) -> VaultResult<FileRecord> {
        let principal = authorize(gate, session).await?;
        let record = self.ledger.get(principal, id).await?;
        self.delete_owned(principal, &record).await?;
        Ok(record)
    }

    async fn delete_owned(&self, principal: Uuid, record: &FileRecord) -> VaultResult<()> {
        if record.owner_id != principal {
            warn!(
                principal = %principal,
                record_id = %record.id,
                "refusing to delete a record owned by another principal"
            );
            return Err(VaultError::NotFound(record.id));
        }

        match self.store.delete_by_locator(&record.locator).await {
            Ok(()) => {}
            // A previous attempt got this far; finish the job.
            Err(ObjectStoreError::NotFound(_)) => {
                debug!(record_id = %record.id, locator = %record.locator, "object already absent");
            }
            Err(source) => {
                warn!(
                    record_id = %record.id,
                    locator = %record.locator,
                    error = %source,
                    "object delete failed; record kept for retry"
                );
                return Err(VaultError::ObjectDeleteFailed {
                    record_id: record.id,
                    locator: record.locator.clone(),
                    source,
                });
            }
        }

        match self.ledger.delete_by_id(principal, record.id).await {
            Ok(()) => {
                info!(record_id = %record.id, locator = %record.locator, "file deleted");
                Ok(())
            }
            Err(LedgerError::NotFound(id)) => Err(VaultError::NotFound(id)),
            Err(source) => {
                warn!(
                    record_id = %record.id,
                    error = %source,
                    "object removed but record delete failed; record now dangles"
                );
                Err(VaultError::MetadataDeleteFailed {
                    record_id: record.id,
                    source,
                })
            }
        }
    }
}

async fn authorize(gate: &SessionGate, session: &Session) -> VaultResult<Uuid> {
    let current = gate.require_session().await?;
    if current.principal != session.principal {
        return Err(AuthError::Unauthenticated.into());
    }
    Ok(current.principal)
}
