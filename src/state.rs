//! Shared state handed to every HTTP handler.

use crate::{
    config::AppConfig,
    services::{
        delete_manager::DeleteTransactionManager,
        identity::IdentityProvider,
        ledger::FileLedger,
        object_store::ObjectStore,
        progress::ProgressTracker,
        reconcile::Reconciler,
        session_gate::SessionRegistry,
        upload_manager::UploadTransactionManager,
    },
};
use chrono::Duration;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: SessionRegistry,
    pub store: Arc<dyn ObjectStore>,
    pub ledger: Arc<dyn FileLedger>,
    pub uploads: UploadTransactionManager,
    pub deletes: DeleteTransactionManager,
    pub reconciler: Reconciler,
    pub progress: ProgressTracker,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn ObjectStore>,
        ledger: Arc<dyn FileLedger>,
    ) -> Self {
        let grace = Duration::seconds(config.reconcile_grace_secs);
        Self {
            sessions: SessionRegistry::new(provider),
            uploads: UploadTransactionManager::new(store.clone(), ledger.clone()),
            deletes: DeleteTransactionManager::new(store.clone(), ledger.clone()),
            reconciler: Reconciler::new(store.clone(), ledger.clone(), grace),
            progress: ProgressTracker::new(),
            config: Arc::new(config),
            store,
            ledger,
        }
    }
}
