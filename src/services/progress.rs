//! In-process registry of live upload progress, so a client can poll an
//! upload it started on another connection.
//!
//! An entry lives exactly as long as the [`TrackedUpload`] guard returned by
//! [`ProgressTracker::track`], so an abandoned request cannot leave one behind.

use crate::models::upload::UploadProgress;
use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::watch;
use uuid::Uuid;

type UploadKey = (Uuid, String);

#[derive(Clone, Default)]
pub struct ProgressTracker {
    uploads: Arc<Mutex<HashMap<UploadKey, watch::Receiver<UploadProgress>>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `progress` under `upload_id` until the guard is dropped.
    ///
    /// Returns `None` when `owner` already has a live upload with that id.
    pub fn track(
        &self,
        owner: Uuid,
        upload_id: &str,
        progress: watch::Receiver<UploadProgress>,
    ) -> Option<TrackedUpload> {
        let key = (owner, upload_id.to_string());
        match self.lock().entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(progress);
                Some(TrackedUpload {
                    tracker: self.clone(),
                    key,
                })
            }
        }
    }

    /// Latest progress of `owner`'s upload, if it is still running.
    pub fn snapshot(&self, owner: Uuid, upload_id: &str) -> Option<UploadProgress> {
        self.lock()
            .get(&(owner, upload_id.to_string()))
            .map(|rx| *rx.borrow())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UploadKey, watch::Receiver<UploadProgress>>> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its upload from the tracker on drop.
pub struct TrackedUpload {
    tracker: ProgressTracker,
    key: UploadKey,
}

impl Drop for TrackedUpload {
    fn drop(&mut self) {
        self.tracker.lock().remove(&self.key);
    }
}
