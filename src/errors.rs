use crate::{
    models::file_record::Locator,
    services::{identity::AuthError, ledger::LedgerError, object_store::ObjectStoreError},
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Every way a file operation can fail.
///
/// Partial-failure variants carry the locator or record id needed to retry
/// or to clean up by hand.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    /// Nothing was recorded; the ledger is untouched.
    #[error("writing object `{key}` failed: {source}")]
    ObjectWriteFailed {
        key: String,
        #[source]
        source: ObjectStoreError,
    },

    /// The object exists at `locator` but has no ledger entry.
    #[error("object `{locator}` was stored but its record could not be written: {source}")]
    MetadataWriteFailed {
        locator: Locator,
        #[source]
        source: LedgerError,
    },

    /// The record and its object are both still in place.
    #[error("deleting object `{locator}` of record `{record_id}` failed: {source}")]
    ObjectDeleteFailed {
        record_id: Uuid,
        locator: Locator,
        #[source]
        source: ObjectStoreError,
    },

    /// The object is gone but record `record_id` still points at it.
    #[error("object removed but record `{record_id}` could not be deleted: {source}")]
    MetadataDeleteFailed {
        record_id: Uuid,
        #[source]
        source: LedgerError,
    },

    #[error("file `{0}` not found")]
    NotFound(Uuid),

    #[error(transparent)]
    StoreUnavailable(LedgerError),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
}

pub type VaultResult<T> = Result<T, VaultError>;

impl From<LedgerError> for VaultError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => VaultError::NotFound(id),
            other => VaultError::StoreUnavailable(other),
        }
    }
}

impl VaultError {
    /// True when the failure came from a cancelled upload.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            VaultError::ObjectWriteFailed {
                source: ObjectStoreError::Cancelled,
                ..
            }
        )
    }
}

/// A lightweight wrapper for HTTP-facing errors.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub context: Option<serde_json::Value>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            context: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16()
        });
        if let Some(context) = self.context {
            body["context"] = context;
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        VaultError::from(err).into()
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        VaultError::from(err).into()
    }
}

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        let message = err.to_string();
        let app = match &err {
            VaultError::Auth(auth) => {
                let status = match auth {
                    AuthError::Unauthenticated | AuthError::InvalidCredentials => {
                        StatusCode::UNAUTHORIZED
                    }
                    AuthError::AccountExists => StatusCode::CONFLICT,
                    AuthError::WeakCredential(_) | AuthError::InvalidEmail(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    AuthError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                AppError::new(status, message)
            }
            VaultError::InvalidUpload(_) => AppError::bad_request(message),
            VaultError::ObjectWriteFailed { key, source } => {
                let status = match source {
                    ObjectStoreError::SizeMismatch { .. } => StatusCode::BAD_REQUEST,
                    _ => StatusCode::BAD_GATEWAY,
                };
                AppError::new(status, message).with_context(json!({ "key": key }))
            }
            VaultError::MetadataWriteFailed { locator, .. } => AppError::internal(message)
                .with_context(json!({ "locator": locator, "orphaned_object": true })),
            VaultError::ObjectDeleteFailed {
                record_id, locator, ..
            } => AppError::new(StatusCode::BAD_GATEWAY, message)
                .with_context(json!({ "record_id": record_id, "locator": locator })),
            VaultError::MetadataDeleteFailed { record_id, .. } => AppError::internal(message)
                .with_context(json!({ "record_id": record_id, "dangling_record": true })),
            VaultError::NotFound(_) => AppError::new(StatusCode::NOT_FOUND, message),
            VaultError::StoreUnavailable(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, message)
            }
            VaultError::ObjectStore(source) => match source {
                ObjectStoreError::NotFound(_) => AppError::new(StatusCode::NOT_FOUND, message),
                ObjectStoreError::InvalidKey(_) => AppError::bad_request(message),
                _ => AppError::internal(message),
            },
        };

        if app.status.is_server_error() {
            tracing::error!(status = app.status.as_u16(), error = %err, "request failed");
        }
        app
    }
}
