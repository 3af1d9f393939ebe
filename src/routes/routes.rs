//! Defines routes for the backup service.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Auth**
//!   - `POST   /auth/signup`: create an account and sign in
//!   - `POST   /auth/login`: sign in
//!   - `POST   /auth/logout`: sign out (always succeeds locally)
//!   - `GET    /auth/session`: current session
//!
//! - **Files** (bearer token required)
//!   - `GET    /files`: list the caller's files, newest first
//!   - `PUT    /files/{name}`: upload the raw body as `name`
//!   - `GET    /files/{id}`: download
//!   - `DELETE /files/{id}`: delete object then record
//!   - `GET    /uploads/{upload_id}`: live upload progress
//!   - `GET    /stats`: usage totals
//!   - `POST   /reconcile`: orphan sweep, `?repair=true` to clean up
//!
//! `PUT` takes a file name in the same path segment where `GET`/`DELETE`
//! take a file id.

use crate::{
    handlers::{
        auth_handlers::{current_session, login, logout, signup},
        file_handlers::{
            delete_file, download_file, list_files, reconcile, stats, upload_file,
            upload_progress,
        },
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build and return the router with every route, carrying [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // auth
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/session", get(current_session))
        // files
        .route("/files", get(list_files))
        .route(
            "/files/{file}",
            put(upload_file).get(download_file).delete(delete_file),
        )
        .route("/uploads/{upload_id}", get(upload_progress))
        .route("/stats", get(stats))
        .route("/reconcile", post(reconcile))
}
