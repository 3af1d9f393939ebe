//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the ledger and object store

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Liveness probe. Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a trivial query against the ledger.
/// 2. Performs a write/read/delete round trip in the object store.
///
/// HTTP 200 when both checks pass, HTTP 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let ledger_check = match state.ledger.probe().await {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(e),
    };
    let store_check = match state.store.probe().await {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(e),
    };

    let overall_ok = ledger_check.ok && store_check.ok;
    if !overall_ok {
        tracing::warn!(
            ledger = ?ledger_check.error,
            store = ?store_check.error,
            "readiness check failed"
        );
    }

    let mut checks = HashMap::new();
    checks.insert("ledger", ledger_check);
    checks.insert("object_store", store_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(err: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            error: Some(format!("error: {}", err)),
        }
    }
}
