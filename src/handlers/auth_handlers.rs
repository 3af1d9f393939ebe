//! Signup, login, logout and session introspection.

use crate::{
    errors::AppError,
    handlers::extract::{Authenticated, bearer_token},
    models::session::{Credentials, Session},
    services::session_gate::LogoutOutcome,
    state::AppState,
};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub principal: Uuid,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&Session> for AuthResponse {
    fn from(session: &Session) -> Self {
        Self {
            token: session.token.expose().to_string(),
            principal: session.principal,
            email: session.handle.clone(),
            expires_at: session.expires_at,
        }
    }
}

#[derive(Serialize)]
pub struct LogoutResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<String>,
}

/// `POST /auth/signup`
pub async fn signup(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<impl IntoResponse, AppError> {
    let (_, session) = state.sessions.signup(&credentials).await?;
    Ok((StatusCode::CREATED, Json(AuthResponse::from(&session))))
}

/// `POST /auth/login`
pub async fn login(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<Json<AuthResponse>, AppError> {
    let (_, session) = state.sessions.login(&credentials).await?;
    Ok(Json(AuthResponse::from(&session)))
}

/// `POST /auth/logout`: always 200; the local session is gone either way.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Json<LogoutResponse> {
    let outcome = match bearer_token(&headers) {
        Some(token) => state.sessions.logout(&token).await,
        None => LogoutOutcome::AlreadySignedOut,
    };

    let response = match outcome {
        LogoutOutcome::SignedOut => LogoutResponse {
            status: "signed_out",
            provider_error: None,
        },
        LogoutOutcome::AlreadySignedOut => LogoutResponse {
            status: "already_signed_out",
            provider_error: None,
        },
        LogoutOutcome::LocalOnly(err) => LogoutResponse {
            status: "signed_out_locally",
            provider_error: Some(err.to_string()),
        },
    };
    Json(response)
}

/// `GET /auth/session`
pub async fn current_session(auth: Authenticated) -> Json<Session> {
    Json(auth.session)
}
