//! Identity provider: issues and validates user sessions.
//!
//! Passwords are stored only as Argon2id hashes and bearer tokens only as
//! SHA-256 digests. The provider knows nothing about files; the session gate
//! is its only caller.

use crate::models::session::{Session, SessionToken};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication required")]
    Unauthenticated,
    /// Same error for an unknown email and a wrong password.
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("an account already exists for this email")]
    AccountExists,
    #[error("credential rejected: {0}")]
    WeakCredential(String),
    #[error("invalid email address `{0}`")]
    InvalidEmail(String),
    #[error("identity provider unavailable: {0}")]
    ProviderUnavailable(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        AuthError::ProviderUnavailable(err.to_string())
    }
}

/// Backend that authenticates users and tracks their sessions.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Sign in an existing account.
    async fn authenticate(&self, email: &str, password: &str) -> AuthResult<Session>;

    /// Create an account and sign it in.
    async fn register(&self, email: &str, password: &str) -> AuthResult<Session>;

    /// Resolve a bearer token. `Ok(None)` means unknown, revoked or expired.
    async fn resolve(&self, token: &SessionToken) -> AuthResult<Option<Session>>;

    /// Revoke a session at the provider.
    async fn deauthenticate(&self, session: &Session) -> AuthResult<()>;
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub session_ttl: Duration,
    pub min_password_len: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::hours(24),
            min_password_len: 6,
        }
    }
}

/// SQLite-backed identity provider using the `users` and `sessions` tables.
#[derive(Clone)]
pub struct SqliteIdentityProvider {
    db: Arc<SqlitePool>,
    config: IdentityConfig,
}

impl SqliteIdentityProvider {
    pub fn new(db: Arc<SqlitePool>, config: IdentityConfig) -> Self {
        Self { db, config }
    }

    async fn issue_session(&self, user_id: Uuid, email: &str) -> AuthResult<Session> {
        let token = generate_token();
        let now = Utc::now();
        let expires_at = now + self.config.session_ttl;

        sqlx::query(
            "INSERT INTO sessions (token_hash, user_id, created_at, expires_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(hash_token(&token))
        .bind(user_id)
        .bind(now)
        .bind(expires_at)
        .execute(&*self.db)
        .await?;

        Ok(Session {
            principal: user_id,
            handle: email.to_string(),
            token: SessionToken::new(token),
            expires_at,
        })
    }
}

#[async_trait]
impl IdentityProvider for SqliteIdentityProvider {
    async fn authenticate(&self, email: &str, password: &str) -> AuthResult<Session> {
        let email = normalize_email(email);
        let row = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT id, password_hash FROM users WHERE email = ?",
        )
        .bind(&email)
        .fetch_optional(&*self.db)
        .await?;

        let Some((user_id, password_hash)) = row else {
            return Err(AuthError::InvalidCredentials);
        };

        let password = password.to_string();
        let verified =
            tokio::task::spawn_blocking(move || verify_password(&password, &password_hash))
                .await
                .map_err(|err| AuthError::ProviderUnavailable(err.to_string()))?;
        if !verified {
            return Err(AuthError::InvalidCredentials);
        }

        debug!(principal = %user_id, "credentials accepted");
        self.issue_session(user_id, &email).await
    }

    async fn register(&self, email: &str, password: &str) -> AuthResult<Session> {
        let email = normalize_email(email);
        validate_email(&email)?;
        if password.chars().count() < self.config.min_password_len {
            return Err(AuthError::WeakCredential(format!(
                "password must be at least {} characters",
                self.config.min_password_len
            )));
        }

        let password = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|err| AuthError::ProviderUnavailable(err.to_string()))??;

        let user_id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO users (id, email, password_hash, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&email)
        .bind(&password_hash)
        .bind(Utc::now())
        .execute(&*self.db)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => return Err(AuthError::AccountExists),
            Err(err) => return Err(err.into()),
        }

        debug!(principal = %user_id, "account registered");
        self.issue_session(user_id, &email).await
    }

    async fn resolve(&self, token: &SessionToken) -> AuthResult<Option<Session>> {
        let token_hash = hash_token(token.expose());
        let row = sqlx::query_as::<_, (Uuid, String, DateTime<Utc>)>(
            "SELECT s.user_id, u.email, s.expires_at
             FROM sessions s JOIN users u ON u.id = s.user_id
             WHERE s.token_hash = ?",
        )
        .bind(&token_hash)
        .fetch_optional(&*self.db)
        .await?;

        let Some((principal, email, expires_at)) = row else {
            return Ok(None);
        };

        if expires_at <= Utc::now() {
            sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
                .bind(&token_hash)
                .execute(&*self.db)
                .await?;
            debug!(principal = %principal, "session expired");
            return Ok(None);
        }

        Ok(Some(Session {
            principal,
            handle: email,
            token: token.clone(),
            expires_at,
        }))
    }

    async fn deauthenticate(&self, session: &Session) -> AuthResult<()> {
        sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
            .bind(hash_token(session.token.expose()))
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn validate_email(email: &str) -> AuthResult<()> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(AuthError::InvalidEmail(email.to_string()))
    }
}

/// Hash a password with Argon2id and a random salt.
fn hash_password(password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::ProviderUnavailable(format!("password hashing failed: {err}")))
}

fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// 256 random bits, URL-safe base64.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
