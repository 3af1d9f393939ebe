//! Session gate: the single place that answers "who is calling?".
//!
//! A [`SessionGate`] holds one client's authentication state and publishes
//! every change (login, logout, expiry) on a `watch` channel so dependents can
//! react without polling. The HTTP layer keeps one gate per bearer token in a
//! [`SessionRegistry`].

use crate::models::session::{Credentials, Session, SessionToken};
use crate::services::identity::{AuthError, AuthResult, IdentityProvider};
use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

/// Result of [`SessionGate::logout`]. Local state is cleared in every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutOutcome {
    SignedOut,
    AlreadySignedOut,
    /// Cleared locally, but the provider could not revoke the session.
    LocalOnly(AuthError),
}

#[derive(Clone)]
pub struct SessionGate {
    provider: Arc<dyn IdentityProvider>,
    state: Arc<watch::Sender<Option<Session>>>,
}

impl SessionGate {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            provider,
            state: Arc::new(state),
        }
    }

    /// Build a gate from a previously issued token.
    pub async fn restore(
        provider: Arc<dyn IdentityProvider>,
        token: &SessionToken,
    ) -> AuthResult<Self> {
        let session = provider
            .resolve(token)
            .await?
            .ok_or(AuthError::Unauthenticated)?;
        let gate = Self::new(provider);
        gate.state.send_replace(Some(session));
        Ok(gate)
    }

    /// Latest known session, without contacting the provider.
    pub fn current_session(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    /// Stream of authentication state changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }

    /// The current session, re-validated with the provider.
    ///
    /// A session the provider no longer recognises is dropped locally and
    /// observers see the logout.
    pub async fn require_session(&self) -> AuthResult<Session> {
        let current = self.current_session().ok_or(AuthError::Unauthenticated)?;

        match self.provider.resolve(&current.token).await? {
            Some(fresh) if fresh.principal == current.principal => Ok(fresh),
            _ => {
                self.clear_if_current(&current.token);
                warn!(principal = %current.principal, "session no longer valid, signing out");
                Err(AuthError::Unauthenticated)
            }
        }
    }

    pub async fn login(&self, credentials: &Credentials) -> AuthResult<Session> {
        let session = self
            .provider
            .authenticate(&credentials.email, &credentials.password)
            .await?;
        self.replace(session.clone()).await;
        info!(principal = %session.principal, "signed in");
        Ok(session)
    }

    pub async fn signup(&self, credentials: &Credentials) -> AuthResult<Session> {
        let session = self
            .provider
            .register(&credentials.email, &credentials.password)
            .await?;
        self.replace(session.clone()).await;
        info!(principal = %session.principal, "account created");
        Ok(session)
    }

    /// Sign out. Idempotent; the local session is cleared before the provider
    /// is contacted so a provider outage never leaves the client signed in.
    pub async fn logout(&self) -> LogoutOutcome {
        let Some(previous) = self.state.send_replace(None) else {
            return LogoutOutcome::AlreadySignedOut;
        };

        match self.provider.deauthenticate(&previous).await {
            Ok(()) => {
                info!(principal = %previous.principal, "signed out");
                LogoutOutcome::SignedOut
            }
            Err(err) => {
                warn!(
                    principal = %previous.principal,
                    error = %err,
                    "provider failed to revoke session; cleared locally"
                );
                LogoutOutcome::LocalOnly(err)
            }
        }
    }

    async fn replace(&self, session: Session) {
        if let Some(previous) = self.state.send_replace(Some(session)) {
            if let Err(err) = self.provider.deauthenticate(&previous).await {
                debug!(error = %err, "could not revoke replaced session");
            }
        }
    }

    fn clear_if_current(&self, token: &SessionToken) {
        self.state.send_if_modified(|state| {
            if state.as_ref().is_some_and(|s| &s.token == token) {
                *state = None;
                true
            } else {
                false
            }
        });
    }
}

/// Gates keyed by bearer token, shared by all request handlers.
#[derive(Clone)]
pub struct SessionRegistry {
    provider: Arc<dyn IdentityProvider>,
    gates: Arc<RwLock<HashMap<SessionToken, SessionGate>>>,
}

impl SessionRegistry {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            provider,
            gates: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn login(&self, credentials: &Credentials) -> AuthResult<(SessionGate, Session)> {
        let gate = SessionGate::new(self.provider.clone());
        let session = gate.login(credentials).await?;
        self.register(&session, gate.clone()).await;
        Ok((gate, session))
    }

    pub async fn signup(&self, credentials: &Credentials) -> AuthResult<(SessionGate, Session)> {
        let gate = SessionGate::new(self.provider.clone());
        let session = gate.signup(credentials).await?;
        self.register(&session, gate.clone()).await;
        Ok((gate, session))
    }

    /// Gate for `token`, restoring it from the provider when this process has
    /// not seen the token yet (e.g. after a restart).
    ///
    /// Concurrent first requests for one token share a single gate, so a
    /// logout reaches every upload started under it.
    pub async fn gate_for(&self, token: &SessionToken) -> AuthResult<SessionGate> {
        if let Some(gate) = self.gates.read().await.get(token) {
            if gate.current_session().is_some() {
                return Ok(gate.clone());
            }
        }

        let mut gates = self.gates.write().await;
        if let Some(gate) = gates.get(token) {
            if gate.current_session().is_some() {
                return Ok(gate.clone());
            }
        }
        prune_dead(&mut gates);

        let gate = SessionGate::restore(self.provider.clone(), token).await?;
        gates.insert(token.clone(), gate.clone());
        Ok(gate)
    }

    /// Sign out the session behind `token`; unknown tokens are already signed out.
    pub async fn logout(&self, token: &SessionToken) -> LogoutOutcome {
        let gate = self.gates.write().await.remove(token);
        let gate = match gate {
            Some(gate) => gate,
            None => match SessionGate::restore(self.provider.clone(), token).await {
                Ok(gate) => gate,
                Err(AuthError::Unauthenticated) => return LogoutOutcome::AlreadySignedOut,
                Err(err) => return LogoutOutcome::LocalOnly(err),
            },
        };
        gate.logout().await
    }

    async fn register(&self, session: &Session, gate: SessionGate) {
        let mut gates = self.gates.write().await;
        prune_dead(&mut gates);
        gates.insert(session.token.clone(), gate);
    }
}

/// Drop gates that are signed out or past expiry.
fn prune_dead(gates: &mut HashMap<SessionToken, SessionGate>) {
    let now = Utc::now();
    gates.retain(|_, g| g.current_session().is_some_and(|s| s.expires_at > now));
}
