//! services/api/src/web/state.rs
//!
//! Defines the application's shared state and the per-connection state.

use crate::adapters::PasswordIdentityProvider;
use crate::config::Config;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, warn};
use verse_study_core::dispatcher::{ErrorChannel, WriteDispatcher};
use verse_study_core::domain::Identity;
use verse_study_core::ports::{AccountRepository, DocumentStore, VerseAnalysisService};

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub accounts: Arc<dyn AccountRepository>,
    pub analysis: Arc<dyn VerseAnalysisService>,
    pub config: Arc<Config>,
    /// Write path for writes made outside any connection, such as the
    /// profile document written on sign-up.
    pub dispatcher: WriteDispatcher,
}

impl AppState {
    /// Builds the state and starts logging failures of out-of-connection
    /// writes. Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        accounts: Arc<dyn AccountRepository>,
        analysis: Arc<dyn VerseAnalysisService>,
        config: Arc<Config>,
    ) -> Self {
        let errors = ErrorChannel::new();
        let mut failures = errors.subscribe();
        tokio::spawn(async move {
            loop {
                match failures.recv().await {
                    Ok(failure) => error!(
                        path = %failure.path,
                        kind = ?failure.kind,
                        error = %failure.error,
                        "Background write failed."
                    ),
                    Err(RecvError::Lagged(missed)) => warn!(missed, "Write failure log lagged."),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            dispatcher: WriteDispatcher::new(store.clone(), errors),
            store,
            accounts,
            analysis,
            config,
        }
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.config.session_ttl_days)
    }

    /// A provider with nobody signed in, for the auth endpoints.
    pub fn identity_provider(&self) -> PasswordIdentityProvider {
        PasswordIdentityProvider::new(self.accounts.clone(), self.session_ttl())
    }
}

//=========================================================================================
// AuthenticatedUser (Inserted by the Auth Middleware)
//=========================================================================================

/// The caller of a protected route, as established by `require_auth`.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub identity: Identity,
    pub auth_session_id: String,
}

impl AuthenticatedUser {
    /// A provider that starts out signed in as this user.
    pub fn into_provider(self, state: &AppState) -> PasswordIdentityProvider {
        PasswordIdentityProvider::resumed(
            state.accounts.clone(),
            state.session_ttl(),
            self.identity,
            self.auth_session_id,
        )
    }
}
