//! services/api/src/adapters/identity.rs
//!
//! An `IdentityProvider` backed by the account tables: email and password
//! credentials hashed with Argon2, and cookie auth sessions.
//!
//! One provider instance serves one client. It remembers the auth session it
//! issued (or resumed) so that signing out can revoke it.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;
use verse_study_core::domain::Identity;
use verse_study_core::ports::{AccountRepository, IdentityProvider, PortError, PortResult};

pub fn hash_password(password: &str) -> PortResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            error!("Failed to hash password: {:?}", e);
            PortError::Unexpected("Failed to hash password".to_string())
        })
}

pub fn verify_password(password: &str, hashed: &str) -> PortResult<bool> {
    let parsed = PasswordHash::new(hashed).map_err(|e| {
        error!("Failed to parse password hash: {:?}", e);
        PortError::Unexpected("Authentication error".to_string())
    })?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

pub struct PasswordIdentityProvider {
    accounts: Arc<dyn AccountRepository>,
    session_ttl: Duration,
    auth_session: Mutex<Option<String>>,
    current: watch::Sender<Option<Identity>>,
}

impl PasswordIdentityProvider {
    /// A provider with nobody signed in.
    pub fn new(accounts: Arc<dyn AccountRepository>, session_ttl: Duration) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            accounts,
            session_ttl,
            auth_session: Mutex::new(None),
            current,
        }
    }

    /// A provider for a client that already presented a valid auth session.
    pub fn resumed(
        accounts: Arc<dyn AccountRepository>,
        session_ttl: Duration,
        identity: Identity,
        auth_session_id: String,
    ) -> Self {
        let provider = Self::new(accounts, session_ttl);
        *provider.slot() = Some(auth_session_id);
        provider.current.send_replace(Some(identity));
        provider
    }

    /// The auth session issued by the last successful sign-up or sign-in.
    pub fn auth_session_id(&self) -> Option<String> {
        self.slot().clone()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.auth_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn open_session(&self, identity: Identity) -> PortResult<Identity> {
        let session_id = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + self.session_ttl;
        self.accounts
            .create_auth_session(&session_id, identity.uid, expires_at)
            .await?;
        *self.slot() = Some(session_id);
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }
}

#[async_trait]
impl IdentityProvider for PasswordIdentityProvider {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> PortResult<Identity> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(PortError::InvalidInput(
                "Email and password are required".to_string(),
            ));
        }
        let hashed = hash_password(password)?;
        let identity = self
            .accounts
            .create_user_with_email(email.trim(), display_name, &hashed)
            .await?;
        info!(uid = %identity.uid, "Account created.");
        self.open_session(identity).await
    }

    async fn sign_in(&self, email: &str, password: &str) -> PortResult<Identity> {
        let credentials = match self.accounts.get_user_by_email(email.trim()).await {
            Ok(credentials) => credentials,
            Err(PortError::NotFound(_)) => return Err(PortError::Unauthorized),
            Err(e) => return Err(e),
        };
        if !verify_password(password, &credentials.hashed_password)? {
            return Err(PortError::Unauthorized);
        }
        self.open_session(credentials.identity).await
    }

    async fn sign_out(&self) -> PortResult<()> {
        let session_id = self.slot().take();
        self.current.send_replace(None);
        if let Some(session_id) = session_id {
            self.accounts.delete_auth_session(&session_id).await?;
        }
        Ok(())
    }

    fn changes(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}
