//! crates/verse_study_core/src/session.rs
//!
//! The session context: one explicit object, created when the application
//! starts, that owns the store handle, the write dispatcher, the error channel
//! and the current identity. Everything that touches per-user data is handed a
//! reference to it instead of looking anything up globally.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatcher::{ErrorChannel, WriteDispatcher};
use crate::domain::Identity;
use crate::ports::{DocumentStore, IdentityProvider, PortResult};

pub struct SessionContext {
    store: Arc<dyn DocumentStore>,
    provider: Arc<dyn IdentityProvider>,
    identity: watch::Receiver<Option<Identity>>,
    dispatcher: WriteDispatcher,
    errors: ErrorChannel,
    shutdown: CancellationToken,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl SessionContext {
    /// Starts the session: subscribes to the identity provider's change
    /// stream and prepares the write path. Must be called from within a Tokio
    /// runtime.
    pub fn start(store: Arc<dyn DocumentStore>, provider: Arc<dyn IdentityProvider>) -> Self {
        let errors = ErrorChannel::new();
        let dispatcher = WriteDispatcher::new(store.clone(), errors.clone());

        let mut upstream = provider.changes();
        let initial = upstream.borrow_and_update().clone();
        let (identity_tx, identity) = watch::channel(initial);
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = upstream.changed() => {
                        if changed.is_err() {
                            warn!("Identity provider closed its change stream.");
                            break;
                        }
                        let next = upstream.borrow_and_update().clone();
                        info!(uid = ?next.as_ref().map(|i| i.uid), "Identity changed.");
                        identity_tx.send_replace(next);
                    }
                }
            }
            identity_tx.send_replace(None);
        });

        info!("Session context started.");
        Self {
            store,
            provider,
            identity,
            dispatcher,
            errors,
            shutdown,
            forwarder: Mutex::new(Some(forwarder)),
        }
    }

    /// The signed-in identity, or `None` when nobody is logged in.
    pub fn identity(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    /// A receiver notified whenever the identity changes.
    pub fn watch_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.clone()
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    pub fn dispatcher(&self) -> &WriteDispatcher {
        &self.dispatcher
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    pub async fn sign_out(&self) -> PortResult<()> {
        self.provider.sign_out().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Unsubscribes from the identity provider and lets in-flight writes
    /// drain. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(forwarder) = forwarder {
            if let Err(e) = forwarder.await {
                warn!(error = %e, "Identity forwarder ended abnormally.");
            }
        }
        self.dispatcher.settle().await;
        info!("Session context shut down.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryIdentityProvider, MemoryStore};
    use crate::store::{paths, WriteMode};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn identity() -> Identity {
        Identity {
            uid: Uuid::new_v4(),
            email: Some("u1@example.com".to_string()),
            display_name: None,
        }
    }

    #[tokio::test]
    async fn test_start_picks_up_current_identity() {
        let who = identity();
        let provider = Arc::new(MemoryIdentityProvider::signed_in(who.clone()));
        let ctx = SessionContext::start(Arc::new(MemoryStore::new()), provider);
        assert_eq!(ctx.identity(), Some(who));
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_identity_changes_are_forwarded() {
        let provider = Arc::new(MemoryIdentityProvider::signed_in(identity()));
        let ctx = SessionContext::start(Arc::new(MemoryStore::new()), provider);
        let mut rx = ctx.watch_identity();

        ctx.sign_out().await.unwrap();
        timeout(Duration::from_secs(2), rx.wait_for(|id| id.is_none()))
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.identity().is_none());
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_clears_identity_and_drains_writes() {
        let store = MemoryStore::new();
        store.set_write_delay(Some(Duration::from_millis(50)));
        let provider = Arc::new(MemoryIdentityProvider::signed_in(identity()));
        let ctx = SessionContext::start(Arc::new(store.clone()), provider);

        ctx.dispatcher()
            .set(paths::verse("v"), json!({"text": "v"}), WriteMode::Merge);
        timeout(Duration::from_secs(2), ctx.shutdown()).await.unwrap();

        assert!(ctx.is_shut_down());
        assert!(ctx.identity().is_none());
        assert!(store.get(&paths::verse("v")).await.unwrap().is_some());
        // A second shutdown is harmless.
        ctx.shutdown().await;
    }
}
