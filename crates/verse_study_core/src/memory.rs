//! crates/verse_study_core/src/memory.rs
//!
//! In-process implementations of the core ports. They back the test suite and
//! any local run that has no database, and they honour the same contracts as
//! the networked adapters: merge semantics, server timestamps and live
//! snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use uuid::Uuid;

use crate::domain::{AccountCredentials, Identity};
use crate::ports::{
    AccountRepository, DocumentStore, IdentityProvider, PortError, PortResult, SnapshotStream,
};
use crate::store::{
    merge_into, resolve_server_timestamps, DocPath, Document, MonotonicClock, Query, WriteMode,
};

const CHANGE_BUFFER: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//=========================================================================================
// MemoryStore
//=========================================================================================

/// A `DocumentStore` held entirely in memory. Cloning shares the same data.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

struct Shared {
    docs: Mutex<BTreeMap<DocPath, Value>>,
    denied: Mutex<Vec<String>>,
    write_delay: Mutex<Option<Duration>>,
    clock: MonotonicClock,
    changes: broadcast::Sender<DocPath>,
    gets: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            shared: Arc::new(Shared {
                docs: Mutex::new(BTreeMap::new()),
                denied: Mutex::new(Vec::new()),
                write_delay: Mutex::new(None),
                clock: MonotonicClock::default(),
                changes,
                gets: AtomicUsize::new(0),
            }),
        }
    }

    /// Rejects every operation on paths starting with `prefix`, the way a
    /// security rule would.
    pub fn deny(&self, prefix: &str) {
        lock(&self.shared.denied).push(prefix.trim_matches('/').to_string());
    }

    /// Delays every write, to mimic a slow network.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *lock(&self.shared.write_delay) = delay;
    }

    /// Number of single-document reads served so far.
    pub fn get_calls(&self) -> usize {
        self.shared.gets.load(Ordering::SeqCst)
    }

    /// Number of documents currently stored under `collection`.
    pub fn count(&self, collection: &str) -> usize {
        lock(&self.shared.docs)
            .keys()
            .filter(|path| path.collection().as_str() == collection)
            .count()
    }

    fn check_access(&self, path: &str) -> PortResult<()> {
        let denied = lock(&self.shared.denied);
        match denied.iter().find(|prefix| path.starts_with(prefix.as_str())) {
            Some(_) => Err(PortError::PermissionDenied(format!(
                "Missing or insufficient permissions for {}",
                path
            ))),
            None => Ok(()),
        }
    }

    fn evaluate(&self, query: &Query) -> Vec<Document> {
        let docs = lock(&self.shared.docs);
        let candidates = docs
            .iter()
            .filter(|(path, _)| path.collection() == &query.collection)
            .map(|(path, data)| Document {
                path: path.clone(),
                data: data.clone(),
            })
            .collect::<Vec<_>>();
        query.apply(candidates)
    }

    fn lookup(&self, path: &DocPath) -> Option<Document> {
        lock(&self.shared.docs).get(path).map(|data| Document {
            path: path.clone(),
            data: data.clone(),
        })
    }

    async fn simulate_latency(&self) {
        let delay = *lock(&self.shared.write_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> PortResult<Option<Document>> {
        self.shared.gets.fetch_add(1, Ordering::SeqCst);
        self.check_access(&path.to_string())?;
        Ok(self.lookup(path))
    }

    async fn query(&self, query: &Query) -> PortResult<Vec<Document>> {
        self.check_access(query.collection.as_str())?;
        Ok(self.evaluate(query))
    }

    async fn set(&self, path: &DocPath, mut data: Value, mode: WriteMode) -> PortResult<()> {
        self.simulate_latency().await;
        self.check_access(&path.to_string())?;
        if !data.is_object() {
            return Err(PortError::InvalidInput(format!(
                "Document body for {} must be an object",
                path
            )));
        }
        resolve_server_timestamps(&mut data, self.shared.clock.now());
        {
            let mut docs = lock(&self.shared.docs);
            let existing = docs.remove(path);
            docs.insert(path.clone(), merge_into(existing, data, mode));
        }
        // No receivers is not an error: nobody is listening yet.
        let _ = self.shared.changes.send(path.clone());
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> PortResult<()> {
        self.simulate_latency().await;
        self.check_access(&path.to_string())?;
        let removed = lock(&self.shared.docs).remove(path).is_some();
        if removed {
            let _ = self.shared.changes.send(path.clone());
        }
        Ok(())
    }

    async fn listen_query(&self, query: &Query) -> PortResult<SnapshotStream<Vec<Document>>> {
        self.check_access(query.collection.as_str())?;
        let mut changes = self.shared.changes.subscribe();
        let store = self.clone();
        let query = query.clone();
        let initial = store.evaluate(&query);

        Ok(Box::pin(async_stream::stream! {
            let mut last = initial.clone();
            yield Ok(initial);
            loop {
                match changes.recv().await {
                    Ok(path) if path.collection() != &query.collection => continue,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                if let Err(e) = store.check_access(query.collection.as_str()) {
                    yield Err(e);
                    break;
                }
                let next = store.evaluate(&query);
                if next != last {
                    last = next.clone();
                    yield Ok(next);
                }
            }
        }))
    }

    async fn listen_doc(&self, path: &DocPath) -> PortResult<SnapshotStream<Option<Document>>> {
        self.check_access(&path.to_string())?;
        let mut changes = self.shared.changes.subscribe();
        let store = self.clone();
        let path = path.clone();
        let initial = store.lookup(&path);

        Ok(Box::pin(async_stream::stream! {
            let mut last = initial.clone();
            yield Ok(initial);
            loop {
                match changes.recv().await {
                    Ok(changed) if changed != path => continue,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                if let Err(e) = store.check_access(&path.to_string()) {
                    yield Err(e);
                    break;
                }
                let next = store.lookup(&path);
                if next != last {
                    last = next.clone();
                    yield Ok(next);
                }
            }
        }))
    }
}

//=========================================================================================
// MemoryIdentityProvider
//=========================================================================================

/// An identity provider with an in-memory account list. Passwords are kept in
/// plain text; use it only in tests and local runs.
pub struct MemoryIdentityProvider {
    accounts: Mutex<HashMap<String, (String, Identity)>>,
    current: watch::Sender<Option<Identity>>,
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            accounts: Mutex::new(HashMap::new()),
            current,
        }
    }

    /// A provider that starts out with `identity` already signed in.
    pub fn signed_in(identity: Identity) -> Self {
        let provider = Self::new();
        provider.current.send_replace(Some(identity));
        provider
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> PortResult<Identity> {
        let identity = {
            let mut accounts = lock(&self.accounts);
            if accounts.contains_key(email) {
                return Err(PortError::InvalidInput(format!(
                    "An account already exists for {}",
                    email
                )));
            }
            let identity = Identity {
                uid: Uuid::new_v4(),
                email: Some(email.to_string()),
                display_name: display_name.map(str::to_string),
            };
            accounts.insert(email.to_string(), (password.to_string(), identity.clone()));
            identity
        };
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_in(&self, email: &str, password: &str) -> PortResult<Identity> {
        let identity = match lock(&self.accounts).get(email) {
            Some((stored, identity)) if stored == password => identity.clone(),
            _ => return Err(PortError::Unauthorized),
        };
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) -> PortResult<()> {
        self.current.send_replace(None);
        Ok(())
    }

    fn changes(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}

//=========================================================================================
// MemoryAccounts
//=========================================================================================

/// An `AccountRepository` held in memory.
#[derive(Default)]
pub struct MemoryAccounts {
    users: Mutex<HashMap<String, AccountCredentials>>,
    sessions: Mutex<HashMap<String, (Uuid, DateTime<Utc>)>>,
}

impl MemoryAccounts {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountRepository for MemoryAccounts {
    async fn create_user_with_email(
        &self,
        email: &str,
        display_name: Option<&str>,
        hashed_password: &str,
    ) -> PortResult<Identity> {
        let mut users = lock(&self.users);
        if users.contains_key(email) {
            return Err(PortError::InvalidInput(format!(
                "An account already exists for {}",
                email
            )));
        }
        let identity = Identity {
            uid: Uuid::new_v4(),
            email: Some(email.to_string()),
            display_name: display_name.map(str::to_string),
        };
        users.insert(
            email.to_string(),
            AccountCredentials {
                identity: identity.clone(),
                hashed_password: hashed_password.to_string(),
            },
        );
        Ok(identity)
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<AccountCredentials> {
        lock(&self.users)
            .get(email)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", email)))
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        lock(&self.sessions).insert(session_id.to_string(), (user_id, expires_at));
        Ok(())
    }

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Identity> {
        let (user_id, expires_at) = lock(&self.sessions)
            .get(session_id)
            .copied()
            .ok_or(PortError::Unauthorized)?;
        if expires_at <= Utc::now() {
            return Err(PortError::Unauthorized);
        }
        lock(&self.users)
            .values()
            .find(|creds| creds.identity.uid == user_id)
            .map(|creds| creds.identity.clone())
            .ok_or(PortError::Unauthorized)
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        lock(&self.sessions).remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{paths, server_timestamp, CollectionPath, Direction};
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_merge_patches_existing_document() {
        let store = MemoryStore::new();
        let path = paths::verse("f1");
        store
            .set(&path, json!({"text": "t", "summary": "old"}), WriteMode::Merge)
            .await
            .unwrap();
        store
            .set(&path, json!({"summary": "new"}), WriteMode::Merge)
            .await
            .unwrap();

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.data, json!({"text": "t", "summary": "new"}));
    }

    #[tokio::test]
    async fn test_server_timestamps_are_resolved() {
        let store = MemoryStore::new();
        let path = CollectionPath::new("c").doc("d");
        store
            .set(&path, json!({"at": server_timestamp()}), WriteMode::Replace)
            .await
            .unwrap();
        let doc = store.get(&path).await.unwrap().unwrap();
        assert!(doc.data["at"].is_string());
    }

    #[tokio::test]
    async fn test_denied_paths_fail() {
        let store = MemoryStore::new();
        store.deny("verses/secret");
        let err = store.get(&paths::verse("secret")).await.unwrap_err();
        assert!(matches!(err, PortError::PermissionDenied(_)));
        assert!(store.get(&paths::verse("open")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listen_query_emits_initial_and_changes() {
        let store = MemoryStore::new();
        let collection = CollectionPath::new("items");
        let query = Query::collection(collection.clone()).order_by("n", Direction::Descending);
        let mut stream = store.listen_query(&query).await.unwrap();

        assert!(stream.next().await.unwrap().unwrap().is_empty());

        store
            .set(&collection.doc("a"), json!({"n": 1}), WriteMode::Replace)
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);

        // A write elsewhere does not produce a snapshot.
        store
            .set(&paths::verse("x"), json!({"text": "x"}), WriteMode::Replace)
            .await
            .unwrap();
        store
            .set(&collection.doc("b"), json!({"n": 2}), WriteMode::Replace)
            .await
            .unwrap();

        let second = stream.next().await.unwrap().unwrap();
        let ids: Vec<&str> = second.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_listen_doc_sees_delete() {
        let store = MemoryStore::new();
        let path = paths::verse("v");
        store
            .set(&path, json!({"text": "v"}), WriteMode::Replace)
            .await
            .unwrap();
        let mut stream = store.listen_doc(&path).await.unwrap();
        assert!(stream.next().await.unwrap().unwrap().is_some());

        store.delete(&path).await.unwrap();
        assert!(stream.next().await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_identity_provider_notifies_changes() {
        let provider = MemoryIdentityProvider::new();
        let mut changes = provider.changes();
        assert!(changes.borrow().is_none());

        let identity = provider.sign_up("a@example.com", "pw", Some("A")).await.unwrap();
        changes.changed().await.unwrap();
        assert_eq!(changes.borrow().as_ref(), Some(&identity));

        provider.sign_out().await.unwrap();
        changes.changed().await.unwrap();
        assert!(changes.borrow().is_none());

        assert_eq!(
            provider.sign_in("a@example.com", "wrong").await.unwrap_err(),
            PortError::Unauthorized
        );
    }

    #[tokio::test]
    async fn test_memory_accounts_expire_sessions() {
        let accounts = MemoryAccounts::new();
        let identity = accounts
            .create_user_with_email("b@example.com", None, "hash")
            .await
            .unwrap();
        accounts
            .create_auth_session("live", identity.uid, Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        accounts
            .create_auth_session("stale", identity.uid, Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();

        assert_eq!(accounts.validate_auth_session("live").await.unwrap(), identity);
        assert!(accounts.validate_auth_session("stale").await.is_err());
        accounts.delete_auth_session("live").await.unwrap();
        assert!(accounts.validate_auth_session("live").await.is_err());
    }
}
