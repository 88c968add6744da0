//! crates/verse_study_core/src/subscription.rs
//!
//! Live read subscriptions. A `Subscription` binds a query or a single
//! document reference to the store and exposes the tri-state
//! `{data, is_loading, error}` result through a `watch` channel.
//!
//! The descriptor is compared by value: handing the same query in again is a
//! no-op, a different one tears the old listener down before the new one is
//! established. A `None` descriptor means "not ready to query yet" and settles
//! immediately on an empty, non-loading state.

use async_trait::async_trait;
use futures::StreamExt;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ports::{DocumentStore, PortError, PortResult, SnapshotStream};
use crate::store::{DocPath, Document, Query};

/// Something a subscription can listen to.
#[async_trait]
pub trait Descriptor: Debug + Clone + PartialEq + Send + Sync + 'static {
    /// What a snapshot of this descriptor looks like. `Default` is the empty result.
    type Output: Debug + Clone + Default + Send + Sync + 'static;

    async fn listen(&self, store: &dyn DocumentStore) -> PortResult<SnapshotStream<Self::Output>>;
}

#[async_trait]
impl Descriptor for Query {
    type Output = Vec<Document>;

    async fn listen(&self, store: &dyn DocumentStore) -> PortResult<SnapshotStream<Vec<Document>>> {
        store.listen_query(self).await
    }
}

#[async_trait]
impl Descriptor for DocPath {
    type Output = Option<Document>;

    async fn listen(
        &self,
        store: &dyn DocumentStore,
    ) -> PortResult<SnapshotStream<Option<Document>>> {
        store.listen_doc(self).await
    }
}

/// The observable result of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    pub data: T,
    pub is_loading: bool,
    pub error: Option<PortError>,
}

impl<T: Default> QueryState<T> {
    pub fn loading() -> Self {
        Self {
            data: T::default(),
            is_loading: true,
            error: None,
        }
    }

    /// The terminal state of a subscription that was never established.
    pub fn idle() -> Self {
        Self {
            data: T::default(),
            is_loading: false,
            error: None,
        }
    }

    pub fn ready(data: T) -> Self {
        Self {
            data,
            is_loading: false,
            error: None,
        }
    }

    pub fn failed(error: PortError) -> Self {
        Self {
            data: T::default(),
            is_loading: false,
            error: Some(error),
        }
    }
}

pub type CollectionSubscription = Subscription<Query>;
pub type DocumentSubscription = Subscription<DocPath>;

/// A live subscription owned by one scope. Dropping it unsubscribes.
pub struct Subscription<D: Descriptor> {
    store: Arc<dyn DocumentStore>,
    descriptor: Option<D>,
    state: Arc<watch::Sender<QueryState<D::Output>>>,
    epoch: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl<D: Descriptor> Subscription<D> {
    /// Creates the subscription and, if `descriptor` is present, starts
    /// listening. Must be called from within a Tokio runtime.
    pub fn new(store: Arc<dyn DocumentStore>, descriptor: Option<D>) -> Self {
        let (state, _) = watch::channel(QueryState::loading());
        let mut subscription = Self {
            store,
            descriptor: None,
            state: Arc::new(state),
            epoch: Arc::new(AtomicU64::new(0)),
            task: None,
        };
        subscription.establish(descriptor);
        subscription
    }

    /// Points the subscription at a new descriptor. Returns `true` if it
    /// re-subscribed, `false` if the descriptor was equal to the current one.
    pub fn set_descriptor(&mut self, descriptor: Option<D>) -> bool {
        if self.descriptor == descriptor {
            return false;
        }
        self.establish(descriptor);
        true
    }

    pub fn descriptor(&self) -> Option<&D> {
        self.descriptor.as_ref()
    }

    /// A copy of the current state.
    pub fn state(&self) -> QueryState<D::Output> {
        self.state.borrow().clone()
    }

    /// A receiver that is notified on every state change.
    pub fn watch(&self) -> watch::Receiver<QueryState<D::Output>> {
        self.state.subscribe()
    }

    /// Waits until the current descriptor has produced data or failed.
    pub async fn settled(&self) -> QueryState<D::Output> {
        let mut rx = self.watch();
        let result = match rx.wait_for(|state| !state.is_loading).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        result
    }

    fn establish(&mut self, descriptor: Option<D>) {
        self.teardown();

        let mut epoch = 0;
        let listening = descriptor.is_some();
        let counter = &self.epoch;
        self.state.send_modify(|state| {
            // Bumped under the channel lock so a stale listener can never
            // publish after this point.
            epoch = counter.fetch_add(1, Ordering::SeqCst) + 1;
            *state = if listening {
                QueryState::loading()
            } else {
                QueryState::idle()
            };
        });

        self.descriptor = descriptor.clone();
        if let Some(descriptor) = descriptor {
            debug!(?descriptor, "Establishing subscription.");
            self.task = Some(tokio::spawn(drive(
                self.store.clone(),
                descriptor,
                self.state.clone(),
                epoch,
                self.epoch.clone(),
            )));
        }
    }

    fn teardown(&mut self) {
        if let Some(task) = self.task.take() {
            debug!(descriptor = ?self.descriptor, "Tearing down subscription.");
            task.abort();
        }
    }
}

impl<D: Descriptor> Drop for Subscription<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Pumps snapshots from the store into the state channel until the stream
/// ends, fails, or the task is aborted.
async fn drive<D: Descriptor>(
    store: Arc<dyn DocumentStore>,
    descriptor: D,
    state: Arc<watch::Sender<QueryState<D::Output>>>,
    epoch: u64,
    current_epoch: Arc<AtomicU64>,
) {
    let publish = |next: QueryState<D::Output>| {
        state.send_if_modified(|slot| {
            if current_epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            *slot = next;
            true
        });
    };

    let mut stream = match descriptor.listen(store.as_ref()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(?descriptor, error = %e, "Subscription was rejected by the store.");
            publish(QueryState::failed(e));
            return;
        }
    };

    while let Some(snapshot) = stream.next().await {
        match snapshot {
            Ok(data) => publish(QueryState::ready(data)),
            Err(e) => {
                warn!(?descriptor, error = %e, "Subscription failed.");
                publish(QueryState::failed(e));
                return;
            }
        }
    }
}
