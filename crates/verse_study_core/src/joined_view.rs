//! crates/verse_study_core/src/joined_view.rs
//!
//! The library view: a user's `userVerses` references joined with the shared
//! `verses` documents they point to.
//!
//! The reference list comes from a live subscription ordered by
//! `savedTimestamp` descending. Each referenced verse is fetched once and kept
//! in a key -> document cache that only grows for the life of the view. A
//! failed fetch is isolated to its key: the key is logged, left out of the
//! cache and therefore out of the rows, and not retried. A verse that simply
//! does not exist yet is looked up again on the next reference emission.

use chrono::NaiveDate;
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{Identity, LibraryEntry, UserVerseReference, VerseDocument};
use crate::library::user_verses_query;
use crate::ports::{DocumentStore, PortError};
use crate::session::SessionContext;
use crate::store::{paths, Document};
use crate::subscription::{CollectionSubscription, QueryState, Subscription};

/// Client-side filters applied after the join.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryFilter {
    /// Case-insensitive substring over the verse text and analysis fields.
    pub search: Option<String>,
    /// Exact UTC calendar date of `savedTimestamp`.
    pub date: Option<NaiveDate>,
}

impl LibraryFilter {
    pub fn is_active(&self) -> bool {
        self.date.is_some() || self.search_term().is_some()
    }

    pub fn matches(&self, entry: &LibraryEntry) -> bool {
        let search_ok = self
            .search_term()
            .map_or(true, |term| entry.verse.contains_text(term));
        let date_ok = self
            .date
            .map_or(true, |date| entry.saved_timestamp.date_naive() == date);
        search_ok && date_ok
    }

    fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    /// Only join the most recent `limit` references.
    pub limit: Option<usize>,
    pub filter: LibraryFilter,
}

/// What the library view renders.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedState {
    /// Resolved, filtered rows in descending `savedTimestamp` order.
    pub entries: Vec<LibraryEntry>,
    /// Number of references before joining and filtering.
    pub total_references: usize,
    pub is_loading: bool,
    /// Whether a client-side filter was applied to `entries`.
    pub filtered: bool,
    pub error: Option<PortError>,
}

impl JoinedState {
    fn loading() -> Self {
        Self {
            entries: Vec::new(),
            total_references: 0,
            is_loading: true,
            filtered: false,
            error: None,
        }
    }

    fn failed(error: PortError) -> Self {
        Self {
            entries: Vec::new(),
            total_references: 0,
            is_loading: false,
            filtered: false,
            error: Some(error),
        }
    }

    /// The message to show instead of rows, if any.
    pub fn empty_message(&self) -> Option<&'static str> {
        if self.error.is_some() {
            return Some("Your library could not be loaded. Please try again.");
        }
        if self.is_loading || !self.entries.is_empty() {
            return None;
        }
        if self.total_references == 0 {
            Some("Your library is empty.")
        } else if self.filtered {
            Some("No verses match your filters.")
        } else {
            Some("Your saved verses could not be loaded. Please try again.")
        }
    }
}

/// A live joined view. Dropping it tears down its subscription.
pub struct JoinedView {
    state: watch::Receiver<JoinedState>,
    filter: watch::Sender<LibraryFilter>,
    task: JoinHandle<()>,
}

impl JoinedView {
    /// Opens the view for whoever is signed in to `ctx`, following identity
    /// changes for as long as the view lives.
    pub fn open(ctx: &SessionContext, options: JoinOptions) -> Self {
        let identity = ctx.watch_identity();
        let descriptor = identity
            .borrow()
            .as_ref()
            .map(|who| user_verses_query(who.uid, options.limit));
        let refs = Subscription::new(ctx.store(), descriptor);

        let (state_tx, state) = watch::channel(JoinedState::loading());
        let (filter, filter_rx) = watch::channel(options.filter);
        let joiner = Joiner::new(ctx.store());
        let task = tokio::spawn(run(
            joiner,
            refs,
            identity,
            options.limit,
            filter_rx,
            state_tx,
        ));

        Self {
            state,
            filter,
            task,
        }
    }

    /// Replaces the client-side filter. No store traffic is caused by this.
    pub fn set_filter(&self, filter: LibraryFilter) {
        self.filter.send_replace(filter);
    }

    pub fn state(&self) -> JoinedState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<JoinedState> {
        self.state.clone()
    }

    /// Waits for the first completed join (or a terminal error).
    pub async fn wait_until_loaded(&self) -> JoinedState {
        let mut rx = self.state.clone();
        let result = match rx.wait_for(|state| !state.is_loading).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        result
    }
}

impl Drop for JoinedView {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut joiner: Joiner,
    mut refs: CollectionSubscription,
    mut identity: watch::Receiver<Option<Identity>>,
    limit: Option<usize>,
    mut filter: watch::Receiver<LibraryFilter>,
    state: watch::Sender<JoinedState>,
) {
    let mut snapshots = refs.watch();
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        let current_filter = filter.borrow_and_update().clone();
        let next = joiner.join(&snapshot, &current_filter).await;
        state.send_replace(next);

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = filter.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = identity.changed() => {
                if changed.is_err() {
                    break;
                }
                let descriptor = identity
                    .borrow_and_update()
                    .as_ref()
                    .map(|who| user_verses_query(who.uid, limit));
                refs.set_descriptor(descriptor);
            }
        }
    }
}

/// Owns the verse cache. Nothing outside this type writes to it.
struct Joiner {
    store: Arc<dyn DocumentStore>,
    cache: HashMap<String, VerseDocument>,
    failed: HashSet<String>,
    resolved_for: Option<Vec<Document>>,
}

impl Joiner {
    fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            cache: HashMap::new(),
            failed: HashSet::new(),
            resolved_for: None,
        }
    }

    async fn join(
        &mut self,
        snapshot: &QueryState<Vec<Document>>,
        filter: &LibraryFilter,
    ) -> JoinedState {
        if snapshot.is_loading {
            return JoinedState::loading();
        }
        if let Some(e) = &snapshot.error {
            return JoinedState::failed(e.clone());
        }

        let references = decode_references(&snapshot.data);
        if self.resolved_for.as_ref() != Some(&snapshot.data) {
            self.resolve(&references).await;
            self.resolved_for = Some(snapshot.data.clone());
        }

        let entries = references
            .iter()
            .filter_map(|reference| {
                self.cache.get(&reference.verse_id).map(|verse| LibraryEntry {
                    verse_id: reference.verse_id.clone(),
                    saved_timestamp: reference.saved_timestamp,
                    verse: verse.clone(),
                })
            })
            .filter(|entry| filter.matches(entry))
            .collect();

        JoinedState {
            entries,
            total_references: references.len(),
            is_loading: false,
            filtered: filter.is_active(),
            error: None,
        }
    }

    /// Fetches every referenced verse that is neither cached nor known to fail.
    /// Fetches for distinct keys run concurrently.
    async fn resolve(&mut self, references: &[UserVerseReference]) {
        let missing: BTreeSet<String> = references
            .iter()
            .map(|reference| reference.verse_id.clone())
            .filter(|key| !self.cache.contains_key(key) && !self.failed.contains(key))
            .collect();
        if missing.is_empty() {
            return;
        }

        debug!(count = missing.len(), "Resolving referenced verses.");
        let fetches = missing.into_iter().map(|key| {
            let store = self.store.clone();
            async move {
                let result = store
                    .get(&paths::verse(&key))
                    .await
                    .and_then(|doc| doc.map(|d| d.decode::<VerseDocument>()).transpose());
                (key, result)
            }
        });

        for (key, result) in join_all(fetches).await {
            match result {
                Ok(Some(verse)) => {
                    self.cache.insert(key, verse);
                }
                Ok(None) => debug!(verse_id = %key, "Referenced verse does not exist yet."),
                Err(e) => {
                    warn!(verse_id = %key, error = %e, "Could not resolve referenced verse; omitting it.");
                    self.failed.insert(key);
                }
            }
        }
    }
}

fn decode_references(docs: &[Document]) -> Vec<UserVerseReference> {
    docs.iter()
        .filter_map(|doc| match doc.decode::<UserVerseReference>() {
            Ok(mut reference) => {
                reference.id = doc.id().to_string();
                Some(reference)
            }
            Err(e) => {
                warn!(path = %doc.path, error = %e, "Skipping malformed library reference.");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VerseAnalysis;
    use chrono::{TimeZone, Utc};

    fn entry(text: &str, summary: &str, day: u32) -> LibraryEntry {
        LibraryEntry {
            verse_id: text.to_string(),
            saved_timestamp: Utc.with_ymd_and_hms(2024, 3, day, 10, 0, 0).unwrap(),
            verse: VerseDocument {
                text: text.to_string(),
                analysis: VerseAnalysis {
                    summary: summary.to_string(),
                    ..Default::default()
                },
            },
        }
    }

    #[test]
    fn test_search_is_case_insensitive_substring() {
        let filter = LibraryFilter {
            search: Some("  DUTY ".to_string()),
            date: None,
        };
        assert!(filter.matches(&entry("कर्मण्येव", "On duty without attachment", 1)));
        assert!(!filter.matches(&entry("उद्यमेन", "Effort over wishing", 1)));
    }

    #[test]
    fn test_date_filter_matches_calendar_day() {
        let filter = LibraryFilter {
            search: None,
            date: NaiveDate::from_ymd_opt(2024, 3, 2),
        };
        assert!(filter.matches(&entry("a", "", 2)));
        assert!(!filter.matches(&entry("a", "", 3)));
    }

    #[test]
    fn test_blank_search_is_inactive() {
        let filter = LibraryFilter {
            search: Some("   ".to_string()),
            date: None,
        };
        assert!(!filter.is_active());
        assert!(filter.matches(&entry("a", "", 1)));
    }

    #[test]
    fn test_empty_messages() {
        let mut state = JoinedState {
            entries: Vec::new(),
            total_references: 0,
            is_loading: false,
            filtered: false,
            error: None,
        };
        assert_eq!(state.empty_message(), Some("Your library is empty."));
        state.total_references = 3;
        assert_eq!(
            state.empty_message(),
            Some("Your saved verses could not be loaded. Please try again.")
        );
        state.filtered = true;
        assert_eq!(state.empty_message(), Some("No verses match your filters."));
        state.is_loading = true;
        assert_eq!(state.empty_message(), None);
        assert!(JoinedState::failed(PortError::Unauthorized)
            .empty_message()
            .is_some());
    }
}
