//! End-to-end library behaviour against the in-memory adapters.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use verse_study_core::analysis::{recommend_from_library, RecommendOutcome};
use verse_study_core::daily::{generate_daily_verse, todays_verse, DailyLookup, PublishOutcome};
use verse_study_core::fingerprint::derive_id;
use verse_study_core::library::{remove_verse, save_verse, SaveOutcome};
use verse_study_core::memory::{MemoryIdentityProvider, MemoryStore};
use serde_json::json;
use verse_study_core::store::{paths, server_timestamp, WriteMode};
use verse_study_core::{
    DocumentStore, GeneratedDailyVerse, Identity, IdentityProvider, JoinOptions, JoinedState,
    JoinedView, LibraryFilter, PortResult, Recommendation, ScannedVerse, SessionContext,
    VerseAnalysis, VerseAnalysisService, WordAnalysis,
};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct FakeAnalysis {
    recommend_calls: AtomicUsize,
}

#[async_trait]
impl VerseAnalysisService for FakeAnalysis {
    async fn analyze_verse(&self, verse_text: &str) -> PortResult<VerseAnalysis> {
        Ok(analysis_for(verse_text))
    }

    async fn explain_word(&self, word: &str) -> PortResult<WordAnalysis> {
        Ok(WordAnalysis {
            meaning: format!("meaning of {}", word),
            english_translation: word.to_string(),
            grammatical_analysis: "noun".to_string(),
            usage_example: word.to_string(),
        })
    }

    async fn scan_verse_image(&self, _image_data_uri: &str) -> PortResult<ScannedVerse> {
        Ok(ScannedVerse {
            verse_text: "scanned".to_string(),
            analysis: analysis_for("scanned"),
        })
    }

    async fn generate_daily_verse(&self) -> PortResult<GeneratedDailyVerse> {
        Ok(GeneratedDailyVerse {
            verse_text: "योगः कर्मसु कौशलम्".to_string(),
            source: "Bhagavad Gita".to_string(),
            chapter: 2,
            verse: 50,
            analysis: analysis_for("योगः कर्मसु कौशलम्"),
        })
    }

    async fn recommend_verse(
        &self,
        interaction_history: &str,
        _preferences: &str,
    ) -> PortResult<Recommendation> {
        self.recommend_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Recommendation {
            recommended_shloka: "उद्धरेदात्मनात्मानं".to_string(),
            reasoning: format!("Based on {} lines of history", interaction_history.lines().count()),
        })
    }
}

fn analysis_for(text: &str) -> VerseAnalysis {
    VerseAnalysis {
        transliteration: format!("translit {}", text),
        word_meanings: String::new(),
        grammar_tags: String::new(),
        english_translation: format!("translation {}", text),
        summary: format!("summary {}", text),
    }
}

fn user(name: &str) -> Identity {
    Identity {
        uid: Uuid::new_v4(),
        email: Some(format!("{}@example.com", name)),
        display_name: Some(name.to_string()),
    }
}

fn session(store: &MemoryStore, who: Identity) -> SessionContext {
    SessionContext::start(
        Arc::new(store.clone()),
        Arc::new(MemoryIdentityProvider::signed_in(who)),
    )
}

async fn save(ctx: &SessionContext, text: &str) -> String {
    match save_verse(ctx, text, &analysis_for(text)).await.unwrap() {
        SaveOutcome::Saved { verse_id } => verse_id,
        other => panic!("expected a fresh save, got {:?}", other),
    }
}

async fn wait_for(view: &JoinedView, pred: impl Fn(&JoinedState) -> bool) -> JoinedState {
    let mut rx = view.watch();
    let state = timeout(WAIT, rx.wait_for(|s| !s.is_loading && pred(s)))
        .await
        .expect("timed out waiting for the library view")
        .expect("library view closed");
    let state = state.clone();
    state
}

#[tokio::test]
async fn test_two_users_share_one_verse_document() {
    let store = MemoryStore::new();
    let u1 = session(&store, user("u1"));
    let u2 = session(&store, user("u2"));

    let id1 = save(&u1, "धर्मक्षेत्रे कुरुक्षेत्रे").await;
    let id2 = save(&u2, "धर्मक्षेत्रे कुरुक्षेत्रे").await;
    assert_eq!(id1, id2);
    u1.dispatcher().settle().await;
    u2.dispatcher().settle().await;

    assert_eq!(store.count(paths::VERSES), 1);
    for ctx in [&u1, &u2] {
        let view = JoinedView::open(ctx, JoinOptions::default());
        let state = wait_for(&view, |s| s.entries.len() == 1).await;
        assert_eq!(state.entries[0].verse_id, id1);
    }
}

#[tokio::test]
async fn test_saving_twice_is_idempotent() {
    let store = MemoryStore::new();
    let who = user("u1");
    let ctx = session(&store, who.clone());

    let id = save(&ctx, "सत्यमेव जयते").await;
    ctx.dispatcher().settle().await;
    let again = save_verse(&ctx, "सत्यमेव जयते", &analysis_for("x")).await.unwrap();
    assert_eq!(again, SaveOutcome::AlreadySaved { verse_id: id.clone() });
    ctx.dispatcher().settle().await;

    assert_eq!(store.count(paths::user_verses(who.uid).as_str()), 1);
    // Nothing was overwritten by the second attempt.
    let verse = store.get(&paths::verse(&id)).await.unwrap().unwrap();
    assert_eq!(verse.data["summary"], "summary सत्यमेव जयते");
}

#[tokio::test]
async fn test_live_view_follows_saves_and_removals() {
    let store = MemoryStore::new();
    let ctx = session(&store, user("u1"));
    let view = JoinedView::open(&ctx, JoinOptions::default());

    let empty = view.wait_until_loaded().await;
    assert_eq!(empty.empty_message(), Some("Your library is empty."));

    let first = save(&ctx, "first verse").await;
    wait_for(&view, |s| s.entries.len() == 1).await;
    let second = save(&ctx, "second verse").await;
    let state = wait_for(&view, |s| s.entries.len() == 2).await;
    // Newest first.
    assert_eq!(state.entries[0].verse_id, second);
    assert_eq!(state.entries[1].verse_id, first);

    remove_verse(&ctx, &first).unwrap();
    let state = wait_for(&view, |s| s.entries.len() == 1).await;
    assert_eq!(state.entries[0].verse_id, second);

    ctx.dispatcher().settle().await;
    assert!(store.get(&paths::verse(&first)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_verse_fetch_only_hides_that_verse() {
    let store = MemoryStore::new();
    let ctx = session(&store, user("u1"));
    let a = save(&ctx, "verse a").await;
    let b = save(&ctx, "verse b").await;
    ctx.dispatcher().settle().await;

    store.deny(&paths::verse(&b).to_string());
    let view = JoinedView::open(&ctx, JoinOptions::default());
    let state = view.wait_until_loaded().await;

    assert!(state.error.is_none());
    assert_eq!(state.total_references, 2);
    assert_eq!(state.entries.len(), 1);
    assert_eq!(state.entries[0].verse_id, a);
}

#[tokio::test]
async fn test_unresolved_library_without_filter_reports_load_problem() {
    let store = MemoryStore::new();
    let ctx = session(&store, user("u1"));
    save(&ctx, "verse a").await;
    ctx.dispatcher().settle().await;

    store.deny(paths::VERSES);
    let view = JoinedView::open(&ctx, JoinOptions::default());
    let state = view.wait_until_loaded().await;

    assert!(state.entries.is_empty());
    assert_eq!(state.total_references, 1);
    assert!(!state.filtered);
    assert_eq!(
        state.empty_message(),
        Some("Your saved verses could not be loaded. Please try again.")
    );
}

#[tokio::test]
async fn test_filters_are_client_side() {
    let store = MemoryStore::new();
    let ctx = session(&store, user("u1"));
    save(&ctx, "कर्मण्येवाधिकारस्ते").await;
    save(&ctx, "उद्यमेन हि सिध्यन्ति").await;
    ctx.dispatcher().settle().await;

    let view = JoinedView::open(&ctx, JoinOptions::default());
    wait_for(&view, |s| s.entries.len() == 2).await;
    let reads = store.get_calls();

    view.set_filter(LibraryFilter {
        search: Some("उद्यमेन".to_string()),
        date: None,
    });
    let state = wait_for(&view, |s| s.entries.len() == 1).await;
    assert_eq!(state.total_references, 2);

    view.set_filter(LibraryFilter {
        search: None,
        date: NaiveDate::from_ymd_opt(1999, 1, 1),
    });
    let state = wait_for(&view, |s| s.entries.is_empty()).await;
    assert_eq!(state.empty_message(), Some("No verses match your filters."));

    view.set_filter(LibraryFilter {
        search: None,
        date: Some(Utc::now().date_naive()),
    });
    wait_for(&view, |s| s.entries.len() == 2).await;

    // Every verse was served from the view's cache.
    assert_eq!(store.get_calls(), reads);
}

#[tokio::test]
async fn test_cached_verses_are_not_fetched_again() {
    let store = MemoryStore::new();
    let ctx = session(&store, user("u1"));
    save(&ctx, "one").await;
    ctx.dispatcher().settle().await;

    let view = JoinedView::open(&ctx, JoinOptions::default());
    wait_for(&view, |s| s.entries.len() == 1).await;
    let before = store.get_calls();

    save(&ctx, "two").await;
    wait_for(&view, |s| s.entries.len() == 2).await;
    // One read for the save's existence check, one for the new verse.
    assert_eq!(store.get_calls(), before + 2);
}

#[tokio::test]
async fn test_signed_out_view_is_empty_and_follows_sign_in() {
    let store = MemoryStore::new();
    let provider = Arc::new(MemoryIdentityProvider::new());
    let ctx = SessionContext::start(Arc::new(store.clone()), provider.clone());

    let view = JoinedView::open(&ctx, JoinOptions::default());
    let state = view.wait_until_loaded().await;
    assert!(state.entries.is_empty());
    assert_eq!(state.empty_message(), Some("Your library is empty."));

    let who = provider
        .sign_up("reader@example.com", "secret", Some("Reader"))
        .await
        .unwrap();
    timeout(WAIT, ctx.watch_identity().wait_for(|id| id.is_some()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ctx.identity().map(|id| id.uid), Some(who.uid));

    save(&ctx, "after sign in").await;
    wait_for(&view, |s| s.entries.len() == 1).await;

    ctx.sign_out().await.unwrap();
    wait_for(&view, |s| s.entries.is_empty() && s.total_references == 0).await;
}

#[tokio::test]
async fn test_limit_keeps_most_recent() {
    let store = MemoryStore::new();
    let ctx = session(&store, user("u1"));
    for text in ["a", "b", "c"] {
        save(&ctx, text).await;
        ctx.dispatcher().settle().await;
    }

    let view = JoinedView::open(
        &ctx,
        JoinOptions {
            limit: Some(2),
            filter: LibraryFilter::default(),
        },
    );
    let state = wait_for(&view, |s| s.entries.len() == 2).await;
    assert_eq!(state.entries[0].verse_id, derive_id("c"));
    assert_eq!(state.entries[1].verse_id, derive_id("b"));
}

#[tokio::test]
async fn test_recommendations_need_history() {
    let store = MemoryStore::new();
    let ctx = session(&store, user("u1"));
    let service = FakeAnalysis::default();

    let outcome = recommend_from_library(&ctx, &service).await.unwrap();
    assert_eq!(outcome, RecommendOutcome::NotEnoughData);
    assert_eq!(service.recommend_calls.load(Ordering::SeqCst), 0);

    save(&ctx, "सत्यमेव जयते").await;
    ctx.dispatcher().settle().await;

    let outcome = recommend_from_library(&ctx, &service).await.unwrap();
    let RecommendOutcome::Recommended(recommended) = outcome else {
        panic!("expected a recommendation, got {:?}", outcome);
    };
    assert_eq!(recommended.recommendation.reasoning, "Based on 2 lines of history");
    assert_eq!(
        recommended.analysis.summary,
        "summary उद्धरेदात्मनात्मानं"
    );
}

#[tokio::test]
async fn test_recommendation_skips_malformed_history_entries() {
    let store = MemoryStore::new();
    let who = user("u1");
    let ctx = session(&store, who.clone());
    let service = FakeAnalysis::default();
    save(&ctx, "सत्यमेव जयते").await;
    ctx.dispatcher().settle().await;

    store
        .set(&paths::verse("bad"), json!({"text": 5}), WriteMode::Replace)
        .await
        .unwrap();
    store
        .set(
            &paths::user_verse(who.uid, "bad"),
            json!({"verseId": "bad", "savedTimestamp": server_timestamp()}),
            WriteMode::Replace,
        )
        .await
        .unwrap();
    store
        .set(
            &paths::user_verse(who.uid, "broken"),
            json!({"verseId": 7, "savedTimestamp": server_timestamp()}),
            WriteMode::Replace,
        )
        .await
        .unwrap();

    let view = JoinedView::open(&ctx, JoinOptions::default());
    let state = wait_for(&view, |s| s.entries.len() == 1).await;
    assert_eq!(state.entries[0].verse_id, derive_id("सत्यमेव जयते"));

    let outcome = recommend_from_library(&ctx, &service).await.unwrap();
    let RecommendOutcome::Recommended(recommended) = outcome else {
        panic!("expected a recommendation, got {:?}", outcome);
    };
    // Only the good verse made it into the two-line history.
    assert_eq!(recommended.recommendation.reasoning, "Based on 2 lines of history");
    assert_eq!(service.recommend_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_daily_verse_round_trip() {
    let store = MemoryStore::new();
    let ctx = session(&store, user("u1"));
    let service = FakeAnalysis::default();
    let today = Utc::now().date_naive();

    assert_eq!(todays_verse(&ctx, today).await.unwrap(), DailyLookup::NoneToday);

    let outcome = generate_daily_verse(&ctx, &service, today).await.unwrap();
    let PublishOutcome::Published { verse_id, .. } = outcome else {
        panic!("expected a published verse, got {:?}", outcome);
    };
    ctx.dispatcher().settle().await;

    let DailyLookup::Found(record) = todays_verse(&ctx, today).await.unwrap() else {
        panic!("expected today's verse");
    };
    assert_eq!(record.verse_id, verse_id);
    assert_eq!(record.verse_chapter, 2);
    assert_eq!(record.verse_number, 50);
    assert!(store.get(&paths::verse(&verse_id)).await.unwrap().is_some());
}
