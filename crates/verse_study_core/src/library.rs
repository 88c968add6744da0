//! crates/verse_study_core/src/library.rs
//!
//! Saving verses to, and removing them from, the signed-in user's library.
//!
//! A save writes two documents: the shared `verses/{fingerprint}` record
//! (merged, so concurrent savers converge) and the caller's
//! `users/{uid}/userVerses/{fingerprint}` reference. Removing only deletes the
//! reference; the shared record is left for other users.

use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::dispatcher::WriteDispatcher;
use crate::domain::{Identity, VerseAnalysis, VerseDocument};
use crate::fingerprint::derive_id;
use crate::ports::{PortError, PortResult};
use crate::session::SessionContext;
use crate::store::{paths, server_timestamp, Direction, Query, WriteMode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaveOutcome {
    Saved { verse_id: String },
    /// The user's reference already existed; nothing was written.
    AlreadySaved { verse_id: String },
    SignedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoveOutcome {
    Removed { verse_id: String },
    SignedOut,
}

/// The user's references, newest first.
pub fn user_verses_query(uid: Uuid, limit: Option<usize>) -> Query {
    let query = Query::collection(paths::user_verses(uid))
        .order_by("savedTimestamp", Direction::Descending);
    match limit {
        Some(limit) => query.limit(limit),
        None => query,
    }
}

/// Saves `text` and its analysis for the signed-in user.
///
/// The existence check is an awaited read; the writes themselves are
/// dispatched and their failures surface on the session's error channel.
pub async fn save_verse(
    ctx: &SessionContext,
    text: &str,
    analysis: &VerseAnalysis,
) -> PortResult<SaveOutcome> {
    if text.trim().is_empty() {
        return Err(PortError::InvalidInput("Verse text is empty".to_string()));
    }
    let Some(identity) = ctx.identity() else {
        return Ok(SaveOutcome::SignedOut);
    };

    let verse_id = derive_id(text);
    let reference = paths::user_verse(identity.uid, &verse_id);
    if ctx.store().get(&reference).await?.is_some() {
        info!(uid = %identity.uid, %verse_id, "Verse already in library.");
        return Ok(SaveOutcome::AlreadySaved { verse_id });
    }

    let verse = VerseDocument {
        text: text.to_string(),
        analysis: analysis.clone(),
    };
    let body = serde_json::to_value(&verse)
        .map_err(|e| PortError::Unexpected(format!("Could not encode verse: {}", e)))?;

    // The shared record goes first so a live library never sees a reference
    // to a verse that does not exist yet.
    ctx.dispatcher().set_in_order(vec![
        (paths::verse(&verse_id), body, WriteMode::Merge),
        (
            reference,
            json!({
                "verseId": verse_id,
                "savedTimestamp": server_timestamp(),
            }),
            WriteMode::Merge,
        ),
    ]);

    info!(uid = %identity.uid, %verse_id, "Verse saved to library.");
    Ok(SaveOutcome::Saved { verse_id })
}

/// Removes the user's reference to `verse_id`.
pub fn remove_verse(ctx: &SessionContext, verse_id: &str) -> PortResult<RemoveOutcome> {
    if verse_id.trim().is_empty() || verse_id.contains('/') {
        return Err(PortError::InvalidInput(format!(
            "'{}' is not a verse id",
            verse_id
        )));
    }
    let Some(identity) = ctx.identity() else {
        return Ok(RemoveOutcome::SignedOut);
    };
    ctx.dispatcher()
        .delete(paths::user_verse(identity.uid, verse_id));
    info!(uid = %identity.uid, %verse_id, "Verse removed from library.");
    Ok(RemoveOutcome::Removed {
        verse_id: verse_id.to_string(),
    })
}

/// Records the `users/{uid}` profile document after a sign-up.
pub fn write_user_profile(dispatcher: &WriteDispatcher, identity: &Identity) {
    dispatcher.set(
        paths::user_profile(identity.uid),
        json!({
            "email": identity.email,
            "displayName": identity.display_name,
            "createdAt": server_timestamp(),
        }),
        WriteMode::Merge,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryIdentityProvider, MemoryStore};
    use crate::ports::DocumentStore;
    use std::sync::Arc;

    fn analysis() -> VerseAnalysis {
        VerseAnalysis {
            transliteration: "karmaṇy evādhikāras te".to_string(),
            summary: "Act without attachment to results.".to_string(),
            ..Default::default()
        }
    }

    fn signed_in_ctx(store: &MemoryStore) -> (SessionContext, Identity) {
        let who = Identity {
            uid: Uuid::new_v4(),
            email: Some("reader@example.com".to_string()),
            display_name: Some("Reader".to_string()),
        };
        let provider = Arc::new(MemoryIdentityProvider::signed_in(who.clone()));
        (SessionContext::start(Arc::new(store.clone()), provider), who)
    }

    #[test]
    fn test_user_verses_query_shape() {
        let uid = Uuid::new_v4();
        let query = user_verses_query(uid, Some(10));
        assert_eq!(query.collection, paths::user_verses(uid));
        assert_eq!(query.limit, Some(10));
        let order = query.order_by.unwrap();
        assert_eq!(order.field, "savedTimestamp");
        assert_eq!(order.direction, Direction::Descending);
    }

    #[tokio::test]
    async fn test_save_writes_verse_and_reference() {
        let store = MemoryStore::new();
        let (ctx, who) = signed_in_ctx(&store);

        let outcome = save_verse(&ctx, "कर्मण्येवाधिकारस्ते", &analysis()).await.unwrap();
        let SaveOutcome::Saved { verse_id } = outcome else {
            panic!("expected a fresh save, got {:?}", outcome);
        };
        ctx.shutdown().await;

        let verse = store.get(&paths::verse(&verse_id)).await.unwrap().unwrap();
        let verse: VerseDocument = verse.decode().unwrap();
        assert_eq!(verse.analysis, analysis());

        let reference = store
            .get(&paths::user_verse(who.uid, &verse_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reference.data["verseId"], verse_id);
        assert!(reference.data["savedTimestamp"].is_string());
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected() {
        let store = MemoryStore::new();
        let (ctx, _) = signed_in_ctx(&store);
        let result = save_verse(&ctx, "   ", &analysis()).await;
        assert!(matches!(result, Err(PortError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_signed_out_writes_nothing() {
        let store = MemoryStore::new();
        let ctx = SessionContext::start(
            Arc::new(store.clone()),
            Arc::new(MemoryIdentityProvider::new()),
        );
        let outcome = save_verse(&ctx, "text", &analysis()).await.unwrap();
        assert_eq!(outcome, SaveOutcome::SignedOut);
        assert_eq!(remove_verse(&ctx, "abc"), Ok(RemoveOutcome::SignedOut));
        ctx.shutdown().await;
        assert_eq!(store.count(paths::VERSES), 0);
    }

    #[tokio::test]
    async fn test_remove_rejects_malformed_ids() {
        let store = MemoryStore::new();
        let (ctx, who) = signed_in_ctx(&store);
        for bad in ["", "  ", "abc/def", "../x"] {
            assert!(
                matches!(remove_verse(&ctx, bad), Err(PortError::InvalidInput(_))),
                "accepted {:?}",
                bad
            );
        }
        assert_eq!(ctx.dispatcher().pending(), 0);
        assert_eq!(
            remove_verse(&ctx, "abc"),
            Ok(RemoveOutcome::Removed {
                verse_id: "abc".to_string()
            })
        );
        ctx.shutdown().await;
        assert_eq!(store.count(&paths::user_verses(who.uid).to_string()), 0);
    }

    #[tokio::test]
    async fn test_profile_document() {
        let store = MemoryStore::new();
        let (ctx, who) = signed_in_ctx(&store);
        write_user_profile(ctx.dispatcher(), &who);
        ctx.shutdown().await;

        let profile = store
            .get(&paths::user_profile(who.uid))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(profile.data["displayName"], "Reader");
        assert!(profile.data["createdAt"].is_string());
    }
}
