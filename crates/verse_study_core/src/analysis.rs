//! crates/verse_study_core/src/analysis.rs
//!
//! Input validation and orchestration around the `VerseAnalysisService` port.

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{
    LibraryEntry, RecommendedVerse, ScannedVerse, UserVerseReference, VerseAnalysis,
    VerseDocument, WordAnalysis,
};
use crate::library::user_verses_query;
use crate::ports::{PortError, PortResult, VerseAnalysisService};
use crate::session::SessionContext;
use crate::store::paths;

/// How many recent library entries feed a recommendation.
pub const HISTORY_LEN: usize = 10;

pub const PREFERENCES: &str = "general spiritual wisdom, dharma, karma, self-realization";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecommendOutcome {
    Recommended(RecommendedVerse),
    /// The library is empty, so there is nothing to personalise on.
    NotEnoughData,
    SignedOut,
}

fn require_text<'a>(value: &'a str, what: &str) -> PortResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PortError::InvalidInput(format!("{} is empty", what)));
    }
    Ok(trimmed)
}

pub async fn analyze_verse(
    service: &dyn VerseAnalysisService,
    verse_text: &str,
) -> PortResult<VerseAnalysis> {
    let text = require_text(verse_text, "Verse text")?;
    service.analyze_verse(text).await
}

pub async fn explain_word(
    service: &dyn VerseAnalysisService,
    word: &str,
) -> PortResult<WordAnalysis> {
    let word = require_text(word, "Word")?;
    service.explain_word(word).await
}

/// Reads a verse from an image given as a `data:<mime>;base64,<payload>` URI.
pub async fn scan_verse(
    service: &dyn VerseAnalysisService,
    image_data_uri: &str,
) -> PortResult<ScannedVerse> {
    validate_data_uri(image_data_uri)?;
    service.scan_verse_image(image_data_uri).await
}

/// Accepts `data:<type>/<subtype>;base64,<non-empty payload>`.
pub fn validate_data_uri(uri: &str) -> PortResult<()> {
    let invalid = || {
        PortError::InvalidInput(
            "Image must be a data URI of the form data:<mime>;base64,<payload>".to_string(),
        )
    };
    let rest = uri.strip_prefix("data:").ok_or_else(invalid)?;
    let (mime, payload) = rest.split_once(";base64,").ok_or_else(invalid)?;
    let valid_mime = mime
        .split_once('/')
        .map_or(false, |(kind, sub)| !kind.is_empty() && !sub.is_empty());
    if !valid_mime || payload.trim().is_empty() {
        return Err(invalid());
    }
    Ok(())
}

/// Formats library entries as the interaction history handed to the AI.
pub fn library_history(entries: &[LibraryEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            format!(
                "Verse: {}\nSummary: {}",
                entry.verse.text, entry.verse.analysis.summary
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Recommends a verse based on the user's most recently saved ones, then
/// analyses the recommendation.
pub async fn recommend_from_library(
    ctx: &SessionContext,
    service: &dyn VerseAnalysisService,
) -> PortResult<RecommendOutcome> {
    let Some(identity) = ctx.identity() else {
        return Ok(RecommendOutcome::SignedOut);
    };

    let store = ctx.store();
    let references = store
        .query(&user_verses_query(identity.uid, Some(HISTORY_LEN)))
        .await?;

    // A bad reference or verse only drops that entry from the history.
    let mut entries = Vec::with_capacity(references.len());
    for doc in references {
        let reference = match doc.decode::<UserVerseReference>() {
            Ok(reference) => reference,
            Err(e) => {
                warn!(path = %doc.path, error = %e, "Skipping malformed library reference.");
                continue;
            }
        };
        let verse = store
            .get(&paths::verse(&reference.verse_id))
            .await
            .and_then(|doc| doc.map(|d| d.decode::<VerseDocument>()).transpose());
        match verse {
            Ok(Some(verse)) => entries.push(LibraryEntry {
                verse_id: reference.verse_id,
                saved_timestamp: reference.saved_timestamp,
                verse,
            }),
            Ok(None) => {}
            Err(e) => {
                warn!(verse_id = %reference.verse_id, error = %e, "Skipping verse in history.")
            }
        }
    }

    let history = library_history(&entries);
    if history.is_empty() {
        info!(uid = %identity.uid, "No library history to recommend from.");
        return Ok(RecommendOutcome::NotEnoughData);
    }

    let recommendation = service.recommend_verse(&history, PREFERENCES).await?;
    let analysis = analyze_verse(service, &recommendation.recommended_shloka).await?;
    info!(uid = %identity.uid, "Recommendation ready.");
    Ok(RecommendOutcome::Recommended(RecommendedVerse {
        recommendation,
        analysis,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_data_uri_validation() {
        assert!(validate_data_uri("data:image/png;base64,iVBORw0KGgo=").is_ok());
        assert!(validate_data_uri("data:image/jpeg;base64,").is_err());
        assert!(validate_data_uri("data:;base64,AAAA").is_err());
        assert!(validate_data_uri("image/png;base64,AAAA").is_err());
        assert!(validate_data_uri("data:image/png,AAAA").is_err());
    }

    #[test]
    fn test_history_format() {
        let entry = |text: &str, summary: &str| LibraryEntry {
            verse_id: text.to_string(),
            saved_timestamp: Utc::now(),
            verse: VerseDocument {
                text: text.to_string(),
                analysis: VerseAnalysis {
                    summary: summary.to_string(),
                    ..Default::default()
                },
            },
        };
        let history = library_history(&[entry("one", "first"), entry("two", "second")]);
        assert_eq!(history, "Verse: one\nSummary: first\n\nVerse: two\nSummary: second");
        assert!(library_history(&[]).is_empty());
    }
}
