//! crates/verse_study_core/src/domain.rs
//!
//! Defines the core data structures for the application.
//! Document bodies are serialized with camelCase field names, which is the
//! shape they take inside the document store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The authenticated user as seen by the rest of the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub uid: Uuid,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

// Only used internally for sign-in - contains sensitive data
#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub identity: Identity,
    pub hashed_password: String,
}

/// The five analysis fields every AI analysis variant returns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerseAnalysis {
    pub transliteration: String,
    pub word_meanings: String,
    pub grammar_tags: String,
    pub english_translation: String,
    pub summary: String,
}

/// The canonical, shared analysis record stored at `verses/{fingerprint}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerseDocument {
    pub text: String,
    #[serde(flatten)]
    pub analysis: VerseAnalysis,
}

impl VerseDocument {
    /// Returns true if `needle` occurs (case-insensitively) in any text field.
    pub fn contains_text(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        [
            &self.text,
            &self.analysis.transliteration,
            &self.analysis.word_meanings,
            &self.analysis.grammar_tags,
            &self.analysis.english_translation,
            &self.analysis.summary,
        ]
        .iter()
        .any(|field| field.to_lowercase().contains(&needle))
    }
}

/// A per-user pointer at `users/{uid}/userVerses/{fingerprint}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserVerseReference {
    /// The document id inside the user's subcollection. Not stored in the body.
    #[serde(skip)]
    pub id: String,
    pub verse_id: String,
    pub saved_timestamp: DateTime<Utc>,
}

/// One verse-of-the-day record stored under `dailyShlokas`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyVerseRecord {
    /// Calendar date key, `YYYY-MM-DD`.
    pub date: String,
    pub verse_id: String,
    pub verse_text: String,
    pub verse_source: String,
    pub verse_chapter: u32,
    pub verse_number: u32,
    pub interpretation: String,
    #[serde(flatten)]
    pub analysis: VerseAnalysis,
    pub generated_at: DateTime<Utc>,
}

/// Detailed analysis of a single Sanskrit word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordAnalysis {
    pub meaning: String,
    pub english_translation: String,
    pub grammatical_analysis: String,
    pub usage_example: String,
}

/// A verse read out of an image, together with its analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedVerse {
    pub verse_text: String,
    #[serde(flatten)]
    pub analysis: VerseAnalysis,
}

/// What the AI returns when asked for a verse of the day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedDailyVerse {
    pub verse_text: String,
    pub source: String,
    pub chapter: u32,
    pub verse: u32,
    #[serde(flatten)]
    pub analysis: VerseAnalysis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub recommended_shloka: String,
    pub reasoning: String,
}

/// A recommendation plus the full analysis of the recommended verse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedVerse {
    pub recommendation: Recommendation,
    pub analysis: VerseAnalysis,
}

/// A row of the joined library view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryEntry {
    pub verse_id: String,
    pub saved_timestamp: DateTime<Utc>,
    pub verse: VerseDocument,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_covers_every_analysis_field() {
        let verse = VerseDocument {
            text: "तत्त्वमसि".to_string(),
            analysis: VerseAnalysis {
                transliteration: "tat tvam asi".to_string(),
                word_meanings: "tat: that".to_string(),
                grammar_tags: "asi: present, 2nd person singular".to_string(),
                english_translation: "That thou art".to_string(),
                summary: "Identity of self and Brahman".to_string(),
            },
        };
        for needle in ["तत्त्व", "TVAM", "tat: that", "2nd person", "thou", "brahman"] {
            assert!(verse.contains_text(needle), "no match for {}", needle);
        }
        assert!(!verse.contains_text("karma"));
    }
}
