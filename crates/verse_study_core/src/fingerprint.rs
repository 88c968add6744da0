//! Content-addressed identifiers for verse text.
//!
//! The fingerprint is the key of a verse in the global `verses` collection and
//! in every user's `userVerses` subcollection. It is computed as
//! `base64url(sha256(text))[0:32]` over the raw UTF-8 bytes. No whitespace or
//! punctuation normalization is applied, so two texts that differ by a single
//! character land on different documents.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

/// Length of every fingerprint, in characters.
pub const FINGERPRINT_LEN: usize = 32;

/// Derives the document key for a verse text. Accepts any string, including
/// the empty one.
pub fn derive_id(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_derive_id_is_deterministic() {
        let text = "कर्मण्येवाधिकारस्ते मा फलेषु कदाचन।";
        assert_eq!(derive_id(text), derive_id(text));
        assert_eq!(derive_id(text).len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_derive_id_accepts_empty_text() {
        let id = derive_id("");
        assert_eq!(id.len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_derive_id_is_path_safe() {
        let id = derive_id("योगस्थः कुरु कर्माणि सङ्गं त्यक्त्वा धनञ्जय।");
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_near_duplicates_do_not_merge() {
        let a = "उद्यमेन हि सिध्यन्ति कार्याणि न मनोरथैः।";
        let b = "उद्यमेन हि सिध्यन्ति कार्याणि न मनोरथैः। ";
        assert_ne!(derive_id(a), derive_id(b));
    }

    #[test]
    fn test_no_collisions_over_corpus() {
        let corpus: Vec<String> = (0..5000)
            .map(|i| format!("श्लोक {} धर्मक्षेत्रे कुरुक्षेत्रे", i))
            .collect();
        let ids: HashSet<String> = corpus.iter().map(|t| derive_id(t)).collect();
        assert_eq!(ids.len(), corpus.len());
    }
}
