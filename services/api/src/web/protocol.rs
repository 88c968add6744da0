//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the browser client and the API server
//! for the verse-study application.

use axum::extract::ws::{Message, WebSocket};
use chrono::NaiveDate;
use futures::{stream::SplitSink, SinkExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use verse_study_core::dispatcher::{WriteFailure, WriteKind};
use verse_study_core::domain::{
    DailyVerseRecord, Identity, LibraryEntry, RecommendedVerse, ScannedVerse, VerseAnalysis,
    WordAnalysis,
};
use verse_study_core::ports::PortError;
use verse_study_core::{JoinedState, LibraryFilter};

/// The write half of a connection, shared by every task that talks to the client.
pub type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    AnalyzeVerse { text: String },

    ExplainWord { word: String },

    /// An image of a verse as a `data:<mime>;base64,<payload>` URI.
    ScanImage { image_data_uri: String },

    /// Saves a verse the client already has an analysis for.
    SaveVerse { text: String, analysis: VerseAnalysis },

    RemoveVerse { verse_id: String },

    /// Starts (or restarts) the live library feed.
    WatchLibrary {
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        search: Option<String>,
        #[serde(default)]
        date: Option<NaiveDate>,
    },

    /// Changes the filter of the running library feed.
    UpdateFilter {
        #[serde(default)]
        search: Option<String>,
        #[serde(default)]
        date: Option<NaiveDate>,
    },

    StopLibrary,

    TodaysVerse,

    GenerateDailyVerse,

    Recommend,

    SignOut,
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once the connection's session is running.
    Ready { identity: Identity },

    Analysis { text: String, analysis: VerseAnalysis },

    WordExplanation { word: String, explanation: WordAnalysis },

    ScannedVerse { verse: ScannedVerse },

    /// `already_saved` is true when the verse was in the library before.
    Saved { verse_id: String, already_saved: bool },

    Removed { verse_id: String },

    /// A complete rendering of the library view. Replaces the previous one.
    Library {
        entries: Vec<LibraryEntry>,
        total_references: usize,
        empty_message: Option<String>,
        failed: bool,
    },

    DailyVerse { record: DailyVerseRecord },

    Recommendation { recommendation: RecommendedVerse },

    /// A dispatched write was rejected by the store after it was acknowledged.
    WriteFailed {
        path: String,
        kind: WriteKind,
        message: String,
    },

    /// A normal outcome with nothing to show, such as no verse today.
    Notice { message: String },

    /// An operation failed. `retryable` is false for bad input.
    Error { message: String, retryable: bool },

    SignedOut,
}

pub const SIGN_IN_NOTICE: &str = "Please sign in to use your library.";

impl ServerMessage {
    pub fn notice(message: impl Into<String>) -> Self {
        ServerMessage::Notice {
            message: message.into(),
        }
    }

    pub fn library(state: &JoinedState) -> Self {
        ServerMessage::Library {
            entries: state.entries.clone(),
            total_references: state.total_references,
            empty_message: state.empty_message().map(str::to_string),
            failed: state.error.is_some(),
        }
    }

    pub fn write_failed(failure: &WriteFailure) -> Self {
        let message = match failure.error {
            PortError::PermissionDenied(_) => "You do not have permission to make this change.",
            _ => "Your change could not be saved. Please try again.",
        };
        ServerMessage::WriteFailed {
            path: failure.path.to_string(),
            kind: failure.kind,
            message: message.to_string(),
        }
    }
}

/// Builds the library filter carried by `watch_library` and `update_filter`.
pub fn filter_from(search: Option<String>, date: Option<NaiveDate>) -> LibraryFilter {
    LibraryFilter { search, date }
}

/// Serializes `message` and sends it as a text frame.
pub async fn send(sender: &WsSender, message: &ServerMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).map_err(axum::Error::new)?;
    sender.lock().await.send(Message::Text(json.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use verse_study_core::store::DocPath;

    #[test]
    fn test_client_messages_are_type_tagged() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "remove_verse", "verse_id": "abc"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::RemoveVerse {
                verse_id: "abc".to_string()
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type": "stop_library"}"#).unwrap();
        assert_eq!(msg, ClientMessage::StopLibrary);
    }

    #[test]
    fn test_watch_library_fields_are_optional() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "watch_library"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::WatchLibrary {
                limit: None,
                search: None,
                date: None
            }
        );

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "update_filter", "search": "karma", "date": "2024-03-01"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::UpdateFilter {
                search: Some("karma".to_string()),
                date: NaiveDate::from_ymd_opt(2024, 3, 1),
            }
        );
    }

    #[test]
    fn test_save_verse_carries_camel_case_analysis() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "save_verse",
            "text": "सत्यमेव जयते",
            "analysis": {
                "transliteration": "satyameva jayate",
                "wordMeanings": "truth alone triumphs",
                "grammarTags": "",
                "englishTranslation": "Truth alone triumphs.",
                "summary": "From the Mundaka Upanishad."
            }
        }))
        .unwrap();
        match msg {
            ClientMessage::SaveVerse { text, analysis } => {
                assert_eq!(text, "सत्यमेव जयते");
                assert_eq!(analysis.transliteration, "satyameva jayate");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "init"}"#).is_err());
    }

    #[test]
    fn test_server_messages_serialize_with_type() {
        let saved = serde_json::to_value(ServerMessage::Saved {
            verse_id: "abc".to_string(),
            already_saved: true,
        })
        .unwrap();
        assert_eq!(
            saved,
            json!({"type": "saved", "verse_id": "abc", "already_saved": true})
        );

        let signed_out = serde_json::to_value(ServerMessage::SignedOut).unwrap();
        assert_eq!(signed_out, json!({"type": "signed_out"}));
    }

    #[test]
    fn test_write_failure_hides_store_details() {
        let failure = WriteFailure {
            path: DocPath::parse("verses/abc").unwrap(),
            kind: WriteKind::Merge,
            error: PortError::Unexpected("connection reset".to_string()),
        };
        let value: Value = serde_json::to_value(ServerMessage::write_failed(&failure)).unwrap();
        assert_eq!(value["type"], "write_failed");
        assert_eq!(value["path"], "verses/abc");
        assert_eq!(value["kind"], "merge");
        assert!(!value["message"].as_str().unwrap().contains("connection reset"));
    }
}
