//! crates/verse_study_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the concrete document store, identity provider and LLM.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use tokio::sync::watch;
use uuid::Uuid;

use crate::domain::{
    AccountCredentials, GeneratedDailyVerse, Identity, Recommendation, ScannedVerse,
    VerseAnalysis, WordAnalysis,
};
use crate::store::{DocPath, Document, Query, WriteMode};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
/// It is `Clone` so that it can sit inside reactive state that is shared with observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// A live feed of snapshots. The first item is the current state.
pub type SnapshotStream<T> = Pin<Box<dyn Stream<Item = PortResult<T>> + Send>>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait DocumentStore: Send + Sync {
    // --- One-shot reads ---
    async fn get(&self, path: &DocPath) -> PortResult<Option<Document>>;

    async fn query(&self, query: &Query) -> PortResult<Vec<Document>>;

    // --- Writes ---
    /// Writes `data` at `path`. Any `server_timestamp()` sentinel inside the
    /// payload is replaced with the store's clock.
    async fn set(&self, path: &DocPath, data: Value, mode: WriteMode) -> PortResult<()>;

    async fn delete(&self, path: &DocPath) -> PortResult<()>;

    // --- Live reads ---
    async fn listen_query(&self, query: &Query) -> PortResult<SnapshotStream<Vec<Document>>>;

    async fn listen_doc(&self, path: &DocPath) -> PortResult<SnapshotStream<Option<Document>>>;
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> PortResult<Identity>;

    async fn sign_in(&self, email: &str, password: &str) -> PortResult<Identity>;

    async fn sign_out(&self) -> PortResult<()>;

    /// The change-notification stream. The current value is the signed-in
    /// identity, or `None`.
    fn changes(&self) -> watch::Receiver<Option<Identity>>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    // --- Accounts ---
    async fn create_user_with_email(
        &self,
        email: &str,
        display_name: Option<&str>,
        hashed_password: &str,
    ) -> PortResult<Identity>;

    async fn get_user_by_email(&self, email: &str) -> PortResult<AccountCredentials>;

    // --- Auth Sessions ---
    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()>;

    async fn validate_auth_session(&self, session_id: &str) -> PortResult<Identity>;

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()>;
}

#[async_trait]
pub trait VerseAnalysisService: Send + Sync {
    /// Produces the full analysis of a verse.
    async fn analyze_verse(&self, verse_text: &str) -> PortResult<VerseAnalysis>;

    async fn explain_word(&self, word: &str) -> PortResult<WordAnalysis>;

    /// Reads a verse out of a `data:<mime>;base64,<payload>` image and analyses it.
    async fn scan_verse_image(&self, image_data_uri: &str) -> PortResult<ScannedVerse>;

    async fn generate_daily_verse(&self) -> PortResult<GeneratedDailyVerse>;

    async fn recommend_verse(
        &self,
        interaction_history: &str,
        preferences: &str,
    ) -> PortResult<Recommendation>;
}
