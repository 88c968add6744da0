//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.
//!
//! The analysis endpoints are stateless: they neither read nor write the
//! document store, so they do not require a session.

use crate::error::reject;
use crate::web::auth::{AuthResponse, LoginRequest, SignupRequest};
use crate::web::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};
use verse_study_core::analysis;
use verse_study_core::domain::{ScannedVerse, VerseAnalysis, WordAnalysis};

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        analyze_verse_handler,
        explain_word_handler,
        scan_verse_handler,
        crate::web::auth::signup_handler,
        crate::web::auth::login_handler,
        crate::web::auth::logout_handler,
    ),
    components(
        schemas(
            AnalyzeVerseRequest,
            ExplainWordRequest,
            ScanVerseRequest,
            AnalysisResponse,
            WordExplanationResponse,
            ScannedVerseResponse,
            SignupRequest,
            LoginRequest,
            AuthResponse,
        )
    ),
    tags(
        (name = "Verse Study API", description = "Sanskrit verse analysis, word study and account endpoints.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct AnalyzeVerseRequest {
    /// The verse in Devanagari or transliteration.
    pub text: String,
}

#[derive(Deserialize, ToSchema)]
pub struct ExplainWordRequest {
    pub word: String,
}

#[derive(Deserialize, ToSchema)]
pub struct ScanVerseRequest {
    /// `data:<mime>;base64,<payload>`
    pub image_data_uri: String,
}

/// The five analysis fields of a verse.
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResponse {
    pub transliteration: String,
    pub word_meanings: String,
    pub grammar_tags: String,
    pub english_translation: String,
    pub summary: String,
}

impl From<VerseAnalysis> for AnalysisResponse {
    fn from(a: VerseAnalysis) -> Self {
        Self {
            transliteration: a.transliteration,
            word_meanings: a.word_meanings,
            grammar_tags: a.grammar_tags,
            english_translation: a.english_translation,
            summary: a.summary,
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WordExplanationResponse {
    pub meaning: String,
    pub english_translation: String,
    pub grammatical_analysis: String,
    pub usage_example: String,
}

impl From<WordAnalysis> for WordExplanationResponse {
    fn from(w: WordAnalysis) -> Self {
        Self {
            meaning: w.meaning,
            english_translation: w.english_translation,
            grammatical_analysis: w.grammatical_analysis,
            usage_example: w.usage_example,
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScannedVerseResponse {
    /// The verse as read from the image.
    pub verse_text: String,
    pub analysis: AnalysisResponse,
}

impl From<ScannedVerse> for ScannedVerseResponse {
    fn from(s: ScannedVerse) -> Self {
        Self {
            verse_text: s.verse_text,
            analysis: s.analysis.into(),
        }
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Analyse a Sanskrit verse.
#[utoipa::path(
    post,
    path = "/verses/analyze",
    request_body = AnalyzeVerseRequest,
    responses(
        (status = 200, description = "Verse analysed", body = AnalysisResponse),
        (status = 400, description = "Empty verse text"),
        (status = 502, description = "The analysis service failed")
    )
)]
pub async fn analyze_verse_handler(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeVerseRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let analysis = analysis::analyze_verse(app_state.analysis.as_ref(), &req.text)
        .await
        .map_err(|e| reject("Verse analysis", e))?;
    Ok(Json(AnalysisResponse::from(analysis)))
}

/// Explain a single Sanskrit word.
#[utoipa::path(
    post,
    path = "/words/explain",
    request_body = ExplainWordRequest,
    responses(
        (status = 200, description = "Word explained", body = WordExplanationResponse),
        (status = 400, description = "Empty word"),
        (status = 502, description = "The analysis service failed")
    )
)]
pub async fn explain_word_handler(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<ExplainWordRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let explanation = analysis::explain_word(app_state.analysis.as_ref(), &req.word)
        .await
        .map_err(|e| reject("Word analysis", e))?;
    Ok(Json(WordExplanationResponse::from(explanation)))
}

/// Read a verse from an image and analyse it.
#[utoipa::path(
    post,
    path = "/verses/scan",
    request_body = ScanVerseRequest,
    responses(
        (status = 200, description = "Verse read and analysed", body = ScannedVerseResponse),
        (status = 400, description = "The image is not a base64 data URI"),
        (status = 502, description = "The analysis service failed")
    )
)]
pub async fn scan_verse_handler(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<ScanVerseRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let scanned = analysis::scan_verse(app_state.analysis.as_ref(), &req.image_data_uri)
        .await
        .map_err(|e| reject("Image scan", e))?;
    Ok(Json(ScannedVerseResponse::from(scanned)))
}
