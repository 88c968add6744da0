//! services/api/src/adapters/analysis_llm.rs
//!
//! This module contains the adapter for the verse-analysis LLM.
//! It implements the `VerseAnalysisService` port from the `core` crate on top of
//! OpenAI chat completions in JSON mode.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        CreateChatCompletionRequestArgs, ImageUrlArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, error};
use verse_study_core::{
    domain::{GeneratedDailyVerse, Recommendation, ScannedVerse, VerseAnalysis, WordAnalysis},
    ports::{PortError, PortResult, VerseAnalysisService},
};

const SYSTEM_INSTRUCTIONS: &str = "You are a scholar of Sanskrit and the Hindu scriptures. \
Answer with a single JSON object using exactly the keys requested, each holding a string \
unless a number is requested. Do not add commentary outside the JSON.";

const ANALYSIS_KEYS: &str = r#""transliteration" (IAST transliteration of the verse), "wordMeanings" (the meaning of each word), "grammarTags" (grammatical tags for each word), "englishTranslation" (a clear English translation) and "summary" (a short explanation of the meaning and context)"#;

const VERSE_TEMPLATE: &str = "Analyse the following Sanskrit verse. Return the keys {keys}.\n\nVerse: {verse}";

const WORD_TEMPLATE: &str = r#"Analyse the single Sanskrit word below as a grammarian and lexicographer. Return the keys "meaning" (detailed definition and core concept), "englishTranslation" (common English equivalents), "grammaticalAnalysis" (root, word type, case, gender, number, tense or person as applicable) and "usageExample" (a short Sanskrit phrase using the word, in Devanagari with IAST transliteration and English translation).

Word: {word}"#;

const SCAN_TEMPLATE: &str = r#"The image contains a Sanskrit verse. Transcribe the complete verse in Devanagari as "verseText", then analyse it and also return the keys {keys}."#;

const DAILY_TEMPLATE: &str = r#"Choose one profound Sanskrit verse for a verse-of-the-day feature, from a well-known scripture such as the Bhagavad Gita, the Upanishads or the Vedas. Pick a different verse each time. Return "verseText" (Devanagari), "source" (the scripture), "chapter" (number), "verse" (number) and the keys {keys}."#;

const RECOMMEND_TEMPLATE: &str = r#"Recommend one Sanskrit verse the reader has not seen yet, related to the themes of the verses they saved. Never repeat a verse from their history. Return "recommendedShloka" (the verse in Devanagari) and "reasoning" (one or two sentences linking it to their history or preferences).

Saved verses:
{history}

Preferences: {preferences}"#;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `VerseAnalysisService` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiVerseAdapter {
    client: Client<OpenAIConfig>,
    model: String,
    vision_model: String,
}

impl OpenAiVerseAdapter {
    /// Creates a new `OpenAiVerseAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String, vision_model: String) -> Self {
        Self {
            client,
            model,
            vision_model,
        }
    }

    /// Sends one JSON-mode completion and decodes the reply into `T`.
    async fn complete<T: DeserializeOwned>(
        &self,
        model: &str,
        content: ChatCompletionRequestUserMessageContent,
    ) -> PortResult<T> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(SYSTEM_INSTRUCTIONS)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(messages)
            .response_format(ResponseFormat::JsonObject)
            .n(1)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e: OpenAIError| {
                error!("Analysis LLM request failed: {}", e);
                PortError::Unexpected(e.to_string())
            })?;

        let raw = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                PortError::Unexpected("Analysis LLM returned no text content.".to_string())
            })?;
        debug!(chars = raw.len(), "Analysis LLM replied.");
        parse_json_reply(&raw)
    }

    async fn complete_text<T: DeserializeOwned>(&self, prompt: String) -> PortResult<T> {
        self.complete(&self.model, prompt.into()).await
    }
}

/// Decodes a model reply, tolerating Markdown fences or prose around the object.
pub fn parse_json_reply<T: DeserializeOwned>(raw: &str) -> PortResult<T> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let body = match (start, end) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => {
            return Err(PortError::Unexpected(
                "Analysis LLM reply did not contain a JSON object.".to_string(),
            ))
        }
    };
    serde_json::from_str(body).map_err(|e| {
        error!("Failed to decode analysis reply: {}", e);
        PortError::Unexpected(format!("Analysis LLM reply was malformed: {}", e))
    })
}

//=========================================================================================
// `VerseAnalysisService` Trait Implementation
//=========================================================================================

#[async_trait]
impl VerseAnalysisService for OpenAiVerseAdapter {
    async fn analyze_verse(&self, verse_text: &str) -> PortResult<VerseAnalysis> {
        let prompt = VERSE_TEMPLATE
            .replace("{keys}", ANALYSIS_KEYS)
            .replace("{verse}", verse_text);
        self.complete_text(prompt).await
    }

    async fn explain_word(&self, word: &str) -> PortResult<WordAnalysis> {
        self.complete_text(WORD_TEMPLATE.replace("{word}", word)).await
    }

    async fn scan_verse_image(&self, image_data_uri: &str) -> PortResult<ScannedVerse> {
        let content = ChatCompletionRequestUserMessageContent::Array(vec![
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(SCAN_TEMPLATE.replace("{keys}", ANALYSIS_KEYS))
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
            ChatCompletionRequestMessageContentPartImageArgs::default()
                .image_url(
                    ImageUrlArgs::default()
                        .url(image_data_uri)
                        .build()
                        .map_err(|e| PortError::Unexpected(e.to_string()))?,
                )
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
        ]);
        self.complete(&self.vision_model, content).await
    }

    async fn generate_daily_verse(&self) -> PortResult<GeneratedDailyVerse> {
        self.complete_text(DAILY_TEMPLATE.replace("{keys}", ANALYSIS_KEYS))
            .await
    }

    async fn recommend_verse(
        &self,
        interaction_history: &str,
        preferences: &str,
    ) -> PortResult<Recommendation> {
        let prompt = RECOMMEND_TEMPLATE
            .replace("{history}", interaction_history)
            .replace("{preferences}", preferences);
        self.complete_text(prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_json_reply() {
        let reply = r#"{"recommendedShloka": "सत्यमेव जयते", "reasoning": "Truth."}"#;
        let parsed: Recommendation = parse_json_reply(reply).unwrap();
        assert_eq!(parsed.recommended_shloka, "सत्यमेव जयते");
    }

    #[test]
    fn test_fenced_reply() {
        let reply = "```json\n{\"meaning\": \"m\", \"englishTranslation\": \"e\", \"grammaticalAnalysis\": \"g\", \"usageExample\": \"u\"}\n```";
        let parsed: WordAnalysis = parse_json_reply(reply).unwrap();
        assert_eq!(parsed.grammatical_analysis, "g");
    }

    #[test]
    fn test_daily_reply_with_numbers() {
        let reply = r#"{"verseText": "v", "source": "Bhagavad Gita", "chapter": 2, "verse": 47,
            "transliteration": "t", "wordMeanings": "w", "grammarTags": "g",
            "englishTranslation": "e", "summary": "s"}"#;
        let parsed: GeneratedDailyVerse = parse_json_reply(reply).unwrap();
        assert_eq!(parsed.chapter, 2);
        assert_eq!(parsed.analysis.summary, "s");
    }

    #[test]
    fn test_missing_object_is_an_error() {
        let result: PortResult<VerseAnalysis> = parse_json_reply("I cannot help with that.");
        assert!(matches!(result, Err(PortError::Unexpected(_))));
        let missing_field: PortResult<VerseAnalysis> = parse_json_reply(r#"{"summary": "s"}"#);
        assert!(missing_field.is_err());
    }
}
