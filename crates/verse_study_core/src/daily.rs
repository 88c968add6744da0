//! crates/verse_study_core/src/daily.rs
//!
//! The verse of the day.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::domain::{DailyVerseRecord, GeneratedDailyVerse, VerseDocument};
use crate::fingerprint::derive_id;
use crate::ports::{PortError, PortResult, VerseAnalysisService};
use crate::session::SessionContext;
use crate::store::{paths, server_timestamp, DocPath, Direction, FilterOp, Query, WriteMode};

pub const NO_VERSE_TODAY: &str = "No shloka available for today. Please check back tomorrow!";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DailyLookup {
    Found(DailyVerseRecord),
    NoneToday,
    SignedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishOutcome {
    Published { record_id: String, verse_id: String },
    SignedOut,
}

/// `YYYY-MM-DD`.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// The newest record published for `date`.
pub fn todays_verse_query(date: NaiveDate) -> Query {
    Query::collection(paths::daily_verses())
        .filter("date", FilterOp::Eq, date_key(date))
        .order_by("generatedAt", Direction::Descending)
        .limit(1)
}

/// `dailyShlokas/{date}_{first 8 fingerprint chars}`.
pub fn daily_record_path(date: NaiveDate, verse_id: &str) -> DocPath {
    let prefix: String = verse_id.chars().take(8).collect();
    paths::daily_verses().doc(format!("{}_{}", date_key(date), prefix))
}

/// Looks up the verse of the day. An empty result is a normal outcome.
pub async fn todays_verse(ctx: &SessionContext, date: NaiveDate) -> PortResult<DailyLookup> {
    if ctx.identity().is_none() {
        return Ok(DailyLookup::SignedOut);
    }
    let found = ctx.store().query(&todays_verse_query(date)).await?;
    match found.first() {
        Some(doc) => Ok(DailyLookup::Found(doc.decode()?)),
        None => Ok(DailyLookup::NoneToday),
    }
}

/// Stores a generated verse as the record for `date` and upserts the shared
/// verse document.
pub fn publish_daily_verse(
    ctx: &SessionContext,
    generated: &GeneratedDailyVerse,
    date: NaiveDate,
) -> PortResult<PublishOutcome> {
    if generated.verse_text.trim().is_empty() {
        return Err(PortError::InvalidInput(
            "Generated verse has no text".to_string(),
        ));
    }
    if ctx.identity().is_none() {
        return Ok(PublishOutcome::SignedOut);
    }

    let verse_id = derive_id(&generated.verse_text);
    let record_path = daily_record_path(date, &verse_id);
    let verse = VerseDocument {
        text: generated.verse_text.clone(),
        analysis: generated.analysis.clone(),
    };
    let encode = |e: serde_json::Error| PortError::Unexpected(format!("Could not encode verse: {}", e));

    let mut record = serde_json::to_value(&generated.analysis).map_err(encode)?;
    if let Some(fields) = record.as_object_mut() {
        fields.extend([
            ("date".to_string(), json!(date_key(date))),
            ("verseId".to_string(), json!(verse_id)),
            ("verseText".to_string(), json!(generated.verse_text)),
            ("verseSource".to_string(), json!(generated.source)),
            ("verseChapter".to_string(), json!(generated.chapter)),
            ("verseNumber".to_string(), json!(generated.verse)),
            ("interpretation".to_string(), json!(generated.analysis.summary)),
            ("generatedAt".to_string(), server_timestamp()),
        ]);
    }

    ctx.dispatcher().set_in_order(vec![
        (
            paths::verse(&verse_id),
            serde_json::to_value(&verse).map_err(encode)?,
            WriteMode::Merge,
        ),
        (record_path.clone(), record, WriteMode::Replace),
    ]);

    info!(record = %record_path, %verse_id, "Daily verse published.");
    Ok(PublishOutcome::Published {
        record_id: record_path.id().to_string(),
        verse_id,
    })
}

/// Asks the AI for a verse of the day and publishes it for `date`.
pub async fn generate_daily_verse(
    ctx: &SessionContext,
    service: &dyn VerseAnalysisService,
    date: NaiveDate,
) -> PortResult<PublishOutcome> {
    if ctx.identity().is_none() {
        return Ok(PublishOutcome::SignedOut);
    }
    let generated = service.generate_daily_verse().await?;
    publish_daily_verse(ctx, &generated, date)
}
