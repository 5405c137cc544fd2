//! Wire format of the top-items queue message.
//!
//! The queue delivers an SQS-style event whose first record carries a JSON
//! string body. Everything here is plain serde: missing keys and unknown
//! enum values surface as [`EnvelopeError`]s whose message names the
//! offending key or value.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed event: {0}")]
    MalformedEvent(#[source] serde_json::Error),

    #[error("malformed message body: {0}")]
    MalformedBody(#[source] serde_json::Error),

    #[error("event contains no records")]
    NoRecords,

    #[error("invalid position {position} for item {id}, positions start at 1")]
    InvalidPosition { id: String, position: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    ShortTerm,
    MediumTerm,
    LongTerm,
}

impl TimeRange {
    /// Value stored in the `time_range` column and used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::ShortTerm => "short_term",
            TimeRange::MediumTerm => "medium_term",
            TimeRange::LongTerm => "long_term",
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "Records")]
    records: Vec<Record>,
}

#[derive(Debug, Deserialize)]
struct Record {
    body: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserSpotifyData {
    pub user_id: String,
    // the key itself is mandatory, only its value may be null
    #[serde(deserialize_with = "required_nullable")]
    pub refresh_token: Option<String>,
    pub top_artists_data: Vec<TopItemsData>,
    pub top_tracks_data: Vec<TopItemsData>,
    pub top_genres_data: Vec<TopGenresData>,
    pub top_emotions_data: Vec<TopEmotionsData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopItemsData {
    #[serde(alias = "top_artists", alias = "top_tracks")]
    pub top_items: Vec<TopItem>,
    pub time_range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopItem {
    pub id: String,
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopGenresData {
    pub top_genres: Vec<TopGenre>,
    pub time_range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopGenre {
    pub name: String,
    pub count: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopEmotionsData {
    pub top_emotions: Vec<TopEmotion>,
    pub time_range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopEmotion {
    pub name: String,
    pub percentage: f64,
    pub track_id: Option<String>,
}

fn required_nullable<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::deserialize(deserializer)
}

/// Decode a raw queue event into the snapshot carried by its first record.
pub fn decode_event(raw: &str) -> Result<UserSpotifyData, EnvelopeError> {
    let event: Event = serde_json::from_str(raw).map_err(EnvelopeError::MalformedEvent)?;

    if event.records.len() > 1 {
        tracing::warn!(
            "event carries {} records, only the first one is ingested",
            event.records.len()
        );
    }

    let record = event.records.into_iter().next().ok_or(EnvelopeError::NoRecords)?;
    decode_body(&record.body)
}

/// Decode a message body that was already taken out of its event record.
pub fn decode_body(body: &str) -> Result<UserSpotifyData, EnvelopeError> {
    let data: UserSpotifyData = serde_json::from_str(body).map_err(EnvelopeError::MalformedBody)?;
    validate_positions(&data)?;
    Ok(data)
}

fn validate_positions(data: &UserSpotifyData) -> Result<(), EnvelopeError> {
    let ranked = data.top_artists_data.iter().chain(data.top_tracks_data.iter());
    for item in ranked.flat_map(|d| d.top_items.iter()) {
        if item.position < 1 {
            return Err(EnvelopeError::InvalidPosition {
                id: item.id.clone(),
                position: item.position,
            });
        }
    }
    Ok(())
}
