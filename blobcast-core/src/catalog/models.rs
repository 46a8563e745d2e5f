use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Processing,
    Active,
    Error,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Processing => "processing",
            VideoStatus::Active => "active",
            VideoStatus::Error => "error",
        }
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(VideoStatus::Processing),
            "active" => Ok(VideoStatus::Active),
            "error" => Ok(VideoStatus::Error),
            other => Err(format!("unknown video status: {other}")),
        }
    }
}

/// Segment file name derived from the ordinal.
pub fn segment_filename(ordinal: u32) -> String {
    format!("segment_{ordinal:05}.ts")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoRecord {
    pub id: String,
    pub filename: String,
    pub duration: f64,
    pub total_segments: i64,
    pub byte_size: i64,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub container: Option<String>,
    pub status: VideoStatus,
    pub error_reason: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl VideoRecord {
    pub fn new(id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            duration: 0.0,
            total_segments: 0,
            byte_size: 0,
            video_codec: None,
            audio_codec: None,
            container: None,
            status: VideoStatus::Processing,
            error_reason: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let updated_at: Option<NaiveDateTime> = row.get("updated_at")?;
        Ok(Self {
            id: row.get("id")?,
            filename: row.get("filename")?,
            duration: row.get("duration")?,
            total_segments: row.get("total_segments")?,
            byte_size: row.get("byte_size")?,
            video_codec: row.get("video_codec")?,
            audio_codec: row.get("audio_codec")?,
            container: row.get("container")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(VideoStatus::Error),
            error_reason: row.get("error_reason")?,
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            updated_at: updated_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentRecord {
    pub video_id: String,
    pub ordinal: i64,
    pub filename: String,
    pub duration: f64,
    pub byte_size: i64,
    /// Opaque remote handle as returned by the platform.
    pub handle: String,
    /// Account the segment was uploaded with; retrieval must use it.
    pub account_id: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl SegmentRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        Ok(Self {
            video_id: row.get("video_id")?,
            ordinal: row.get("ordinal")?,
            filename: row.get("filename")?,
            duration: row.get("duration")?,
            byte_size: row.get("byte_size")?,
            handle: row.get("handle")?,
            account_id: row.get("account_id")?,
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtitleTrackRecord {
    pub video_id: String,
    pub track_index: i64,
    pub language: String,
    pub title: Option<String>,
    pub codec: Option<String>,
    pub is_default: bool,
    pub is_forced: bool,
    pub is_hearing_impaired: bool,
    pub handle: String,
    pub account_id: String,
}

impl SubtitleTrackRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            video_id: row.get("video_id")?,
            track_index: row.get("track_index")?,
            language: row.get("language")?,
            title: row.get("title")?,
            codec: row.get("codec")?,
            is_default: row.get::<_, i64>("is_default")? != 0,
            is_forced: row.get::<_, i64>("is_forced")? != 0,
            is_hearing_impaired: row.get::<_, i64>("is_hearing_impaired")? != 0,
            handle: row.get("handle")?,
            account_id: row.get("account_id")?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogMetrics {
    pub videos: usize,
    pub by_status: HashMap<String, usize>,
    pub segments: usize,
    pub total_bytes: i64,
}
