//! Append-only JSON-lines event log.
//!
//! Every record is written as a single `write_all` of one complete line, and
//! readers skip lines that fail to parse, so a torn final line from an
//! interrupted run never poisons later runs. Records are never rewritten.

use crate::db::track_id_from_uri;
use crate::fatigue::FeedbackState;
use crate::taste::normalize;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// One entry of the feedback log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedbackEvent {
    /// A playlist was published.
    Generated {
        timestamp: DateTime<Utc>,
        #[serde(default, alias = "track_ids")]
        picks: Vec<String>,
        #[serde(default)]
        artists: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        energy_tag: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        discovery_ratio: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidate_count: Option<usize>,
    },
    LikeTrack {
        timestamp: DateTime<Utc>,
        #[serde(default, alias = "track_uri", skip_serializing_if = "Option::is_none")]
        track_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artist: Option<String>,
    },
    /// An artist crossed the like threshold.
    BoostArtistAuto {
        timestamp: DateTime<Utc>,
        artist: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u32>,
    },
}

impl FeedbackEvent {
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            FeedbackEvent::Generated { timestamp, .. }
            | FeedbackEvent::LikeTrack { timestamp, .. }
            | FeedbackEvent::BoostArtistAuto { timestamp, .. } => *timestamp,
        }
    }
}

/// Narrow interface to the feedback log.
pub trait EventStore {
    /// # Errors
    ///
    /// Fails if the log cannot be opened or written.
    fn append(&self, event: &FeedbackEvent) -> Result<()>;

    /// Every readable event in append order. A missing log reads as empty.
    ///
    /// # Errors
    ///
    /// Fails if the log exists but cannot be read.
    fn read_all(&self) -> Result<Vec<FeedbackEvent>>;
}

/// A JSON-lines file on disk.
#[derive(Debug, Clone)]
pub struct JsonlLog {
    path: PathBuf,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line.
    ///
    /// # Errors
    ///
    /// Fails on serialization or I/O errors.
    pub fn append_record<T: Serialize>(&self, record: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory: {}", parent.display())
                })?;
            }
        }

        let mut line = serde_json::to_string(record).context("Failed to serialize log record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open log: {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to log: {}", self.path.display()))?;
        Ok(())
    }

    /// Read every parsable record; unreadable lines are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be opened or read.
    pub fn read_records<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open log: {}", self.path.display()))
            }
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read log: {}", self.path.display()))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str(trimmed) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "Skipping unreadable line {} in {}: {e}",
                    index + 1,
                    self.path.display()
                ),
            }
        }
        Ok(records)
    }
}

impl EventStore for JsonlLog {
    fn append(&self, event: &FeedbackEvent) -> Result<()> {
        self.append_record(event)
    }

    fn read_all(&self) -> Result<Vec<FeedbackEvent>> {
        self.read_records()
    }
}

/// Result of [`record_like`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeOutcome {
    /// Likes now counted for the artist.
    pub artist_likes: u32,
    /// A `boost_artist_auto` event was written by this call.
    pub boosted: bool,
}

/// Record a like and, when the artist first reaches `threshold` likes, a
/// one-time automatic boost. `state` is updated to match what was written.
///
/// # Errors
///
/// Fails if the log cannot be written.
pub fn record_like(
    store: &dyn EventStore,
    state: &mut FeedbackState,
    track_id: Option<&str>,
    artist: Option<&str>,
    threshold: u32,
    now: DateTime<Utc>,
) -> Result<LikeOutcome> {
    let track_id = track_id
        .map(|t| track_id_from_uri(t.trim()).to_string())
        .filter(|t| !t.is_empty());
    let artist = artist.map(str::trim).filter(|a| !a.is_empty());

    store.append(&FeedbackEvent::LikeTrack {
        timestamp: now,
        track_id: track_id.clone(),
        artist: artist.map(str::to_string),
    })?;
    state.note_like(track_id.as_deref(), artist, threshold);

    let Some(artist) = artist else {
        return Ok(LikeOutcome {
            artist_likes: 0,
            boosted: false,
        });
    };

    let key = normalize(artist);
    let artist_likes = state.artist_like_count(&key);
    if threshold == 0 || artist_likes < threshold || state.has_boost_event(&key) {
        if state.has_boost_event(&key) {
            debug!("Artist {artist} already auto-boosted; skipping");
        }
        return Ok(LikeOutcome {
            artist_likes,
            boosted: false,
        });
    }

    store.append(&FeedbackEvent::BoostArtistAuto {
        timestamp: now,
        artist: artist.to_string(),
        reason: Some("like_threshold".to_string()),
        count: Some(artist_likes),
    })?;
    state.note_boost_event(&key);
    info!("Auto-boosted {artist} after {artist_likes} likes");

    Ok(LikeOutcome {
        artist_likes,
        boosted: true,
    })
}
