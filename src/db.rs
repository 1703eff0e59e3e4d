//! SQLite catalog: tracks, bans and the playlist run history.
//!
//! Timestamps are stored as RFC 3339 text with whole seconds and a `Z`
//! suffix, so they sort lexicographically. Bare `YYYY-MM-DD` dates written by
//! older databases are still read.

use crate::pipeline::{CatalogStore, LastRun, RunRecord};
use crate::taste::normalize;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use log::{debug, info, trace};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Ban reason recorded for tracks the user deleted from the live playlist.
pub const REMOVED_REASON: &str = "manually removed from playlist";

/// Removed-track bans needed before the whole artist is banned.
pub const ARTIST_BAN_THRESHOLD: usize = 3;

/// One catalog track as seen by a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackCandidate {
    #[serde(alias = "id", alias = "uri")]
    pub track_id: String,
    pub artist: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_played: Option<DateTime<Utc>>,
}

impl TrackCandidate {
    pub fn new(track_id: impl Into<String>, artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            track_id: track_id.into(),
            artist: artist.into(),
            title: title.into(),
            energy_tag: None,
            duration_ms: None,
            last_played: None,
        }
    }

    #[must_use]
    pub fn uri(&self) -> String {
        format!("spotify:track:{}", self.track_id)
    }
}

/// Bare track id from an id, a `spotify:track:` URI or an
/// `open.spotify.com/track/` link.
///
/// ```
/// use dailydj::db::track_id_from_uri;
///
/// assert_eq!(track_id_from_uri("spotify:track:4uLU6hMCjMI75M1A2tKUQC"), "4uLU6hMCjMI75M1A2tKUQC");
/// assert_eq!(track_id_from_uri("https://open.spotify.com/track/abc?si=x"), "abc");
/// assert_eq!(track_id_from_uri("abc"), "abc");
/// ```
#[must_use]
pub fn track_id_from_uri(value: &str) -> &str {
    if let Some(id) = value.strip_prefix("spotify:track:") {
        return id;
    }
    if let Some(rest) = value.split("open.spotify.com/track/").nth(1) {
        return rest.split(['?', '/', '#']).next().unwrap_or(rest);
    }
    value
}

#[must_use]
pub fn format_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[must_use]
pub fn parse_db_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(ts.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tracks (
        track_id    TEXT PRIMARY KEY,
        artist      TEXT NOT NULL,
        title       TEXT NOT NULL,
        last_played TEXT,
        source      TEXT,
        energy_tag  TEXT,
        duration_ms INTEGER
    );
    CREATE TABLE IF NOT EXISTS bans (
        track_id  TEXT PRIMARY KEY,
        artist    TEXT,
        title     TEXT,
        reason    TEXT,
        banned_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS artist_bans (
        artist    TEXT PRIMARY KEY,
        reason    TEXT,
        banned_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS playlist_runs (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        run_label           TEXT NOT NULL,
        run_at              TEXT NOT NULL,
        mode                TEXT,
        energy_tag          TEXT,
        discovery_ratio     REAL,
        gpt_count           INTEGER NOT NULL DEFAULT 0,
        deterministic_count INTEGER NOT NULL DEFAULT 0,
        warnings            TEXT
    );
    CREATE TABLE IF NOT EXISTS playlist_run_tracks (
        run_id         INTEGER NOT NULL REFERENCES playlist_runs(id),
        position       INTEGER NOT NULL,
        track_id       TEXT NOT NULL,
        source         TEXT NOT NULL,
        gpt_reason     TEXT,
        gpt_confidence REAL,
        PRIMARY KEY (run_id, position)
    );
    CREATE INDEX IF NOT EXISTS idx_run_tracks_track ON playlist_run_tracks(track_id);
";

const TRACK_COLUMNS: &str = "track_id, artist, title, energy_tag, duration_ms, last_played";

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<TrackCandidate> {
    let energy_tag: Option<String> = row.get(3)?;
    let duration_ms: Option<i64> = row.get(4)?;
    let last_played: Option<String> = row.get(5)?;

    Ok(TrackCandidate {
        track_id: row.get(0)?,
        artist: row.get(1)?,
        title: row.get(2)?,
        energy_tag: energy_tag.filter(|t| !t.trim().is_empty()),
        duration_ms: duration_ms.and_then(|d| u64::try_from(d).ok()).filter(|d| *d > 0),
        last_played: last_played.as_deref().and_then(parse_db_time),
    })
}

/// The catalog database.
#[derive(Debug)]
pub struct SqliteCatalog {
    conn: Connection,
}

impl SqliteCatalog {
    /// Open (creating if needed) and bring the schema up to date.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or the schema cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open catalog database: {}", path.display()))?;
        let catalog = Self { conn };
        catalog.init_schema()?;
        Ok(catalog)
    }

    /// # Errors
    ///
    /// Fails if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let catalog = Self { conn };
        catalog.init_schema()?;
        Ok(catalog)
    }

    /// Create missing tables, indexes and columns. Safe to run repeatedly.
    ///
    /// # Errors
    ///
    /// Fails on any SQL error.
    pub fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("Failed to create catalog schema")?;
        // older catalogs predate these columns
        self.ensure_column("tracks", "energy_tag", "TEXT")?;
        self.ensure_column("tracks", "duration_ms", "INTEGER")?;
        self.ensure_column("tracks", "source", "TEXT")?;
        self.conn
            .execute_batch("CREATE INDEX IF NOT EXISTS idx_tracks_energy_tag ON tracks(energy_tag);")
            .context("Failed to create energy tag index")?;
        Ok(())
    }

    fn ensure_column(&self, table: &str, column: &str, decl: &str) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .with_context(|| format!("Failed to inspect table {table}"))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if !names.iter().any(|n| n == column) {
            info!("Adding column {table}.{column}");
            self.conn
                .execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"), [])
                .with_context(|| format!("Failed to add column {table}.{column}"))?;
        }
        Ok(())
    }

    fn query_tracks<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<TrackCandidate>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("Failed to prepare track query: {sql}"))?;
        let tracks = stmt
            .query_map(params, track_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read tracks")?;
        trace!("Track query returned {} rows", tracks.len());
        Ok(tracks)
    }

    /// Insert or update tracks in one transaction. Existing energy tags and
    /// durations survive when the new row leaves them empty.
    ///
    /// # Errors
    ///
    /// Fails on any SQL error; nothing is written in that case.
    pub fn upsert_tracks(&mut self, tracks: &[TrackCandidate], source: &str) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO tracks (track_id, artist, title, source, energy_tag, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(track_id) DO UPDATE SET
                     artist = excluded.artist,
                     title = excluded.title,
                     source = excluded.source,
                     energy_tag = COALESCE(excluded.energy_tag, tracks.energy_tag),
                     duration_ms = COALESCE(excluded.duration_ms, tracks.duration_ms)",
            )?;
            for track in tracks {
                let duration = track.duration_ms.and_then(|d| i64::try_from(d).ok());
                let energy_tag = track
                    .energy_tag
                    .as_deref()
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty());
                stmt.execute((
                    track_id_from_uri(track.track_id.trim()),
                    track.artist.trim(),
                    track.title.trim(),
                    source,
                    energy_tag,
                    duration,
                ))
                .with_context(|| format!("Failed to store track {}", track.track_id))?;
            }
        }
        tx.commit().context("Failed to commit track import")?;
        Ok(tracks.len())
    }

    /// # Errors
    ///
    /// Fails on any SQL error.
    pub fn track_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))
            .context("Failed to count tracks")?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl CatalogStore for SqliteCatalog {
    fn candidates(&self, energy_tag: &str) -> Result<Vec<TrackCandidate>> {
        self.query_tracks(
            &format!(
                "SELECT {TRACK_COLUMNS} FROM tracks
                 WHERE lower(energy_tag) = lower(?1) OR energy_tag IS NULL OR trim(energy_tag) = ''
                 ORDER BY rowid"
            ),
            [energy_tag],
        )
    }

    fn full_catalog(&self) -> Result<Vec<TrackCandidate>> {
        self.query_tracks(&format!("SELECT {TRACK_COLUMNS} FROM tracks ORDER BY rowid"), [])
    }

    fn hard_bans(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT track_id FROM bans")?;
        let bans = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()
            .context("Failed to read track bans")?;
        Ok(bans)
    }

    fn artist_bans(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT artist FROM artist_bans")?;
        let bans = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read artist bans")?;
        Ok(bans
            .iter()
            .map(|a| normalize(a))
            .filter(|a| !a.is_empty())
            .collect())
    }

    fn recent_history(&self, limit: usize) -> Result<Vec<TrackCandidate>> {
        self.query_tracks(
            &format!(
                "SELECT {TRACK_COLUMNS} FROM tracks
                 WHERE last_played IS NOT NULL AND last_played != ''
                 ORDER BY last_played DESC, rowid LIMIT ?1"
            ),
            [to_i64(limit)],
        )
    }

    fn record_run(&mut self, record: &RunRecord) -> Result<i64> {
        let warnings = serde_json::to_string(&record.warnings).context("Failed to encode warnings")?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO playlist_runs
                 (run_label, run_at, mode, energy_tag, discovery_ratio, gpt_count, deterministic_count, warnings)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            (
                &record.run_label,
                format_db_time(record.run_at),
                &record.mode,
                &record.energy_tag,
                record.discovery_ratio,
                to_i64(record.gpt_count),
                to_i64(record.deterministic_count),
                warnings,
            ),
        )
        .context("Failed to record playlist run")?;
        let run_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO playlist_run_tracks (run_id, position, track_id, source, gpt_reason, gpt_confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (position, track) in record.tracks.iter().enumerate() {
                stmt.execute((
                    run_id,
                    to_i64(position),
                    &track.candidate.track_id,
                    track.source.as_str(),
                    &track.rationale,
                    track.confidence,
                ))
                .context("Failed to record run track")?;
            }
        }
        tx.commit().context("Failed to commit playlist run")?;
        debug!("Recorded run {run_id} with {} tracks", record.tracks.len());
        Ok(run_id)
    }

    fn mark_played(&mut self, track_ids: &[String], at: DateTime<Utc>) -> Result<()> {
        let stamp = format_db_time(at);
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE tracks SET last_played = ?1 WHERE track_id = ?2")?;
            for id in track_ids {
                stmt.execute((&stamp, id))
                    .with_context(|| format!("Failed to mark {id} as played"))?;
            }
        }
        tx.commit().context("Failed to commit last-played updates")?;
        Ok(())
    }

    fn last_run(&self) -> Result<Option<LastRun>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, run_at FROM playlist_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("Failed to read last run")?;
        let Some((run_id, run_at)) = row else {
            return Ok(None);
        };
        let Some(run_at) = parse_db_time(&run_at) else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare("SELECT track_id FROM playlist_run_tracks WHERE run_id = ?1 ORDER BY position")?;
        let track_ids = stmt
            .query_map([run_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read last run tracks")?;
        Ok(Some(LastRun { run_at, track_ids }))
    }

    fn recent_run_tracks(&self, since: DateTime<Utc>) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT rt.track_id FROM playlist_run_tracks rt
             JOIN playlist_runs r ON r.id = rt.run_id
             WHERE r.run_at >= ?1",
        )?;
        let ids = stmt
            .query_map([format_db_time(since)], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()
            .context("Failed to read recent run tracks")?;
        Ok(ids)
    }

    fn record_removed_bans(&mut self, track_ids: &[String], at: DateTime<Utc>) -> Result<Vec<String>> {
        let stamp = format_db_time(at);
        let tx = self.conn.transaction()?;
        let mut newly_banned = Vec::new();
        {
            let mut lookup = tx.prepare("SELECT artist, title FROM tracks WHERE track_id = ?1")?;
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO bans (track_id, artist, title, reason, banned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for id in track_ids {
                let (artist, title): (String, String) = lookup
                    .query_row([id], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?
                    .unwrap_or_default();
                insert
                    .execute((id, &artist, &title, REMOVED_REASON, &stamp))
                    .with_context(|| format!("Failed to ban removed track {id}"))?;
            }

            let mut banned_artists = tx.prepare("SELECT artist FROM bans WHERE reason = ?1")?;
            let artists = banned_artists
                .query_map([REMOVED_REASON], |row| row.get::<_, Option<String>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut counts: HashMap<String, usize> = HashMap::new();
            for artist in artists.iter().flatten() {
                let key = normalize(artist);
                if !key.is_empty() {
                    *counts.entry(key).or_insert(0) += 1;
                }
            }

            let mut ban_artist = tx.prepare(
                "INSERT OR IGNORE INTO artist_bans (artist, reason, banned_at) VALUES (?1, ?2, ?3)",
            )?;
            let mut keys: Vec<_> = counts
                .into_iter()
                .filter(|(_, n)| *n >= ARTIST_BAN_THRESHOLD)
                .map(|(artist, _)| artist)
                .collect();
            keys.sort();
            for artist in keys {
                let reason = format!("{ARTIST_BAN_THRESHOLD}+ tracks {REMOVED_REASON}");
                if ban_artist.execute((&artist, reason, &stamp))? > 0 {
                    newly_banned.push(artist);
                }
            }
        }
        tx.commit().context("Failed to commit removed-track bans")?;
        Ok(newly_banned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{SelectedTrack, TrackSource};
    use chrono::Duration;

    fn tagged(id: &str, artist: &str, tag: Option<&str>) -> TrackCandidate {
        TrackCandidate {
            energy_tag: tag.map(str::to_string),
            ..TrackCandidate::new(id, artist, format!("{id} title"))
        }
    }

    fn run(at: DateTime<Utc>, ids: &[&str]) -> RunRecord {
        RunRecord {
            run_label: "test".to_string(),
            run_at: at,
            mode: "monday".to_string(),
            energy_tag: "monday".to_string(),
            discovery_ratio: 0.0,
            tracks: ids
                .iter()
                .map(|id| SelectedTrack {
                    candidate: TrackCandidate::new(*id, "A", "T"),
                    source: TrackSource::Deterministic,
                    score: 0.0,
                    rationale: None,
                    confidence: None,
                })
                .collect(),
            gpt_count: 0,
            deterministic_count: ids.len(),
            warnings: vec!["careful".to_string()],
        }
    }

    #[test]
    fn test_schema_is_idempotent() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog.init_schema().unwrap();
        catalog.init_schema().unwrap();
        assert_eq!(catalog.track_count().unwrap(), 0);
    }

    #[test]
    fn test_candidates_include_untagged_tracks_in_catalog_order() {
        let mut catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog
            .upsert_tracks(
                &[
                    tagged("1", "A", Some("Monday")),
                    tagged("2", "B", Some("friday")),
                    tagged("3", "C", None),
                ],
                "test",
            )
            .unwrap();

        let ids: Vec<String> = catalog
            .candidates("monday")
            .unwrap()
            .into_iter()
            .map(|t| t.track_id)
            .collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(catalog.full_catalog().unwrap().len(), 3);
    }

    #[test]
    fn test_upsert_keeps_existing_tag_and_strips_uri() {
        let mut catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog.upsert_tracks(&[tagged("spotify:track:1", "A", Some("monday"))], "a").unwrap();
        catalog.upsert_tracks(&[tagged("1", "A2", None)], "b").unwrap();

        let tracks = catalog.full_catalog().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].track_id, "1");
        assert_eq!(tracks[0].artist, "A2");
        assert_eq!(tracks[0].energy_tag.as_deref(), Some("monday"));
    }

    #[test]
    fn test_record_run_and_last_run() {
        let mut catalog = SqliteCatalog::open_in_memory().unwrap();
        assert!(catalog.last_run().unwrap().is_none());

        let now = Utc::now();
        catalog.record_run(&run(now - Duration::days(40), &["old"])).unwrap();
        catalog.record_run(&run(now, &["b", "a"])).unwrap();

        let last = catalog.last_run().unwrap().unwrap();
        assert_eq!(last.track_ids, vec!["b", "a"]);
        assert_eq!(last.run_at, parse_db_time(&format_db_time(now)).unwrap());

        let recent = catalog.recent_run_tracks(now - Duration::days(30)).unwrap();
        assert!(recent.contains("a") && recent.contains("b"));
        assert!(!recent.contains("old"));
    }

    #[test]
    fn test_mark_played_feeds_recent_history() {
        let mut catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog
            .upsert_tracks(&[tagged("1", "A", None), tagged("2", "B", None)], "test")
            .unwrap();
        let now = Utc::now();
        catalog.mark_played(&["2".to_string()], now).unwrap();

        let history = catalog.recent_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].track_id, "2");
        assert!(history[0].last_played.is_some());
    }

    #[test]
    fn test_removed_bans_escalate_to_artist_ban() {
        let mut catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog
            .upsert_tracks(
                &[
                    tagged("1", "The Band", None),
                    tagged("2", "The Band", None),
                    tagged("3", "the band", None),
                    tagged("4", "Other", None),
                ],
                "test",
            )
            .unwrap();
        let now = Utc::now();

        let banned = catalog
            .record_removed_bans(&["1".to_string(), "2".to_string(), "4".to_string()], now)
            .unwrap();
        assert!(banned.is_empty());

        let banned = catalog.record_removed_bans(&["3".to_string()], now).unwrap();
        assert_eq!(banned, vec!["the band"]);

        let track_bans = catalog.hard_bans().unwrap();
        assert_eq!(track_bans.len(), 4);
        assert!(catalog.artist_bans().unwrap().contains("the band"));
    }

    #[test]
    fn test_parse_db_time_accepts_legacy_dates() {
        let parsed = parse_db_time("2024-03-01").unwrap();
        assert_eq!(format_db_time(parsed), "2024-03-01T00:00:00Z");
        assert!(parse_db_time("not a date").is_none());
    }
}
