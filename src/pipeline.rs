//! The daily run: catalog to published playlist.
//!
//! ## Steps
//!
//! 1. Learn from the previous day: saved tracks that appeared in recent runs
//!    become likes, and tracks removed from the live playlist become bans.
//!    Failures here are warnings.
//! 2. Load the candidate pool for today's energy tag, dropping banned and
//!    cooling-down tracks. An empty pool falls back to the whole catalog; if
//!    that is empty too the run fails with
//!    [`PipelineError::EmptyCandidatePool`].
//! 3. Score, rank and shortlist.
//! 4. Optionally ask GPT for picks from the shortlist.
//! 5. Merge the picks with the ranking and fill to the size and duration
//!    targets, re-checking every rule.
//! 6. Publish the playlist. A failed write aborts the run before anything is
//!    recorded.
//! 7. Record the run, mark tracks played, append the `generated` event and
//!    the GPT history.
//!
//! The run is single-threaded and all inputs are read once at the start, so a
//! given catalog, profile, feedback log and clock always produce the same
//! playlist.

use crate::algorithm::{self, rank_candidates, statistics, ScoringContext};
use crate::config::Settings;
use crate::db::TrackCandidate;
use crate::error::{PipelineError, Result};
use crate::fatigue::FeedbackState;
use crate::feedback::{record_like, EventStore, FeedbackEvent, JsonlLog};
use crate::queue::{merge_and_fill, MergeConfig, SelectedTrack, TrackSource};
use crate::recommender::{
    build_prompt, request_recommendations, CompletionClient, GptHistoryEntry, PromptRequest,
};
use crate::taste::{resolve_discovery_ratio, RuleEngine, TasteProfile};
use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;

/// Catalog and run history.
pub trait CatalogStore {
    /// Tracks tagged `energy_tag` plus untagged tracks, in catalog order.
    fn candidates(&self, energy_tag: &str) -> anyhow::Result<Vec<TrackCandidate>>;
    fn full_catalog(&self) -> anyhow::Result<Vec<TrackCandidate>>;
    /// Banned track ids.
    fn hard_bans(&self) -> anyhow::Result<HashSet<String>>;
    /// Banned artists, normalized.
    fn artist_bans(&self) -> anyhow::Result<HashSet<String>>;
    /// Most recently played tracks, newest first.
    fn recent_history(&self, limit: usize) -> anyhow::Result<Vec<TrackCandidate>>;
    fn record_run(&mut self, record: &RunRecord) -> anyhow::Result<i64>;
    fn mark_played(&mut self, track_ids: &[String], at: DateTime<Utc>) -> anyhow::Result<()>;
    fn last_run(&self) -> anyhow::Result<Option<LastRun>>;
    /// Ids of tracks that appeared in any run since `since`.
    fn recent_run_tracks(&self, since: DateTime<Utc>) -> anyhow::Result<HashSet<String>>;
    /// Ban removed tracks; returns artists that became banned as a result.
    fn record_removed_bans(&mut self, track_ids: &[String], at: DateTime<Utc>) -> anyhow::Result<Vec<String>>;
}

/// A track the user saved in the playlist service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedTrack {
    pub track_id: String,
    pub artist: String,
}

/// The playlist service.
pub trait PlaylistService {
    fn replace_tracks(&self, playlist_id: &str, uris: &[String]) -> anyhow::Result<()>;
    fn append_tracks(&self, playlist_id: &str, uris: &[String]) -> anyhow::Result<()>;
    fn playlist_track_ids(&self, playlist_id: &str) -> anyhow::Result<Vec<String>>;
    fn recent_saved_tracks(&self, limit: usize) -> anyhow::Result<Vec<SavedTrack>>;
}

/// Replace the playlist with the first batch and append the rest in order.
/// Any failing request aborts the publish.
///
/// # Errors
///
/// Returns the first request error.
pub fn publish_playlist(
    service: &dyn PlaylistService,
    playlist_id: &str,
    track_ids: &[String],
    batch_size: usize,
) -> anyhow::Result<()> {
    let uris: Vec<String> = track_ids.iter().map(|id| format!("spotify:track:{id}")).collect();
    let mut batches = uris.chunks(batch_size.max(1));
    service.replace_tracks(playlist_id, batches.next().unwrap_or(&[]))?;
    for batch in batches {
        service.append_tracks(playlist_id, batch)?;
    }
    info!("Published {} tracks to playlist {playlist_id}", uris.len());
    Ok(())
}

/// The previous run, as needed for removed-track detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastRun {
    pub run_at: DateTime<Utc>,
    pub track_ids: Vec<String>,
}

/// Audit record of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_label: String,
    pub run_at: DateTime<Utc>,
    pub mode: String,
    pub energy_tag: String,
    pub discovery_ratio: f64,
    pub tracks: Vec<SelectedTrack>,
    pub gpt_count: usize,
    pub deterministic_count: usize,
    pub warnings: Vec<String>,
}

impl RunRecord {
    #[must_use]
    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.candidate.track_id.clone()).collect()
    }
}

/// Energy tag for a weekday: `monday` through `sunday`.
#[must_use]
pub fn energy_tag_for(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub now: DateTime<Utc>,
    pub energy_tag: String,
    /// Defaults to the energy tag.
    pub mode: Option<String>,
    pub use_gpt: bool,
    /// Build everything but publish and record nothing.
    pub dry_run: bool,
}

impl RunOptions {
    #[must_use]
    pub fn for_date(now: DateTime<Utc>, weekday: Weekday) -> Self {
        Self {
            now,
            energy_tag: energy_tag_for(weekday).to_string(),
            mode: None,
            use_gpt: true,
            dry_run: false,
        }
    }

    #[must_use]
    pub fn mode(&self) -> &str {
        self.mode.as_deref().unwrap_or(&self.energy_tag)
    }
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub record: RunRecord,
    pub published: bool,
    pub fell_back_to_full_catalog: bool,
    pub candidate_count: usize,
    pub shortlist_count: usize,
}

/// Everything a run reads from and writes to.
pub struct DailyDj<'a> {
    pub settings: &'a Settings,
    pub profile: &'a TasteProfile,
    pub catalog: &'a mut dyn CatalogStore,
    pub events: &'a dyn EventStore,
    pub playlist: Option<&'a dyn PlaylistService>,
    pub completion: Option<&'a dyn CompletionClient>,
    /// Where accepted GPT picks are logged.
    pub gpt_log: Option<&'a JsonlLog>,
}

fn push_warning(warnings: &mut Vec<String>, message: String) {
    warn!("{message}");
    warnings.push(message);
}

impl DailyDj<'_> {
    /// Run the whole pipeline once.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmptyCandidatePool`] when nothing is eligible,
    /// [`PipelineError::PlaylistService`] when publishing fails, and
    /// [`PipelineError::Storage`] when the catalog or feedback log cannot be
    /// read or the run cannot be recorded.
    pub fn run(&mut self, options: &RunOptions) -> Result<RunReport> {
        let now = options.now;
        let mode = options.mode().to_string();
        let mut warnings = Vec::new();

        let mut profile = self.profile.for_mode(&mode);
        if profile.constraints.no_repeat_days.is_none() {
            profile.constraints.no_repeat_days = Some(self.settings.no_repeat_days);
        }
        let threshold = profile.learning.artist_like_threshold;

        let events = self.events.read_all().map_err(PipelineError::Storage)?;
        let mut feedback = FeedbackState::from_events(&events, threshold);

        if !options.dry_run {
            self.learn_from_service(&mut feedback, threshold, now, &mut warnings);
        }

        let track_bans = self.catalog.hard_bans().map_err(PipelineError::Storage)?;
        let artist_bans = self.catalog.artist_bans().map_err(PipelineError::Storage)?;
        let engine = RuleEngine::new(&profile, &artist_bans, &track_bans, &feedback, now);

        let (pool, fell_back) = self.load_pool(&options.energy_tag, &engine, &mut warnings)?;
        let candidate_count = pool.len();

        let ctx = ScoringContext {
            profile: &profile,
            feedback: &feedback,
            weights: &self.settings.weights,
            now,
        };
        let ranked = rank_candidates(pool, &ctx);
        if let Some(stats) = statistics::summarize(&ranked) {
            debug!(
                "Scores over {} candidates: mean {:.2}, median {:.2}, range {:.2}..{:.2}",
                stats.count, stats.mean, stats.median, stats.min, stats.max
            );
        }
        let shortlist = algorithm::shortlist(&ranked, &engine, self.settings.candidate_limit);

        let discovery_ratio =
            resolve_discovery_ratio(self.profile, &mode, self.settings.discovery_ratio);
        let merge_config = MergeConfig {
            target_total: self.settings.tracks_per_day,
            discovery_ratio,
            duration: self.settings.duration_target(),
        };

        let wants_gpt = options.use_gpt
            && self.settings.enable_gpt
            && merge_config.discovery_target() > 0
            && !shortlist.is_empty();
        let recommendations = match (wants_gpt, self.completion) {
            (true, Some(client)) => {
                let history = self
                    .catalog
                    .recent_history(self.settings.max_history_items)
                    .map_err(PipelineError::Storage)?;
                let prompt = build_prompt(&PromptRequest {
                    playlist_name: &self.settings.playlist_name,
                    timezone_hint: &self.settings.timezone_hint,
                    mode: &mode,
                    profile: &profile,
                    history: &history,
                    shortlist: &shortlist,
                    target_count: merge_config.discovery_target(),
                });
                let ids: HashSet<String> = shortlist
                    .iter()
                    .map(|s| s.candidate.track_id.clone())
                    .collect();
                let (recs, gpt_warnings) = request_recommendations(client, &prompt, &ids);
                for w in gpt_warnings {
                    push_warning(&mut warnings, w);
                }
                recs
            }
            (true, None) => {
                push_warning(
                    &mut warnings,
                    "GPT recommender not configured; using deterministic ranking only".to_string(),
                );
                Vec::new()
            }
            (false, _) => Vec::new(),
        };

        let mut outcome = merge_and_fill(&ranked, &shortlist, &recommendations, &merge_config, &engine);
        for w in outcome.warnings.drain(..) {
            push_warning(&mut warnings, w);
        }
        let before = outcome.tracks.len();
        outcome.tracks.retain(|t| !engine.is_hard_banned(&t.candidate));
        if outcome.tracks.len() != before {
            push_warning(
                &mut warnings,
                format!("Removed {} hard-banned tracks after merge", before - outcome.tracks.len()),
            );
        }

        let record = RunRecord {
            run_label: format!("{} {}", self.settings.playlist_name, now.format("%Y-%m-%d")),
            run_at: now,
            mode: mode.clone(),
            energy_tag: options.energy_tag.clone(),
            discovery_ratio,
            gpt_count: outcome.count(TrackSource::Gpt),
            deterministic_count: outcome.count(TrackSource::Deterministic),
            tracks: outcome.tracks,
            warnings,
        };
        let mut report = RunReport {
            record,
            published: false,
            fell_back_to_full_catalog: fell_back,
            candidate_count,
            shortlist_count: shortlist.len(),
        };

        if options.dry_run {
            info!("Dry run: {} tracks selected, nothing published", report.record.tracks.len());
            return Ok(report);
        }
        if report.record.tracks.is_empty() {
            push_warning(
                &mut report.record.warnings,
                "No tracks passed the rules; playlist left unchanged".to_string(),
            );
            return Ok(report);
        }

        let playlist = self.playlist.ok_or_else(|| {
            PipelineError::PlaylistService(anyhow::anyhow!("no playlist service configured"))
        })?;
        if self.settings.playlist_id.trim().is_empty() {
            return Err(PipelineError::PlaylistService(anyhow::anyhow!(
                "playlist_id is not set in settings.json"
            )));
        }
        let track_ids = report.record.track_ids();
        publish_playlist(
            playlist,
            &self.settings.playlist_id,
            &track_ids,
            self.settings.spotify.batch_size,
        )
        .map_err(PipelineError::PlaylistService)?;
        report.published = true;

        self.persist(&report, candidate_count)?;
        Ok(report)
    }

    fn load_pool(
        &self,
        energy_tag: &str,
        engine: &RuleEngine<'_>,
        warnings: &mut Vec<String>,
    ) -> Result<(Vec<TrackCandidate>, bool)> {
        let eligible = |tracks: Vec<TrackCandidate>| -> Vec<TrackCandidate> {
            tracks
                .into_iter()
                .filter(|t| match engine.check_history(t) {
                    Ok(()) => true,
                    Err(reason) => {
                        debug!("Excluding {} - {}: {reason}", t.artist, t.title);
                        false
                    }
                })
                .collect()
        };

        let tagged = self.catalog.candidates(energy_tag).map_err(PipelineError::Storage)?;
        let pool = eligible(tagged);
        if !pool.is_empty() {
            info!("{} eligible candidates for {energy_tag}", pool.len());
            return Ok((pool, false));
        }

        push_warning(
            warnings,
            format!("No eligible tracks tagged {energy_tag}; falling back to the full catalog"),
        );
        let pool = eligible(self.catalog.full_catalog().map_err(PipelineError::Storage)?);
        if pool.is_empty() {
            return Err(PipelineError::EmptyCandidatePool {
                energy_tag: energy_tag.to_string(),
            });
        }
        Ok((pool, true))
    }

    fn learn_from_service(
        &mut self,
        feedback: &mut FeedbackState,
        threshold: u32,
        now: DateTime<Utc>,
        warnings: &mut Vec<String>,
    ) {
        let Some(playlist) = self.playlist else {
            return;
        };

        match detect_liked_tracks(
            playlist,
            &*self.catalog,
            self.events,
            feedback,
            threshold,
            now - Duration::days(i64::from(self.settings.like_lookback_days)),
            now,
        ) {
            Ok(0) => {}
            Ok(n) => info!("Recorded {n} new likes"),
            Err(e) => push_warning(warnings, format!("Like detection skipped: {e:#}")),
        }

        if self.settings.playlist_id.trim().is_empty() {
            return;
        }
        if let Err(e) = ban_removed_tracks(playlist, &mut *self.catalog, &self.settings.playlist_id, now) {
            push_warning(warnings, format!("Removed-track bans skipped: {e:#}"));
        }
    }

    fn persist(&mut self, report: &RunReport, candidate_count: usize) -> Result<()> {
        let record = &report.record;
        let track_ids = record.track_ids();

        // a failed append must leave no recorded run behind
        self.events
            .append(&FeedbackEvent::Generated {
                timestamp: record.run_at,
                picks: track_ids.clone(),
                artists: record.tracks.iter().map(|t| t.candidate.artist.clone()).collect(),
                mode: Some(record.mode.clone()),
                energy_tag: Some(record.energy_tag.clone()),
                discovery_ratio: Some(record.discovery_ratio),
                candidate_count: Some(candidate_count),
            })
            .map_err(PipelineError::Storage)?;
        self.catalog.record_run(record).map_err(PipelineError::Storage)?;
        self.catalog
            .mark_played(&track_ids, record.run_at)
            .map_err(PipelineError::Storage)?;

        if let Some(log) = self.gpt_log {
            for track in record.tracks.iter().filter(|t| t.source == TrackSource::Gpt) {
                let entry = GptHistoryEntry::from_selected(track, &record.run_label, record.run_at);
                if let Err(e) = log.append_record(&entry) {
                    warn!("Failed to log GPT pick {}: {e:#}", track.candidate.track_id);
                }
            }
        }
        info!(
            "Recorded run {}: {} tracks ({} GPT, {} deterministic)",
            record.run_label,
            record.tracks.len(),
            record.gpt_count,
            record.deterministic_count
        );
        Ok(())
    }
}

/// Turn recently saved tracks that appeared in a run since `since` into like
/// events. Already-liked tracks are skipped. Returns the number of new likes.
///
/// # Errors
///
/// Fails if the service, catalog or log cannot be read or written.
pub fn detect_liked_tracks(
    playlist: &dyn PlaylistService,
    catalog: &dyn CatalogStore,
    events: &dyn EventStore,
    feedback: &mut FeedbackState,
    threshold: u32,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let saved = playlist.recent_saved_tracks(50)?;
    let recent = catalog.recent_run_tracks(since)?;

    let mut recorded = 0;
    for track in saved {
        if feedback.is_liked(&track.track_id) || !recent.contains(&track.track_id) {
            continue;
        }
        let artist = Some(track.artist.as_str()).filter(|a| !a.is_empty());
        record_like(events, feedback, Some(&track.track_id), artist, threshold, now)?;
        recorded += 1;
    }
    Ok(recorded)
}

/// Ban tracks that were in the last run but are gone from the live playlist.
/// Skipped when the last run happened on the same day as `now`.
///
/// # Errors
///
/// Fails if the service or catalog cannot be read or written.
pub fn ban_removed_tracks(
    playlist: &dyn PlaylistService,
    catalog: &mut dyn CatalogStore,
    playlist_id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let Some(last) = catalog.last_run()? else {
        return Ok(0);
    };
    if last.run_at.date_naive() >= now.date_naive() {
        debug!("Last run was today; not checking for removed tracks");
        return Ok(0);
    }

    let live: HashSet<String> = playlist.playlist_track_ids(playlist_id)?.into_iter().collect();
    let removed: Vec<String> = last
        .track_ids
        .into_iter()
        .filter(|id| !live.contains(id))
        .collect();
    if removed.is_empty() {
        return Ok(0);
    }

    let artists = catalog.record_removed_bans(&removed, now)?;
    info!("Banned {} tracks removed from the playlist", removed.len());
    for artist in artists {
        info!("Banned artist {artist} after repeated removals");
    }
    Ok(removed.len())
}

/// Today's weekday in the local time zone.
#[must_use]
pub fn local_weekday() -> Weekday {
    chrono::Local::now().weekday()
}
