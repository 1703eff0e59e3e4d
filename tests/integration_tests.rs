//! # Integration Tests for DailyDJ
//!
//! End-to-end runs against a real SQLite catalog and JSONL feedback log in a
//! temporary directory, with in-process fakes for the playlist service and
//! the completion endpoint. The CLI tests drive the built binary.

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dailydj::config::Settings;
use dailydj::db::{SqliteCatalog, TrackCandidate};
use dailydj::error::PipelineError;
use dailydj::feedback::{EventStore, FeedbackEvent, JsonlLog};
use dailydj::pipeline::{
    CatalogStore, DailyDj, PlaylistService, RunOptions, RunReport, SavedTrack,
};
use dailydj::queue::TrackSource;
use dailydj::recommender::{CompletionClient, GptHistoryEntry};
use dailydj::taste::TasteProfile;
use std::cell::RefCell;
use std::collections::HashMap;
use tempfile::TempDir;

const ARTISTS: [&str; 10] = [
    "Robyn", "Lorde", "Haim", "Bjork", "Sade", "Blur", "Pulp", "Wham", "Abba", "Cher",
];

/// 2024-06-07 was a Friday.
fn friday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 7, 12, 0, 0).unwrap()
}

/// `t00`..`t19`, artists cycling through [`ARTISTS`], all tagged `friday`.
fn sample_tracks() -> Vec<TrackCandidate> {
    (0..20)
        .map(|i| TrackCandidate {
            energy_tag: Some("friday".to_string()),
            duration_ms: Some(200_000),
            ..TrackCandidate::new(format!("t{i:02}"), ARTISTS[i % 10], format!("Song {i}"))
        })
        .collect()
}

/// Test helper to create a catalog and feedback log in a temporary directory
fn create_test_store(tracks: &[TrackCandidate]) -> Result<(TempDir, SqliteCatalog, JsonlLog)> {
    let temp_dir = TempDir::new()?;
    let mut catalog = SqliteCatalog::open(&temp_dir.path().join("track_history.db"))?;
    catalog.upsert_tracks(tracks, "test")?;
    let events = JsonlLog::new(temp_dir.path().join("state").join("feedback.jsonl"));
    Ok((temp_dir, catalog, events))
}

fn test_settings() -> Settings {
    Settings {
        playlist_id: "p1".to_string(),
        tracks_per_day: 10,
        target_duration_minutes: 0,
        discovery_ratio: 0.5,
        ..Settings::default()
    }
}

/// Playlist service that keeps the playlist in memory.
#[derive(Default)]
struct FakePlaylist {
    live: RefCell<Vec<String>>,
    calls: RefCell<Vec<(&'static str, usize)>>,
    saved: Vec<SavedTrack>,
    fail_on_replace: bool,
}

impl FakePlaylist {
    fn strip(uris: &[String]) -> Vec<String> {
        uris.iter()
            .map(|u| u.trim_start_matches("spotify:track:").to_string())
            .collect()
    }

    fn remove(&self, ids: &[&str]) {
        self.live.borrow_mut().retain(|id| !ids.contains(&id.as_str()));
    }
}

impl PlaylistService for FakePlaylist {
    fn replace_tracks(&self, _playlist_id: &str, uris: &[String]) -> Result<()> {
        if self.fail_on_replace {
            anyhow::bail!("503 Service Unavailable");
        }
        self.calls.borrow_mut().push(("replace", uris.len()));
        *self.live.borrow_mut() = Self::strip(uris);
        Ok(())
    }

    fn append_tracks(&self, _playlist_id: &str, uris: &[String]) -> Result<()> {
        self.calls.borrow_mut().push(("append", uris.len()));
        self.live.borrow_mut().extend(Self::strip(uris));
        Ok(())
    }

    fn playlist_track_ids(&self, _playlist_id: &str) -> Result<Vec<String>> {
        Ok(self.live.borrow().clone())
    }

    fn recent_saved_tracks(&self, limit: usize) -> Result<Vec<SavedTrack>> {
        Ok(self.saved.iter().take(limit).cloned().collect())
    }
}

/// Completion client with a canned answer.
struct CannedGpt(String);

impl CompletionClient for CannedGpt {
    fn complete(&self, _prompt: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

struct Harness<'a> {
    settings: &'a Settings,
    profile: &'a TasteProfile,
    catalog: &'a mut SqliteCatalog,
    events: &'a JsonlLog,
    playlist: Option<&'a dyn PlaylistService>,
    completion: Option<&'a dyn CompletionClient>,
}

impl Harness<'_> {
    fn run(&mut self, options: &RunOptions) -> dailydj::error::Result<RunReport> {
        DailyDj {
            settings: self.settings,
            profile: self.profile,
            catalog: &mut *self.catalog,
            events: self.events,
            playlist: self.playlist,
            completion: self.completion,
            gpt_log: None,
        }
        .run(options)
    }
}

fn options(now: DateTime<Utc>, use_gpt: bool, dry_run: bool) -> RunOptions {
    RunOptions {
        now,
        energy_tag: "friday".to_string(),
        mode: None,
        use_gpt,
        dry_run,
    }
}

fn ids(report: &RunReport) -> Vec<String> {
    report.record.track_ids()
}

#[cfg(test)]
mod selection_tests {
    use super::*;

    #[test]
    fn test_hard_banned_artist_never_published_even_when_gpt_picks_it() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let settings = test_settings();
        let mut profile = TasteProfile::default();
        profile.hard_bans.artists.insert("Robyn".to_string());
        let profile = profile.normalized();
        let gpt = CannedGpt(r#"{"picks": ["t00", "t10", "t01"]}"#.to_string());

        let report = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: None,
            completion: Some(&gpt),
        }
        .run(&options(friday(), true, true))?;

        assert!(report.record.tracks.iter().all(|t| t.candidate.artist != "Robyn"));
        assert_eq!(report.record.tracks[0].candidate.track_id, "t01");
        assert_eq!(report.record.tracks[0].source, TrackSource::Gpt);
        assert!(report.record.warnings.iter().any(|w| w.contains("t00")));
        Ok(())
    }

    #[test]
    fn test_artist_cap_holds_across_the_playlist() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let settings = Settings {
            tracks_per_day: 20,
            ..test_settings()
        };
        let mut profile = TasteProfile::default();
        profile.constraints.max_tracks_per_artist = 1;

        let report = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: None,
            completion: None,
        }
        .run(&options(friday(), false, true))?;

        let mut per_artist: HashMap<&str, usize> = HashMap::new();
        for track in &report.record.tracks {
            *per_artist.entry(track.candidate.artist.as_str()).or_default() += 1;
        }
        assert_eq!(report.record.tracks.len(), 10);
        assert!(per_artist.values().all(|n| *n == 1));
        Ok(())
    }

    #[test]
    fn test_malformed_gpt_output_matches_deterministic_run() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let settings = test_settings();
        let profile = TasteProfile::default();
        let gpt = CannedGpt("Sure! Here are some great songs: t03, t04".to_string());

        let with_gpt = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: None,
            completion: Some(&gpt),
        }
        .run(&options(friday(), true, true))?;
        let without_gpt = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: None,
            completion: None,
        }
        .run(&options(friday(), false, true))?;

        assert_eq!(ids(&with_gpt), ids(&without_gpt));
        assert_eq!(with_gpt.record.gpt_count, 0);
        assert!(with_gpt.record.warnings.iter().any(|w| w.contains("not valid JSON")));
        Ok(())
    }

    #[test]
    fn test_out_of_pool_pick_is_dropped() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let settings = test_settings();
        let profile = TasteProfile::default();
        let gpt = CannedGpt(
            r#"```json
{"picks": [{"id": "zzz", "reason": "classic"}, {"id": "t05", "reason": "fits friday", "confidence": 0.9}]}
```"#
                .to_string(),
        );

        let report = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: None,
            completion: Some(&gpt),
        }
        .run(&options(friday(), true, true))?;

        let first = &report.record.tracks[0];
        assert_eq!(first.candidate.track_id, "t05");
        assert_eq!(first.rationale.as_deref(), Some("fits friday"));
        assert_eq!(first.confidence, Some(0.9));
        assert!(!ids(&report).contains(&"zzz".to_string()));
        assert!(report.record.warnings.iter().any(|w| w.contains("zzz")));
        Ok(())
    }

    #[test]
    fn test_gpt_share_is_bounded_by_discovery_ratio() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let settings = test_settings();
        let profile = TasteProfile::default();
        let every_id: Vec<String> = sample_tracks().into_iter().map(|t| t.track_id).collect();
        let gpt = CannedGpt(serde_json::json!({ "picks": every_id }).to_string());

        let report = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: None,
            completion: Some(&gpt),
        }
        .run(&options(friday(), true, true))?;

        assert_eq!(report.record.tracks.len(), 10);
        assert!(report.record.gpt_count <= 5);
        assert_eq!(report.record.gpt_count + report.record.deterministic_count, 10);
        Ok(())
    }

    #[test]
    fn test_same_inputs_give_identical_runs() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let settings = test_settings();
        let mut profile = TasteProfile::default();
        profile.boost.artists.insert("haim".to_string());
        profile.avoid.artists.insert("cher".to_string());

        let mut encoded = Vec::new();
        for _ in 0..2 {
            let report = Harness {
                settings: &settings,
                profile: &profile,
                catalog: &mut catalog,
                events: &events,
                playlist: None,
                completion: None,
            }
            .run(&options(friday(), false, true))?;
            encoded.push(serde_json::to_string(&report)?);
        }
        assert_eq!(encoded[0], encoded[1]);
        Ok(())
    }

    #[test]
    fn test_empty_catalog_is_fatal() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&[])?;
        let settings = test_settings();
        let profile = TasteProfile::default();

        let result = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: None,
            completion: None,
        }
        .run(&options(friday(), false, true));

        assert!(matches!(result, Err(PipelineError::EmptyCandidatePool { .. })));
        Ok(())
    }

    #[test]
    fn test_untagged_day_falls_back_to_full_catalog() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let settings = test_settings();
        let profile = TasteProfile::default();
        let mut monday = options(friday(), false, true);
        monday.energy_tag = "monday".to_string();

        let report = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: None,
            completion: None,
        }
        .run(&monday)?;

        assert!(report.fell_back_to_full_catalog);
        assert_eq!(report.record.tracks.len(), 10);
        Ok(())
    }
}

#[cfg(test)]
mod publish_tests {
    use super::*;

    #[test]
    fn test_publish_records_run_and_cools_tracks_down() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let settings = test_settings();
        let mut profile = TasteProfile::default();
        profile.constraints.cooldown_days_same_artist = 0;
        let playlist = FakePlaylist::default();

        let mut harness = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: Some(&playlist),
            completion: None,
        };
        let day_one = harness.run(&options(friday(), false, false))?;
        assert!(day_one.published);
        assert_eq!(*playlist.live.borrow(), ids(&day_one));

        let day_two = harness.run(&options(friday() + Duration::days(1), false, false))?;
        assert!(day_two.published);
        for id in ids(&day_two) {
            assert!(!ids(&day_one).contains(&id), "{id} played again inside its cooldown");
        }

        let generated = events
            .read_all()?
            .into_iter()
            .filter(|e| matches!(e, FeedbackEvent::Generated { .. }))
            .count();
        assert_eq!(generated, 2);
        let last = catalog.last_run()?.unwrap();
        assert_eq!(last.track_ids, ids(&day_two));
        Ok(())
    }

    #[test]
    fn test_publish_batches_follow_configured_size() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let mut settings = test_settings();
        settings.spotify.batch_size = 4;
        let profile = TasteProfile::default();
        let playlist = FakePlaylist::default();

        Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: Some(&playlist),
            completion: None,
        }
        .run(&options(friday(), false, false))?;

        assert_eq!(
            *playlist.calls.borrow(),
            vec![("replace", 4), ("append", 4), ("append", 2)]
        );
        Ok(())
    }

    #[test]
    fn test_failed_publish_records_nothing() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let settings = test_settings();
        let profile = TasteProfile::default();
        let playlist = FakePlaylist {
            fail_on_replace: true,
            ..FakePlaylist::default()
        };

        let result = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: Some(&playlist),
            completion: None,
        }
        .run(&options(friday(), false, false));

        assert!(matches!(result, Err(PipelineError::PlaylistService(_))));
        assert!(catalog.last_run()?.is_none());
        assert!(catalog.recent_history(10)?.is_empty());
        assert!(events.read_all()?.is_empty());
        Ok(())
    }

    /// Feedback log that reads fine but refuses writes.
    struct ReadOnlyEvents;

    impl EventStore for ReadOnlyEvents {
        fn append(&self, _event: &FeedbackEvent) -> Result<()> {
            anyhow::bail!("read-only file system");
        }

        fn read_all(&self) -> Result<Vec<FeedbackEvent>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_unwritable_feedback_log_records_no_run() -> Result<()> {
        let (_dir, mut catalog, _events) = create_test_store(&sample_tracks())?;
        let settings = test_settings();
        let profile = TasteProfile::default();
        let playlist = FakePlaylist::default();

        let result = DailyDj {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &ReadOnlyEvents,
            playlist: Some(&playlist),
            completion: None,
            gpt_log: None,
        }
        .run(&options(friday(), false, false));

        assert!(matches!(result, Err(PipelineError::Storage(_))));
        assert!(catalog.last_run()?.is_none());
        assert!(catalog.recent_history(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_accepted_gpt_picks_are_logged() -> Result<()> {
        let (dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let settings = test_settings();
        let profile = TasteProfile::default();
        let playlist = FakePlaylist::default();
        let gpt = CannedGpt(r#"{"picks": [{"id": "t07", "reason": "late-week lift"}, "nope"]}"#.to_string());
        let gpt_log = JsonlLog::new(dir.path().join("data").join("gpt_history.jsonl"));

        let report = DailyDj {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: Some(&playlist),
            completion: Some(&gpt),
            gpt_log: Some(&gpt_log),
        }
        .run(&options(friday(), true, false))?;
        assert_eq!(report.record.gpt_count, 1);

        let entries: Vec<GptHistoryEntry> = gpt_log.read_records()?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].track_id, "t07");
        assert_eq!(entries[0].artist, "Wham");
        assert_eq!(entries[0].rationale.as_deref(), Some("late-week lift"));
        Ok(())
    }

    #[test]
    fn test_dry_run_leaves_no_trace() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let settings = test_settings();
        let profile = TasteProfile::default();
        let playlist = FakePlaylist::default();

        let report = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: Some(&playlist),
            completion: None,
        }
        .run(&options(friday(), false, true))?;

        assert!(!report.published);
        assert!(playlist.calls.borrow().is_empty());
        assert!(catalog.last_run()?.is_none());
        assert!(events.read_all()?.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod learning_tests {
    use super::*;
    use dailydj::pipeline::ban_removed_tracks;

    #[test]
    fn test_saved_tracks_from_recent_runs_become_likes() -> Result<()> {
        let (_dir, mut catalog, events) = create_test_store(&sample_tracks())?;
        let settings = test_settings();
        let mut profile = TasteProfile::default();
        profile.constraints.cooldown_days_same_artist = 0;
        profile.constraints.cooldown_days_same_track = 1;
        profile.constraints.no_repeat_days = Some(1);
        profile.learning.artist_like_threshold = 1;
        let playlist = FakePlaylist {
            saved: vec![
                SavedTrack {
                    track_id: "t00".to_string(),
                    artist: "Robyn".to_string(),
                },
                SavedTrack {
                    track_id: "never-played".to_string(),
                    artist: "Somebody".to_string(),
                },
            ],
            ..FakePlaylist::default()
        };

        let mut harness = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: Some(&playlist),
            completion: None,
        };
        harness.run(&options(friday(), false, false))?;
        harness.run(&options(friday() + Duration::days(1), false, false))?;
        // a third run must not record the same like again
        harness.run(&options(friday() + Duration::days(2), false, false))?;

        let all = events.read_all()?;
        let likes: Vec<_> = all
            .iter()
            .filter_map(|e| match e {
                FeedbackEvent::LikeTrack { track_id, .. } => track_id.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(likes, vec!["t00".to_string()]);
        assert!(all
            .iter()
            .any(|e| matches!(e, FeedbackEvent::BoostArtistAuto { artist, .. } if artist == "Robyn")));
        Ok(())
    }

    #[test]
    fn test_removed_tracks_are_banned_and_three_ban_the_artist() -> Result<()> {
        let mut tracks = sample_tracks();
        for track in tracks.iter_mut().take(3) {
            track.artist = "Robyn".to_string();
        }
        let (_dir, mut catalog, events) = create_test_store(&tracks)?;
        let settings = test_settings();
        let mut profile = TasteProfile::default();
        profile.constraints.max_tracks_per_artist = 3;
        let playlist = FakePlaylist::default();

        let day_one = Harness {
            settings: &settings,
            profile: &profile,
            catalog: &mut catalog,
            events: &events,
            playlist: Some(&playlist),
            completion: None,
        }
        .run(&options(friday(), false, false))?;
        assert!(ids(&day_one).starts_with(&["t00".to_string(), "t01".to_string(), "t02".to_string()]));

        playlist.remove(&["t00", "t01", "t02"]);
        assert_eq!(ban_removed_tracks(&playlist, &mut catalog, "p1", friday())?, 0);

        let banned = ban_removed_tracks(&playlist, &mut catalog, "p1", friday() + Duration::days(1))?;
        assert_eq!(banned, 3);
        let track_bans = catalog.hard_bans()?;
        assert!(["t00", "t01", "t02"].iter().all(|id| track_bans.contains(*id)));
        assert!(catalog.artist_bans()?.contains("robyn"));
        Ok(())
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use std::process::{Command, Output};

    fn dailydj(home: &TempDir, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_dailydj"))
            .arg("--home")
            .arg(home.path())
            .args(args)
            .env_remove("SPOTIFY_ACCESS_TOKEN")
            .env_remove("OPENAI_API_KEY")
            .output()
            .expect("Failed to run dailydj")
    }

    #[test]
    fn test_cli_help_lists_commands() {
        let home = TempDir::new().unwrap();
        let output = dailydj(&home, &["--help"]);
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(output.status.success());
        for command in ["run", "init", "doctor", "print-config", "like", "import"] {
            assert!(stdout.contains(command), "missing {command}");
        }
    }

    #[test]
    fn test_init_then_print_config() {
        let home = TempDir::new().unwrap();
        let output = dailydj(&home, &["init"]);
        assert!(output.status.success());
        assert!(home.path().join("config").join("settings.json").exists());
        assert!(home.path().join("config").join("taste_profile.json").exists());
        assert!(home.path().join("track_history.db").exists());

        let output = dailydj(&home, &["print-config"]);
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(output.status.success());
        assert!(stdout.contains("My Daily DJ"));
        assert!(stdout.contains("gpt-4o-mini"));
    }

    #[test]
    fn test_doctor_fails_before_init() {
        let home = TempDir::new().unwrap();
        assert!(!dailydj(&home, &["doctor"]).status.success());
        assert!(dailydj(&home, &["init"]).status.success());
        assert!(dailydj(&home, &["doctor"]).status.success());
    }

    #[test]
    fn test_dry_run_from_the_command_line() {
        let home = TempDir::new().unwrap();
        assert!(dailydj(&home, &["init"]).status.success());
        let output = dailydj(&home, &["add", "t1", "Robyn", "Dancing On My Own"]);
        assert!(output.status.success());

        let output = dailydj(&home, &["run", "--dry-run", "--no-gpt"]);
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        assert!(stdout.contains("Robyn - Dancing On My Own"));
        assert!(stdout.contains("Playlist not updated."));
    }

    #[test]
    fn test_like_writes_feedback_event() {
        let home = TempDir::new().unwrap();
        let output = dailydj(&home, &["like", "spotify:track:abc", "--artist", "Robyn"]);
        assert!(output.status.success());

        let log = JsonlLog::new(home.path().join("state").join("feedback.jsonl"));
        let events = log.read_all().unwrap();
        assert!(matches!(
            &events[..],
            [FeedbackEvent::LikeTrack { track_id: Some(id), .. }] if id == "abc"
        ));
    }

    #[test]
    fn test_completion_generation() {
        let home = TempDir::new().unwrap();
        let output = dailydj(&home, &["completion", "bash"]);
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("_dailydj"));
        assert!(stdout.contains("complete"));
    }
}
