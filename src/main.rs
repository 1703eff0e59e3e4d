//! # DailyDJ
//!
//! Builds a personal daily playlist from a local track catalog under taste
//! rules, optionally blends in GPT picks drawn from a fixed shortlist, and
//! learns from what the user likes and removes.
//!
//! ## Usage
//!
//! ```bash
//! # Set up ~/.dailydj (or $DAILYDJ_HOME)
//! dailydj init
//!
//! # Fill the catalog
//! dailydj import tracks.json
//! dailydj add 4uLU6hMCjMI75M1A2tKUQC "Rick Astley" "Never Gonna Give You Up" --energy-tag friday
//!
//! # Preview, then publish
//! dailydj run --dry-run --verbose
//! SPOTIFY_ACCESS_TOKEN=... OPENAI_API_KEY=... dailydj run
//! ```

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser};
use dailydj::cli::{self, Command};
use dailydj::completion;
use dailydj::config::{self, Paths, Settings};
use dailydj::db::{SqliteCatalog, TrackCandidate};
use dailydj::fatigue::FeedbackState;
use dailydj::feedback::{self, EventStore, JsonlLog};
use dailydj::pipeline::{self, CatalogStore, DailyDj, PlaylistService, RunOptions, RunReport};
use dailydj::queue::TrackSource;
use dailydj::recommender::{CompletionClient, OpenAiClient};
use dailydj::spotify::SpotifyClient;
use dailydj::taste::TasteProfile;
use log::{info, warn};
use std::fs;
use std::path::Path;

/// Main entry point for DailyDJ.
///
/// Logging is controlled with `RUST_LOG`:
/// - `RUST_LOG=info dailydj run` - run summaries
/// - `RUST_LOG=dailydj::queue=debug dailydj run` - why tracks were skipped
fn main() -> Result<()> {
    env_logger::init();

    let args = cli::Args::parse();

    if let Command::Completion { shell } = &args.command {
        let mut cmd = cli::Args::command();
        completion::generate_completions(completion::shell_to_completion_shell(shell), &mut cmd);
        return Ok(());
    }

    let paths = Paths::resolve(args.home.as_deref())?;

    match args.command {
        Command::Run {
            mode,
            energy_tag,
            dry_run,
            no_gpt,
            verbose,
        } => run_daily(&paths, mode, energy_tag, dry_run, no_gpt, verbose)?,
        Command::Init { dry_run } => init_home(&paths, dry_run)?,
        Command::Doctor => doctor(&paths)?,
        Command::PrintConfig => print_config(&paths)?,
        Command::Like { track, artist } => like_track(&paths, &track, artist.as_deref())?,
        Command::Add {
            track_id,
            artist,
            title,
            energy_tag,
            duration_ms,
            source,
        } => {
            let track = TrackCandidate {
                energy_tag,
                duration_ms,
                ..TrackCandidate::new(track_id, artist, title)
            };
            paths.ensure_dirs()?;
            let mut catalog = SqliteCatalog::open(&paths.db_path)?;
            catalog.upsert_tracks(std::slice::from_ref(&track), &source)?;
            println!("Added {} - {}", track.artist, track.title);
        }
        Command::Import {
            file,
            energy_tag,
            source,
            dry_run,
        } => import_tracks(&paths, &file, energy_tag.as_deref(), &source, dry_run)?,
        Command::Recent { limit } => {
            let catalog = SqliteCatalog::open(&paths.db_path)?;
            let tracks = catalog.recent_history(limit)?;
            if tracks.is_empty() {
                println!("No plays recorded yet.");
            }
            for track in tracks {
                let when = track
                    .last_played
                    .map(|t| t.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
                println!("{when}  {} - {}{}", track.artist, track.title, tag_suffix(&track));
            }
        }
        Command::Completion { .. } => {}
    }

    Ok(())
}

fn env_secret(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn redact(value: Option<&str>) -> String {
    match value {
        None => "not set".to_string(),
        Some(v) => {
            let chars: Vec<char> = v.chars().collect();
            if chars.len() <= 8 {
                "set".to_string()
            } else {
                let head: String = chars[..4].iter().collect();
                let tail: String = chars[chars.len() - 4..].iter().collect();
                format!("set ({head}...{tail})")
            }
        }
    }
}

fn tag_suffix(track: &TrackCandidate) -> String {
    track
        .energy_tag
        .as_deref()
        .map(|t| format!(" [{t}]"))
        .unwrap_or_default()
}

fn run_daily(
    paths: &Paths,
    mode: Option<String>,
    energy_tag: Option<String>,
    dry_run: bool,
    no_gpt: bool,
    verbose: bool,
) -> Result<()> {
    let settings = config::load_settings(&paths.settings_path)?;
    let profile = config::load_taste_profile(&paths.taste_profile_path)?;
    paths.ensure_dirs()?;

    let mut catalog = SqliteCatalog::open(&paths.db_path)?;
    let events = JsonlLog::new(&paths.feedback_path);
    let gpt_log = JsonlLog::new(&paths.gpt_history_path);

    let spotify = match env_secret(&settings.spotify.token_env) {
        Some(token) => Some(SpotifyClient::new(&settings.spotify, token)?),
        None if dry_run => None,
        None => bail!(
            "{} is not set; cannot publish the playlist (try --dry-run)",
            settings.spotify.token_env
        ),
    };
    let openai = if settings.enable_gpt && !no_gpt {
        match env_secret(&settings.gpt.api_key_env) {
            Some(key) => Some(OpenAiClient::new(&settings.gpt, key)?),
            None => {
                warn!("{} is not set; GPT picks disabled", settings.gpt.api_key_env);
                None
            }
        }
    } else {
        None
    };

    let mut options = RunOptions::for_date(Utc::now(), pipeline::local_weekday());
    if let Some(tag) = energy_tag {
        options.energy_tag = tag.trim().to_lowercase();
    }
    options.mode = mode;
    options.use_gpt = !no_gpt;
    options.dry_run = dry_run;
    info!(
        "Building {} for {} (mode {})",
        settings.playlist_name,
        options.energy_tag,
        options.mode()
    );

    let mut dj = DailyDj {
        settings: &settings,
        profile: &profile,
        catalog: &mut catalog,
        events: &events,
        playlist: spotify.as_ref().map(|c| c as &dyn PlaylistService),
        completion: openai.as_ref().map(|c| c as &dyn CompletionClient),
        gpt_log: Some(&gpt_log),
    };
    let report = dj.run(&options)?;
    print_report(&report, verbose || dry_run);
    Ok(())
}

fn print_report(report: &RunReport, verbose: bool) {
    let record = &report.record;
    println!(
        "{} tracks for {} ({} GPT, {} deterministic) from {} candidates",
        record.tracks.len(),
        record.energy_tag,
        record.gpt_count,
        record.deterministic_count,
        report.candidate_count
    );
    if report.fell_back_to_full_catalog {
        println!("No tracks matched the energy tag; used the full catalog.");
    }

    if verbose {
        for (i, track) in record.tracks.iter().enumerate() {
            let source = match track.source {
                TrackSource::Gpt => "gpt",
                TrackSource::Deterministic => "det",
            };
            print!(
                "{:>3}. [{source}] {} - {}{} ({:.2})",
                i + 1,
                track.candidate.artist,
                track.candidate.title,
                tag_suffix(&track.candidate),
                track.score
            );
            match &track.rationale {
                Some(reason) => println!(": {reason}"),
                None => println!(),
            }
        }
    }

    if !record.warnings.is_empty() {
        println!("Warnings:");
        for warning in &record.warnings {
            println!("  - {warning}");
        }
    }
    if report.published {
        println!("Playlist updated.");
    } else {
        println!("Playlist not updated.");
    }
}

fn init_home(paths: &Paths, dry_run: bool) -> Result<()> {
    if dry_run {
        println!("Would set up DailyDJ home at {}:", paths.home.display());
        for path in [
            &paths.config_dir,
            &paths.state_dir,
            &paths.data_dir,
            &paths.settings_path,
            &paths.taste_profile_path,
            &paths.db_path,
        ] {
            println!("  {}", path.display());
        }
        return Ok(());
    }

    paths.ensure_dirs()?;
    for (written, path) in [
        (config::write_default(&paths.settings_path, &Settings::default())?, &paths.settings_path),
        (
            config::write_default(&paths.taste_profile_path, &TasteProfile::default())?,
            &paths.taste_profile_path,
        ),
    ] {
        if written {
            println!("Created {}", path.display());
        } else {
            println!("Kept existing {}", path.display());
        }
    }
    SqliteCatalog::open(&paths.db_path)?;
    println!("Database ready at {}", paths.db_path.display());
    Ok(())
}

fn doctor(paths: &Paths) -> Result<()> {
    println!("DailyDJ home: {}", paths.home.display());

    let mut missing = Vec::new();
    for (label, path) in [
        ("settings", &paths.settings_path),
        ("taste profile", &paths.taste_profile_path),
        ("database", &paths.db_path),
    ] {
        if path.exists() {
            println!("  ok       {label}: {}", path.display());
        } else {
            println!("  missing  {label}: {}", path.display());
            missing.push(label);
        }
    }

    let settings = config::load_settings(&paths.settings_path)?;
    config::load_taste_profile(&paths.taste_profile_path)?;
    for var in [&settings.spotify.token_env, &settings.gpt.api_key_env] {
        println!("  {var}: {}", redact(env_secret(var).as_deref()));
    }
    if settings.playlist_id.trim().is_empty() {
        println!("  playlist_id is not set in settings.json");
    }
    if paths.db_path.exists() {
        let catalog = SqliteCatalog::open(&paths.db_path)?;
        println!("  catalog: {} tracks", catalog.track_count()?);
    }

    if !missing.is_empty() {
        bail!("missing {}; run `dailydj init`", missing.join(", "));
    }
    println!("All good.");
    Ok(())
}

fn print_config(paths: &Paths) -> Result<()> {
    let settings = config::load_settings(&paths.settings_path)?;
    let profile = config::load_taste_profile(&paths.taste_profile_path)?;

    println!("Paths:");
    println!("{}", serde_json::to_string_pretty(paths)?);
    println!("Settings:");
    println!("{}", serde_json::to_string_pretty(&settings)?);
    println!("Taste profile:");
    println!(
        "  hard bans: {} artists, {} tracks",
        profile.hard_bans.artists.len(),
        profile.hard_bans.tracks.len()
    );
    println!(
        "  boost: {} artists, {} tracks; like: {} artists, {} tracks; avoid: {} artists, {} tracks",
        profile.boost.artists.len(),
        profile.boost.tracks.len(),
        profile.like.artists.len(),
        profile.like.tracks.len(),
        profile.avoid.artists.len(),
        profile.avoid.tracks.len()
    );
    println!(
        "  constraints: max {} per artist, track cooldown {}d, artist cooldown {}d",
        profile.constraints.max_tracks_per_artist,
        profile.constraints.cooldown_days_same_track,
        profile.constraints.cooldown_days_same_artist
    );
    let modes: Vec<&str> = profile.modes.keys().map(String::as_str).collect();
    println!("  modes: {}", if modes.is_empty() { "none".to_string() } else { modes.join(", ") });
    Ok(())
}

fn like_track(paths: &Paths, track: &str, artist: Option<&str>) -> Result<()> {
    let profile = config::load_taste_profile(&paths.taste_profile_path)?;
    let threshold = profile.learning.artist_like_threshold;
    let events = JsonlLog::new(&paths.feedback_path);
    let mut state = FeedbackState::from_events(&events.read_all()?, threshold);

    let outcome = feedback::record_like(&events, &mut state, Some(track), artist, threshold, Utc::now())?;
    println!("Liked {track}");
    if let Some(artist) = artist {
        println!("{artist}: {} likes", outcome.artist_likes);
    }
    if outcome.boosted {
        println!("{} is now boosted", artist.unwrap_or_default());
    }
    Ok(())
}

fn import_tracks(
    paths: &Paths,
    file: &Path,
    energy_tag: Option<&str>,
    source: &str,
    dry_run: bool,
) -> Result<()> {
    let text = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut tracks: Vec<TrackCandidate> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array of tracks", file.display()))?;

    let before = tracks.len();
    tracks.retain(|t| {
        !t.track_id.trim().is_empty() && !t.artist.trim().is_empty() && !t.title.trim().is_empty()
    });
    if tracks.len() != before {
        warn!("Skipping {} entries without id, artist or title", before - tracks.len());
    }
    if let Some(tag) = energy_tag {
        for track in tracks.iter_mut().filter(|t| t.energy_tag.is_none()) {
            track.energy_tag = Some(tag.to_string());
        }
    }

    if dry_run {
        println!("{} tracks would be imported", tracks.len());
        return Ok(());
    }
    paths.ensure_dirs()?;
    let mut catalog = SqliteCatalog::open(&paths.db_path)?;
    let count = catalog.upsert_tracks(&tracks, source)?;
    println!("Imported {count} tracks ({} in catalog)", catalog.track_count()?);
    Ok(())
}
