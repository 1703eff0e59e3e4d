//! Daily playlist builder that follows the user's taste rules.
//!
//! Core modules:
//! - [`taste`] - Taste profile, normalization and the rule engine
//! - [`fatigue`] - Replay history and the fatigue penalty
//! - [`algorithm`] - Candidate scoring and ranking
//! - [`recommender`] - GPT prompt, response validation and the OpenAI client
//! - [`queue`] - Merging GPT picks with the ranking and filling to target
//! - [`pipeline`] - The daily run and publishing
//!
//! ### Supporting Modules
//!
//! - [`db`] - SQLite catalog, bans and run history
//! - [`feedback`] - Append-only JSONL feedback log
//! - [`spotify`] - Spotify Web API playlist client
//! - [`config`] - Home directory layout, settings and profile loading
//! - [`error`] - Pipeline error type
//! - [`cli`] - Command-line interface definitions with clap integration
//! - [`completion`] - Shell completion generation
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use dailydj::config::{self, Paths};
//! use dailydj::db::SqliteCatalog;
//! use dailydj::feedback::JsonlLog;
//! use dailydj::pipeline::{self, DailyDj, RunOptions};
//! use chrono::Utc;
//!
//! let paths = Paths::resolve(None)?;
//! let settings = config::load_settings(&paths.settings_path)?;
//! let profile = config::load_taste_profile(&paths.taste_profile_path)?;
//! let mut catalog = SqliteCatalog::open(&paths.db_path)?;
//! let events = JsonlLog::new(&paths.feedback_path);
//!
//! let mut options = RunOptions::for_date(Utc::now(), pipeline::local_weekday());
//! options.dry_run = true;
//! options.use_gpt = false;
//!
//! let mut dj = DailyDj {
//!     settings: &settings,
//!     profile: &profile,
//!     catalog: &mut catalog,
//!     events: &events,
//!     playlist: None,
//!     completion: None,
//!     gpt_log: None,
//! };
//! let report = dj.run(&options)?;
//! for track in &report.record.tracks {
//!     println!("{} - {} ({:.2})", track.candidate.artist, track.candidate.title, track.score);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Selection
//!
//! Every run reads the catalog, the taste profile and the feedback log once,
//! then works on in-memory data:
//!
//! - **Hard bans** (profile patterns and persisted bans) are never published,
//!   whoever proposed the track.
//! - **Cooldowns** keep a track out for `cooldown_days_same_track` days and an
//!   artist out for `cooldown_days_same_artist` days after being published.
//! - **Scores** add boost, like and scene-anchor weights, subtract avoid and
//!   discourage weights, and apply fatigue for recent plays. Liked tracks and
//!   auto-boosted artists earn learned bonuses.
//! - **GPT picks** may only come from the shortlist and only fill the
//!   discovery share of the playlist. Anything malformed is discarded with a
//!   warning and the deterministic ranking fills the gap.
//!
//! ## Learning
//!
//! - A saved track that appeared in a recent run is recorded as a like.
//!   After enough likes for one artist a one-time boost event is written.
//! - A track removed from the live playlist since the last run is banned.
//!   Three removals by one artist ban the artist.
//!
//! ## Files
//!
//! Everything lives under `~/.dailydj` (or `$DAILYDJ_HOME`):
//!
//! ```text
//! config/settings.json        run settings
//! config/taste_profile.json   taste rules
//! state/feedback.jsonl        like, boost and generated events
//! data/gpt_history.jsonl      accepted GPT picks
//! track_history.db            catalog, bans, runs
//! ```
//!
//! ## Error Handling
//!
//! Storage and CLI paths return `anyhow::Result` with context. The run itself
//! returns [`error::PipelineError`] so callers can tell an empty catalog from a
//! failed publish.

pub mod algorithm;
pub mod cli;
pub mod completion;
pub mod config;
pub mod db;
pub mod error;
pub mod fatigue;
pub mod feedback;
pub mod pipeline;
pub mod queue;
pub mod recommender;
pub mod spotify;
pub mod taste;
