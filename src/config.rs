//! # Configuration Module
//!
//! Resolves the DailyDJ home directory once at startup and loads the two JSON
//! configuration files. Everything downstream receives explicit paths and
//! values; nothing else looks at the environment or the filesystem layout.
//!
//! ## Home directory
//!
//! Resolved in order from the `--home` flag, the `DAILYDJ_HOME` environment
//! variable, and finally `~/.dailydj`:
//!
//! ```text
//! <home>/
//!   config/settings.json        run settings, weights, endpoints
//!   config/taste_profile.json   taste rules
//!   state/feedback.jsonl        feedback event log
//!   data/gpt_history.jsonl      accepted GPT picks
//!   track_history.db            catalog and run history
//! ```
//!
//! Missing configuration files load as defaults, so a fresh home works after
//! `dailydj init` or even without it.

use crate::algorithm::WeightTable;
use crate::queue::DurationTarget;
use crate::taste::TasteProfile;
use anyhow::{anyhow, Context, Result};
use log::debug;
use path_absolutize::Absolutize;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "DAILYDJ_HOME";

/// Every file and directory DailyDJ touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Paths {
    pub home: PathBuf,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub settings_path: PathBuf,
    pub taste_profile_path: PathBuf,
    pub feedback_path: PathBuf,
    pub gpt_history_path: PathBuf,
    pub db_path: PathBuf,
}

impl Paths {
    /// Resolve the home directory: explicit override, then `DAILYDJ_HOME`,
    /// then `~/.dailydj`.
    ///
    /// # Errors
    ///
    /// Fails if no override is given and the user's home directory cannot be
    /// determined, or if a relative path cannot be absolutized.
    pub fn resolve(home_override: Option<&Path>) -> Result<Self> {
        let env_home = std::env::var_os(HOME_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let home = match home_override.map(Path::to_path_buf).or(env_home) {
            Some(path) => path,
            None => dirs::home_dir()
                .ok_or_else(|| anyhow!("Could not determine your home directory; set {HOME_ENV}"))?
                .join(".dailydj"),
        };
        let home = home
            .absolutize()
            .with_context(|| format!("Invalid home directory: {}", home.display()))?
            .into_owned();

        debug!("DailyDJ home: {}", home.display());
        Ok(Self::from_home(home))
    }

    #[must_use]
    pub fn from_home(home: PathBuf) -> Self {
        let config_dir = home.join("config");
        let state_dir = home.join("state");
        let data_dir = home.join("data");
        Self {
            settings_path: config_dir.join("settings.json"),
            taste_profile_path: config_dir.join("taste_profile.json"),
            feedback_path: state_dir.join("feedback.jsonl"),
            gpt_history_path: data_dir.join("gpt_history.jsonl"),
            db_path: home.join("track_history.db"),
            config_dir,
            state_dir,
            data_dir,
            home,
        }
    }

    /// Create every directory of the layout.
    ///
    /// # Errors
    ///
    /// Fails if a directory cannot be created.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.home, &self.config_dir, &self.state_dir, &self.data_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Completion endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GptSettings {
    /// Base URL of an OpenAI-compatible API; `/chat/completions` is appended.
    pub endpoint: String,
    pub model: String,
    pub temperature: f64,
    pub timeout_secs: u64,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub system_prompt: String,
}

impl Default for GptSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            timeout_secs: 30,
            api_key_env: "OPENAI_API_KEY".to_string(),
            system_prompt: "You are a meticulous musicologist.".to_string(),
        }
    }
}

/// Playlist service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifySettings {
    pub api_base: String,
    /// Name of the environment variable holding a bearer token.
    pub token_env: String,
    pub timeout_secs: u64,
    /// Tracks per replace/append request; the Web API accepts at most 100.
    pub batch_size: usize,
}

impl Default for SpotifySettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.spotify.com/v1".to_string(),
            token_env: "SPOTIFY_ACCESS_TOKEN".to_string(),
            timeout_secs: 30,
            batch_size: 100,
        }
    }
}

/// Contents of `config/settings.json`. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Target playlist id; publishing is impossible while empty.
    pub playlist_id: String,
    pub playlist_name: String,
    pub timezone_hint: String,
    pub tracks_per_day: usize,
    /// Zero disables the duration target.
    pub target_duration_minutes: u32,
    pub duration_tolerance: f64,
    pub no_repeat_days: u32,
    pub discovery_ratio: f64,
    pub enable_gpt: bool,
    pub candidate_limit: usize,
    pub max_history_items: usize,
    /// Days of run history searched for saved tracks when detecting likes.
    pub like_lookback_days: u32,
    pub weights: WeightTable,
    pub gpt: GptSettings,
    pub spotify: SpotifySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            playlist_id: String::new(),
            playlist_name: "My Daily DJ".to_string(),
            timezone_hint: "local time".to_string(),
            tracks_per_day: 60,
            target_duration_minutes: 360,
            duration_tolerance: 0.05,
            no_repeat_days: 14,
            discovery_ratio: 0.3,
            enable_gpt: true,
            candidate_limit: 300,
            max_history_items: 10,
            like_lookback_days: 30,
            weights: WeightTable::default(),
            gpt: GptSettings::default(),
            spotify: SpotifySettings::default(),
        }
    }
}

impl Settings {
    #[must_use]
    pub fn duration_target(&self) -> Option<DurationTarget> {
        DurationTarget::from_minutes(self.target_duration_minutes, self.duration_tolerance)
    }
}

fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} not found; using defaults", path.display());
            return Ok(T::default());
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// # Errors
///
/// Fails if the file exists but cannot be read or parsed.
pub fn load_settings(path: &Path) -> Result<Settings> {
    load_json_or_default(path)
}

/// Load and normalize the taste profile.
///
/// # Errors
///
/// Fails if the file exists but cannot be read or parsed.
pub fn load_taste_profile(path: &Path) -> Result<TasteProfile> {
    let profile: TasteProfile = load_json_or_default(path)?;
    Ok(profile.normalized())
}

/// Write `value` as pretty JSON unless the file already exists.
/// Returns whether the file was written.
///
/// # Errors
///
/// Fails on serialization or I/O errors other than the file already existing.
pub fn write_default<T: Serialize>(path: &Path, value: &T) -> Result<bool> {
    let mut text = serde_json::to_string_pretty(value).context("Failed to serialize defaults")?;
    text.push('\n');
    match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            use std::io::Write;
            file.write_all(text.as_bytes())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to create {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_under_explicit_home() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::resolve(Some(dir.path())).unwrap();
        assert_eq!(paths.home, dir.path());
        assert_eq!(paths.settings_path, dir.path().join("config").join("settings.json"));
        assert_eq!(paths.feedback_path, dir.path().join("state").join("feedback.jsonl"));
        assert_eq!(paths.gpt_history_path, dir.path().join("data").join("gpt_history.jsonl"));
        assert_eq!(paths.db_path, dir.path().join("track_history.db"));
    }

    #[test]
    fn test_ensure_dirs_creates_the_layout_only() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::resolve(Some(&dir.path().join("home"))).unwrap();
        paths.ensure_dirs().unwrap();
        let mut created: Vec<String> = fs::read_dir(&paths.home)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        created.sort();
        assert_eq!(created, ["config", "data", "state"]);
    }

    #[test]
    fn test_relative_home_is_absolutized() {
        let paths = Paths::resolve(Some(Path::new("some/relative/home"))).unwrap();
        assert!(paths.home.is_absolute());
        assert!(paths.home.ends_with("some/relative/home"));
    }

    #[test]
    fn test_missing_files_load_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = load_settings(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, Settings::default());
        let profile = load_taste_profile(&dir.path().join("nope.json")).unwrap();
        assert_eq!(profile.constraints.max_tracks_per_artist, 2);
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"tracks_per_day": 20, "weights": {"boost_weight": 2.0}, "gpt": {"model": "local"}}"#,
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.tracks_per_day, 20);
        assert_eq!(settings.weights.boost_weight, 2.0);
        assert_eq!(settings.weights.like_weight, 0.5);
        assert_eq!(settings.gpt.model, "local");
        assert_eq!(settings.gpt.timeout_secs, 30);
        assert_eq!(settings.candidate_limit, 300);
        assert!(settings.duration_target().is_some());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taste_profile.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load_taste_profile(&path).is_err());
    }

    #[test]
    fn test_taste_profile_is_normalized_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taste_profile.json");
        fs::write(
            &path,
            r#"{"hard_bans": {"artists": ["Florence + The Machine"]}, "constraints": {"dedupe_title_variants": true}}"#,
        )
        .unwrap();

        let profile = load_taste_profile(&path).unwrap();
        assert!(profile.hard_bans.artists.contains("florence and the machine"));
        assert!(profile.constraints.dedupe_titles);
    }

    #[test]
    fn test_write_default_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        assert!(write_default(&path, &Settings::default()).unwrap());
        fs::write(&path, "{\"tracks_per_day\": 5}").unwrap();
        assert!(!write_default(&path, &Settings::default()).unwrap());
        assert_eq!(load_settings(&path).unwrap().tracks_per_day, 5);
    }
}
