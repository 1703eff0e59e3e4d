//! Taste rules: name normalization, ban/avoid/boost/like predicates and the
//! per-run selection constraints.
//!
//! Every rule string is normalized once when the profile is loaded, and every
//! candidate field is normalized at comparison time, so `"Florence + The
//! Machine"` in a rule matches `"florence and the machine"` in the catalog.
//! Matching is substring containment on normalized text.
//!
//! ## Selection constraints
//!
//! [`RuleEngine`] bundles the resolved profile with the persisted bans and the
//! feedback history for one run. Its checks are split in two:
//!
//! - history checks ([`RuleEngine::check_history`]) depend only on the
//!   candidate and what happened in earlier runs (no-repeat window, track and
//!   artist cooldowns);
//! - selection checks ([`RuleEngine::check`]) additionally look at the
//!   [`SelectionState`] accumulated so far in this run (artist cap, duplicate
//!   ids, duplicate titles).
//!
//! Candidates are accepted in score order, so the outcome of a check depends on
//! what was accepted before it.

use crate::db::TrackCandidate;
use crate::fatigue::FeedbackState;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

/// Normalize an artist or title for rule matching.
///
/// Lowercases, turns `&` and `+` into `and`, drops punctuation and collapses
/// runs of whitespace. Applying it twice gives the same result as once.
///
/// ```
/// use dailydj::taste::normalize;
///
/// assert_eq!(normalize("Florence + The Machine"), "florence and the machine");
/// assert_eq!(normalize("  AC/DC!  "), "acdc");
/// assert_eq!(normalize(&normalize("Simon & Garfunkel")), "simon and garfunkel");
/// ```
#[must_use]
pub fn normalize(name: &str) -> String {
    let lowered = name
        .to_lowercase()
        .replace('&', " and ")
        .replace('+', " and ");

    let kept: String = lowered
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c.is_whitespace() {
                Some(' ')
            } else {
                None
            }
        })
        .collect();

    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn contains_any(haystack: &str, needles: &BTreeSet<String>) -> bool {
    !haystack.is_empty()
        && needles
            .iter()
            .any(|needle| !needle.is_empty() && haystack.contains(needle.as_str()))
}

fn normalize_set(values: &BTreeSet<String>) -> BTreeSet<String> {
    values
        .iter()
        .map(|v| normalize(v))
        .filter(|v| !v.is_empty())
        .collect()
}

/// A list of artist and track-title patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleList {
    pub artists: BTreeSet<String>,
    pub tracks: BTreeSet<String>,
}

impl RuleList {
    /// Copy with every pattern normalized and empty patterns removed.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            artists: normalize_set(&self.artists),
            tracks: normalize_set(&self.tracks),
        }
    }

    /// `artist` must already be normalized.
    #[must_use]
    pub fn matches_artist(&self, artist: &str) -> bool {
        contains_any(artist, &self.artists)
    }

    /// `title` must already be normalized.
    #[must_use]
    pub fn matches_title(&self, title: &str) -> bool {
        contains_any(title, &self.tracks)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artists.is_empty() && self.tracks.is_empty()
    }

    fn merge(&mut self, other: &RuleList) {
        self.artists.extend(other.artists.iter().cloned());
        self.tracks.extend(other.tracks.iter().cloned());
    }
}

/// Hard limits applied while a playlist is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    /// At most this many tracks per (normalized) artist in one playlist.
    pub max_tracks_per_artist: u32,
    pub cooldown_days_same_track: u32,
    pub cooldown_days_same_artist: u32,
    /// Falls back to the settings value when absent.
    pub no_repeat_days: Option<u32>,
    #[serde(alias = "dedupe_title_variants")]
    pub dedupe_titles: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_tracks_per_artist: 2,
            cooldown_days_same_track: 30,
            cooldown_days_same_artist: 10,
            no_repeat_days: None,
            dedupe_titles: false,
        }
    }
}

/// Partial [`Constraints`] used by mode overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintsOverride {
    pub max_tracks_per_artist: Option<u32>,
    pub cooldown_days_same_track: Option<u32>,
    pub cooldown_days_same_artist: Option<u32>,
    pub no_repeat_days: Option<u32>,
    #[serde(alias = "dedupe_title_variants")]
    pub dedupe_titles: Option<bool>,
}

impl Constraints {
    fn apply(&mut self, patch: &ConstraintsOverride) {
        if let Some(v) = patch.max_tracks_per_artist {
            self.max_tracks_per_artist = v;
        }
        if let Some(v) = patch.cooldown_days_same_track {
            self.cooldown_days_same_track = v;
        }
        if let Some(v) = patch.cooldown_days_same_artist {
            self.cooldown_days_same_artist = v;
        }
        if patch.no_repeat_days.is_some() {
            self.no_repeat_days = patch.no_repeat_days;
        }
        if let Some(v) = patch.dedupe_titles {
            self.dedupe_titles = v;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Discovery {
    pub ratio_default: Option<f64>,
    /// Artists that score lower when they show up, without being banned.
    pub discourage_artists: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Learning {
    /// Likes needed before an artist earns a learned boost.
    pub artist_like_threshold: u32,
}

impl Default for Learning {
    fn default() -> Self {
        Self {
            artist_like_threshold: 5,
        }
    }
}

/// Per-mode partial profile. Scalars replace, lists are unioned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeOverride {
    pub discovery_ratio: Option<f64>,
    pub constraints: ConstraintsOverride,
    pub hard_bans: RuleList,
    pub avoid: RuleList,
    pub boost: RuleList,
    pub like: RuleList,
    pub vibe_tags: BTreeSet<String>,
    pub discourage_artists: BTreeSet<String>,
}

/// The user's taste rules, loaded from `config/taste_profile.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasteProfile {
    pub hard_bans: RuleList,
    pub avoid: RuleList,
    pub boost: RuleList,
    pub like: RuleList,
    pub constraints: Constraints,
    pub discovery: Discovery,
    /// Named groups of artists that anchor the user's scenes.
    pub scene_anchors: BTreeMap<String, BTreeSet<String>>,
    pub vibe_tags: BTreeSet<String>,
    pub learning: Learning,
    pub modes: BTreeMap<String, ModeOverride>,
}

impl TasteProfile {
    /// Normalize every pattern in the profile, mode overrides included.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.hard_bans = self.hard_bans.normalized();
        self.avoid = self.avoid.normalized();
        self.boost = self.boost.normalized();
        self.like = self.like.normalized();
        self.discovery.discourage_artists = normalize_set(&self.discovery.discourage_artists);
        self.vibe_tags = normalize_set(&self.vibe_tags);
        for anchors in self.scene_anchors.values_mut() {
            *anchors = normalize_set(anchors);
        }
        for mode in self.modes.values_mut() {
            mode.hard_bans = mode.hard_bans.normalized();
            mode.avoid = mode.avoid.normalized();
            mode.boost = mode.boost.normalized();
            mode.like = mode.like.normalized();
            mode.vibe_tags = normalize_set(&mode.vibe_tags);
            mode.discourage_artists = normalize_set(&mode.discourage_artists);
        }
        self
    }

    fn mode_override(&self, mode: &str) -> Option<&ModeOverride> {
        self.modes
            .get(mode)
            .or_else(|| self.modes.get(&mode.to_lowercase()))
    }

    /// Resolve the profile for a mode. Unknown modes return the base profile.
    #[must_use]
    pub fn for_mode(&self, mode: &str) -> TasteProfile {
        let mut resolved = self.clone();
        let Some(patch) = self.mode_override(mode) else {
            return resolved;
        };

        resolved.constraints.apply(&patch.constraints);
        resolved.hard_bans.merge(&patch.hard_bans);
        resolved.avoid.merge(&patch.avoid);
        resolved.boost.merge(&patch.boost);
        resolved.like.merge(&patch.like);
        resolved.vibe_tags.extend(patch.vibe_tags.iter().cloned());
        resolved
            .discovery
            .discourage_artists
            .extend(patch.discourage_artists.iter().cloned());
        if patch.discovery_ratio.is_some() {
            resolved.discovery.ratio_default = patch.discovery_ratio;
        }
        resolved
    }

    /// `artist` must already be normalized.
    #[must_use]
    pub fn is_scene_anchor(&self, artist: &str) -> bool {
        self.scene_anchors
            .values()
            .any(|group| contains_any(artist, group))
    }

    #[must_use]
    pub fn is_discouraged(&self, artist: &str) -> bool {
        contains_any(artist, &self.discovery.discourage_artists)
    }
}

/// Discovery ratio for a run: mode override, then profile default, then the
/// settings fallback. Always within `0.0..=1.0`.
#[must_use]
pub fn resolve_discovery_ratio(profile: &TasteProfile, mode: &str, fallback: f64) -> f64 {
    let ratio = profile
        .mode_override(mode)
        .and_then(|m| m.discovery_ratio)
        .or(profile.discovery.ratio_default)
        .unwrap_or(fallback);
    if ratio.is_finite() {
        ratio.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// True if the candidate is excluded outright by a profile rule or a
/// persisted ban. `db_artist_bans` must hold normalized artist names.
#[must_use]
pub fn is_hard_banned(
    candidate: &TrackCandidate,
    profile: &TasteProfile,
    db_artist_bans: &HashSet<String>,
    db_track_bans: &HashSet<String>,
) -> bool {
    if db_track_bans.contains(&candidate.track_id) {
        return true;
    }
    let artist = normalize(&candidate.artist);
    if profile.hard_bans.matches_artist(&artist) {
        return true;
    }
    // persisted bans name one artist exactly; only profile patterns are substrings
    if !artist.is_empty() && db_artist_bans.contains(&artist) {
        return true;
    }
    profile.hard_bans.matches_title(&normalize(&candidate.title))
}

/// Why a candidate was turned away.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    HardBanned,
    NoRepeatWindow { days: u32 },
    TrackCooldown { days: u32 },
    ArtistCooldown { days: u32 },
    ArtistCap { max: u32 },
    DuplicateTrack,
    DuplicateTitle,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::HardBanned => write!(f, "hard-banned"),
            Rejection::NoRepeatWindow { days } => write!(f, "played within the last {days} days"),
            Rejection::TrackCooldown { days } => write!(f, "track cooldown of {days} days"),
            Rejection::ArtistCooldown { days } => write!(f, "artist cooldown of {days} days"),
            Rejection::ArtistCap { max } => write!(f, "artist already has {max} tracks"),
            Rejection::DuplicateTrack => write!(f, "already selected"),
            Rejection::DuplicateTitle => write!(f, "duplicate title"),
        }
    }
}

/// What has been accepted so far in the current run.
#[derive(Debug, Clone, Default)]
pub struct SelectionState {
    artist_counts: HashMap<String, u32>,
    titles: HashSet<String>,
    track_ids: HashSet<String>,
    total_duration_ms: u64,
}

impl SelectionState {
    pub fn accept(&mut self, candidate: &TrackCandidate) {
        *self
            .artist_counts
            .entry(normalize(&candidate.artist))
            .or_insert(0) += 1;
        self.titles.insert(normalize(&candidate.title));
        self.track_ids.insert(candidate.track_id.clone());
        self.total_duration_ms += candidate.duration_ms.unwrap_or(0);
    }

    /// `artist` must already be normalized.
    #[must_use]
    pub fn artist_count(&self, artist: &str) -> u32 {
        self.artist_counts.get(artist).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn contains(&self, track_id: &str) -> bool {
        self.track_ids.contains(track_id)
    }

    #[must_use]
    pub fn has_title(&self, normalized_title: &str) -> bool {
        self.titles.contains(normalized_title)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.track_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.track_ids.is_empty()
    }

    #[must_use]
    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration_ms
    }
}

/// Resolved rules plus everything they are checked against for one run.
#[derive(Debug, Clone)]
pub struct RuleEngine<'a> {
    profile: &'a TasteProfile,
    artist_bans: &'a HashSet<String>,
    track_bans: &'a HashSet<String>,
    history: &'a FeedbackState,
    now: DateTime<Utc>,
}

fn within(now: DateTime<Utc>, seen: DateTime<Utc>, days: u32) -> bool {
    days > 0 && now.signed_duration_since(seen) < Duration::days(i64::from(days))
}

impl<'a> RuleEngine<'a> {
    #[must_use]
    pub fn new(
        profile: &'a TasteProfile,
        artist_bans: &'a HashSet<String>,
        track_bans: &'a HashSet<String>,
        history: &'a FeedbackState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            profile,
            artist_bans,
            track_bans,
            history,
            now,
        }
    }

    #[must_use]
    pub fn profile(&self) -> &'a TasteProfile {
        self.profile
    }

    #[must_use]
    pub fn history(&self) -> &'a FeedbackState {
        self.history
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    #[must_use]
    pub fn is_hard_banned(&self, candidate: &TrackCandidate) -> bool {
        is_hard_banned(candidate, self.profile, self.artist_bans, self.track_bans)
    }

    /// Latest of the catalog's last-played time and the last run that picked
    /// this track.
    #[must_use]
    pub fn last_played(&self, candidate: &TrackCandidate) -> Option<DateTime<Utc>> {
        let seen = self.history.last_seen_track(&candidate.track_id);
        match (candidate.last_played, seen) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Bans and cooldowns; independent of the current selection.
    pub fn check_history(&self, candidate: &TrackCandidate) -> Result<(), Rejection> {
        if self.is_hard_banned(candidate) {
            return Err(Rejection::HardBanned);
        }

        let constraints = &self.profile.constraints;
        if let Some(played) = self.last_played(candidate) {
            let no_repeat = constraints.no_repeat_days.unwrap_or(0);
            if within(self.now, played, no_repeat) {
                return Err(Rejection::NoRepeatWindow { days: no_repeat });
            }
            if within(self.now, played, constraints.cooldown_days_same_track) {
                return Err(Rejection::TrackCooldown {
                    days: constraints.cooldown_days_same_track,
                });
            }
        }

        let artist = normalize(&candidate.artist);
        if let Some(seen) = self.history.last_seen_artist(&artist) {
            if within(self.now, seen, constraints.cooldown_days_same_artist) {
                return Err(Rejection::ArtistCooldown {
                    days: constraints.cooldown_days_same_artist,
                });
            }
        }
        Ok(())
    }

    /// Every rule, given what has been accepted so far.
    pub fn check(&self, candidate: &TrackCandidate, state: &SelectionState) -> Result<(), Rejection> {
        if state.contains(&candidate.track_id) {
            return Err(Rejection::DuplicateTrack);
        }
        self.check_history(candidate)?;

        let max = self.profile.constraints.max_tracks_per_artist;
        if state.artist_count(&normalize(&candidate.artist)) >= max {
            return Err(Rejection::ArtistCap { max });
        }
        if self.profile.constraints.dedupe_titles && state.has_title(&normalize(&candidate.title)) {
            return Err(Rejection::DuplicateTitle);
        }
        Ok(())
    }

    #[must_use]
    pub fn passes_constraints(&self, candidate: &TrackCandidate, state: &SelectionState) -> bool {
        self.check(candidate, state).is_ok()
    }
}
