//! Recency fatigue and learned boosts, derived from the feedback log.

use crate::algorithm::WeightTable;
use crate::db::{track_id_from_uri, TrackCandidate};
use crate::feedback::FeedbackEvent;
use crate::taste::normalize;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Everything the scorer and the rule engine need from past feedback.
#[derive(Debug, Clone, Default)]
pub struct FeedbackState {
    /// Latest `generated` timestamp per track id.
    pub track_last_seen: HashMap<String, DateTime<Utc>>,
    /// Latest `generated` timestamp per normalized artist.
    pub artist_last_seen: HashMap<String, DateTime<Utc>>,
    pub liked_tracks: HashSet<String>,
    pub likes_by_artist: HashMap<String, u32>,
    /// Artists with an explicit `boost_artist_auto` event.
    pub boost_events: HashSet<String>,
    artist_like_threshold: u32,
}

fn keep_latest(map: &mut HashMap<String, DateTime<Utc>>, key: String, at: DateTime<Utc>) {
    map.entry(key)
        .and_modify(|seen| {
            if at > *seen {
                *seen = at;
            }
        })
        .or_insert(at);
}

impl FeedbackState {
    #[must_use]
    pub fn from_events(events: &[FeedbackEvent], artist_like_threshold: u32) -> Self {
        let mut state = Self {
            artist_like_threshold,
            ..Self::default()
        };

        for event in events {
            match event {
                FeedbackEvent::Generated {
                    timestamp,
                    picks,
                    artists,
                    ..
                } => {
                    for pick in picks {
                        let id = track_id_from_uri(pick.trim());
                        if !id.is_empty() {
                            keep_latest(&mut state.track_last_seen, id.to_string(), *timestamp);
                        }
                    }
                    for artist in artists {
                        let key = normalize(artist);
                        if !key.is_empty() {
                            keep_latest(&mut state.artist_last_seen, key, *timestamp);
                        }
                    }
                }
                FeedbackEvent::LikeTrack {
                    track_id, artist, ..
                } => {
                    state.note_like(track_id.as_deref(), artist.as_deref(), artist_like_threshold);
                }
                FeedbackEvent::BoostArtistAuto { artist, .. } => {
                    state.note_boost_event(&normalize(artist));
                }
            }
        }
        state
    }

    pub(crate) fn note_like(&mut self, track_id: Option<&str>, artist: Option<&str>, threshold: u32) {
        self.artist_like_threshold = threshold;
        if let Some(id) = track_id.map(|t| track_id_from_uri(t.trim())) {
            if !id.is_empty() {
                self.liked_tracks.insert(id.to_string());
            }
        }
        if let Some(artist) = artist {
            let key = normalize(artist);
            if !key.is_empty() {
                *self.likes_by_artist.entry(key).or_insert(0) += 1;
            }
        }
    }

    pub(crate) fn note_boost_event(&mut self, artist_key: &str) {
        if !artist_key.is_empty() {
            self.boost_events.insert(artist_key.to_string());
        }
    }

    #[must_use]
    pub fn last_seen_track(&self, track_id: &str) -> Option<DateTime<Utc>> {
        self.track_last_seen.get(track_id).copied()
    }

    /// `artist` must already be normalized.
    #[must_use]
    pub fn last_seen_artist(&self, artist: &str) -> Option<DateTime<Utc>> {
        self.artist_last_seen.get(artist).copied()
    }

    #[must_use]
    pub fn is_liked(&self, track_id: &str) -> bool {
        self.liked_tracks.contains(track_id)
    }

    #[must_use]
    pub fn artist_like_count(&self, artist: &str) -> u32 {
        self.likes_by_artist.get(artist).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn has_boost_event(&self, artist: &str) -> bool {
        self.boost_events.contains(artist)
    }

    /// Explicit boost event, or enough likes to have earned one.
    #[must_use]
    pub fn has_learned_boost(&self, artist: &str) -> bool {
        self.has_boost_event(artist)
            || (self.artist_like_threshold > 0
                && self.artist_like_count(artist) >= self.artist_like_threshold)
    }

    /// Learned artist bonus per normalized artist. Each artist appears once
    /// no matter how many boost events it has.
    #[must_use]
    pub fn learned_boosts(&self, weights: &WeightTable) -> HashMap<String, f64> {
        self.boost_events
            .iter()
            .chain(self.likes_by_artist.keys())
            .filter(|artist| self.has_learned_boost(artist))
            .map(|artist| (artist.clone(), weights.learned_artist_boost))
            .collect()
    }
}

fn elapsed_days(now: DateTime<Utc>, seen: DateTime<Utc>) -> i64 {
    now.signed_duration_since(seen).num_days()
}

/// Recency penalty for a candidate; subtract it from the score.
///
/// Never-seen tracks get zero. The value never grows as more days pass since
/// the last sighting: a recent track or artist adds the configured penalty,
/// and a track unseen for long enough earns the long-time bonus as a negative
/// penalty.
#[must_use]
pub fn fatigue_penalty(
    candidate: &TrackCandidate,
    state: &FeedbackState,
    now: DateTime<Utc>,
    weights: &WeightTable,
) -> f64 {
    // configured as magnitudes
    let recent = &weights.recent_play_penalty;
    let penalty = recent.penalty.abs();
    let long_time = &weights.long_time_no_play_bonus;
    let bonus = long_time.bonus.abs();

    let mut total = 0.0;
    if let Some(seen) = state.last_seen_track(&candidate.track_id) {
        let days = elapsed_days(now, seen);
        if days <= i64::from(recent.within_days) {
            total += penalty;
        } else if days >= i64::from(long_time.after_days) {
            total -= bonus;
        }
    }
    if let Some(seen) = state.last_seen_artist(&normalize(&candidate.artist)) {
        if elapsed_days(now, seen) <= i64::from(recent.within_days) {
            total += penalty;
        }
    }
    total
}
