//! Candidate scoring, ranking and shortlisting.
//!
//! A score is a plain sum of rule contributions minus recency fatigue:
//!
//! ```text
//! score(track) = boost + like + liked_track + avoid + scene_anchor
//!              + vibe_tag + discourage + learned_artist - fatigue
//! ```
//!
//! Every weight comes from a [`WeightTable`] (part of the settings file), and
//! nothing here reads global state, so the same catalog, profile and feedback
//! log always produce the same ordering.

use crate::db::TrackCandidate;
use crate::fatigue::{fatigue_penalty, FeedbackState};
use crate::taste::{normalize, RuleEngine, SelectionState, TasteProfile};
use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// Recency window and the penalty applied inside it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecentPlayPenalty {
    pub within_days: u32,
    pub penalty: f64,
}

impl Default for RecentPlayPenalty {
    fn default() -> Self {
        Self {
            within_days: 14,
            penalty: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LongTimeNoPlayBonus {
    pub after_days: u32,
    pub bonus: f64,
}

impl Default for LongTimeNoPlayBonus {
    fn default() -> Self {
        Self {
            after_days: 120,
            bonus: 0.0,
        }
    }
}

/// Every scoring weight in one place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightTable {
    /// Per boost match (artist and title count separately).
    pub boost_weight: f64,
    pub like_weight: f64,
    /// Negative.
    pub avoid_weight: f64,
    pub discourage_weight: f64,
    /// Applied once, however many anchor groups match.
    pub scene_anchor_weight: f64,
    pub vibe_tag_weight: f64,
    pub liked_track_bonus: f64,
    pub learned_artist_boost: f64,
    pub recent_play_penalty: RecentPlayPenalty,
    pub long_time_no_play_bonus: LongTimeNoPlayBonus,
}

impl Default for WeightTable {
    fn default() -> Self {
        Self {
            boost_weight: 1.0,
            like_weight: 0.5,
            avoid_weight: -0.5,
            discourage_weight: -0.5,
            scene_anchor_weight: 0.5,
            vibe_tag_weight: 0.25,
            liked_track_bonus: 3.0,
            learned_artist_boost: 1.5,
            recent_play_penalty: RecentPlayPenalty::default(),
            long_time_no_play_bonus: LongTimeNoPlayBonus::default(),
        }
    }
}

/// Everything a score depends on.
#[derive(Debug, Clone, Copy)]
pub struct ScoringContext<'a> {
    pub profile: &'a TasteProfile,
    pub feedback: &'a FeedbackState,
    pub weights: &'a WeightTable,
    pub now: DateTime<Utc>,
}

/// Each term of a score, for `--verbose` output and debugging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub boost: f64,
    pub like: f64,
    pub liked_track: f64,
    pub avoid: f64,
    pub scene_anchor: f64,
    pub vibe_tag: f64,
    pub discourage: f64,
    pub learned_artist: f64,
    pub fatigue: f64,
}

impl ScoreBreakdown {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.boost
            + self.like
            + self.liked_track
            + self.avoid
            + self.scene_anchor
            + self.vibe_tag
            + self.discourage
            + self.learned_artist
            - self.fatigue
    }
}

fn matches(hit: bool, weight: f64) -> f64 {
    if hit {
        weight
    } else {
        0.0
    }
}

#[must_use]
pub fn score_breakdown(candidate: &TrackCandidate, ctx: &ScoringContext<'_>) -> ScoreBreakdown {
    let profile = ctx.profile;
    let weights = ctx.weights;
    let artist = normalize(&candidate.artist);
    let title = normalize(&candidate.title);

    let vibe_hit = candidate
        .energy_tag
        .as_deref()
        .map(normalize)
        .is_some_and(|tag| !tag.is_empty() && profile.vibe_tags.contains(&tag));

    ScoreBreakdown {
        boost: matches(profile.boost.matches_artist(&artist), weights.boost_weight)
            + matches(profile.boost.matches_title(&title), weights.boost_weight),
        like: matches(profile.like.matches_artist(&artist), weights.like_weight)
            + matches(profile.like.matches_title(&title), weights.like_weight),
        liked_track: matches(ctx.feedback.is_liked(&candidate.track_id), weights.liked_track_bonus),
        avoid: matches(profile.avoid.matches_artist(&artist), weights.avoid_weight)
            + matches(profile.avoid.matches_title(&title), weights.avoid_weight),
        scene_anchor: matches(profile.is_scene_anchor(&artist), weights.scene_anchor_weight),
        vibe_tag: matches(vibe_hit, weights.vibe_tag_weight),
        discourage: matches(profile.is_discouraged(&artist), weights.discourage_weight),
        learned_artist: matches(
            ctx.feedback.has_learned_boost(&artist),
            weights.learned_artist_boost,
        ),
        fatigue: fatigue_penalty(candidate, ctx.feedback, ctx.now, weights),
    }
}

/// Ordering score for one candidate. Pure and deterministic.
///
/// ```
/// use dailydj::algorithm::{score, ScoringContext, WeightTable};
/// use dailydj::db::TrackCandidate;
/// use dailydj::fatigue::FeedbackState;
/// use dailydj::taste::TasteProfile;
///
/// let mut profile = TasteProfile::default();
/// profile.boost.artists.insert("robyn".to_string());
/// let feedback = FeedbackState::default();
/// let weights = WeightTable::default();
/// let ctx = ScoringContext { profile: &profile, feedback: &feedback, weights: &weights, now: chrono::Utc::now() };
///
/// let track = TrackCandidate::new("id1", "Robyn", "Dancing On My Own");
/// assert_eq!(score(&track, &ctx), 1.0);
/// ```
#[must_use]
pub fn score(candidate: &TrackCandidate, ctx: &ScoringContext<'_>) -> f64 {
    score_breakdown(candidate, ctx).total()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub candidate: TrackCandidate,
    pub score: f64,
}

/// Score and sort descending. The sort is stable, so ties keep catalog order.
#[must_use]
pub fn rank_candidates(candidates: Vec<TrackCandidate>, ctx: &ScoringContext<'_>) -> Vec<ScoredCandidate> {
    let mut ranked: Vec<ScoredCandidate> = candidates
        .into_iter()
        .map(|candidate| {
            let score = score(&candidate, ctx);
            trace!("{} - {}: {score:.3}", candidate.artist, candidate.title);
            ScoredCandidate { candidate, score }
        })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}

/// Walk the ranking in order and keep the first `limit` candidates that pass
/// every rule, applying the artist cap as the list fills.
#[must_use]
pub fn shortlist(ranked: &[ScoredCandidate], engine: &RuleEngine<'_>, limit: usize) -> Vec<ScoredCandidate> {
    let mut state = SelectionState::default();
    let mut picked = Vec::with_capacity(limit.min(ranked.len()));

    for scored in ranked {
        if picked.len() >= limit {
            break;
        }
        match engine.check(&scored.candidate, &state) {
            Ok(()) => {
                state.accept(&scored.candidate);
                picked.push(scored.clone());
            }
            Err(reason) => debug!(
                "Shortlist skips {} - {}: {reason}",
                scored.candidate.artist, scored.candidate.title
            ),
        }
    }
    picked
}

/// Score distribution helpers for run summaries.
pub mod statistics {
    use super::ScoredCandidate;

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct ScoreStatistics {
        pub count: usize,
        pub mean: f64,
        pub median: f64,
        pub min: f64,
        pub max: f64,
    }

    /// `None` for an empty ranking.
    #[must_use]
    pub fn summarize(ranked: &[ScoredCandidate]) -> Option<ScoreStatistics> {
        if ranked.is_empty() {
            return None;
        }
        let mut scores: Vec<f64> = ranked.iter().map(|s| s.score).collect();
        scores.sort_by(f64::total_cmp);

        let count = scores.len();
        let mean = scores.iter().sum::<f64>() / count as f64;
        let median = if count % 2 == 0 {
            (scores[count / 2 - 1] + scores[count / 2]) / 2.0
        } else {
            scores[count / 2]
        };

        Some(ScoreStatistics {
            count,
            mean,
            median,
            min: scores[0],
            max: scores[count - 1],
        })
    }
}
