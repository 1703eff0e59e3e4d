//! Merge and fill: turn validated GPT picks plus the deterministic ranking
//! into the final ordered playlist.
//!
//! ## Order of operations
//!
//! 1. Up to `discovery_target` GPT picks are taken in the model's order. Each
//!    one must come from the shortlist and must pass every rule again, given
//!    what has already been accepted.
//! 2. Remaining slots are filled from the ranked list in score order, skipping
//!    anything already selected or now failing a rule.
//! 3. With a duration target, a track that would overshoot the upper bound is
//!    skipped, and filling stops once the lower bound is reached.
//!
//! Every GPT pick that is dropped (off the shortlist, failing a rule, or too
//! long for the duration target) leaves a warning. Picks left over once the
//! discovery target is met were never needed and are only logged at `debug`,
//! as are deterministic candidates that fail a rule.

use crate::algorithm::ScoredCandidate;
use crate::db::TrackCandidate;
use crate::recommender::GptRecommendation;
use crate::taste::{RuleEngine, SelectionState};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Gpt,
    Deterministic,
}

impl TrackSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TrackSource::Gpt => "gpt",
            TrackSource::Deterministic => "deterministic",
        }
    }
}

/// One track of the final playlist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectedTrack {
    pub candidate: TrackCandidate,
    pub source: TrackSource,
    pub score: f64,
    pub rationale: Option<String>,
    pub confidence: Option<f64>,
}

/// Total playlist length with a relative tolerance on both sides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationTarget {
    pub target_ms: u64,
    pub tolerance: f64,
}

impl DurationTarget {
    #[must_use]
    pub fn from_minutes(minutes: u32, tolerance: f64) -> Option<Self> {
        (minutes > 0).then(|| Self {
            target_ms: u64::from(minutes) * 60_000,
            tolerance: if tolerance.is_finite() {
                tolerance.clamp(0.0, 1.0)
            } else {
                0.0
            },
        })
    }

    #[must_use]
    pub fn lower_ms(&self) -> u64 {
        (self.target_ms as f64 * (1.0 - self.tolerance)).round() as u64
    }

    #[must_use]
    pub fn upper_ms(&self) -> u64 {
        (self.target_ms as f64 * (1.0 + self.tolerance)).round() as u64
    }

    #[must_use]
    pub fn reached(&self, total_ms: u64) -> bool {
        total_ms >= self.lower_ms()
    }

    #[must_use]
    pub fn would_overshoot(&self, total_ms: u64, add_ms: u64) -> bool {
        total_ms.saturating_add(add_ms) > self.upper_ms()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeConfig {
    pub target_total: usize,
    pub discovery_ratio: f64,
    pub duration: Option<DurationTarget>,
}

impl MergeConfig {
    /// `round(discovery_ratio * target_total)`, clamped to `0..=target_total`.
    #[must_use]
    pub fn discovery_target(&self) -> usize {
        let ratio = if self.discovery_ratio.is_finite() {
            self.discovery_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        ((ratio * self.target_total as f64).round() as usize).min(self.target_total)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub tracks: Vec<SelectedTrack>,
    pub warnings: Vec<String>,
}

impl MergeOutcome {
    #[must_use]
    pub fn count(&self, source: TrackSource) -> usize {
        self.tracks.iter().filter(|t| t.source == source).count()
    }

    #[must_use]
    pub fn total_duration_ms(&self) -> u64 {
        self.tracks
            .iter()
            .map(|t| t.candidate.duration_ms.unwrap_or(0))
            .sum()
    }

    #[must_use]
    pub fn track_ids(&self) -> Vec<String> {
        self.tracks
            .iter()
            .map(|t| t.candidate.track_id.clone())
            .collect()
    }
}

fn is_full(config: &MergeConfig, state: &SelectionState) -> bool {
    state.len() >= config.target_total
        || config
            .duration
            .is_some_and(|d| d.reached(state.total_duration_ms()))
}

fn overshoots(config: &MergeConfig, state: &SelectionState, candidate: &TrackCandidate) -> bool {
    config.duration.is_some_and(|d| {
        d.would_overshoot(state.total_duration_ms(), candidate.duration_ms.unwrap_or(0))
    })
}

/// Blend GPT picks into the deterministic ranking.
///
/// Never fails: an empty or short result is valid output.
#[must_use]
pub fn merge_and_fill(
    ranked: &[ScoredCandidate],
    shortlist: &[ScoredCandidate],
    recommendations: &[GptRecommendation],
    config: &MergeConfig,
    engine: &RuleEngine<'_>,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let mut state = SelectionState::default();

    let pool: HashMap<&str, &ScoredCandidate> = shortlist
        .iter()
        .map(|s| (s.candidate.track_id.as_str(), s))
        .collect();
    let discovery_target = config.discovery_target();

    let mut accepted_gpt = 0;
    for (index, rec) in recommendations.iter().enumerate() {
        if accepted_gpt >= discovery_target || is_full(config, &state) {
            debug!(
                "{} GPT picks left unused past the discovery target",
                recommendations.len() - index
            );
            break;
        }
        let Some(scored) = pool.get(rec.track_id.as_str()) else {
            outcome
                .warnings
                .push(format!("GPT pick {} is not in the shortlist; dropped", rec.track_id));
            continue;
        };
        let candidate = &scored.candidate;
        if let Err(reason) = engine.check(candidate, &state) {
            outcome.warnings.push(format!(
                "GPT pick {} - {} rejected: {reason}",
                candidate.artist, candidate.title
            ));
            continue;
        }
        if overshoots(config, &state, candidate) {
            outcome.warnings.push(format!(
                "GPT pick {} dropped: would overshoot the duration target",
                candidate.track_id
            ));
            continue;
        }

        state.accept(candidate);
        outcome.tracks.push(SelectedTrack {
            candidate: candidate.clone(),
            source: TrackSource::Gpt,
            score: scored.score,
            rationale: rec.rationale.clone(),
            confidence: rec.confidence,
        });
        accepted_gpt += 1;
    }

    for scored in ranked {
        if is_full(config, &state) {
            break;
        }
        let candidate = &scored.candidate;
        if state.contains(&candidate.track_id) {
            continue;
        }
        if let Err(reason) = engine.check(candidate, &state) {
            debug!("Fill skips {} - {}: {reason}", candidate.artist, candidate.title);
            continue;
        }
        if overshoots(config, &state, candidate) {
            debug!("Fill skips {}: would overshoot the duration target", candidate.track_id);
            continue;
        }

        state.accept(candidate);
        outcome.tracks.push(SelectedTrack {
            candidate: candidate.clone(),
            source: TrackSource::Deterministic,
            score: scored.score,
            rationale: None,
            confidence: None,
        });
    }

    info!(
        "Merged {} tracks ({} from GPT, target {discovery_target})",
        outcome.tracks.len(),
        accepted_gpt
    );
    outcome
}
