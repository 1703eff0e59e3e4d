//! GPT recommendations constrained to the shortlist.
//!
//! The model sees only the shortlist and must answer with strict JSON:
//!
//! ```text
//! {"picks": ["<track id>", ...], "notes": "optional"}
//! ```
//!
//! A pick may also be a `spotify:track:` URI or an object
//! `{"id": ..., "reason": ..., "confidence": ...}`. One surrounding Markdown
//! code fence is tolerated; anything else that does not match the schema is
//! discarded with a warning. Nothing in this module can fail a run: every
//! problem becomes zero recommendations plus a warning, and the merge step then
//! falls back to the deterministic ranking.
//!
//! # Examples
//!
//! ```
//! use dailydj::recommender::parse_response;
//! use std::collections::HashSet;
//!
//! let shortlist: HashSet<String> = ["a".to_string(), "b".to_string()].into();
//! let (picks, warnings) = parse_response(r#"{"picks": ["a", "zzz"]}"#, &shortlist);
//! assert_eq!(picks.len(), 1);
//! assert_eq!(warnings.len(), 1);
//! ```

use crate::algorithm::ScoredCandidate;
use crate::config::GptSettings;
use crate::db::{track_id_from_uri, TrackCandidate};
use crate::queue::SelectedTrack;
use crate::taste::TasteProfile;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;
use std::time::Duration;

/// Something that turns a prompt into completion text.
pub trait CompletionClient {
    /// # Errors
    ///
    /// Network failures, timeouts, quota and rate-limit responses.
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// A validated pick, guaranteed to be on the shortlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptRecommendation {
    pub track_id: String,
    pub rationale: Option<String>,
    /// Within `0.0..=1.0`.
    pub confidence: Option<f64>,
}

/// Inputs to [`build_prompt`].
#[derive(Debug, Clone, Copy)]
pub struct PromptRequest<'a> {
    pub playlist_name: &'a str,
    pub timezone_hint: &'a str,
    pub mode: &'a str,
    pub profile: &'a TasteProfile,
    pub history: &'a [TrackCandidate],
    pub shortlist: &'a [ScoredCandidate],
    /// How many picks to ask for.
    pub target_count: usize,
}

fn join_or_none(values: &BTreeSet<String>) -> String {
    if values.is_empty() {
        "none".to_string()
    } else {
        values.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

fn track_line(track: &TrackCandidate) -> String {
    let mut line = format!("{} - {}", track.artist, track.title);
    if let Some(tag) = &track.energy_tag {
        let _ = write!(line, " [{tag}]");
    }
    line
}

/// Build the user prompt. Identical requests give byte-identical prompts.
#[must_use]
pub fn build_prompt(request: &PromptRequest<'_>) -> String {
    let profile = request.profile;
    let mut out = String::new();

    let _ = writeln!(
        out,
        "I need help programming a playlist called \"{}\". Timezone: {}. Mode: {}.",
        request.playlist_name, request.timezone_hint, request.mode
    );

    out.push_str("\nTaste:\n");
    let _ = writeln!(out, "- boosted artists: {}", join_or_none(&profile.boost.artists));
    let _ = writeln!(out, "- boosted tracks: {}", join_or_none(&profile.boost.tracks));
    let _ = writeln!(out, "- liked artists: {}", join_or_none(&profile.like.artists));
    let _ = writeln!(out, "- avoided artists: {}", join_or_none(&profile.avoid.artists));
    let _ = writeln!(out, "- vibe tags: {}", join_or_none(&profile.vibe_tags));
    for (scene, artists) in &profile.scene_anchors {
        let _ = writeln!(out, "- scene {scene}: {}", join_or_none(artists));
    }

    out.push_str("\nRecently played:\n");
    if request.history.is_empty() {
        out.push_str("- none\n");
    }
    for track in request.history {
        let _ = writeln!(out, "- {}", track_line(track));
    }

    out.push_str("\nCandidate pool (id | artist - title [energy] score):\n");
    if request.shortlist.is_empty() {
        out.push_str("- none\n");
    }
    for scored in request.shortlist {
        let _ = writeln!(
            out,
            "- {} | {} {:.2}",
            scored.candidate.track_id,
            track_line(&scored.candidate),
            scored.score
        );
    }

    let _ = write!(
        out,
        "\nPick up to {} tracks from the candidate pool that continue the user's taste \
         while adding some variety. Use only ids from the candidate pool; never invent tracks.\n\
         \n\
         Return ONLY strict JSON, with no prose and no code fences, in exactly this shape:\n\
         {{\"picks\": [\"<id from the pool>\", ...], \"notes\": \"<optional short string>\"}}\n",
        request.target_count
    );
    out
}

/// A pick as written by the model, before shortlist validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Pick {
    pub id: String,
    pub reason: Option<String>,
    pub confidence: Option<f64>,
}

/// Outcome of checking raw completion text against the response schema.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseCheck {
    Valid { picks: Vec<Pick>, notes: Option<String> },
    ParseError(String),
    SchemaViolation(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PicksEnvelope {
    picks: Vec<RawPick>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPick {
    Id(String),
    Detailed(DetailedPick),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DetailedPick {
    #[serde(alias = "track_id")]
    id: String,
    #[serde(default, alias = "rationale")]
    reason: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

impl From<RawPick> for Pick {
    fn from(raw: RawPick) -> Self {
        match raw {
            RawPick::Id(id) => Pick {
                id,
                reason: None,
                confidence: None,
            },
            RawPick::Detailed(d) => Pick {
                id: d.id,
                reason: d.reason.filter(|r| !r.trim().is_empty()),
                confidence: d.confidence,
            },
        }
    }
}

/// Strip one surrounding Markdown code fence, with or without a language tag.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // drop the language tag, on its own line or not
    let body = body.trim();
    let tag_len = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+')))
        .unwrap_or(body.len());
    body[tag_len..].trim()
}

/// Check raw completion text against the response schema.
#[must_use]
pub fn validate_response(raw: &str) -> ResponseCheck {
    let text = strip_code_fence(raw);
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return ResponseCheck::ParseError(e.to_string()),
    };
    match serde_json::from_value::<PicksEnvelope>(value) {
        Ok(envelope) => ResponseCheck::Valid {
            picks: envelope.picks.into_iter().map(Pick::from).collect(),
            notes: envelope.notes,
        },
        Err(e) => ResponseCheck::SchemaViolation(e.to_string()),
    }
}

/// Validate a response against the shortlist. Never fails; every dropped
/// pick produces a warning.
#[must_use]
pub fn parse_response(raw: &str, shortlist_ids: &HashSet<String>) -> (Vec<GptRecommendation>, Vec<String>) {
    let mut warnings = Vec::new();
    let (picks, notes) = match validate_response(raw) {
        ResponseCheck::Valid { picks, notes } => (picks, notes),
        ResponseCheck::ParseError(e) => {
            warnings.push(format!("GPT response was not valid JSON ({e}); using deterministic picks"));
            return (Vec::new(), warnings);
        }
        ResponseCheck::SchemaViolation(e) => {
            warnings.push(format!(
                "GPT response did not match the picks schema ({e}); using deterministic picks"
            ));
            return (Vec::new(), warnings);
        }
    };
    if let Some(notes) = notes {
        debug!("GPT notes: {notes}");
    }

    let mut seen = HashSet::new();
    let mut recommendations = Vec::new();
    for pick in picks {
        let id = track_id_from_uri(pick.id.trim()).to_string();
        if !shortlist_ids.contains(&id) {
            warnings.push(format!("GPT picked {id}, which is not in the candidate pool; dropped"));
            continue;
        }
        if !seen.insert(id.clone()) {
            warnings.push(format!("GPT picked {id} more than once; duplicate dropped"));
            continue;
        }
        recommendations.push(GptRecommendation {
            track_id: id,
            rationale: pick.reason,
            confidence: pick
                .confidence
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0)),
        });
    }
    (recommendations, warnings)
}

/// Ask the client for picks. Client failures become zero picks plus a warning.
#[must_use]
pub fn request_recommendations(
    client: &dyn CompletionClient,
    prompt: &str,
    shortlist_ids: &HashSet<String>,
) -> (Vec<GptRecommendation>, Vec<String>) {
    match client.complete(prompt) {
        Ok(raw) => {
            let (recs, warnings) = parse_response(&raw, shortlist_ids);
            info!("GPT returned {} usable picks", recs.len());
            (recs, warnings)
        }
        Err(e) => {
            warn!("GPT request failed: {e:#}");
            (Vec::new(), vec![format!("GPT recommender unavailable: {e:#}")])
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f64,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completion client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f64,
    system_prompt: String,
}

impl OpenAiClient {
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(settings: &GptSettings, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to build completion HTTP client")?;
        Ok(Self {
            client,
            url: format!("{}/chat/completions", settings.endpoint.trim_end_matches('/')),
            api_key,
            model: settings.model.clone(),
            temperature: settings.temperature,
            system_prompt: settings.system_prompt.clone(),
        })
    }
}

impl CompletionClient for OpenAiClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        debug!("POST {} ({} prompt bytes)", self.url, prompt.len());
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .context("Completion request failed")?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            bail!("completion endpoint rate-limited the request (429)");
        }
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            bail!("completion endpoint returned {status}: {text}");
        }

        let parsed: ChatResponse = response
            .json()
            .context("Failed to decode completion response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .context("completion response had no choices")
    }
}

/// One accepted GPT pick, as appended to `data/gpt_history.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub run_label: String,
    pub track_id: String,
    pub artist: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl GptHistoryEntry {
    #[must_use]
    pub fn from_selected(track: &SelectedTrack, run_label: &str, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at,
            run_label: run_label.to_string(),
            track_id: track.candidate.track_id.clone(),
            artist: track.candidate.artist.clone(),
            title: track.candidate.title.clone(),
            energy_tag: track.candidate.energy_tag.clone(),
            rationale: track.rationale.clone(),
            confidence: track.confidence,
        }
    }
}
