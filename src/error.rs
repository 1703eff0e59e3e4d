//! Conditions that abort a daily run.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Nothing survived bans and cooldowns, even with the energy-tag filter
    /// relaxed to the whole catalog.
    #[error("no eligible tracks for energy tag `{energy_tag}`, even after falling back to the full catalog")]
    EmptyCandidatePool { energy_tag: String },

    /// The playlist could not be written; nothing was recorded.
    #[error("playlist update failed: {0:#}")]
    PlaylistService(#[source] anyhow::Error),

    #[error("storage unavailable: {0:#}")]
    Storage(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
