//! # Command-Line Interface Module
//!
//! Clap derive definitions for the `dailydj` binary.
//!
//! ## Commands
//!
//! - `run`: build today's playlist and publish it
//! - `init`: create the home directory, default configs and the database
//! - `doctor`: check files and credentials
//! - `print-config`: show resolved paths and settings
//! - `like`: record a liked track by hand
//! - `add` / `import`: put tracks into the catalog
//! - `recent`: list recently played tracks
//! - `completion`: print a shell completion script
//!
//! ## Examples
//!
//! ```bash
//! dailydj init
//! dailydj import tracks.json --energy-tag friday
//! dailydj run --dry-run --no-gpt
//! RUST_LOG=debug dailydj run --mode focus
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

/// Main application arguments structure.
#[derive(Parser)]
#[command(name = "dailydj")]
#[command(about = "DailyDJ: taste-ruled daily playlists from your own catalog")]
#[command(version)]
pub struct Args {
    /// DailyDJ home directory (defaults to $DAILYDJ_HOME, then ~/.dailydj)
    #[arg(long, global = true, value_hint = clap::ValueHint::DirPath)]
    pub home: Option<PathBuf>,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Enumeration of all available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Build today's playlist and publish it
    ///
    /// Picks tracks for today's energy tag under the taste rules, optionally
    /// blends in GPT picks from the shortlist, replaces the playlist and
    /// records the run.
    Run {
        /// Taste-profile mode (defaults to the energy tag)
        #[arg(long)]
        mode: Option<String>,

        /// Energy tag to select candidates by (defaults to today's weekday)
        #[arg(long)]
        energy_tag: Option<String>,

        /// Build and print the playlist without publishing or recording it
        #[arg(long)]
        dry_run: bool,

        /// Skip the GPT recommender
        #[arg(long)]
        no_gpt: bool,

        /// Print the selected tracks with sources and scores
        #[arg(short, long)]
        verbose: bool,
    },

    /// Create the home directory, default config files and the database
    ///
    /// Existing files are never overwritten.
    Init {
        /// Show what would be created without touching anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Check config files, the database and credentials
    Doctor,

    /// Print resolved paths, settings and a taste profile summary
    PrintConfig,

    /// Record a liked track
    ///
    /// Counts toward the artist's learned boost.
    Like {
        /// Track id, spotify:track: URI or open.spotify.com link
        track: String,

        /// Artist of the track
        #[arg(long)]
        artist: Option<String>,
    },

    /// Add one track to the catalog
    Add {
        /// Track id or spotify:track: URI
        track_id: String,

        /// Artist name
        artist: String,

        /// Track title
        title: String,

        /// Energy tag (monday..sunday); untagged tracks qualify every day
        #[arg(long)]
        energy_tag: Option<String>,

        /// Track length in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,

        /// Where the track came from
        #[arg(long, default_value = "manual")]
        source: String,
    },

    /// Bulk-load tracks from a JSON array
    ///
    /// Each entry needs `track_id` (or `id`/`uri`), `artist` and `title`;
    /// `energy_tag` and `duration_ms` are optional.
    Import {
        /// JSON file to read
        #[arg(value_hint = clap::ValueHint::FilePath)]
        file: PathBuf,

        /// Energy tag for entries that have none
        #[arg(long)]
        energy_tag: Option<String>,

        /// Where the tracks came from
        #[arg(long, default_value = "import")]
        source: String,

        /// Validate the file without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// List recently played tracks
    Recent {
        /// How many tracks to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
