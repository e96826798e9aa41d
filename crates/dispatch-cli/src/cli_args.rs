//! Command line surface (SPEC_FULL §12), built the way `crates/cli/src/cli_args.rs`
//! structures `qmt`'s own `clap` derive: a top-level struct with global flags plus a
//! `Subcommand` enum, one variant per user-facing action.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(name = "dispatch", about = "Streaming crash-log analysis dispatcher")]
pub struct CliArgs {
    /// Path to the TOML config file. Defaults to `~/.dispatch/config.toml`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream an analysis of an ANR or tombstone log to stdout.
    Analyze {
        /// Path to the crash-log file.
        file: PathBuf,
        /// Which family of crash artifact this is.
        #[arg(long, default_value = "anr")]
        kind: String,
        /// Thoroughness-vs-cost tuning knob.
        #[arg(long, default_value = "intelligent")]
        mode: String,
        /// Provider to route to; falls back to the config's default_provider.
        #[arg(long)]
        provider: Option<String>,
        /// Skip the cache on both read and write.
        #[arg(long)]
        no_cache: bool,
        /// Queue priority; lower runs first.
        #[arg(long, default_value_t = 5)]
        priority: i32,
    },
    /// Estimate cost, time, and chunk count across every configured provider/model.
    Estimate {
        file: PathBuf,
        #[arg(long, default_value = "intelligent")]
        mode: String,
        /// Maximum acceptable cost in USD; estimates over budget are flagged, not excluded.
        #[arg(long)]
        budget: Option<f64>,
        /// Tie-break preference when recommending a model: "quality" or "speed".
        #[arg(long, default_value = "quality")]
        prefer: String,
    },
    /// Look up a previously submitted analysis by id.
    Status {
        analysis_id: String,
    },
    /// Request cancellation of a previously submitted analysis.
    Cancel {
        analysis_id: String,
        #[arg(long, default_value = "user_cancelled")]
        reason: String,
    },
}
