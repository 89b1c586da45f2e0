use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Args, Parser, Subcommand};

use crate::error::{PrepError, PrepResult};
use crate::features::ShapeTag;

// ---------------------------------------------------------------------------
// Graceful Ctrl+C shutdown
// ---------------------------------------------------------------------------

/// Global flag indicating that a shutdown signal has been received.
static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

/// Coordinates graceful Ctrl+C shutdown.
///
/// When a signal is received the controller sets a global `AtomicBool`,
/// which the process layer's cancel tokens poll between child-exit checks.
/// In-flight external jobs are killed and reaped rather than detached, so no
/// orphan survives the pipeline's death.
pub struct ShutdownController;

impl ShutdownController {
    /// Install the Ctrl+C signal handler.
    ///
    /// Errors are non-fatal (signal handling is best-effort), so callers may
    /// choose to log and continue.
    pub fn install() -> PrepResult<()> {
        ctrlc::set_handler(|| {
            SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
            tracing::info!("shutdown signal received (Ctrl+C)");
        })
        .map_err(|e| PrepError::Io(std::io::Error::other(format!("ctrlc handler: {e}"))))?;
        Ok(())
    }

    /// Returns `true` once a Ctrl+C (or programmatic trigger) has been received.
    #[must_use]
    pub fn is_shutting_down() -> bool {
        SHUTDOWN_FLAG.load(Ordering::SeqCst)
    }

    /// Programmatically trigger the shutdown flag (internal cancel paths).
    pub fn trigger_shutdown() {
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    }

    /// The exit code the binary should use when exiting due to a signal.
    #[must_use]
    pub const fn signal_exit_code() -> i32 {
        130 // Convention: 128 + SIGINT(2)
    }
}

// ---------------------------------------------------------------------------
// Command-line interface
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "asr_prep")]
#[command(about = "Staged data-preparation and experiment pipeline for multi-stream ASR training")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the staged experiment pipeline end to end.
    Run(RunArgs),
    /// Carve a dev set from a corpus data directory.
    Split(SplitArgs),
    /// Build a symbol dictionary from a transcript table.
    Dict(DictArgs),
    /// Build a base manifest from a feature table, dictionary, and transcripts.
    BuildManifest(BuildManifestArgs),
    /// Merge a feature stream into an existing manifest under a named slot.
    Fuse(FuseArgs),
    /// Split a manifest into N contiguous decode shards.
    Shard(ShardArgs),
    /// Merge per-shard result documents, verifying utterance coverage.
    MergeShards(MergeShardsArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the experiment config JSON.
    #[arg(long)]
    pub config: PathBuf,

    /// First stage to execute; all earlier stages are assumed complete.
    /// Negative means "start before any data exists".
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub stage: i32,

    /// Overall pipeline deadline in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print the full JSON run report instead of a summary line.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct SplitArgs {
    /// Corpus data directory (`wav.scp` + `text`).
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Dev set size (the first K utterances of the sorted pool).
    #[arg(long, default_value_t = 100)]
    pub dev_size: usize,

    /// Output directory for `train.ids` / `dev.ids`.
    #[arg(long)]
    pub out_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct DictArgs {
    /// Transcript table (`<utt_id> <text>` lines).
    #[arg(long)]
    pub text: PathBuf,

    /// Output dictionary file.
    #[arg(long)]
    pub out: PathBuf,
}

#[derive(Debug, Args)]
pub struct BuildManifestArgs {
    /// Primary feature table (scp).
    #[arg(long)]
    pub feats: PathBuf,

    /// Shape of the primary stream.
    #[arg(long, value_enum, default_value_t = ShapeTag::Matrix)]
    pub shape: ShapeTag,

    /// Dictionary file to tokenize against.
    #[arg(long)]
    pub dict: PathBuf,

    /// Transcript table (`<utt_id> <text>` lines).
    #[arg(long)]
    pub text: PathBuf,

    /// Output manifest path.
    #[arg(long)]
    pub out: PathBuf,
}

#[derive(Debug, Args)]
pub struct FuseArgs {
    /// Manifest to fuse into.
    #[arg(long)]
    pub manifest: PathBuf,

    /// Feature table (scp) providing the new stream.
    #[arg(long)]
    pub scp: PathBuf,

    /// Stream name used in diagnostics.
    #[arg(long, default_value = "aux")]
    pub stream_name: String,

    /// Shape of the new stream.
    #[arg(long, value_enum, default_value_t = ShapeTag::Matrix)]
    pub shape: ShapeTag,

    /// Input slot to bind the stream under (e.g. input2).
    #[arg(long)]
    pub slot: String,

    /// Drop manifest utterances missing from the stream instead of failing.
    #[arg(long)]
    pub lenient: bool,

    /// Output path; defaults to replacing the manifest in place (atomic).
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ShardArgs {
    /// Manifest to partition.
    #[arg(long)]
    pub manifest: PathBuf,

    /// Number of shards.
    #[arg(long)]
    pub num: usize,

    /// Output directory for `shard-N.json` / `shard-N.ids`.
    #[arg(long)]
    pub out_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct MergeShardsArgs {
    /// The manifest the shards were carved from (coverage reference).
    #[arg(long)]
    pub manifest: PathBuf,

    /// Per-shard result documents, in any order.
    #[arg(long, required = true, num_args = 1..)]
    pub results: Vec<PathBuf>,

    /// Output path for the merged result document.
    #[arg(long)]
    pub out: PathBuf,
}
