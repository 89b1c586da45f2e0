//! Experiment configuration.
//!
//! An experiment is described by a JSON config file: where the corpus lives,
//! how large the dev carve is, how wide each parallel stage may fan out, and
//! which external commands implement the opaque collaborators. The config is
//! loaded once and validated before any stage runs, so a defective worker
//! bound or a missing tool name fails fast instead of mid-pipeline.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifact;
use crate::dispatch::Job;
use crate::error::{PrepError, PrepResult};

/// An external collaborator: a program plus fixed leading arguments.
///
/// Stage code appends the per-invocation file arguments. The file contracts
/// are documented on [`ToolSuite`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    #[must_use]
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_owned(),
            args: Vec::new(),
        }
    }

    /// Build a dispatcher job invoking this tool with extra trailing args.
    #[must_use]
    pub fn job(&self, id: &str, extra_args: &[String], log_path: PathBuf) -> Job {
        let mut args = self.args.clone();
        args.extend_from_slice(extra_args);
        Job {
            id: id.to_owned(),
            program: self.program.clone(),
            args,
            cwd: None,
            log_path,
        }
    }

    /// Full argument vector for a direct (non-dispatched) invocation.
    #[must_use]
    pub fn args_with(&self, extra_args: &[String]) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend_from_slice(extra_args);
        args
    }
}

/// The external tools the pipeline orchestrates. All of them are invoked with
/// positional trailing arguments (after any configured fixed args):
///
/// - `extract`:    `<wav_scp> <out_scp>` — acoustic features for a shard.
/// - `synthesize`: `<manifest_json> <utt_list> <out_scp>` — synthesized
///   acoustic stream generated from the manifest's token sequences.
/// - `embed`:      `<wav_scp> <out_scp>` — fixed-size speaker embeddings.
/// - `train`:      `<train_json> <dev_json> <model_dir>` — writes an opaque
///   checkpoint under `<model_dir>`.
/// - `decode`:     `<shard_json> <utt_list> <checkpoint> <out_json>` — one
///   recognition result document per shard.
/// - `score`:      `<result_json> <ref_text> <report_dir>` — final scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSuite {
    pub extract: ToolCommand,
    pub synthesize: ToolCommand,
    pub embed: ToolCommand,
    pub train: ToolCommand,
    pub decode: ToolCommand,
    pub score: ToolCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Kaldi-style data directory for the raw train pool (`wav.scp`, `text`).
    pub data_dir: PathBuf,
    /// Data directory for the externally fixed test partition.
    pub test_data_dir: PathBuf,
    /// Root for every artifact this pipeline writes.
    pub work_dir: PathBuf,

    /// Dev set size: the first K utterances of the sorted raw train pool.
    #[serde(default = "default_dev_size")]
    pub dev_size: usize,

    /// Number of feature-extraction shards per split.
    #[serde(default = "default_shards")]
    pub extract_shards: usize,
    /// Concurrent feature-extraction jobs.
    #[serde(default = "default_workers")]
    pub extract_workers: usize,
    /// Number of decode shards over the test manifest.
    #[serde(default = "default_shards")]
    pub decode_shards: usize,
    /// Concurrent decode jobs.
    #[serde(default = "default_workers")]
    pub decode_workers: usize,

    /// Fail (rather than drop utterances) when an auxiliary stream does not
    /// cover the manifest.
    #[serde(default = "default_true")]
    pub strict_fusion: bool,
    /// Warn when an auxiliary stream covers utterances outside the manifest.
    #[serde(default = "default_true")]
    pub warn_on_extra: bool,

    pub tools: ToolSuite,
}

fn default_dev_size() -> usize {
    100
}

fn default_shards() -> usize {
    4
}

fn default_workers() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> PrepResult<Self> {
        let contents = artifact::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|e| PrepError::CorruptArtifact {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation, reported before any stage executes.
    pub fn validate(&self) -> PrepResult<()> {
        let mut problems = Vec::new();
        if self.extract_shards == 0 {
            problems.push("extract_shards must be positive".to_owned());
        }
        if self.extract_workers == 0 {
            problems.push("extract_workers must be positive".to_owned());
        }
        if self.decode_shards == 0 {
            problems.push("decode_shards must be positive".to_owned());
        }
        if self.decode_workers == 0 {
            problems.push("decode_workers must be positive".to_owned());
        }
        for (name, tool) in [
            ("extract", &self.tools.extract),
            ("synthesize", &self.tools.synthesize),
            ("embed", &self.tools.embed),
            ("train", &self.tools.train),
            ("decode", &self.tools.decode),
            ("score", &self.tools.score),
        ] {
            if tool.program.trim().is_empty() {
                problems.push(format!("tools.{name}.program must not be empty"));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(PrepError::InvalidConfig(problems.join("; ")))
        }
    }
}
