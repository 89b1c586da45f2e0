use std::path::PathBuf;

use thiserror::Error;

pub type PrepResult<T> = Result<T, PrepError>;

#[derive(Debug, Error)]
pub enum PrepError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing command `{command}` on PATH")]
    CommandMissing { command: String },

    #[error("command failed: `{command}` (status: {status}){stderr_suffix}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr_suffix: String,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("missing expected artifact at `{0}`")]
    MissingArtifact(PathBuf),

    #[error("corrupt artifact `{path}`: {detail}")]
    CorruptArtifact { path: PathBuf, detail: String },

    #[error("insufficient data: requested {requested} from a pool of {available}")]
    InsufficientData { requested: usize, available: usize },

    #[error(
        "utterance `{utterance}` in manifest has no entry in stream `{stream}` (strict fuse into slot `{slot}`)"
    )]
    MissingFeature {
        utterance: String,
        stream: String,
        slot: String,
    },

    #[error(
        "slot `{slot}` is already occupied (first conflicting utterance `{utterance}`); refusing to overwrite"
    )]
    SlotConflict { slot: String, utterance: String },

    #[error(
        "shard results do not cover the manifest: missing [{}], unexpected [{}]",
        missing.join(", "),
        unexpected.join(", ")
    )]
    ShardCountMismatch {
        missing: Vec<String>,
        /// Ids returned more than once, or returned without being in the
        /// manifest at all.
        unexpected: Vec<String>,
    },

    #[error(
        "{} of {total} parallel jobs failed: [{}]",
        failed.len(),
        failed.join(", ")
    )]
    JobFailure { failed: Vec<String>, total: usize },

    #[error("stage {index} ({label}) aborted: {source}")]
    StageAbort {
        index: i32,
        label: String,
        #[source]
        source: Box<PrepError>,
    },

    #[error("pipeline cancelled: {0}")]
    Cancelled(String),
}

impl PrepError {
    #[must_use]
    pub fn from_command_failure(command: String, status: i32, stderr: String) -> Self {
        let trimmed = stderr.trim();
        let stderr_suffix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("; stderr: {trimmed}")
        };
        Self::CommandFailed {
            command,
            status,
            stderr_suffix,
        }
    }

    /// Wrap an error produced inside a stage body, preserving the stage identity.
    #[must_use]
    pub fn stage_abort(index: i32, label: &str, source: PrepError) -> Self {
        Self::StageAbort {
            index,
            label: label.to_owned(),
            source: Box::new(source),
        }
    }

    /// Stable, unique, machine-readable error code for every variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "AP-IO",
            Self::Json(_) => "AP-JSON",
            Self::CommandMissing { .. } => "AP-CMD-MISSING",
            Self::CommandFailed { .. } => "AP-CMD-FAILED",
            Self::InvalidConfig(_) => "AP-INVALID-CONFIG",
            Self::MissingArtifact(_) => "AP-MISSING-ARTIFACT",
            Self::CorruptArtifact { .. } => "AP-CORRUPT-ARTIFACT",
            Self::InsufficientData { .. } => "AP-INSUFFICIENT-DATA",
            Self::MissingFeature { .. } => "AP-MISSING-FEATURE",
            Self::SlotConflict { .. } => "AP-SLOT-CONFLICT",
            Self::ShardCountMismatch { .. } => "AP-SHARD-MISMATCH",
            Self::JobFailure { .. } => "AP-JOB-FAILURE",
            Self::StageAbort { .. } => "AP-STAGE-ABORT",
            Self::Cancelled(_) => "AP-CANCELLED",
        }
    }
}
