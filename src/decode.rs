//! Sharded recognition: split a manifest into N decode shards, fan the
//! shards out through the job dispatcher, and merge the per-shard result
//! documents back into one utterance-keyed document.
//!
//! Sharding is deterministic and order-preserving: contiguous, nearly equal
//! blocks over the manifest's sorted utterance ids, pairwise disjoint, whose
//! union is exactly the manifest. The merge re-checks that property on the
//! way back in, so a decode job that dropped or duplicated utterances is
//! caught before scoring instead of silently skewing the error rate.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::artifact;
use crate::config::ToolCommand;
use crate::corpus::IdList;
use crate::dispatch::{fail_on_job_errors, run_parallel};
use crate::error::{PrepError, PrepResult};
use crate::manifest::Manifest;
use crate::process::CancelToken;

/// One recognized utterance: hypothesis text plus the decoder's score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub text: String,
    pub score: f64,
}

/// Per-shard or merged recognition output, keyed by utterance id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultDocument {
    pub utts: BTreeMap<String, Hypothesis>,
}

impl ResultDocument {
    pub fn save(&self, path: &Path) -> PrepResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        artifact::write_atomic(path, &json)
    }

    pub fn load(path: &Path) -> PrepResult<Self> {
        let contents = artifact::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| PrepError::CorruptArtifact {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.utts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.utts.is_empty()
    }
}

/// Partition `manifest` into `n` contiguous, nearly equal shards over its
/// sorted utterance-id order.
///
/// Shard sizes differ by at most one; earlier shards take the remainder.
/// `n` outside `[1, |manifest|]` is a partition request the pool cannot
/// satisfy.
pub fn shard(manifest: &Manifest, n: usize) -> PrepResult<Vec<Manifest>> {
    let total = manifest.len();
    if n == 0 || n > total {
        return Err(PrepError::InsufficientData {
            requested: n,
            available: total,
        });
    }

    let base = total / n;
    let remainder = total % n;
    let mut records = manifest.utts.iter();
    let mut shards = Vec::with_capacity(n);
    for shard_index in 0..n {
        let size = base + usize::from(shard_index < remainder);
        let utts: BTreeMap<_, _> = records
            .by_ref()
            .take(size)
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        shards.push(Manifest {
            vocab_size: manifest.vocab_size,
            dictionary_sha256: manifest.dictionary_sha256.clone(),
            utts,
        });
    }
    Ok(shards)
}

/// Merge per-shard result documents, verifying that the union of returned
/// ids is exactly `expected` (no utterance dropped or duplicated).
pub fn merge_results(
    expected: &IdList,
    shard_results: Vec<ResultDocument>,
) -> PrepResult<ResultDocument> {
    let mut merged = ResultDocument::default();
    let mut unexpected = Vec::new();
    for document in shard_results {
        for (id, hypothesis) in document.utts {
            let foreign = !expected.contains(&id);
            if merged.utts.insert(id.clone(), hypothesis).is_some() || foreign {
                unexpected.push(id);
            }
        }
    }

    let missing: Vec<String> = expected
        .ids()
        .iter()
        .filter(|id| !merged.utts.contains_key(*id))
        .cloned()
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        Ok(merged)
    } else {
        unexpected.sort();
        unexpected.dedup();
        Err(PrepError::ShardCountMismatch {
            missing,
            unexpected,
        })
    }
}

/// Shard `manifest`, decode every shard in parallel with the external
/// decoder against a fixed checkpoint, and merge the results.
///
/// Per shard `i` (1-based), the coordinator writes `shard-i.json` and
/// `shard-i.ids` under `workdir` and invokes
/// `decode <shard_json> <utt_list> <checkpoint> <result_json>` with the log
/// in `workdir/log/decode-i.log`.
pub fn run_sharded_decode(
    manifest: &Manifest,
    decoder: &ToolCommand,
    checkpoint: &Path,
    workdir: &Path,
    num_shards: usize,
    max_workers: usize,
    token: &CancelToken,
) -> PrepResult<ResultDocument> {
    let shards = shard(manifest, num_shards)?;
    std::fs::create_dir_all(workdir)?;

    let mut jobs = Vec::with_capacity(shards.len());
    let mut result_paths = Vec::with_capacity(shards.len());
    for (i, shard_manifest) in shards.iter().enumerate() {
        let shard_no = i + 1;
        let shard_json = workdir.join(format!("shard-{shard_no}.json"));
        let shard_ids = workdir.join(format!("shard-{shard_no}.ids"));
        let result_json = workdir.join(format!("result-{shard_no}.json"));

        shard_manifest.save(&shard_json)?;
        shard_manifest.id_list().save(&shard_ids)?;

        jobs.push(decoder.job(
            &format!("decode-{shard_no}"),
            &[
                shard_json.display().to_string(),
                shard_ids.display().to_string(),
                checkpoint.display().to_string(),
                result_json.display().to_string(),
            ],
            workdir.join("log").join(format!("decode-{shard_no}.log")),
        ));
        result_paths.push(result_json);
    }

    tracing::info!(
        shards = jobs.len(),
        max_workers,
        "dispatching decode shards"
    );
    let results = run_parallel(jobs, max_workers, token)?;
    fail_on_job_errors(&results)?;

    let mut shard_documents = Vec::with_capacity(result_paths.len());
    for path in &result_paths {
        shard_documents.push(ResultDocument::load(path)?);
    }
    merge_results(&manifest.id_list(), shard_documents)
}
