//! The staged experiment engine.
//!
//! Wires the corpus partitioner, dictionary, manifest builder/fuser, job
//! dispatcher, and decode coordinator into six numbered, resumable stages:
//!
//! 0. data preparation — sort the corpus, carve the dev set, materialize
//!    per-split data directories and ordered id-list artifacts
//! 1. acoustic features — fan extraction out over id-list chunks, fan the
//!    shard tables back into one feature stream per split
//! 2. dictionary + base manifests — freeze the label dictionary over the
//!    train transcripts, build `input1`+`output` records per split
//! 3. auxiliary fusion — synthesized-acoustic stream into `input2`, speaker
//!    embeddings into `input3`, per training split, atomically replacing the
//!    manifest
//! 4. training — hand the train/dev manifests to the external trainer
//! 5. decode + score — shard the test manifest, decode in parallel, merge,
//!    verify coverage, and invoke the external scorer
//!
//! Stages communicate exclusively through artifacts on disk; re-running from
//! any resume index only requires the artifacts of earlier stages to exist.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::config::ExperimentConfig;
use crate::corpus::{Corpus, IdList, split_first_k};
use crate::decode::run_sharded_decode;
use crate::dictionary::Dictionary;
use crate::dispatch::{fail_on_job_errors, run_parallel};
use crate::error::{PrepError, PrepResult};
use crate::features::{FeatureStream, ShapeTag};
use crate::manifest::{FusePolicy, Manifest, build_manifest};
use crate::process::{CancelToken, run_logged_command};
use crate::stage::{StageController, StageOutcome};

/// Splits that carry ground truth and get the full three-stream fusion.
const TRAIN_SPLITS: [&str; 2] = ["train", "dev"];

/// All dataset splits, in processing order.
const ALL_SPLITS: [&str; 3] = ["train", "dev", "test"];

/// Summary of one pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub resume_from: i32,
    pub started_at_rfc3339: String,
    pub finished_at_rfc3339: String,
    pub stages: Vec<StageOutcome>,
}

/// Resolves every artifact path under the experiment work directory.
///
/// The layout is the explicit state machine of the pipeline: stage N reads
/// only paths written by stages `< N`, and each path is overwritten
/// atomically, so file presence never needs to be guessed at.
#[derive(Debug, Clone)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    #[must_use]
    pub fn split_ids(&self, split: &str) -> PathBuf {
        self.root.join("splits").join(format!("{split}.ids"))
    }

    #[must_use]
    pub fn data_dir(&self, split: &str) -> PathBuf {
        self.root.join("data").join(split)
    }

    #[must_use]
    pub fn feats_scp(&self, split: &str) -> PathBuf {
        self.root.join("feats").join(split).join("feats.scp")
    }

    #[must_use]
    pub fn extract_shard_dir(&self, split: &str, shard_no: usize) -> PathBuf {
        self.root
            .join("feats")
            .join(split)
            .join(format!("shard-{shard_no}"))
    }

    #[must_use]
    pub fn extract_log(&self, split: &str, shard_no: usize) -> PathBuf {
        self.root
            .join("feats")
            .join(split)
            .join("log")
            .join(format!("extract-{shard_no}.log"))
    }

    #[must_use]
    pub fn dict_path(&self) -> PathBuf {
        self.root.join("dict").join("units.txt")
    }

    #[must_use]
    pub fn manifest(&self, split: &str) -> PathBuf {
        self.root.join("manifests").join(format!("{split}.json"))
    }

    #[must_use]
    pub fn aux_scp(&self, stream: &str, split: &str) -> PathBuf {
        self.root.join(stream).join(format!("{split}.scp"))
    }

    #[must_use]
    pub fn aux_log(&self, stream: &str, split: &str) -> PathBuf {
        self.root
            .join(stream)
            .join("log")
            .join(format!("{split}.log"))
    }

    #[must_use]
    pub fn model_dir(&self) -> PathBuf {
        self.root.join("model")
    }

    #[must_use]
    pub fn train_log(&self) -> PathBuf {
        self.root.join("model").join("train.log")
    }

    #[must_use]
    pub fn decode_dir(&self) -> PathBuf {
        self.root.join("decode")
    }

    #[must_use]
    pub fn result_json(&self) -> PathBuf {
        self.root.join("decode").join("result.json")
    }

    #[must_use]
    pub fn score_dir(&self) -> PathBuf {
        self.root.join("score")
    }
}

pub struct ExperimentPipeline {
    config: ExperimentConfig,
    layout: WorkLayout,
}

impl ExperimentPipeline {
    pub fn new(config: ExperimentConfig) -> PrepResult<Self> {
        config.validate()?;
        let layout = WorkLayout::new(&config.work_dir);
        Ok(Self { config, layout })
    }

    #[must_use]
    pub fn layout(&self) -> &WorkLayout {
        &self.layout
    }

    /// Execute the pipeline from `resume_from` (stages below it are skipped).
    pub fn run(&self, resume_from: i32, token: &CancelToken) -> PrepResult<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        tracing::info!(%run_id, resume_from, work_dir = %self.config.work_dir.display(), "pipeline started");

        let mut controller = StageController::new(resume_from);
        controller.run(0, "data-prep", || self.stage_data_prep())?;
        controller.run(1, "features", || self.stage_features(token))?;
        controller.run(2, "dictionary-manifests", || self.stage_manifests())?;
        controller.run(3, "auxiliary-fusion", || self.stage_fusion(token))?;
        controller.run(4, "train", || self.stage_train(token))?;
        controller.run(5, "decode-score", || self.stage_decode_score(token))?;

        let report = RunReport {
            run_id,
            resume_from,
            started_at_rfc3339: started_at.to_rfc3339(),
            finished_at_rfc3339: Utc::now().to_rfc3339(),
            stages: controller.outcomes().to_vec(),
        };
        tracing::info!(run_id = %report.run_id, "pipeline finished");
        Ok(report)
    }

    /// Stage 0: sort the corpus, carve dev = first K of the raw train pool,
    /// and persist ordered id lists plus per-split data directories.
    ///
    /// Every later derivation of "the same split" starts from these id-list
    /// artifacts, never from a fresh partition of the raw corpus.
    fn stage_data_prep(&self) -> PrepResult<()> {
        let corpus = Corpus::load_dir(&self.config.data_dir)?;
        let pool = corpus.id_list();
        tracing::info!(utterances = pool.len(), "loaded raw train pool");

        let (dev, train) = split_first_k(&pool, self.config.dev_size)?;
        for (split, ids) in [("train", &train), ("dev", &dev)] {
            ids.save(&self.layout.split_ids(split))?;
            corpus.write_subset(ids, &self.layout.data_dir(split))?;
            tracing::info!(split, utterances = ids.len(), "split materialized");
        }

        let test_corpus = Corpus::load_dir(&self.config.test_data_dir)?;
        let test_ids = test_corpus.id_list();
        test_ids.save(&self.layout.split_ids("test"))?;
        test_corpus.write_subset(&test_ids, &self.layout.data_dir("test"))?;
        tracing::info!(utterances = test_ids.len(), "test partition materialized");
        Ok(())
    }

    /// Stage 1: parallel acoustic feature extraction per split.
    fn stage_features(&self, token: &CancelToken) -> PrepResult<()> {
        for split in ALL_SPLITS {
            let ids = IdList::load(&self.layout.split_ids(split))?;
            let corpus = Corpus::load_dir(&self.layout.data_dir(split))?;
            let chunks = ids.split_chunks(self.config.extract_shards.min(ids.len()))?;

            let mut jobs = Vec::with_capacity(chunks.len());
            let mut shard_outputs = Vec::with_capacity(chunks.len());
            for (i, chunk) in chunks.iter().enumerate() {
                let shard_no = i + 1;
                let shard_dir = self.layout.extract_shard_dir(split, shard_no);
                corpus.write_subset(chunk, &shard_dir)?;
                let out_scp = shard_dir.join("feats.scp");
                jobs.push(self.config.tools.extract.job(
                    &format!("extract-{split}-{shard_no}"),
                    &[
                        shard_dir.join("wav.scp").display().to_string(),
                        out_scp.display().to_string(),
                    ],
                    self.layout.extract_log(split, shard_no),
                ));
                shard_outputs.push(out_scp);
            }

            tracing::info!(
                split,
                shards = jobs.len(),
                max_workers = self.config.extract_workers,
                "dispatching feature extraction"
            );
            let results = run_parallel(jobs, self.config.extract_workers, token)?;
            fail_on_job_errors(&results)?;

            let mut shard_streams = Vec::with_capacity(shard_outputs.len());
            for path in &shard_outputs {
                shard_streams.push(FeatureStream::load_scp("fbank", ShapeTag::Matrix, path)?);
            }
            let stream = FeatureStream::concat("fbank", ShapeTag::Matrix, shard_streams)?;
            stream.verify_covers(&ids)?;
            stream.save_scp(&self.layout.feats_scp(split))?;
        }
        Ok(())
    }

    /// Stage 2: freeze the dictionary over the train transcripts and build
    /// the base manifest for every split.
    fn stage_manifests(&self) -> PrepResult<()> {
        let train_corpus = Corpus::load_dir(&self.layout.data_dir("train"))?;
        let train_texts = train_corpus.all_transcripts();
        let dictionary = Dictionary::build(train_texts.values().map(String::as_str));
        dictionary.save(&self.layout.dict_path())?;
        tracing::info!(
            vocab_size = dictionary.vocab_size(),
            "dictionary frozen over train transcripts"
        );

        for split in ALL_SPLITS {
            let stream =
                FeatureStream::load_scp("fbank", ShapeTag::Matrix, &self.layout.feats_scp(split))?;
            let transcripts = Corpus::load_dir(&self.layout.data_dir(split))?.all_transcripts();
            let (manifest, report) = build_manifest(&stream, &dictionary, &transcripts);
            tracing::info!(
                split,
                records = report.built,
                missing_transcript = report.missing_transcript,
                missing_feature = report.missing_feature,
                "base manifest built"
            );
            manifest.save(&self.layout.manifest(split))?;
        }
        Ok(())
    }

    /// Stage 3: generate and fuse the auxiliary streams for the training
    /// splits: synthesized acoustics into `input2`, speaker embeddings into
    /// `input3`.
    fn stage_fusion(&self, token: &CancelToken) -> PrepResult<()> {
        let policy = FusePolicy {
            strict: self.config.strict_fusion,
            warn_on_extra: self.config.warn_on_extra,
        };

        // Synthesized-acoustic stream: generated from each manifest's token
        // sequences by the external synthesizer.
        let synth_jobs = TRAIN_SPLITS
            .iter()
            .map(|split| {
                self.config.tools.synthesize.job(
                    &format!("synthesize-{split}"),
                    &[
                        self.layout.manifest(split).display().to_string(),
                        self.layout.split_ids(split).display().to_string(),
                        self.layout.aux_scp("synth", split).display().to_string(),
                    ],
                    self.layout.aux_log("synth", split),
                )
            })
            .collect();
        let results = run_parallel(synth_jobs, self.config.extract_workers, token)?;
        fail_on_job_errors(&results)?;
        for split in TRAIN_SPLITS {
            self.fuse_aux_stream(split, "synth", ShapeTag::Matrix, "input2", policy)?;
        }

        // Speaker-embedding stream: one fixed-size vector per utterance from
        // the raw audio.
        let embed_jobs = TRAIN_SPLITS
            .iter()
            .map(|split| {
                self.config.tools.embed.job(
                    &format!("embed-{split}"),
                    &[
                        self.layout
                            .data_dir(split)
                            .join("wav.scp")
                            .display()
                            .to_string(),
                        self.layout.aux_scp("xvector", split).display().to_string(),
                    ],
                    self.layout.aux_log("xvector", split),
                )
            })
            .collect();
        let results = run_parallel(embed_jobs, self.config.extract_workers, token)?;
        fail_on_job_errors(&results)?;
        for split in TRAIN_SPLITS {
            self.fuse_aux_stream(split, "xvector", ShapeTag::Vector, "input3", policy)?;
        }
        Ok(())
    }

    fn fuse_aux_stream(
        &self,
        split: &str,
        stream_name: &str,
        shape: ShapeTag,
        slot: &str,
        policy: FusePolicy,
    ) -> PrepResult<()> {
        let stream =
            FeatureStream::load_scp(stream_name, shape, &self.layout.aux_scp(stream_name, split))?;
        let manifest_path = self.layout.manifest(split);
        let manifest = Manifest::load(&manifest_path)?;
        let (fused, report) = manifest.fuse(&stream, slot, policy)?;
        tracing::info!(
            split,
            slot,
            stream = stream_name,
            records = fused.len(),
            dropped = report.dropped.len(),
            extras_ignored = report.extras_ignored,
            "auxiliary stream fused"
        );
        fused.save(&manifest_path)
    }

    /// Stage 4: external training over the fused train/dev manifests.
    fn stage_train(&self, token: &CancelToken) -> PrepResult<()> {
        std::fs::create_dir_all(self.layout.model_dir())?;
        let args = self.config.tools.train.args_with(&[
            self.layout.manifest("train").display().to_string(),
            self.layout.manifest("dev").display().to_string(),
            self.layout.model_dir().display().to_string(),
        ]);
        tracing::info!(program = %self.config.tools.train.program, "training started");
        run_logged_command(
            &self.config.tools.train.program,
            &args,
            None,
            &self.layout.train_log(),
            token,
        )
    }

    /// Stage 5: sharded decoding over the test manifest, merge, and scoring.
    fn stage_decode_score(&self, token: &CancelToken) -> PrepResult<()> {
        let manifest_path = self.layout.manifest("test");
        let manifest = Manifest::load(&manifest_path)?;

        // Decoding must reuse the dictionary that built the training
        // manifests; a mismatch means the manifests were rebuilt after
        // training and the label space no longer lines up.
        let dictionary = Dictionary::load(&self.layout.dict_path())?;
        if manifest.dictionary_sha256 != dictionary.fingerprint() {
            return Err(PrepError::CorruptArtifact {
                path: manifest_path,
                detail: "manifest was built with a different dictionary than dict/units.txt"
                    .to_owned(),
            });
        }

        let num_shards = self.config.decode_shards.min(manifest.len());
        let merged = run_sharded_decode(
            &manifest,
            &self.config.tools.decode,
            &self.layout.model_dir(),
            &self.layout.decode_dir(),
            num_shards,
            self.config.decode_workers,
            token,
        )?;
        merged.save(&self.layout.result_json())?;
        tracing::info!(utterances = merged.len(), "decode results merged");

        std::fs::create_dir_all(self.layout.score_dir())?;
        let args = self.config.tools.score.args_with(&[
            self.layout.result_json().display().to_string(),
            self.layout
                .data_dir("test")
                .join("text")
                .display()
                .to_string(),
            self.layout.score_dir().display().to_string(),
        ]);
        run_logged_command(
            &self.config.tools.score.program,
            &args,
            None,
            &self.layout.score_dir().join("score.log"),
            token,
        )
    }
}
