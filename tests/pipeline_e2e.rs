//! End-to-end pipeline tests.
//!
//! The external collaborators (feature extractor, synthesizer, speaker
//! embedder, trainer, decoder, scorer) are replaced by mock shell scripts
//! materialized into a TempDir. The mocks honor the real file contracts:
//! they read the utterance tables they are handed and write id-keyed
//! artifacts, so utterance alignment is exercised for real.

use std::path::{Path, PathBuf};

use asr_prep::corpus::IdList;
use asr_prep::manifest::Manifest;
use asr_prep::stage::StageStatus;
use asr_prep::{CancelToken, ExperimentConfig, ExperimentPipeline, PrepError, ToolCommand};

// ---------------------------------------------------------------------------
// Fixture helpers
// ---------------------------------------------------------------------------

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write mock script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("make executable");
    path
}

/// Reads a `wav.scp`-style table from `$1`, writes one locator line per
/// utterance to `$2`.
const MOCK_EXTRACT: &str = r#"#!/bin/sh
out="$2"
: > "$out.partial"
n=0
while read -r id rest; do
  [ -z "$id" ] && continue
  echo "$id $out.ark:$n" >> "$out.partial"
  n=$((n+1))
done < "$1"
mv "$out.partial" "$out"
"#;

/// Reads the ordered utterance list from `$2` (the manifest is `$1`), writes
/// a synthesized-feature locator per utterance to `$3`.
const MOCK_SYNTH: &str = r#"#!/bin/sh
[ -f "$1" ] || { echo "missing manifest $1" >&2; exit 1; }
out="$3"
: > "$out.partial"
while read -r id; do
  [ -z "$id" ] && continue
  echo "$id $out.ark:7" >> "$out.partial"
done < "$2"
mv "$out.partial" "$out"
"#;

/// Like MOCK_SYNTH but skips the first utterance, producing an incomplete
/// stream for strict-fusion tests.
const MOCK_SYNTH_DROPS_FIRST: &str = r#"#!/bin/sh
out="$3"
: > "$out.partial"
first=1
while read -r id; do
  [ -z "$id" ] && continue
  if [ $first -eq 1 ]; then first=0; continue; fi
  echo "$id $out.ark:7" >> "$out.partial"
done < "$2"
mv "$out.partial" "$out"
"#;

const MOCK_TRAIN: &str = r#"#!/bin/sh
[ -f "$1" ] || { echo "missing train manifest" >&2; exit 1; }
[ -f "$2" ] || { echo "missing dev manifest" >&2; exit 1; }
mkdir -p "$3"
echo trained > "$3/final.ckpt"
"#;

/// Decodes the shard whose utterance list is `$2` against checkpoint `$3`,
/// writing an id-keyed result document to `$4`.
const MOCK_DECODE: &str = r#"#!/bin/sh
[ -f "$3/final.ckpt" ] || { echo "missing checkpoint under $3" >&2; exit 1; }
out="$4"
{
  printf '{"utts":{'
  first=1
  while read -r id; do
    [ -z "$id" ] && continue
    [ $first -eq 0 ] && printf ','
    printf '"%s":{"text":"hello there","score":-0.5}' "$id"
    first=0
  done < "$2"
  printf '}}'
} > "$out.partial"
mv "$out.partial" "$out"
"#;

const MOCK_SCORE: &str = r#"#!/bin/sh
[ -f "$1" ] || { echo "missing result document" >&2; exit 1; }
[ -f "$2" ] || { echo "missing reference text" >&2; exit 1; }
mkdir -p "$3"
echo "WER 0.0" > "$3/report.txt"
"#;

const MOCK_FAIL: &str = r#"#!/bin/sh
echo "tool exploded" >&2
exit 1
"#;

struct Fixture {
    root: tempfile::TempDir,
    config: ExperimentConfig,
}

impl Fixture {
    /// A small corpus: `train_n` utterances in the raw train pool and
    /// `test_n` in the fixed test partition, with working mocks for every
    /// tool.
    fn new(train_n: usize, test_n: usize, dev_size: usize) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let tools_dir = root.path().join("tools");
        std::fs::create_dir_all(&tools_dir).expect("tools dir");

        let extract = write_script(&tools_dir, "mock_extract.sh", MOCK_EXTRACT);
        let synthesize = write_script(&tools_dir, "mock_synth.sh", MOCK_SYNTH);
        let embed = write_script(&tools_dir, "mock_embed.sh", MOCK_EXTRACT);
        let train = write_script(&tools_dir, "mock_train.sh", MOCK_TRAIN);
        let decode = write_script(&tools_dir, "mock_decode.sh", MOCK_DECODE);
        let score = write_script(&tools_dir, "mock_score.sh", MOCK_SCORE);

        let data_dir = root.path().join("corpus").join("train");
        let test_data_dir = root.path().join("corpus").join("test");
        write_corpus(&data_dir, "utt", train_n);
        write_corpus(&test_data_dir, "test-utt", test_n);

        let config = ExperimentConfig {
            data_dir,
            test_data_dir,
            work_dir: root.path().join("work"),
            dev_size,
            extract_shards: 3,
            extract_workers: 2,
            decode_shards: 2,
            decode_workers: 2,
            strict_fusion: true,
            warn_on_extra: true,
            tools: asr_prep::ToolSuite {
                extract: tool(&extract),
                synthesize: tool(&synthesize),
                embed: tool(&embed),
                train: tool(&train),
                decode: tool(&decode),
                score: tool(&score),
            },
        };
        Self {
            root,
            config,
        }
    }

    fn pipeline(&self) -> ExperimentPipeline {
        ExperimentPipeline::new(self.config.clone()).expect("valid config")
    }

    fn work(&self) -> &Path {
        &self.config.work_dir
    }
}

fn tool(path: &Path) -> ToolCommand {
    ToolCommand::new(&path.display().to_string())
}

fn write_corpus(dir: &Path, prefix: &str, n: usize) {
    std::fs::create_dir_all(dir).expect("data dir");
    let mut wav = String::new();
    let mut text = String::new();
    for i in 0..n {
        wav.push_str(&format!("{prefix}-{i:03} /audio/{prefix}-{i:03}.wav\n"));
        text.push_str(&format!("{prefix}-{i:03} the quick brown fox {i}\n"));
    }
    std::fs::write(dir.join("wav.scp"), wav).expect("wav.scp");
    std::fs::write(dir.join("text"), text).expect("text");
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[test]
fn full_pipeline_produces_fused_manifests_and_merged_results() {
    let fixture = Fixture::new(30, 6, 10);
    let pipeline = fixture.pipeline();

    let report = pipeline
        .run(-1, &CancelToken::no_deadline())
        .expect("pipeline should complete");

    assert_eq!(report.stages.len(), 6);
    assert!(
        report
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Executed),
        "negative resume executes every stage: {:?}",
        report.stages
    );

    // Split membership: dev = first 10 of the sorted pool, train = the rest.
    let dev = IdList::load(&fixture.work().join("splits/dev.ids")).expect("dev ids");
    let train = IdList::load(&fixture.work().join("splits/train.ids")).expect("train ids");
    assert_eq!(dev.len(), 10);
    assert_eq!(train.len(), 20);
    assert_eq!(dev.ids()[0], "utt-000");
    assert_eq!(train.ids()[0], "utt-010");
    assert!(dev.ids().iter().all(|id| !train.contains(id)));

    // Fused train manifest: all three input streams plus labels, aligned on
    // exactly the train split.
    let manifest = Manifest::load(&fixture.work().join("manifests/train.json")).expect("manifest");
    assert_eq!(manifest.len(), 20);
    assert_eq!(manifest.id_list().ids(), train.ids());
    for (id, record) in &manifest.utts {
        for slot in ["input1", "input2", "input3"] {
            assert!(record.inputs.contains_key(slot), "{id} missing {slot}");
        }
        let output = record.output.as_ref().expect("ground truth");
        assert!(!output.token_ids.is_empty(), "{id} has empty labels");
    }

    // Merged decode results cover exactly the test partition.
    let result = asr_prep::decode::ResultDocument::load(&fixture.work().join("decode/result.json"))
        .expect("merged results");
    let test_ids = IdList::load(&fixture.work().join("splits/test.ids")).expect("test ids");
    assert_eq!(result.len(), test_ids.len());
    for id in test_ids.ids() {
        assert_eq!(result.utts[id].text, "hello there");
    }

    // Scorer ran over the merged document.
    let score_report = fixture.work().join("score/report.txt");
    assert!(score_report.exists(), "score report missing");
}

#[test]
fn rerun_from_decode_stage_reuses_earlier_artifacts() {
    let fixture = Fixture::new(18, 4, 6);
    let pipeline = fixture.pipeline();

    pipeline
        .run(-1, &CancelToken::no_deadline())
        .expect("first full run");

    // Remove the merged results so the re-run observably regenerates them.
    std::fs::remove_file(fixture.work().join("decode/result.json")).expect("remove result");

    let report = pipeline
        .run(5, &CancelToken::no_deadline())
        .expect("resume from stage 5");

    let statuses: Vec<StageStatus> = report.stages.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        [
            StageStatus::Skipped,
            StageStatus::Skipped,
            StageStatus::Skipped,
            StageStatus::Skipped,
            StageStatus::Skipped,
            StageStatus::Executed,
        ],
        "only the decode stage runs on resume"
    );
    assert!(
        fixture.work().join("decode/result.json").exists(),
        "decode stage regenerated the merged results"
    );
}

// ---------------------------------------------------------------------------
// Failure propagation
// ---------------------------------------------------------------------------

#[test]
fn failing_extract_jobs_abort_the_feature_stage_naming_every_job() {
    let mut fixture = Fixture::new(12, 4, 4);
    let tools_dir = fixture.root.path().join("tools");
    let failing = write_script(&tools_dir, "mock_fail.sh", MOCK_FAIL);
    fixture.config.tools.extract = tool(&failing);

    let err = fixture
        .pipeline()
        .run(-1, &CancelToken::no_deadline())
        .expect_err("extraction must fail");

    match &err {
        PrepError::StageAbort { index, label, source } => {
            assert_eq!(*index, 1);
            assert_eq!(label, "features");
            match source.as_ref() {
                PrepError::JobFailure { failed, total } => {
                    assert_eq!(*total, 3, "three extraction shards for the train split");
                    assert_eq!(failed.len(), 3, "every failed job is named: {failed:?}");
                    assert!(failed.iter().all(|id| id.starts_with("extract-train-")));
                }
                other => panic!("expected JobFailure inside the abort, got: {other:?}"),
            }
        }
        other => panic!("expected StageAbort, got: {other:?}"),
    }

    // Prior stage artifacts survive the abort for a later resume.
    assert!(fixture.work().join("splits/train.ids").exists());
}

#[test]
fn incomplete_synth_stream_fails_strict_fusion_naming_the_utterance() {
    let mut fixture = Fixture::new(12, 4, 4);
    let tools_dir = fixture.root.path().join("tools");
    let dropping = write_script(&tools_dir, "mock_synth_drop.sh", MOCK_SYNTH_DROPS_FIRST);
    fixture.config.tools.synthesize = tool(&dropping);

    let err = fixture
        .pipeline()
        .run(-1, &CancelToken::no_deadline())
        .expect_err("strict fusion must fail");

    match &err {
        PrepError::StageAbort { index, source, .. } => {
            assert_eq!(*index, 3, "fusion stage");
            match source.as_ref() {
                PrepError::MissingFeature { utterance, slot, .. } => {
                    assert_eq!(slot, "input2");
                    // Train split starts after the dev carve of 4.
                    assert_eq!(utterance, "utt-004");
                }
                other => panic!("expected MissingFeature, got: {other:?}"),
            }
        }
        other => panic!("expected StageAbort, got: {other:?}"),
    }
}

#[test]
fn lenient_fusion_drops_uncovered_utterances_instead_of_failing() {
    let mut fixture = Fixture::new(12, 4, 4);
    let tools_dir = fixture.root.path().join("tools");
    let dropping = write_script(&tools_dir, "mock_synth_drop2.sh", MOCK_SYNTH_DROPS_FIRST);
    fixture.config.tools.synthesize = tool(&dropping);
    fixture.config.strict_fusion = false;

    fixture
        .pipeline()
        .run(-1, &CancelToken::no_deadline())
        .expect("lenient run completes");

    let manifest = Manifest::load(&fixture.work().join("manifests/train.json")).expect("manifest");
    assert_eq!(manifest.len(), 7, "one of eight train utterances dropped");
    assert!(manifest.get("utt-004").is_none(), "uncovered utterance gone");
}

#[test]
fn decode_refuses_a_manifest_built_with_a_different_dictionary() {
    let fixture = Fixture::new(12, 4, 4);
    let pipeline = fixture.pipeline();
    pipeline
        .run(-1, &CancelToken::no_deadline())
        .expect("full run");

    // Replace the frozen dictionary, then resume from decode.
    std::fs::write(fixture.work().join("dict/units.txt"), "<unk> 1\nz 2\n")
        .expect("clobber dictionary");

    let err = pipeline
        .run(5, &CancelToken::no_deadline())
        .expect_err("dictionary mismatch must abort");
    match &err {
        PrepError::StageAbort { index, source, .. } => {
            assert_eq!(*index, 5);
            assert!(
                matches!(source.as_ref(), PrepError::CorruptArtifact { .. }),
                "expected CorruptArtifact, got: {source:?}"
            );
        }
        other => panic!("expected StageAbort, got: {other:?}"),
    }
}
