use std::time::Duration;

use asr_prep::cli::{Cli, Command, ShutdownController};
use asr_prep::corpus::{Corpus, IdList, load_transcript_table, split_first_k};
use asr_prep::decode::{ResultDocument, merge_results, shard};
use asr_prep::dictionary::Dictionary;
use asr_prep::features::FeatureStream;
use asr_prep::manifest::{FusePolicy, Manifest, build_manifest};
use asr_prep::{CancelToken, ExperimentConfig, ExperimentPipeline, PrepResult};
use clap::Parser;

fn main() {
    asr_prep::logging::init();

    if let Err(e) = ShutdownController::install() {
        tracing::warn!("failed to install Ctrl+C handler: {e}");
    }

    if let Err(error) = run() {
        if ShutdownController::is_shutting_down() {
            eprintln!("interrupted");
            std::process::exit(ShutdownController::signal_exit_code());
        }
        eprintln!("error[{}]: {error}", error.error_code());
        std::process::exit(1);
    }

    if ShutdownController::is_shutting_down() {
        std::process::exit(ShutdownController::signal_exit_code());
    }
}

fn run() -> PrepResult<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            let config = ExperimentConfig::load(&args.config)?;
            let pipeline = ExperimentPipeline::new(config)?;
            let token = match args.timeout {
                Some(secs) => CancelToken::with_deadline_from_now(Duration::from_secs(secs)),
                None => CancelToken::no_deadline(),
            };
            let report = pipeline.run(args.stage, &token)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for outcome in &report.stages {
                    println!("stage {} ({}): {:?}", outcome.index, outcome.label, outcome.status);
                }
                println!("run {} finished", report.run_id);
            }
            Ok(())
        }
        Command::Split(args) => {
            let corpus = Corpus::load_dir(&args.data_dir)?;
            let pool = corpus.id_list();
            let (dev, train) = split_first_k(&pool, args.dev_size)?;
            dev.save(&args.out_dir.join("dev.ids"))?;
            train.save(&args.out_dir.join("train.ids"))?;
            println!("dev: {} utterances, train: {} utterances", dev.len(), train.len());
            Ok(())
        }
        Command::Dict(args) => {
            let transcripts = load_transcript_table(&args.text)?;
            let dictionary = Dictionary::build(transcripts.values().map(String::as_str));
            dictionary.save(&args.out)?;
            println!(
                "dictionary with {} label ids written to {}",
                dictionary.vocab_size(),
                args.out.display()
            );
            Ok(())
        }
        Command::BuildManifest(args) => {
            let stream = FeatureStream::load_scp("primary", args.shape, &args.feats)?;
            let dictionary = Dictionary::load(&args.dict)?;
            let transcripts = load_transcript_table(&args.text)?;
            let (manifest, report) = build_manifest(&stream, &dictionary, &transcripts);
            manifest.save(&args.out)?;
            println!(
                "manifest: {} records ({} missing transcript, {} missing features)",
                report.built, report.missing_transcript, report.missing_feature
            );
            Ok(())
        }
        Command::Fuse(args) => {
            let manifest = Manifest::load(&args.manifest)?;
            let stream = FeatureStream::load_scp(&args.stream_name, args.shape, &args.scp)?;
            let policy = FusePolicy {
                strict: !args.lenient,
                ..FusePolicy::default()
            };
            let (fused, report) = manifest.fuse(&stream, &args.slot, policy)?;
            let out = args.out.unwrap_or(args.manifest);
            fused.save(&out)?;
            println!(
                "fused `{}` into {} records ({} dropped, {} extras ignored)",
                args.slot,
                fused.len(),
                report.dropped.len(),
                report.extras_ignored
            );
            Ok(())
        }
        Command::Shard(args) => {
            let manifest = Manifest::load(&args.manifest)?;
            let shards = shard(&manifest, args.num)?;
            for (i, piece) in shards.iter().enumerate() {
                let shard_no = i + 1;
                piece.save(&args.out_dir.join(format!("shard-{shard_no}.json")))?;
                piece
                    .id_list()
                    .save(&args.out_dir.join(format!("shard-{shard_no}.ids")))?;
            }
            println!("{} shards written to {}", shards.len(), args.out_dir.display());
            Ok(())
        }
        Command::MergeShards(args) => {
            let manifest = Manifest::load(&args.manifest)?;
            let expected: IdList = manifest.id_list();
            let mut documents = Vec::with_capacity(args.results.len());
            for path in &args.results {
                documents.push(ResultDocument::load(path)?);
            }
            let merged = merge_results(&expected, documents)?;
            merged.save(&args.out)?;
            println!(
                "merged {} shard documents covering {} utterances",
                args.results.len(),
                merged.len()
            );
            Ok(())
        }
    }
}
