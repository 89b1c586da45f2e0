//! Training/recognition manifests: the fused, utterance-keyed JSON documents
//! consumed by the external trainer and decoder.
//!
//! A manifest record carries one or more named input slots, each bound to a
//! feature-stream entry, and for splits with ground truth an output slot
//! (token ids + source text). The document also records the vocabulary size
//! and the fingerprint of the dictionary that produced the labels, so decode
//! can prove it is reusing the training dictionary.
//!
//! Fusion never mutates its input: it produces a fresh manifest or fails,
//! and persistence goes through an atomic tmp-write + rename, so a reader
//! can never observe a partially merged document.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::artifact;
use crate::corpus::IdList;
use crate::dictionary::Dictionary;
use crate::error::{PrepError, PrepResult};
use crate::features::{FeatureStream, ShapeTag};

/// Slot name for the primary acoustic stream.
pub const PRIMARY_SLOT: &str = "input1";

/// A named input slot bound to one feature-stream entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSlot {
    pub feat: std::path::PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    pub shape: ShapeTag,
}

impl InputSlot {
    fn from_stream(stream: &FeatureStream, id: &str) -> Option<Self> {
        stream.get(id).map(|artifact| Self {
            feat: artifact.path.clone(),
            offset: artifact.offset,
            shape: stream.shape(),
        })
    }
}

/// Ground-truth label slot: token ids against the experiment dictionary,
/// plus the original text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSlot {
    pub token_ids: Vec<u32>,
    pub text: String,
}

/// One utterance's record: named input slots and an optional output slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSlot>,
    #[serde(flatten)]
    pub inputs: BTreeMap<String, InputSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Label vocabulary size the records were tokenized against.
    pub vocab_size: u32,
    /// Fingerprint of the dictionary that produced the output slots.
    pub dictionary_sha256: String,
    pub utts: BTreeMap<String, ManifestRecord>,
}

/// Counters reported by [`build_manifest`]. Mismatched utterances are
/// excluded rather than fatal; callers decide whether a subset manifest is
/// acceptable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub built: usize,
    /// Utterances in the primary stream with no transcript.
    pub missing_transcript: usize,
    /// Utterances with a transcript but no primary-stream entry.
    pub missing_feature: usize,
}

/// Fusion policy for one auxiliary stream.
#[derive(Debug, Clone, Copy)]
pub struct FusePolicy {
    /// Fail on a manifest utterance missing from the stream; otherwise the
    /// utterance is dropped from the fused result.
    pub strict: bool,
    /// Log stream entries that have no manifest counterpart. They are
    /// ignored either way: manifest membership is authoritative.
    pub warn_on_extra: bool,
}

impl Default for FusePolicy {
    fn default() -> Self {
        Self {
            strict: true,
            warn_on_extra: true,
        }
    }
}

/// What a (lenient) fuse did besides attaching slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuseReport {
    /// Manifest utterances dropped because the stream lacked them.
    pub dropped: Vec<String>,
    /// Stream entries ignored because the manifest lacked them.
    pub extras_ignored: usize,
}

/// Build the base manifest for one split from its primary feature stream.
///
/// For each utterance in the stream with a transcript, tokenizes the
/// transcript (unknown symbols map to id 1) and emits
/// `{input1: <stream entry>, output: {token_ids, text}}`. Utterances present
/// on only one side are excluded and counted in the report.
pub fn build_manifest(
    primary: &FeatureStream,
    dictionary: &Dictionary,
    transcripts: &BTreeMap<String, String>,
) -> (Manifest, BuildReport) {
    let mut report = BuildReport::default();
    let mut utts = BTreeMap::new();

    for (id, _) in primary.iter() {
        let Some(text) = transcripts.get(id) else {
            report.missing_transcript += 1;
            continue;
        };
        let slot = InputSlot::from_stream(primary, id).expect("id came from the stream");
        let record = ManifestRecord {
            output: Some(OutputSlot {
                token_ids: dictionary.tokenize(text),
                text: text.clone(),
            }),
            inputs: BTreeMap::from([(PRIMARY_SLOT.to_owned(), slot)]),
        };
        utts.insert(id.clone(), record);
        report.built += 1;
    }
    report.missing_feature = transcripts
        .keys()
        .filter(|id| primary.get(id).is_none())
        .count();

    if report.missing_transcript > 0 || report.missing_feature > 0 {
        tracing::warn!(
            stream = primary.name(),
            built = report.built,
            missing_transcript = report.missing_transcript,
            missing_feature = report.missing_feature,
            "manifest covers a strict subset of the split"
        );
    }

    let manifest = Manifest {
        vocab_size: dictionary.vocab_size(),
        dictionary_sha256: dictionary.fingerprint(),
        utts,
    };
    (manifest, report)
}

impl Manifest {
    #[must_use]
    pub fn len(&self) -> usize {
        self.utts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.utts.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ManifestRecord> {
        self.utts.get(id)
    }

    /// The manifest's ordered (sorted) utterance ids.
    #[must_use]
    pub fn id_list(&self) -> IdList {
        IdList::new(self.utts.keys().cloned().collect())
            .expect("BTreeMap keys are unique by construction")
    }

    /// Merge `stream` into every record under `slot_name`, returning the
    /// fused manifest. The receiver is left untouched on every path.
    ///
    /// Fails with [`PrepError::SlotConflict`] if any record already carries
    /// `slot_name` (a silent overwrite would hide train/dev pools that were
    /// derived from differently ordered sources), and in strict mode with
    /// [`PrepError::MissingFeature`] naming the first uncovered utterance.
    /// Distinct slot names commute: fusing A then B equals B then A.
    pub fn fuse(
        &self,
        stream: &FeatureStream,
        slot_name: &str,
        policy: FusePolicy,
    ) -> PrepResult<(Manifest, FuseReport)> {
        if let Some((id, _)) = self
            .utts
            .iter()
            .find(|(_, record)| record.inputs.contains_key(slot_name))
        {
            return Err(PrepError::SlotConflict {
                slot: slot_name.to_owned(),
                utterance: id.clone(),
            });
        }

        let mut report = FuseReport::default();
        let mut utts = BTreeMap::new();
        for (id, record) in &self.utts {
            match InputSlot::from_stream(stream, id) {
                Some(slot) => {
                    let mut fused = record.clone();
                    fused.inputs.insert(slot_name.to_owned(), slot);
                    utts.insert(id.clone(), fused);
                }
                None if policy.strict => {
                    return Err(PrepError::MissingFeature {
                        utterance: id.clone(),
                        stream: stream.name().to_owned(),
                        slot: slot_name.to_owned(),
                    });
                }
                None => report.dropped.push(id.clone()),
            }
        }

        report.extras_ignored = stream
            .iter()
            .filter(|(id, _)| !self.utts.contains_key(*id))
            .count();

        if !report.dropped.is_empty() {
            tracing::warn!(
                slot = slot_name,
                stream = stream.name(),
                dropped = report.dropped.len(),
                "lenient fuse dropped utterances missing from the stream"
            );
        }
        if report.extras_ignored > 0 && policy.warn_on_extra {
            tracing::warn!(
                slot = slot_name,
                stream = stream.name(),
                extras = report.extras_ignored,
                "stream covers utterances outside the manifest; ignored"
            );
        }

        let fused = Manifest {
            vocab_size: self.vocab_size,
            dictionary_sha256: self.dictionary_sha256.clone(),
            utts,
        };
        Ok((fused, report))
    }

    /// Check internal consistency: every token id must be a valid label
    /// under the declared vocabulary (and never the reserved blank).
    pub fn validate(&self) -> PrepResult<()> {
        for (id, record) in &self.utts {
            if let Some(output) = &record.output {
                for &token in &output.token_ids {
                    if token == crate::dictionary::BLANK_ID || token >= self.vocab_size {
                        return Err(PrepError::InvalidConfig(format!(
                            "utterance `{id}` carries token id {token} outside [1, {})",
                            self.vocab_size
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Persist as pretty-printed JSON (atomic replace).
    pub fn save(&self, path: &Path) -> PrepResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        artifact::write_atomic(path, &json)
    }

    /// Load and validate a manifest document.
    pub fn load(path: &Path) -> PrepResult<Self> {
        let contents = artifact::read_to_string(path)?;
        let manifest: Manifest = serde_json::from_str(&contents).map_err(|e| {
            PrepError::CorruptArtifact {
                path: path.to_path_buf(),
                detail: e.to_string(),
            }
        })?;
        manifest.validate()?;
        Ok(manifest)
    }
}
