//! Feature streams: immutable locator tables produced by external tools.
//!
//! A stream maps utterance id to an artifact reference (file path, optional
//! byte offset into an archive, shape tag). The on-disk form is a Kaldi-style
//! scp table, `<utt_id> <path>[:<byte_offset>]`, one line per utterance.
//! Streams are written once by exactly one tool invocation and consumed
//! read-only by the manifest builder and fuser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifact;
use crate::corpus::IdList;
use crate::error::{PrepError, PrepResult};

/// Shape class of the per-utterance artifacts in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ShapeTag {
    /// Fixed-size vector per utterance (e.g. a speaker embedding).
    Vector,
    /// Time-by-dimension matrix per utterance (e.g. filterbank frames).
    Matrix,
}

impl std::fmt::Display for ShapeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Vector => "vector",
            Self::Matrix => "matrix",
        })
    }
}

/// Opaque locator for one utterance's feature artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

/// A named, ordered, immutable feature table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureStream {
    name: String,
    shape: ShapeTag,
    entries: BTreeMap<String, ArtifactRef>,
}

impl FeatureStream {
    pub fn new(
        name: &str,
        shape: ShapeTag,
        entries: impl IntoIterator<Item = (String, ArtifactRef)>,
    ) -> PrepResult<Self> {
        let mut map = BTreeMap::new();
        for (id, artifact) in entries {
            if map.insert(id.clone(), artifact).is_some() {
                return Err(PrepError::InvalidConfig(format!(
                    "duplicate utterance id `{id}` in stream `{name}`"
                )));
            }
        }
        Ok(Self {
            name: name.to_owned(),
            shape,
            entries: map,
        })
    }

    /// Parse an scp table. Lines are `<utt_id> <path>[:<offset>]`; the
    /// offset suffix is recognized only when the final `:`-separated field
    /// is numeric, since plain paths may themselves contain colons.
    pub fn load_scp(name: &str, shape: ShapeTag, path: &Path) -> PrepResult<Self> {
        let contents = artifact::read_to_string(path)?;
        let mut entries = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (id, locator) = line.split_once(char::is_whitespace).ok_or_else(|| {
                PrepError::CorruptArtifact {
                    path: path.to_path_buf(),
                    detail: format!(
                        "line {}: expected `<utt_id> <path>[:<offset>]`, got `{line}`",
                        lineno + 1
                    ),
                }
            })?;
            entries.push((id.to_owned(), parse_locator(locator.trim())));
        }
        Self::new(name, shape, entries).map_err(|e| match e {
            PrepError::InvalidConfig(detail) => PrepError::CorruptArtifact {
                path: path.to_path_buf(),
                detail,
            },
            other => other,
        })
    }

    /// Write the stream as an scp table (atomic replace).
    pub fn save_scp(&self, path: &Path) -> PrepResult<()> {
        let mut out = String::new();
        for (id, artifact) in &self.entries {
            match artifact.offset {
                Some(offset) => {
                    out.push_str(&format!("{} {}:{}\n", id, artifact.path.display(), offset));
                }
                None => out.push_str(&format!("{} {}\n", id, artifact.path.display())),
            }
        }
        artifact::write_atomic(path, &out)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn shape(&self) -> ShapeTag {
        self.shape
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ArtifactRef> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArtifactRef)> {
        self.entries.iter()
    }

    /// The stream's ordered (sorted) utterance ids.
    #[must_use]
    pub fn id_list(&self) -> IdList {
        IdList::new(self.entries.keys().cloned().collect())
            .expect("BTreeMap keys are unique by construction")
    }

    /// Concatenate per-shard streams back into one table, in shard order.
    ///
    /// Used after parallel feature extraction: each worker wrote a disjoint
    /// shard table, and the union must cover exactly the requested ids.
    pub fn concat(name: &str, shape: ShapeTag, shards: Vec<FeatureStream>) -> PrepResult<Self> {
        let mut entries = Vec::new();
        for shard in shards {
            entries.extend(shard.entries);
        }
        Self::new(name, shape, entries)
    }

    /// Verify that this stream covers exactly `expected` (same id set).
    ///
    /// A shard worker that silently dropped or duplicated utterances is
    /// detected here rather than surfacing later as misaligned training data.
    pub fn verify_covers(&self, expected: &IdList) -> PrepResult<()> {
        let missing: Vec<String> = expected
            .ids()
            .iter()
            .filter(|id| !self.entries.contains_key(*id))
            .cloned()
            .collect();
        let extra: Vec<String> = self
            .entries
            .keys()
            .filter(|id| !expected.contains(id))
            .cloned()
            .collect();
        if missing.is_empty() && extra.is_empty() {
            return Ok(());
        }
        Err(PrepError::ShardCountMismatch {
            missing,
            unexpected: extra,
        })
    }
}

fn parse_locator(locator: &str) -> ArtifactRef {
    if let Some((path, offset)) = locator.rsplit_once(':')
        && let Ok(offset) = offset.parse::<u64>()
    {
        return ArtifactRef {
            path: PathBuf::from(path),
            offset: Some(offset),
        };
    }
    ArtifactRef {
        path: PathBuf::from(locator),
        offset: None,
    }
}

#[cfg(test)]
mod tests {
    use super::{ArtifactRef, FeatureStream, ShapeTag};
    use crate::corpus::IdList;

    fn stream_of(ids: &[&str]) -> FeatureStream {
        FeatureStream::new(
            "fbank",
            ShapeTag::Matrix,
            ids.iter().map(|id| {
                (
                    (*id).to_owned(),
                    ArtifactRef {
                        path: format!("/feats/{id}.ark").into(),
                        offset: Some(16),
                    },
                )
            }),
        )
        .expect("unique ids")
    }

    #[test]
    fn scp_roundtrip_with_and_without_offsets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feats.scp");

        let stream = FeatureStream::new(
            "fbank",
            ShapeTag::Matrix,
            vec![
                (
                    "utt-0".to_owned(),
                    ArtifactRef {
                        path: "/feats/raw.ark".into(),
                        offset: Some(1024),
                    },
                ),
                (
                    "utt-1".to_owned(),
                    ArtifactRef {
                        path: "/feats/one.npy".into(),
                        offset: None,
                    },
                ),
            ],
        )
        .expect("stream");

        stream.save_scp(&path).expect("save");
        let loaded = FeatureStream::load_scp("fbank", ShapeTag::Matrix, &path).expect("load");
        assert_eq!(loaded, stream);
        assert_eq!(loaded.get("utt-0").unwrap().offset, Some(1024));
        assert_eq!(loaded.get("utt-1").unwrap().offset, None);
    }

    #[test]
    fn locator_with_colon_in_path_but_no_numeric_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feats.scp");
        std::fs::write(&path, "utt-0 /data/a:b/feat.ark\n").expect("write");
        let stream = FeatureStream::load_scp("s", ShapeTag::Vector, &path).expect("load");
        let artifact = stream.get("utt-0").expect("entry");
        assert_eq!(artifact.path, std::path::PathBuf::from("/data/a:b/feat.ark"));
        assert_eq!(artifact.offset, None);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feats.scp");
        std::fs::write(&path, "utt-0 a.ark:1\nutt-0 b.ark:2\n").expect("write");
        let err = FeatureStream::load_scp("s", ShapeTag::Matrix, &path).expect_err("dup");
        assert!(err.to_string().contains("utt-0"), "names the id: {err}");
    }

    #[test]
    fn malformed_line_is_a_corrupt_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feats.scp");
        std::fs::write(&path, "lonely-token\n").expect("write");
        let err = FeatureStream::load_scp("s", ShapeTag::Matrix, &path).expect_err("bad line");
        assert!(
            matches!(err, crate::error::PrepError::CorruptArtifact { .. }),
            "got: {err:?}"
        );
    }

    #[test]
    fn entries_are_sorted_by_id() {
        let stream = stream_of(&["utt-2", "utt-0", "utt-1"]);
        let ids: Vec<&String> = stream.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, ["utt-0", "utt-1", "utt-2"]);
        assert_eq!(stream.id_list().ids(), ["utt-0", "utt-1", "utt-2"]);
    }

    #[test]
    fn concat_merges_disjoint_shards() {
        let merged = FeatureStream::concat(
            "fbank",
            ShapeTag::Matrix,
            vec![stream_of(&["utt-0", "utt-1"]), stream_of(&["utt-2"])],
        )
        .expect("concat");
        assert_eq!(merged.len(), 3);

        let err = FeatureStream::concat(
            "fbank",
            ShapeTag::Matrix,
            vec![stream_of(&["utt-0"]), stream_of(&["utt-0"])],
        )
        .expect_err("overlap");
        assert!(err.to_string().contains("utt-0"));
    }

    #[test]
    fn verify_covers_detects_missing_and_extra() {
        let stream = stream_of(&["utt-0", "utt-2"]);
        let expected =
            IdList::new(vec!["utt-0".to_owned(), "utt-1".to_owned()]).expect("ids");
        let err = stream.verify_covers(&expected).expect_err("mismatch");
        match err {
            crate::error::PrepError::ShardCountMismatch {
                missing,
                unexpected,
            } => {
                assert_eq!(missing, ["utt-1"]);
                assert_eq!(unexpected, ["utt-2"]);
            }
            other => panic!("expected ShardCountMismatch, got: {other:?}"),
        }

        let exact = stream_of(&["utt-0", "utt-1"]);
        exact.verify_covers(&expected).expect("exact cover is ok");
    }
}
