//! Corpus model and deterministic partitioning.
//!
//! A corpus is an ordered set of utterances: id, raw-audio locator, and
//! transcript text, loaded from a Kaldi-style data directory (`wav.scp` +
//! `text`). Utterance ids are globally unique and every pool handed to a
//! split-producing operation is lexicographically sorted, so re-deriving a
//! split always yields the same membership in the same order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::artifact;
use crate::error::{PrepError, PrepResult};

/// An ordered sequence of utterance ids.
///
/// Split-producing operations take and return `IdList`s rather than raw
/// vectors so that callers cannot accidentally re-derive "the same" split
/// from a differently ordered pool. The [`fingerprint`](IdList::fingerprint)
/// ties a derived artifact (feature table, manifest) back to the exact
/// ordered membership it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdList {
    ids: Vec<String>,
}

impl IdList {
    /// Wrap an already-ordered id sequence.
    ///
    /// Rejects duplicates; ordering is preserved as given (split heads and
    /// tails of a sorted pool are themselves sorted).
    pub fn new(ids: Vec<String>) -> PrepResult<Self> {
        let mut seen = std::collections::HashSet::new();
        for id in &ids {
            if !seen.insert(id.as_str()) {
                return Err(PrepError::InvalidConfig(format!(
                    "duplicate utterance id `{id}` in id list"
                )));
            }
        }
        Ok(Self { ids })
    }

    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|x| x == id)
    }

    /// SHA-256 over the ordered id sequence.
    ///
    /// Two pools said to represent the same split must agree on this value.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for id in &self.ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Partition into `n` contiguous, nearly equal chunks, preserving order.
    ///
    /// Used to fan out per-split work (feature extraction) across parallel
    /// jobs. Chunk sizes differ by at most one; earlier chunks take the
    /// remainder. `n` outside `[1, len]` cannot be satisfied by this pool.
    pub fn split_chunks(&self, n: usize) -> PrepResult<Vec<IdList>> {
        if n == 0 || n > self.len() {
            return Err(PrepError::InsufficientData {
                requested: n,
                available: self.len(),
            });
        }
        let base = self.len() / n;
        let remainder = self.len() % n;
        let mut chunks = Vec::with_capacity(n);
        let mut cursor = 0;
        for index in 0..n {
            let size = base + usize::from(index < remainder);
            chunks.push(IdList {
                ids: self.ids[cursor..cursor + size].to_vec(),
            });
            cursor += size;
        }
        Ok(chunks)
    }

    /// Persist as a one-id-per-line artifact (atomic replace).
    pub fn save(&self, path: &Path) -> PrepResult<()> {
        let mut out = String::new();
        for id in &self.ids {
            out.push_str(id);
            out.push('\n');
        }
        artifact::write_atomic(path, &out)
    }

    /// Load a previously saved id list.
    pub fn load(path: &Path) -> PrepResult<Self> {
        let contents = artifact::read_to_string(path)?;
        let ids = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_owned)
            .collect();
        Self::new(ids)
    }
}

/// Split an ordered pool into `(head, tail)` by position: `head` is the
/// first `k` ids, `tail` the remainder.
///
/// Pure and deterministic; the central split primitive. The dev set is
/// `head` with `k` = the configured dev size, train is `tail`.
pub fn split_first_k(pool: &IdList, k: usize) -> PrepResult<(IdList, IdList)> {
    if k > pool.len() {
        return Err(PrepError::InsufficientData {
            requested: k,
            available: pool.len(),
        });
    }
    let head = pool.ids[..k].to_vec();
    let tail = pool.ids[k..].to_vec();
    Ok((IdList { ids: head }, IdList { ids: tail }))
}

/// One utterance: id, raw-audio locator, transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub id: String,
    pub audio: PathBuf,
    pub text: String,
}

/// An ordered corpus, sorted lexicographically by utterance id.
#[derive(Debug, Clone)]
pub struct Corpus {
    entries: BTreeMap<String, Utterance>,
}

impl Corpus {
    /// Build a corpus from raw entries. Entries are sorted by id; duplicate
    /// ids are a data defect and rejected.
    pub fn from_entries(entries: Vec<Utterance>) -> PrepResult<Self> {
        let mut map = BTreeMap::new();
        for utt in entries {
            let id = utt.id.clone();
            if map.insert(id.clone(), utt).is_some() {
                return Err(PrepError::InvalidConfig(format!(
                    "duplicate utterance id `{id}` in corpus"
                )));
            }
        }
        Ok(Self { entries: map })
    }

    /// Load a corpus from a Kaldi-style data directory containing `wav.scp`
    /// (`<id> <audio path>`) and `text` (`<id> <transcript>`).
    ///
    /// The two tables must cover exactly the same utterance ids; upstream
    /// data preparation owns reconciliation, so skew here is a defect.
    pub fn load_dir(dir: &Path) -> PrepResult<Self> {
        let wav_path = dir.join("wav.scp");
        let text_path = dir.join("text");

        let wavs = parse_table(&wav_path)?;
        let texts = parse_table(&text_path)?;

        for id in wavs.keys() {
            if !texts.contains_key(id) {
                return Err(PrepError::CorruptArtifact {
                    path: text_path.clone(),
                    detail: format!("utterance `{id}` present in wav.scp but has no transcript"),
                });
            }
        }
        for id in texts.keys() {
            if !wavs.contains_key(id) {
                return Err(PrepError::CorruptArtifact {
                    path: wav_path.clone(),
                    detail: format!("utterance `{id}` has a transcript but no audio entry"),
                });
            }
        }

        let entries = wavs
            .into_iter()
            .map(|(id, audio)| {
                let text = texts[&id].clone();
                Utterance {
                    id,
                    audio: PathBuf::from(audio),
                    text,
                }
            })
            .collect();
        Self::from_entries(entries)
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
    pub fn get(&self, id: &str) -> Option<&Utterance> {
        self.entries.get(id)
    }

    /// The ordered (sorted) id pool for this corpus.
    #[must_use]
    pub fn id_list(&self) -> IdList {
        IdList {
            ids: self.entries.keys().cloned().collect(),
        }
    }

    /// id → transcript map for a subset of utterances.
    pub fn transcripts_for(&self, ids: &IdList) -> PrepResult<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for id in ids.ids() {
            let utt = self.entries.get(id).ok_or_else(|| PrepError::InvalidConfig(
                format!("utterance `{id}` requested from corpus but not present"),
            ))?;
            out.insert(id.clone(), utt.text.clone());
        }
        Ok(out)
    }

    /// Transcripts for every utterance in corpus order.
    #[must_use]
    pub fn all_transcripts(&self) -> BTreeMap<String, String> {
        self.entries
            .values()
            .map(|u| (u.id.clone(), u.text.clone()))
            .collect()
    }

    /// Write `wav.scp` and `text` for a subset into `dir` (atomic).
    ///
    /// Used by stage 0 to materialize per-split data directories that every
    /// later stage (and every auxiliary stream) carves from.
    pub fn write_subset(&self, ids: &IdList, dir: &Path) -> PrepResult<()> {
        let mut wav = String::new();
        let mut text = String::new();
        for id in ids.ids() {
            let utt = self.entries.get(id).ok_or_else(|| PrepError::InvalidConfig(
                format!("utterance `{id}` requested from corpus but not present"),
            ))?;
            wav.push_str(&format!("{} {}\n", utt.id, utt.audio.display()));
            text.push_str(&format!("{} {}\n", utt.id, utt.text));
        }
        artifact::write_atomic(&dir.join("wav.scp"), &wav)?;
        artifact::write_atomic(&dir.join("text"), &text)?;
        Ok(())
    }
}

/// Load an `<id> <transcript>` table file (the Kaldi `text` format).
pub fn load_transcript_table(path: &Path) -> PrepResult<BTreeMap<String, String>> {
    parse_table(path)
}

/// Parse a two-column `<id> <rest...>` table file.
fn parse_table(path: &Path) -> PrepResult<BTreeMap<String, String>> {
    let contents = artifact::read_to_string(path)?;
    let mut out = BTreeMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (id, rest) = line.split_once(char::is_whitespace).ok_or_else(|| {
            PrepError::CorruptArtifact {
                path: path.to_path_buf(),
                detail: format!("line {}: expected `<id> <value>`, got `{line}`", lineno + 1),
            }
        })?;
        if out.insert(id.to_owned(), rest.trim().to_owned()).is_some() {
            return Err(PrepError::CorruptArtifact {
                path: path.to_path_buf(),
                detail: format!("duplicate utterance id `{id}`"),
            });
        }
    }
    Ok(out)
}
