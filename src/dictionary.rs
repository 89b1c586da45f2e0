//! Symbol dictionary for label tokenization.
//!
//! Character-level symbols map to dense integer ids. Id 0 is the blank label
//! used by CTC-style scoring and is never assigned to a symbol; id 1 is the
//! unknown-symbol token. Real symbols receive ids from 2 upward in first-seen
//! order over the training corpus. The dictionary is built once per
//! experiment and frozen: decoding must reuse the exact dictionary that built
//! the training manifests, which the fingerprint enforces.

use std::collections::HashMap;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::artifact;
use crate::error::{PrepError, PrepResult};

/// Reserved blank/empty label id. Never assigned to a dictionary entry.
pub const BLANK_ID: u32 = 0;

/// Reserved unknown-symbol id.
pub const UNK_ID: u32 = 1;

/// The unknown-symbol token as written in the dictionary file.
pub const UNK_SYMBOL: &str = "<unk>";

/// Word separator symbol used by character-level tokenization.
pub const SPACE_SYMBOL: &str = "<space>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dictionary {
    // symbols[i] holds the symbol with id i + 2; <unk> is implicit at id 1.
    symbols: Vec<String>,
    index: HashMap<String, u32>,
}

impl Dictionary {
    /// Build a dictionary over the given transcripts, assigning ids in
    /// first-seen order.
    #[must_use]
    pub fn build<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut dict = Self {
            symbols: Vec::new(),
            index: HashMap::new(),
        };
        for text in texts {
            for symbol in text_symbols(text) {
                dict.intern(&symbol);
            }
        }
        dict
    }

    fn intern(&mut self, symbol: &str) {
        if symbol == UNK_SYMBOL || self.index.contains_key(symbol) {
            return;
        }
        let id = self.symbols.len() as u32 + 2;
        self.symbols.push(symbol.to_owned());
        self.index.insert(symbol.to_owned(), id);
    }

    /// Number of assignable label ids, including blank and `<unk>`.
    ///
    /// This is the `V` the model's output layer is sized to: the highest
    /// assigned id plus one.
    #[must_use]
    pub fn vocab_size(&self) -> u32 {
        self.symbols.len() as u32 + 2
    }

    /// Look up a symbol, falling back to [`UNK_ID`].
    #[must_use]
    pub fn id_of(&self, symbol: &str) -> u32 {
        self.index.get(symbol).copied().unwrap_or(UNK_ID)
    }

    /// Tokenize a transcript into label ids: one id per character, with the
    /// word separator mapped through [`SPACE_SYMBOL`]. Unknown characters map
    /// to [`UNK_ID`].
    #[must_use]
    pub fn tokenize(&self, text: &str) -> Vec<u32> {
        text_symbols(text).map(|s| self.id_of(&s)).collect()
    }

    /// Persist as ordered `<symbol> <id>` lines (atomic). The `<unk>` entry
    /// is written first; id 0 never appears.
    pub fn save(&self, path: &Path) -> PrepResult<()> {
        let mut out = String::new();
        out.push_str(&format!("{UNK_SYMBOL} {UNK_ID}\n"));
        for (i, symbol) in self.symbols.iter().enumerate() {
            out.push_str(&format!("{} {}\n", symbol, i as u32 + 2));
        }
        artifact::write_atomic(path, &out)
    }

    /// Load a dictionary file, validating the reserved-id contract and that
    /// ids are dense and ascending.
    pub fn load(path: &Path) -> PrepResult<Self> {
        let contents = artifact::read_to_string(path)?;
        let corrupt = |detail: String| PrepError::CorruptArtifact {
            path: path.to_path_buf(),
            detail,
        };

        let mut symbols = Vec::new();
        let mut index = HashMap::new();
        let mut expected = UNK_ID;
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (symbol, id_str) = line
                .rsplit_once(' ')
                .ok_or_else(|| corrupt(format!("line {}: expected `<symbol> <id>`", lineno + 1)))?;
            let id: u32 = id_str
                .parse()
                .map_err(|_| corrupt(format!("line {}: bad id `{id_str}`", lineno + 1)))?;
            if id == BLANK_ID {
                return Err(corrupt(format!(
                    "id 0 is reserved for the blank label, assigned to `{symbol}`"
                )));
            }
            if id != expected {
                return Err(corrupt(format!(
                    "ids must be dense and ascending: expected {expected}, got {id}"
                )));
            }
            if id == UNK_ID {
                if symbol != UNK_SYMBOL {
                    return Err(corrupt(format!(
                        "id 1 is reserved for `{UNK_SYMBOL}`, assigned to `{symbol}`"
                    )));
                }
            } else {
                if index.insert(symbol.to_owned(), id).is_some() {
                    return Err(corrupt(format!("duplicate symbol `{symbol}`")));
                }
                symbols.push(symbol.to_owned());
            }
            expected += 1;
        }
        if expected == UNK_ID {
            return Err(corrupt("dictionary file is empty".to_owned()));
        }
        Ok(Self { symbols, index })
    }

    /// SHA-256 over the ordered `(symbol, id)` pairs. Stored in every
    /// manifest built with this dictionary; decode verifies it before
    /// touching a checkpoint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{UNK_SYMBOL} {UNK_ID}\n").as_bytes());
        for (i, symbol) in self.symbols.iter().enumerate() {
            hasher.update(format!("{} {}\n", symbol, i as u32 + 2).as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Expand a transcript into its symbol sequence: one symbol per character,
/// whitespace collapsed to [`SPACE_SYMBOL`].
fn text_symbols(text: &str) -> impl Iterator<Item = String> + '_ {
    text.trim().chars().map(|c| {
        if c.is_whitespace() {
            SPACE_SYMBOL.to_owned()
        } else {
            c.to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{BLANK_ID, Dictionary, SPACE_SYMBOL, UNK_ID, UNK_SYMBOL};

    #[test]
    fn ids_assigned_in_first_seen_order() {
        let dict = Dictionary::build(["abca", "bd"]);
        assert_eq!(dict.id_of("a"), 2);
        assert_eq!(dict.id_of("b"), 3);
        assert_eq!(dict.id_of("c"), 4);
        assert_eq!(dict.id_of("d"), 5);
        assert_eq!(dict.vocab_size(), 6);
    }

    #[test]
    fn unknown_symbols_map_to_unk() {
        let dict = Dictionary::build(["ab"]);
        assert_eq!(dict.id_of("z"), UNK_ID);
        assert_eq!(dict.tokenize("azb"), vec![2, UNK_ID, 3]);
    }

    #[test]
    fn blank_is_never_assigned() {
        let dict = Dictionary::build(["the quick brown fox"]);
        for symbol in "the quick brown fox".chars().map(|c| c.to_string()) {
            assert_ne!(dict.id_of(&symbol), BLANK_ID, "symbol {symbol}");
        }
        assert_ne!(dict.id_of(SPACE_SYMBOL), BLANK_ID);
    }

    #[test]
    fn whitespace_becomes_space_symbol() {
        // First-seen order over "a b": a -> 2, <space> -> 3, b -> 4.
        let dict = Dictionary::build(["a b"]);
        let space_id = dict.id_of(SPACE_SYMBOL);
        assert_eq!(space_id, 3, "space is a real symbol in seen order");
        assert_eq!(dict.tokenize("a b"), vec![2, space_id, 4]);
        // Any whitespace character maps through the separator symbol.
        assert_eq!(dict.tokenize("a\tb"), vec![2, space_id, 4]);
    }

    #[test]
    fn tokenize_empty_text_is_empty() {
        let dict = Dictionary::build(["abc"]);
        assert!(dict.tokenize("").is_empty());
        assert!(dict.tokenize("   ").is_empty(), "trim strips outer space");
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dict").join("units.txt");
        let dict = Dictionary::build(["hello world"]);
        dict.save(&path).expect("save");

        let loaded = Dictionary::load(&path).expect("load");
        assert_eq!(loaded, dict);
        assert_eq!(loaded.fingerprint(), dict.fingerprint());
    }

    #[test]
    fn saved_file_starts_with_unk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("units.txt");
        Dictionary::build(["ab"]).save(&path).expect("save");
        let contents = std::fs::read_to_string(&path).expect("read");
        let first = contents.lines().next().expect("nonempty");
        assert_eq!(first, format!("{UNK_SYMBOL} {UNK_ID}"));
        assert!(!contents.lines().any(|l| l.ends_with(" 0")), "no id 0");
    }

    #[test]
    fn load_rejects_blank_assignment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("units.txt");
        std::fs::write(&path, "<blank> 0\n<unk> 1\na 2\n").expect("write");
        let err = Dictionary::load(&path).expect_err("id 0 must be rejected");
        assert!(err.to_string().contains("reserved"), "got: {err}");
    }

    #[test]
    fn load_rejects_sparse_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("units.txt");
        std::fs::write(&path, "<unk> 1\na 2\nb 4\n").expect("write");
        let err = Dictionary::load(&path).expect_err("gap must be rejected");
        assert!(err.to_string().contains("dense"), "got: {err}");
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = Dictionary::build(["abc"]);
        let b = Dictionary::build(["abd"]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), Dictionary::build(["abc"]).fingerprint());
    }

    #[test]
    fn build_is_deterministic_across_calls() {
        let texts = ["some shared corpus text", "more text"];
        let a = Dictionary::build(texts);
        let b = Dictionary::build(texts);
        assert_eq!(a, b);
    }
}
